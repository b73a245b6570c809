// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! PROFINET framing and transport plumbing shared by the controller and tooling.
//!
//! This crate knows how bytes move: the DCE/RPC header and NDR prelude over UDP, the DCP
//! discovery PDUs and cyclic RT frames over a raw AF_PACKET socket. It holds no per-device
//! state; the connection state machine, scheduler and registry live in `profinet-controller`.

#![warn(missing_docs)]

pub mod cyclic;
pub mod dcp;
pub mod ethernet;
pub mod rpc;
