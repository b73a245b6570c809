// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! DCE/RPC 1.1 over UDP as PROFINET uses it for acyclic communication.

mod client;
mod header;
mod ndr;

pub use client::{RpcClient, RpcError, DEFAULT_RPC_TIMEOUT};
pub use header::{
    Opnum, RpcHeader, RpcPacketType, DREP_LITTLE_ENDIAN, FLAGS1_IDEMPOTENT, FLAGS1_LAST_FRAGMENT,
    RPC_HEADER_LEN, RPC_VERSION,
};
pub use ndr::{NdrHeader, NDR_HEADER_LEN};
