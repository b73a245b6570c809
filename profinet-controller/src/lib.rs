//! The PROFINET IO controller of the water treatment SCADA stack.
//!
//! The crate wires the codec (`profinet-types`) and transport plumbing (`profinet-core`) into
//! a running controller: DCP discovery, one connection state machine and cyclic scheduler per
//! RTU, the authority arbiter with persisted epochs, the historian compression gate, and the
//! registry orchestrator that owns every record.
//!
//! Hosts construct a [`ControllerBuilder`], spawn the returned runner, and talk to the
//! [`Controller`] handle: provisioning, snapshots, actuator commands, handoff, and the
//! subscribe channel of alarms, samples and lifecycle changes.

#![warn(missing_docs)]

pub mod authority;
pub mod config;
pub mod discovery;
pub mod historian;
pub mod registry;
pub mod retry;
pub mod rtu;
pub mod session;

mod builder;
mod controller;
mod dispatch;

pub use builder::ControllerBuilder;
pub use config::{Config, ConfigError, ControllerConfig, StationConfig};
pub use controller::{new_controller, Controller, ControllerError, ControllerRunner};
pub use dispatch::FrameRoutes;
pub use registry::{Event, Registry, RegistryCommand, RegistryDeps};
pub use rtu::{ConnectionState, RtuDevice, SlotConfig, SlotKind};
