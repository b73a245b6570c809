//! AR sessions: identity, frame layout, and the connector seam.

mod connect;
mod cyclic;
mod event_loop;

pub use connect::{
    await_application_ready, prm_end, read_identification, read_record, release, write_record,
    IM0_RECORD_INDEX,
};
pub use cyclic::{CycleUpdate, CyclicExit, IncomingFrame, SchedulerCommand};
pub use event_loop::{ConnectionTask, RtuCommand, SessionEvent, TaskContext};
pub(crate) use event_loop::now_ms;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use profinet_core::rpc::{RpcClient, RpcError};
use profinet_types::{PnUuid, PnioStatus};

use crate::rtu::{SlotConfig, SlotKind};

#[allow(unused)]
macro_rules! session_warn {
    ($session: expr, $($arg:tt)*) =>  {
        log::warn!("ar:{} {}", $session.id, format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_warn;

#[allow(unused)]
macro_rules! session_error {
    ($session: expr, $($arg:tt)*) =>  {
        log::error!("ar:{} {}", $session.id, format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_error;

#[allow(unused)]
macro_rules! session_debug {
    ($session: expr, $($arg:tt)*) =>  {
        log::debug!("ar:{} {}", $session.id, format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_debug;

#[allow(unused)]
macro_rules! session_trace {
    ($session: expr, $($arg:tt)*) =>  {
        log::trace!("ar:{} {}", $session.id, format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_trace;

/// Handle to one AR session, issued by the registry. Replaces what the C sources kept as an
/// opaque pointer on each RTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors of the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// RPC transport failure, including the post-retry timeout.
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),
    /// A payload failed to decode.
    #[error("codec: {0}")]
    Codec(#[from] profinet_types::Error),
    /// The device refused an operation with a PNIO status.
    #[error("device answered PNIO status {0}")]
    Pnio(PnioStatus),
    /// The device sent something out of protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The device never signalled ApplicationReady.
    #[error("timed out waiting for ApplicationReady")]
    ApplicationReadyTimeout,
}

/// Which direction of cyclic frame a layout describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutDirection {
    /// Device to controller: sensor data, IOPS per submodule.
    Input,
    /// Controller to device: actuator data, IOCS per submodule.
    Output,
}

/// Placement of one submodule within a cyclic frame's C_SDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmoduleLayout {
    /// Slot number.
    pub slot: u16,
    /// Subslot number.
    pub subslot: u16,
    /// What the slot holds.
    pub kind: SlotKind,
    /// Offset of the IO data.
    pub data_offset: usize,
    /// Length of the IO data; 0 for the DAP.
    pub data_len: usize,
    /// Offset of the trailing provider status byte.
    pub status_offset: usize,
}

/// Placement of the consumer status byte this frame carries for one submodule of the
/// opposite direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IocsLayout {
    /// Slot number.
    pub slot: u16,
    /// Subslot number.
    pub subslot: u16,
    /// Offset of the status byte.
    pub offset: usize,
}

/// The complete layout of one cyclic frame direction.
///
/// Each submodule of the frame's own direction occupies `data_len + 1` bytes, the trailing
/// byte being its provider status; the DAP contributes a lone status byte in both
/// directions. After the data objects come the consumer status bytes, one per submodule of
/// the opposite direction. Nothing overlaps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameLayout {
    /// Submodules of the frame's direction, in frame order.
    pub entries: Vec<SubmoduleLayout>,
    /// Consumer statuses for the opposite direction, after the data objects.
    pub consumer_statuses: Vec<IocsLayout>,
    /// Total C_SDU bytes the layout occupies.
    pub total_len: usize,
}

impl FrameLayout {
    /// Lay out the enabled slots for `direction`: data objects first (DAP leading, then
    /// ascending (slot, subslot)), consumer statuses after.
    pub fn build(slots: &[SlotConfig], direction: LayoutDirection) -> FrameLayout {
        let mut providers: Vec<&SlotConfig> = slots
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| match (direction, s.kind) {
                (_, SlotKind::Dap) => true,
                (LayoutDirection::Input, SlotKind::Sensor) => true,
                (LayoutDirection::Output, SlotKind::Actuator) => true,
                _ => false,
            })
            .collect();
        providers.sort_by_key(|s| (s.slot, s.subslot));

        let mut consumers: Vec<&SlotConfig> = slots
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| match (direction, s.kind) {
                (LayoutDirection::Input, SlotKind::Actuator) => true,
                (LayoutDirection::Output, SlotKind::Sensor) => true,
                _ => false,
            })
            .collect();
        consumers.sort_by_key(|s| (s.slot, s.subslot));

        let mut entries = Vec::with_capacity(providers.len());
        let mut offset = 0usize;
        for slot in providers {
            let data_len = slot.wire_len();
            entries.push(SubmoduleLayout {
                slot: slot.slot,
                subslot: slot.subslot,
                kind: slot.kind,
                data_offset: offset,
                data_len,
                status_offset: offset + data_len,
            });
            offset += data_len + 1;
        }
        let mut consumer_statuses = Vec::with_capacity(consumers.len());
        for slot in consumers {
            consumer_statuses.push(IocsLayout {
                slot: slot.slot,
                subslot: slot.subslot,
                offset,
            });
            offset += 1;
        }
        FrameLayout {
            entries,
            consumer_statuses,
            total_len: offset,
        }
    }

    /// The data-object entry for (slot, subslot), if it provides in this direction.
    pub fn entry(&self, slot: u16, subslot: u16) -> Option<&SubmoduleLayout> {
        self.entries
            .iter()
            .find(|e| e.slot == slot && e.subslot == subslot)
    }
}

/// Everything one established AR knows about itself.
#[derive(Debug, Clone)]
pub struct ArSession {
    /// Registry-issued handle.
    pub id: SessionId,
    /// The device's station name.
    pub station_name: String,
    /// AR UUID, generated once per Connect and used as the RPC object UUID.
    pub ar_uuid: PnUuid,
    /// Session key echoed in control blocks.
    pub session_key: u16,
    /// The device's RPC endpoint.
    pub remote: SocketAddrV4,
    /// The device's MAC, destination of output frames.
    pub remote_mac: [u8; 6],
    /// Our MAC, source of output frames.
    pub local_mac: [u8; 6],
    /// FrameID of device-to-controller frames.
    pub input_frame_id: u16,
    /// FrameID of controller-to-device frames.
    pub output_frame_id: u16,
    /// Input frame layout.
    pub input_layout: FrameLayout,
    /// Output frame layout.
    pub output_layout: FrameLayout,
    /// Cycle time in milliseconds, a power of two.
    pub cycle_time_ms: u32,
    /// Cycle reduction relative to the 1 ms send clock.
    pub reduction_ratio: u16,
    /// Watchdog multiplier on the cycle time.
    pub watchdog_factor: u16,
    /// Rolling record sequence number.
    seq_number: u16,
}

impl ArSession {
    /// Assemble a session ready for Connect.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        station_name: String,
        remote: SocketAddrV4,
        remote_mac: [u8; 6],
        local_mac: [u8; 6],
        slots: &[SlotConfig],
        cycle_time_ms: u32,
        watchdog_factor: u16,
    ) -> ArSession {
        // RT class 1 unicast FrameIDs; one adjacent pair per session, kept inside the
        // real-time range.
        let output_frame_id = 0xC000 + (id.0 as u16 % 0x1DFF) * 2;
        ArSession {
            id,
            station_name,
            ar_uuid: PnUuid::new(),
            session_key: (id.0 as u16).wrapping_add(1),
            remote,
            remote_mac,
            local_mac,
            input_frame_id: output_frame_id + 1,
            output_frame_id,
            input_layout: FrameLayout::build(slots, LayoutDirection::Input),
            output_layout: FrameLayout::build(slots, LayoutDirection::Output),
            cycle_time_ms,
            reduction_ratio: cycle_time_ms as u16,
            watchdog_factor,
            seq_number: 0,
        }
    }

    /// Milliseconds of input silence after which the session is dead.
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.cycle_time_ms as u64 * self.watchdog_factor as u64)
    }

    /// Next record sequence number.
    pub(crate) fn next_seq(&mut self) -> u16 {
        let seq = self.seq_number;
        self.seq_number = self.seq_number.wrapping_add(1);
        seq
    }
}

/// Seam for establishing the RPC transport of a session, so tests can aim sessions at a
/// loopback device.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Bind a fresh RPC endpoint aimed at `remote`.
    async fn connect(
        &self,
        local_ip: Ipv4Addr,
        remote: SocketAddrV4,
        object_uuid: PnUuid,
        timeout: Duration,
    ) -> Result<RpcClient, RpcError>;
}

/// The production connector: an ephemeral UDP socket routed by the kernel, so the source
/// address is the real interface IP.
pub struct UdpConnector;

#[async_trait]
impl Connector for UdpConnector {
    async fn connect(
        &self,
        local_ip: Ipv4Addr,
        remote: SocketAddrV4,
        object_uuid: PnUuid,
        timeout: Duration,
    ) -> Result<RpcClient, RpcError> {
        RpcClient::bind(local_ip, remote, object_uuid, timeout).await
    }
}
