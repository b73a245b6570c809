//! Inbound Layer 2 demultiplexing: one reader task per interface, routing cyclic frames to
//! their session's scheduler and DCP PDUs to the discovery engine.

use std::sync::Arc;

use hashbrown::HashMap;
use log::{trace, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use profinet_core::dcp::{parse_dcp, DcpFrame};
use profinet_core::ethernet::{parse_profinet_frame, RawEthernetSocket};
use profinet_types::constants::{RT_FRAME_ID_MAX, RT_FRAME_ID_MIN};

use crate::session::IncomingFrame;

/// Largest frame the reader accepts; standard Ethernet, no jumbo frames on the RT segment.
const MAX_FRAME: usize = 1522;

/// The FrameID routing table: written by connection tasks as sessions come and go, read by
/// the dispatcher for every received frame.
#[derive(Clone, Default)]
pub struct FrameRoutes {
    routes: Arc<RwLock<HashMap<u16, mpsc::Sender<IncomingFrame>>>>,
}

impl FrameRoutes {
    /// An empty table.
    pub fn new() -> FrameRoutes {
        FrameRoutes::default()
    }

    /// Route `frame_id` to a session's input queue.
    pub fn insert(&self, frame_id: u16, tx: mpsc::Sender<IncomingFrame>) {
        self.routes.write().insert(frame_id, tx);
    }

    /// Stop routing `frame_id`.
    pub fn remove(&self, frame_id: u16) {
        self.routes.write().remove(&frame_id);
    }

    pub(crate) fn lookup(&self, frame_id: u16) -> Option<mpsc::Sender<IncomingFrame>> {
        self.routes.read().get(&frame_id).cloned()
    }
}

/// Spawn the reader task for one interface.
pub(crate) fn spawn_dispatcher(
    socket: Arc<RawEthernetSocket>,
    routes: FrameRoutes,
    dcp_tx: mpsc::Sender<DcpFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("raw receive on {} failed: {e}", socket.interface());
                    continue;
                }
            };
            let Some((header, payload)) = parse_profinet_frame(&buf[..n]) else {
                continue;
            };
            if header.src == socket.mac() {
                // Our own transmissions loop back on some drivers.
                continue;
            }
            if payload.len() < 2 {
                continue;
            }
            let frame_id = u16::from_be_bytes([payload[0], payload[1]]);
            if (RT_FRAME_ID_MIN..=RT_FRAME_ID_MAX).contains(&frame_id) {
                if let Some(tx) = routes.lookup(frame_id) {
                    // A full queue sheds this frame; the scheduler's counters show it.
                    let _ = tx.try_send(IncomingFrame {
                        payload: payload.to_vec(),
                    });
                } else {
                    trace!("no session for frame id {frame_id:#06X}");
                }
                continue;
            }
            match parse_dcp(header.src, payload) {
                Ok(Some(frame)) => {
                    let _ = dcp_tx.send(frame).await;
                }
                Ok(None) => {}
                Err(e) => trace!("undecodable DCP frame: {e}"),
            }
        }
    })
}
