//! The discovery engine: periodic DCP Identify All sweeps, response collection, and
//! provisioning of unconfigured devices.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use profinet_core::dcp::{build_identify_all, build_set_ip, build_set_name, DcpDevice, DcpFrame};

/// Provisioning operations the registry asks of the discovery engine.
#[derive(Debug, Clone)]
pub enum DiscoveryCommand {
    /// Write an IP parameter to an unconfigured device.
    Provision {
        /// Target device MAC.
        mac: [u8; 6],
        /// Address to assign.
        ip: Ipv4Addr,
        /// Netmask to assign.
        netmask: Ipv4Addr,
        /// Gateway to assign.
        gateway: Ipv4Addr,
    },
    /// Write a station name to a device.
    SetName {
        /// Target device MAC.
        mac: [u8; 6],
        /// Name to assign.
        name: String,
    },
}

/// One discovery engine per interface.
pub struct DiscoveryEngine {
    local_mac: [u8; 6],
    interval: Duration,
    frames_tx: mpsc::Sender<Bytes>,
    dcp_rx: mpsc::Receiver<DcpFrame>,
    commands_rx: mpsc::Receiver<DiscoveryCommand>,
    found_tx: mpsc::Sender<DcpDevice>,
    xid: u32,
}

impl DiscoveryEngine {
    /// Assemble an engine.
    pub fn new(
        local_mac: [u8; 6],
        interval: Duration,
        frames_tx: mpsc::Sender<Bytes>,
        dcp_rx: mpsc::Receiver<DcpFrame>,
        commands_rx: mpsc::Receiver<DiscoveryCommand>,
        found_tx: mpsc::Sender<DcpDevice>,
    ) -> DiscoveryEngine {
        DiscoveryEngine {
            local_mac,
            interval,
            frames_tx,
            dcp_rx,
            commands_rx,
            found_tx,
            xid: 0,
        }
    }

    /// Sweep and serve until every channel closes.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                frame = self.dcp_rx.recv() => match frame {
                    Some(DcpFrame::IdentifyResponse { xid, device }) => {
                        if xid != self.xid {
                            debug!("identify response for stale sweep {xid:#X}");
                        }
                        debug!(
                            "station {:?} at {} (mac {:02X?})",
                            device.station_name, device.ip, device.mac
                        );
                        if self.found_tx.send(device).await.is_err() {
                            return;
                        }
                    }
                    Some(DcpFrame::SetResponse { xid, error }) => {
                        if error == 0 {
                            info!("DCP set {xid:#X} acknowledged");
                        } else {
                            warn!("DCP set {xid:#X} failed with error {error}");
                        }
                    }
                    None => return,
                },
                cmd = self.commands_rx.recv() => match cmd {
                    Some(cmd) => self.provision(cmd).await,
                    None => return,
                },
            }
        }
    }

    async fn sweep(&mut self) {
        self.xid = self.xid.wrapping_add(1);
        match build_identify_all(self.local_mac, self.xid) {
            Ok(frame) => {
                debug!("identify sweep {:#X}", self.xid);
                if self.frames_tx.send(Bytes::from(frame)).await.is_err() {
                    warn!("frame writer gone, identify sweep dropped");
                }
            }
            Err(e) => warn!("identify frame build failed: {e}"),
        }
    }

    async fn provision(&mut self, cmd: DiscoveryCommand) {
        self.xid = self.xid.wrapping_add(1);
        let frame = match cmd {
            DiscoveryCommand::Provision {
                mac,
                ip,
                netmask,
                gateway,
            } => {
                info!("provisioning {mac:02X?} with {ip}/{netmask}");
                build_set_ip(self.local_mac, mac, self.xid, ip, netmask, gateway)
            }
            DiscoveryCommand::SetName { mac, name } => {
                info!("naming {mac:02X?} {name:?}");
                build_set_name(self.local_mac, mac, self.xid, &name)
            }
        };
        match frame {
            Ok(frame) => {
                let _ = self.frames_tx.send(Bytes::from(frame)).await;
            }
            Err(e) => warn!("DCP set frame build failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sweeps_and_forwards_found_stations() {
        let (frames_tx, mut frames_rx) = mpsc::channel(8);
        let (dcp_tx, dcp_rx) = mpsc::channel(8);
        let (_commands_tx, commands_rx) = mpsc::channel::<DiscoveryCommand>(8);
        let (found_tx, mut found_rx) = mpsc::channel(8);

        let engine = DiscoveryEngine::new(
            [2, 0, 0, 0, 0, 1],
            Duration::from_secs(5),
            frames_tx,
            dcp_rx,
            commands_rx,
            found_tx,
        );
        let handle = tokio::spawn(engine.run());

        // First sweep goes out immediately.
        let frame = frames_rx.recv().await.unwrap();
        assert_eq!(&frame[12..14], &[0x88, 0x92]);

        let device = DcpDevice {
            mac: [0, 0x30, 0x11, 1, 2, 3],
            station_name: "wtc-rtu-01".to_string(),
            ip: Ipv4Addr::new(192, 0, 2, 20),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::UNSPECIFIED,
            vendor_id: 0x017B,
            device_id: 2,
        };
        dcp_tx
            .send(DcpFrame::IdentifyResponse {
                xid: 1,
                device: device.clone(),
            })
            .await
            .unwrap();
        assert_eq!(found_rx.recv().await.unwrap(), device);

        drop(dcp_tx);
        handle.await.unwrap();
    }
}
