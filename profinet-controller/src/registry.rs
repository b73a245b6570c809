//! The device registry and orchestrator task: the single owner of all RTU records.
//!
//! Every mutation flows through this task's mailbox in FIFO order. Readers get point-in-time
//! clones, either per station or through the lock-free inventory snapshot, and subscribers
//! get tagged events on a broadcast channel that sheds oldest-first under lag.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use hashbrown::HashMap;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use profinet_core::dcp::DcpDevice;
use profinet_types::{ActuatorCommand, ActuatorOutput, Quality, SensorReading};

use crate::authority::{AuthorityState, AuthorityStore, PersistedAuthority};
use crate::config::StationConfig;
use crate::discovery::DiscoveryCommand;
use crate::dispatch::FrameRoutes;
use crate::historian::{HistorianCompressor, HistorianSample};
use crate::retry::SessionRetryPolicy;
use crate::rtu::{validate_station_name, ConnectionState, RtuDevice, SlotKind};
use crate::session::{
    ConnectionTask, Connector, RtuCommand, SessionEvent, SessionId, TaskContext,
};

/// Events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A sample passed the historian gate.
    Sample {
        /// Station of origin.
        station: String,
        /// Slot of origin.
        slot: u16,
        /// Subslot of origin.
        subslot: u16,
        /// The gated sample.
        sample: HistorianSample,
    },
    /// A reading crossed its alarm threshold.
    AlarmRaised {
        /// Station concerned.
        station: String,
        /// Slot concerned.
        slot: u16,
        /// Subslot concerned.
        subslot: u16,
        /// Operator-facing slot name.
        name: String,
        /// The offending value.
        value: f32,
        /// When it was observed.
        at: DateTime<Utc>,
    },
    /// A previously alarming reading came back inside its thresholds.
    AlarmCleared {
        /// Station concerned.
        station: String,
        /// Slot concerned.
        slot: u16,
        /// Subslot concerned.
        subslot: u16,
        /// Operator-facing slot name.
        name: String,
        /// When it was observed.
        at: DateTime<Utc>,
    },
    /// An RTU moved through its connection lifecycle.
    RtuStateChanged {
        /// Station concerned.
        station: String,
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
        /// When it moved.
        at: DateTime<Utc>,
    },
}

/// Mailbox operations of the orchestrator.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Provision a new RTU.
    AddRtu {
        /// Its configuration.
        config: StationConfig,
        /// Outcome.
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Remove an RTU, releasing its session.
    RemoveRtu {
        /// Station to remove.
        station: String,
        /// Whether the station existed.
        reply: oneshot::Sender<bool>,
    },
    /// Start pursuing a connection.
    Enable {
        /// Station concerned.
        station: String,
    },
    /// Drop the connection and stay offline.
    Disable {
        /// Station concerned.
        station: String,
    },
    /// Tear the session down and reconnect immediately.
    ForceReconnect {
        /// Station concerned.
        station: String,
    },
    /// A point-in-time clone of one RTU record.
    GetSnapshot {
        /// Station wanted.
        station: String,
        /// The clone, if the station exists.
        reply: oneshot::Sender<Option<RtuDevice>>,
    },
    /// The stations DCP has seen, configured or not.
    ListDiscovered {
        /// All responses collected so far, keyed by MAC then flattened.
        reply: oneshot::Sender<Vec<DcpDevice>>,
    },
    /// Drive an actuator under the current epoch.
    IssueActuatorCommand {
        /// Station concerned.
        station: String,
        /// Slot addressed.
        slot: u16,
        /// Subslot addressed.
        subslot: u16,
        /// New output.
        output: ActuatorOutput,
        /// Accepted or rejected with a reason.
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Read an acyclic parameter record from a running session.
    ReadRecord {
        /// Station concerned.
        station: String,
        /// API addressed.
        api: u32,
        /// Slot addressed.
        slot: u16,
        /// Subslot addressed.
        subslot: u16,
        /// Record index.
        index: u16,
        /// Largest record accepted.
        max_len: u32,
        /// The record bytes, or a reason.
        reply: oneshot::Sender<Result<Vec<u8>, String>>,
    },
    /// Write an acyclic parameter record through a running session.
    WriteRecord {
        /// Station concerned.
        station: String,
        /// API addressed.
        api: u32,
        /// Slot addressed.
        slot: u16,
        /// Subslot addressed.
        subslot: u16,
        /// Record index.
        index: u16,
        /// Record bytes to write.
        data: Vec<u8>,
        /// Success, or a reason.
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Write a station name to a device found by DCP, e.g. when commissioning.
    SetStationName {
        /// Target device MAC.
        mac: [u8; 6],
        /// Name to assign.
        name: String,
        /// Accepted or rejected with a reason.
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Take control of the RTU's actuators.
    RequestHandoff {
        /// Station concerned.
        station: String,
    },
    /// Give control back to the RTU.
    ReleaseHandoff {
        /// Station concerned.
        station: String,
    },
    /// Release every session and end the orchestrator.
    Shutdown,
}

/// Shared plumbing the registry hands each connection task.
pub struct RegistryDeps {
    /// Transport seam.
    pub connector: Arc<dyn Connector>,
    /// Our station name.
    pub local_station_name: String,
    /// Our MAC on the interface.
    pub local_mac: [u8; 6],
    /// Address RPC sockets bind to.
    pub local_ip: Ipv4Addr,
    /// The interface's frame writer queue.
    pub frames_tx: mpsc::Sender<Bytes>,
    /// FrameID routing table.
    pub routes: FrameRoutes,
    /// Reconnect policy.
    pub retry: SessionRetryPolicy,
    /// Per-call RPC deadline.
    pub rpc_timeout: Duration,
    /// Cycle time for every session.
    pub cycle_time_ms: u32,
    /// Watchdog multiplier.
    pub watchdog_factor: u16,
    /// Stale-command threshold.
    pub stale_command_threshold_ms: u64,
    /// Epoch persistence.
    pub authority_store: AuthorityStore,
}

struct RtuEntry {
    device: RtuDevice,
    commands: mpsc::Sender<RtuCommand>,
    task: JoinHandle<()>,
    netmask: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
}

/// The orchestrator task state.
pub struct Registry {
    deps: RegistryDeps,
    rtus: HashMap<String, RtuEntry>,
    discovered: HashMap<[u8; 6], DcpDevice>,
    compressor: HistorianCompressor,
    persisted: HashMap<String, PersistedAuthority>,
    tag_ids: HashMap<(String, u16, u16), u32>,
    active_alarms: HashMap<(String, u16, u16), bool>,
    next_session: u32,
    next_tag: u32,
    events: broadcast::Sender<Event>,
    inventory: Arc<ArcSwap<Vec<RtuDevice>>>,
    mailbox: mpsc::Receiver<RegistryCommand>,
    session_events_tx: mpsc::Sender<SessionEvent>,
    session_events: mpsc::Receiver<SessionEvent>,
    found_rx: mpsc::Receiver<DcpDevice>,
    discovery_tx: mpsc::Sender<DiscoveryCommand>,
}

impl Registry {
    /// Assemble the orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deps: RegistryDeps,
        mailbox: mpsc::Receiver<RegistryCommand>,
        found_rx: mpsc::Receiver<DcpDevice>,
        discovery_tx: mpsc::Sender<DiscoveryCommand>,
        events: broadcast::Sender<Event>,
        inventory: Arc<ArcSwap<Vec<RtuDevice>>>,
    ) -> Registry {
        let persisted = deps.authority_store.load().unwrap_or_else(|e| {
            error!("authority store unreadable, starting from epoch zero: {e}");
            HashMap::new()
        });
        let (session_events_tx, session_events) = mpsc::channel(256);
        Registry {
            deps,
            rtus: HashMap::new(),
            discovered: HashMap::new(),
            compressor: HistorianCompressor::new(),
            persisted,
            tag_ids: HashMap::new(),
            active_alarms: HashMap::new(),
            next_session: 1,
            next_tag: 1,
            events,
            inventory,
            mailbox,
            session_events_tx,
            session_events,
            found_rx,
            discovery_tx,
        }
    }

    /// Serve the mailbox until shutdown, then release every session.
    pub async fn run(mut self) {
        info!("registry orchestrator started");
        loop {
            tokio::select! {
                cmd = self.mailbox.recv() => match cmd {
                    None | Some(RegistryCommand::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                ev = self.session_events.recv() => {
                    if let Some(ev) = ev {
                        self.handle_session_event(ev);
                    }
                }
                found = self.found_rx.recv() => {
                    if let Some(device) = found {
                        self.handle_discovered(device).await;
                    }
                }
            }
            self.publish_inventory();
        }

        info!("registry draining: releasing {} sessions", self.rtus.len());
        let mut tasks = Vec::new();
        for (_, entry) in self.rtus.drain() {
            let _ = entry.commands.send(RtuCommand::Shutdown).await;
            tasks.push(entry.task);
        }
        join_all(tasks).await;
        self.persist_authority();
        info!("registry orchestrator stopped");
    }

    fn publish_inventory(&self) {
        let inventory: Vec<RtuDevice> = self.rtus.values().map(|e| e.device.clone()).collect();
        self.inventory.store(Arc::new(inventory));
    }

    fn persist_authority(&self) {
        if let Err(e) = self.deps.authority_store.save(self.persisted.values()) {
            error!("authority persistence failed: {e}");
        }
    }

    async fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::AddRtu { config, reply } => {
                let _ = reply.send(self.add_rtu(config).await);
            }
            RegistryCommand::RemoveRtu { station, reply } => {
                let existed = match self.rtus.remove(&station) {
                    Some(entry) => {
                        let _ = entry.commands.send(RtuCommand::Shutdown).await;
                        let _ = entry.task.await;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(existed);
            }
            RegistryCommand::Enable { station } => {
                if let Some(entry) = self.rtus.get_mut(&station) {
                    entry.device.enabled = true;
                    let _ = entry.commands.send(RtuCommand::Enable).await;
                }
            }
            RegistryCommand::Disable { station } => {
                if let Some(entry) = self.rtus.get_mut(&station) {
                    entry.device.enabled = false;
                    let _ = entry.commands.send(RtuCommand::Disable).await;
                }
            }
            RegistryCommand::ForceReconnect { station } => {
                if let Some(entry) = self.rtus.get(&station) {
                    let _ = entry.commands.send(RtuCommand::ForceReconnect).await;
                }
            }
            RegistryCommand::GetSnapshot { station, reply } => {
                let _ = reply.send(self.rtus.get(&station).map(|e| e.device.clone()));
            }
            RegistryCommand::ListDiscovered { reply } => {
                let _ = reply.send(self.discovered.values().cloned().collect());
            }
            RegistryCommand::IssueActuatorCommand {
                station,
                slot,
                subslot,
                output,
                reply,
            } => {
                let _ = reply.send(self.issue_actuator(&station, slot, subslot, output).await);
            }
            RegistryCommand::ReadRecord {
                station,
                api,
                slot,
                subslot,
                index,
                max_len,
                reply,
            } => match self.rtus.get(&station) {
                Some(entry) => {
                    let forwarded = entry
                        .commands
                        .send(RtuCommand::ReadRecord {
                            api,
                            slot,
                            subslot,
                            index,
                            max_len,
                            reply,
                        })
                        .await;
                    if let Err(mpsc::error::SendError(RtuCommand::ReadRecord { reply, .. })) =
                        forwarded
                    {
                        let _ = reply.send(Err("connection task gone".to_string()));
                    }
                }
                None => {
                    let _ = reply.send(Err(format!("unknown station {station:?}")));
                }
            },
            RegistryCommand::WriteRecord {
                station,
                api,
                slot,
                subslot,
                index,
                data,
                reply,
            } => match self.rtus.get(&station) {
                Some(entry) => {
                    let forwarded = entry
                        .commands
                        .send(RtuCommand::WriteRecord {
                            api,
                            slot,
                            subslot,
                            index,
                            data,
                            reply,
                        })
                        .await;
                    if let Err(mpsc::error::SendError(RtuCommand::WriteRecord { reply, .. })) =
                        forwarded
                    {
                        let _ = reply.send(Err("connection task gone".to_string()));
                    }
                }
                None => {
                    let _ = reply.send(Err(format!("unknown station {station:?}")));
                }
            },
            RegistryCommand::SetStationName { mac, name, reply } => {
                let result = match validate_station_name(&name) {
                    Ok(()) => self
                        .discovery_tx
                        .send(DiscoveryCommand::SetName { mac, name })
                        .await
                        .map_err(|_| "discovery engine gone".to_string()),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            RegistryCommand::RequestHandoff { station } => {
                if let Some(entry) = self.rtus.get(&station) {
                    let _ = entry.commands.send(RtuCommand::RequestHandoff).await;
                }
            }
            RegistryCommand::ReleaseHandoff { station } => {
                if let Some(entry) = self.rtus.get(&station) {
                    let _ = entry.commands.send(RtuCommand::ReleaseHandoff).await;
                }
            }
            RegistryCommand::Shutdown => unreachable!("handled by the select loop"),
        }
    }

    async fn add_rtu(&mut self, config: StationConfig) -> Result<(), String> {
        validate_station_name(&config.station_name)?;
        if self.rtus.contains_key(&config.station_name) {
            return Err(format!("station {:?} already exists", config.station_name));
        }
        match config.slots.first() {
            Some(slot) if slot.slot == 0 && slot.kind == SlotKind::Dap => {}
            _ => return Err("slot 0 must be the DAP".to_string()),
        }

        let station = config.station_name.clone();
        let mut device = RtuDevice::new(
            station.clone(),
            config.vendor_id,
            config.device_id,
            config.slots.clone(),
            self.deps.stale_command_threshold_ms,
        );
        device.ip = config.ip;

        // Historian tags for every sensor slot.
        for slot in config.slots.iter().filter(|s| s.kind == SlotKind::Sensor) {
            let tag = self.next_tag;
            self.next_tag += 1;
            self.tag_ids
                .insert((station.clone(), slot.slot, slot.subslot), tag);
            self.compressor
                .configure(tag, config.compression, slot.deadband);
        }

        // Epochs survive restarts through the store.
        let initial_epoch = self
            .persisted
            .get(&station)
            .map(|p| p.epoch)
            .unwrap_or(0);
        device.authority.epoch = initial_epoch;

        let session_id = SessionId(self.next_session);
        self.next_session += 1;
        device.session = Some(session_id);

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let ctx = TaskContext {
            session_id,
            connector: self.deps.connector.clone(),
            local_station_name: self.deps.local_station_name.clone(),
            local_mac: self.deps.local_mac,
            local_ip: self.deps.local_ip,
            frames_tx: self.deps.frames_tx.clone(),
            routes: self.deps.routes.clone(),
            events_tx: self.session_events_tx.clone(),
            retry: self.deps.retry.clone(),
            rpc_timeout: self.deps.rpc_timeout,
            cycle_time_ms: self.deps.cycle_time_ms,
            watchdog_factor: self.deps.watchdog_factor,
            stale_command_threshold_ms: self.deps.stale_command_threshold_ms,
            initial_epoch,
        };
        let task = ConnectionTask::new(station.clone(), config.slots, ctx, commands_rx);
        let handle = tokio::spawn(task.run());

        if config.enabled {
            device.enabled = true;
            let _ = commands_tx.send(RtuCommand::Enable).await;
        }
        // Replay the newest discovery sighting, if any.
        if let Some(seen) = self
            .discovered
            .values()
            .find(|d| d.station_name == station && !d.needs_ip())
        {
            let _ = commands_tx
                .send(RtuCommand::Discovered {
                    ip: seen.ip,
                    mac: seen.mac,
                })
                .await;
        }

        self.rtus.insert(
            station.clone(),
            RtuEntry {
                device,
                commands: commands_tx,
                task: handle,
                netmask: config.netmask,
                gateway: config.gateway,
            },
        );
        info!("station {station:?} added");
        Ok(())
    }

    async fn issue_actuator(
        &mut self,
        station: &str,
        slot: u16,
        subslot: u16,
        output: ActuatorOutput,
    ) -> Result<(), String> {
        let now = crate::session::now_ms();
        let entry = self
            .rtus
            .get_mut(station)
            .ok_or_else(|| format!("unknown station {station:?}"))?;
        match entry.device.slot(slot, subslot) {
            Some(config) if config.kind == SlotKind::Actuator && config.enabled => {}
            Some(_) => return Err(format!("slot {slot}.{subslot} is not an enabled actuator")),
            None => return Err(format!("unknown slot {slot}.{subslot}")),
        }
        if entry.device.authority.state != AuthorityState::Supervised {
            return Err(format!(
                "not supervising {station:?} (state {:?})",
                entry.device.authority.state
            ));
        }
        let epoch = entry.device.authority.epoch;
        entry
            .commands
            .send(RtuCommand::SetActuator {
                slot,
                subslot,
                output,
                epoch,
                issued_ms: now,
            })
            .await
            .map_err(|_| "connection task gone".to_string())?;

        // On-time bookkeeping.
        let state = entry
            .device
            .actuators
            .entry((slot, subslot))
            .or_default();
        let was_on = state.output.command != ActuatorCommand::Off;
        let is_on = output.command != ActuatorCommand::Off;
        if !was_on && is_on {
            state.cycle_count += 1;
            state.last_on_ms = Some(now);
        }
        if was_on && !is_on {
            if let Some(on_since) = state.last_on_ms.take() {
                state.total_on_ms += now.saturating_sub(on_since);
            }
        }
        state.output = output;
        Ok(())
    }

    async fn handle_discovered(&mut self, device: DcpDevice) {
        self.discovered.insert(device.mac, device.clone());

        if device.station_name.is_empty() {
            debug!("unnamed device at mac {:02X?}", device.mac);
            return;
        }
        let Some(entry) = self.rtus.get_mut(&device.station_name) else {
            debug!("unconfigured station {:?} seen", device.station_name);
            return;
        };

        entry.device.last_seen = Some(Utc::now());
        entry.device.mac = Some(device.mac);
        if entry.device.vendor_id != 0
            && device.vendor_id != 0
            && entry.device.vendor_id != device.vendor_id
        {
            warn!(
                "station {:?} reports vendor {:#06X}, configured {:#06X}",
                device.station_name, device.vendor_id, entry.device.vendor_id
            );
        }

        if device.needs_ip() {
            // Unconfigured device we know: provision its static address.
            if let Some(ip) = entry.device.ip {
                let _ = self
                    .discovery_tx
                    .send(DiscoveryCommand::Provision {
                        mac: device.mac,
                        ip,
                        netmask: entry.netmask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
                        gateway: entry.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
                    })
                    .await;
            } else {
                warn!(
                    "station {:?} has no address and none is configured",
                    device.station_name
                );
            }
            return;
        }

        entry.device.ip = Some(device.ip);
        let _ = entry
            .commands
            .send(RtuCommand::Discovered {
                ip: device.ip,
                mac: device.mac,
            })
            .await;
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { station, state } => {
                let Some(entry) = self.rtus.get_mut(&station) else {
                    return;
                };
                let from = entry.device.state;
                if from == state {
                    return;
                }
                entry.device.state = state;
                let _ = self.events.send(Event::RtuStateChanged {
                    station,
                    from,
                    to: state,
                    at: Utc::now(),
                });
            }
            SessionEvent::Cycle(update) => self.handle_cycle(update),
            SessionEvent::Authority { station, context } => {
                let Some(entry) = self.rtus.get_mut(&station) else {
                    return;
                };
                entry.device.authority = context.clone();
                self.persisted.insert(
                    station.clone(),
                    PersistedAuthority {
                        station_name: station,
                        epoch: context.epoch,
                        state: context.state,
                        holder: context.holder,
                    },
                );
                // Durable at each transition; a restart resumes from this epoch.
                self.persist_authority();
            }
            SessionEvent::Fault { station, detail } => {
                warn!("{station}: {detail}");
            }
        }
    }

    fn handle_cycle(&mut self, update: crate::session::CycleUpdate) {
        let Some(entry) = self.rtus.get_mut(&update.station) else {
            return;
        };
        entry.device.health = update.health;
        entry.device.last_seen = Some(Utc::now());

        for (slot, subslot, reading) in update.readings {
            entry.device.readings.insert((slot, subslot), reading);

            let key = (update.station.clone(), slot, subslot);
            if let Some(&tag) = self.tag_ids.get(&key) {
                let sample = HistorianSample {
                    timestamp_ms: reading.timestamp_ms,
                    tag_id: tag,
                    value: reading.value,
                    quality: reading.quality as u8,
                };
                if let Some(stored) = self.compressor.offer(sample) {
                    let _ = self.events.send(Event::Sample {
                        station: update.station.clone(),
                        slot,
                        subslot,
                        sample: stored,
                    });
                }
            }

            Self::evaluate_alarm(
                &self.events,
                &mut self.active_alarms,
                &entry.device,
                slot,
                subslot,
                &reading,
            );
        }
    }

    /// The sender connection tasks report through; used by tests to inject events.
    #[cfg(test)]
    pub(crate) fn session_events_sender(&self) -> mpsc::Sender<SessionEvent> {
        self.session_events_tx.clone()
    }

    fn evaluate_alarm(
        events: &broadcast::Sender<Event>,
        active: &mut HashMap<(String, u16, u16), bool>,
        device: &RtuDevice,
        slot: u16,
        subslot: u16,
        reading: &SensorReading,
    ) {
        let Some(config) = device.slot(slot, subslot) else {
            return;
        };
        if reading.quality != Quality::Good {
            return;
        }
        let breached = config.alarm_high.is_some_and(|h| reading.value > h)
            || config.alarm_low.is_some_and(|l| reading.value < l);
        let key = (device.station_name.clone(), slot, subslot);
        let was = active.get(&key).copied().unwrap_or(false);
        if breached && !was {
            active.insert(key, true);
            let _ = events.send(Event::AlarmRaised {
                station: device.station_name.clone(),
                slot,
                subslot,
                name: config.name.clone(),
                value: reading.value,
                at: Utc::now(),
            });
        } else if !breached && was {
            active.insert(key, false);
            let _ = events.send(Event::AlarmCleared {
                station: device.station_name.clone(),
                slot,
                subslot,
                name: config.name.clone(),
                at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AuthorityContext;
    use crate::historian::CompressionAlgorithm;
    use crate::rtu::SlotConfig;
    use crate::session::{CycleUpdate, UdpConnector};
    use profinet_types::{Iops, Quality};

    struct Harness {
        commands: mpsc::Sender<RegistryCommand>,
        events: broadcast::Receiver<Event>,
        inventory: Arc<ArcSwap<Vec<RtuDevice>>>,
        session_events: mpsc::Sender<SessionEvent>,
        handle: JoinHandle<()>,
        _frames_rx: mpsc::Receiver<Bytes>,
        _discovery_rx: mpsc::Receiver<DiscoveryCommand>,
        authority_path: std::path::PathBuf,
    }

    fn start(tag: &str) -> Harness {
        start_with(tag, true)
    }

    fn start_with(tag: &str, clean: bool) -> Harness {
        let authority_path = std::env::temp_dir().join(format!(
            "registry-test-{tag}-{}.bin",
            std::process::id()
        ));
        if clean {
            let _ = std::fs::remove_file(&authority_path);
        }

        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (commands_tx, mailbox) = mpsc::channel(16);
        let (_found_tx, found_rx) = mpsc::channel(16);
        let (discovery_tx, discovery_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = broadcast::channel(64);
        let inventory = Arc::new(ArcSwap::from_pointee(Vec::new()));

        let deps = RegistryDeps {
            connector: Arc::new(UdpConnector),
            local_station_name: "wtc-controller".to_string(),
            local_mac: [2, 0, 0, 0, 0, 1],
            local_ip: Ipv4Addr::UNSPECIFIED,
            frames_tx,
            routes: FrameRoutes::new(),
            retry: SessionRetryPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(50),
                Some(1),
            ),
            rpc_timeout: Duration::from_millis(50),
            cycle_time_ms: 32,
            watchdog_factor: 3,
            stale_command_threshold_ms: 500,
            authority_store: AuthorityStore::new(authority_path.clone()),
        };
        let registry = Registry::new(
            deps,
            mailbox,
            found_rx,
            discovery_tx,
            events_tx,
            inventory.clone(),
        );
        let session_events = registry.session_events_sender();
        let handle = tokio::spawn(registry.run());
        Harness {
            commands: commands_tx,
            events: events_rx,
            inventory,
            session_events,
            handle,
            _frames_rx: frames_rx,
            _discovery_rx: discovery_rx,
            authority_path,
        }
    }

    fn station() -> StationConfig {
        let mut sensor = SlotConfig::dap(0x120, 0x121);
        sensor.slot = 1;
        sensor.kind = SlotKind::Sensor;
        sensor.name = "intake turbidity".to_string();
        sensor.alarm_high = Some(50.0);
        let mut pump = SlotConfig::dap(0x220, 0x221);
        pump.slot = 2;
        pump.kind = SlotKind::Actuator;
        pump.name = "dosing pump".to_string();
        StationConfig {
            station_name: "wtc-rtu-01".to_string(),
            ip: None,
            netmask: None,
            gateway: None,
            vendor_id: 0x017B,
            device_id: 2,
            compression: CompressionAlgorithm::None,
            enabled: false,
            slots: vec![SlotConfig::dap(0x10, 0x11), sensor, pump],
        }
    }

    async fn add(harness: &Harness, config: StationConfig) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        harness
            .commands
            .send(RegistryCommand::AddRtu { config, reply })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn snapshot(harness: &Harness, station: &str) -> Option<RtuDevice> {
        let (reply, rx) = oneshot::channel();
        harness
            .commands
            .send(RegistryCommand::GetSnapshot {
                station: station.to_string(),
                reply,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    fn reading(timestamp_ms: u64, value: f32) -> SensorReading {
        SensorReading {
            value,
            quality: Quality::Good,
            iops: Iops::Good,
            timestamp_ms,
            stale: false,
        }
    }

    #[tokio::test]
    async fn add_snapshot_remove() {
        let harness = start("add");
        add(&harness, station()).await.unwrap();
        let device = snapshot(&harness, "wtc-rtu-01").await.unwrap();
        assert_eq!(device.state, ConnectionState::Offline);
        assert_eq!(device.slots.len(), 3);
        assert!(device.session.is_some());

        // Second add with the same name is refused.
        assert!(add(&harness, station()).await.is_err());

        let (reply, rx) = oneshot::channel();
        harness
            .commands
            .send(RegistryCommand::RemoveRtu {
                station: "wtc-rtu-01".to_string(),
                reply,
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap());
        assert!(snapshot(&harness, "wtc-rtu-01").await.is_none());

        harness.commands.send(RegistryCommand::Shutdown).await.unwrap();
        harness.handle.await.unwrap();
        let _ = std::fs::remove_file(&harness.authority_path);
    }

    #[tokio::test]
    async fn cycle_updates_feed_readings_samples_and_alarms() {
        let mut harness = start("cycle");
        add(&harness, station()).await.unwrap();

        let mut update = CycleUpdate {
            station: "wtc-rtu-01".to_string(),
            timestamp_ms: 1000,
            readings: vec![(1, 1, reading(1000, 75.0))],
            health: Default::default(),
        };
        harness
            .session_events
            .send(SessionEvent::Cycle(update.clone()))
            .await
            .unwrap();

        // Sample (compression None stores everything) and an alarm for 75 > 50.
        let mut saw_sample = false;
        let mut saw_alarm = false;
        for _ in 0..2 {
            match harness.events.recv().await.unwrap() {
                Event::Sample { station, sample, .. } => {
                    assert_eq!(station, "wtc-rtu-01");
                    assert_eq!(sample.value, 75.0);
                    saw_sample = true;
                }
                Event::AlarmRaised { name, value, .. } => {
                    assert_eq!(name, "intake turbidity");
                    assert_eq!(value, 75.0);
                    saw_alarm = true;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_sample && saw_alarm);

        let device = snapshot(&harness, "wtc-rtu-01").await.unwrap();
        assert_eq!(device.readings[&(1, 1)].value, 75.0);

        // Back inside the threshold: the alarm clears.
        update.readings = vec![(1, 1, reading(2000, 10.0))];
        update.timestamp_ms = 2000;
        harness
            .session_events
            .send(SessionEvent::Cycle(update))
            .await
            .unwrap();
        let mut saw_cleared = false;
        for _ in 0..2 {
            if let Event::AlarmCleared { name, .. } = harness.events.recv().await.unwrap() {
                assert_eq!(name, "intake turbidity");
                saw_cleared = true;
            }
        }
        assert!(saw_cleared);

        harness.commands.send(RegistryCommand::Shutdown).await.unwrap();
        harness.handle.await.unwrap();
        let _ = std::fs::remove_file(&harness.authority_path);
    }

    #[tokio::test]
    async fn state_changes_become_events_and_inventory() {
        let mut harness = start("state");
        add(&harness, station()).await.unwrap();
        // The freshly spawned task announces OFFLINE; skip anything until our injected
        // transition shows up.
        harness
            .session_events
            .send(SessionEvent::StateChanged {
                station: "wtc-rtu-01".to_string(),
                state: ConnectionState::Running,
            })
            .await
            .unwrap();
        loop {
            if let Event::RtuStateChanged { to, .. } = harness.events.recv().await.unwrap() {
                if to == ConnectionState::Running {
                    break;
                }
            }
        }
        let device = snapshot(&harness, "wtc-rtu-01").await.unwrap();
        assert_eq!(device.state, ConnectionState::Running);
        assert!(harness
            .inventory
            .load()
            .iter()
            .any(|d| d.state == ConnectionState::Running));

        harness.commands.send(RegistryCommand::Shutdown).await.unwrap();
        harness.handle.await.unwrap();
        let _ = std::fs::remove_file(&harness.authority_path);
    }

    #[tokio::test]
    async fn authority_transitions_persist_across_registries() {
        let harness = start("authority");
        add(&harness, station()).await.unwrap();

        let mut context = AuthorityContext::new(500);
        context.epoch = 7;
        context.begin_handoff("wtc-controller", 100);
        context.acknowledge_handoff(150);
        harness
            .session_events
            .send(SessionEvent::Authority {
                station: "wtc-rtu-01".to_string(),
                context,
            })
            .await
            .unwrap();

        // Wait until the snapshot reflects the transition, then shut down.
        loop {
            let device = snapshot(&harness, "wtc-rtu-01").await.unwrap();
            if device.authority.epoch == 8 {
                assert_eq!(device.authority.state, AuthorityState::Supervised);
                break;
            }
            tokio::task::yield_now().await;
        }
        harness.commands.send(RegistryCommand::Shutdown).await.unwrap();
        harness.handle.await.unwrap();

        // A second registry over the same store resumes from epoch 8.
        let harness2 = start_with("authority", false);
        add(&harness2, station()).await.unwrap();
        let device = snapshot(&harness2, "wtc-rtu-01").await.unwrap();
        assert_eq!(device.authority.epoch, 8);
        harness2.commands.send(RegistryCommand::Shutdown).await.unwrap();
        harness2.handle.await.unwrap();
        let _ = std::fs::remove_file(&harness2.authority_path);
    }

    #[tokio::test]
    async fn actuator_commands_require_supervision() {
        let harness = start("actuator");
        add(&harness, station()).await.unwrap();

        let (reply, rx) = oneshot::channel();
        harness
            .commands
            .send(RegistryCommand::IssueActuatorCommand {
                station: "wtc-rtu-01".to_string(),
                slot: 2,
                subslot: 1,
                output: ActuatorOutput {
                    command: ActuatorCommand::On,
                    pwm_duty: 0,
                },
                reply,
            })
            .await
            .unwrap();
        let result = rx.await.unwrap();
        assert!(result.is_err(), "command accepted without supervision");

        harness.commands.send(RegistryCommand::Shutdown).await.unwrap();
        harness.handle.await.unwrap();
        let _ = std::fs::remove_file(&harness.authority_path);
    }
}
