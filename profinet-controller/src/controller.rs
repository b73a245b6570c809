//! The public face of the controller: a cloneable command handle and the runner that owns the
//! interface and its tasks.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{error, info};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use profinet_core::dcp::DcpDevice;
use profinet_core::ethernet::{detect_interface, spawn_frame_writer, RawEthernetSocket};
use profinet_types::ActuatorOutput;

use crate::authority::AuthorityStore;
use crate::config::{Config, ConfigError, ControllerConfig, StationConfig};
use crate::discovery::DiscoveryEngine;
use crate::dispatch::{spawn_dispatcher, FrameRoutes};
use crate::registry::{Event, Registry, RegistryCommand, RegistryDeps};
use crate::retry::SessionRetryPolicy;
use crate::rtu::RtuDevice;
use crate::session::UdpConnector;

/// Errors surfaced by the controller API.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The orchestrator is gone.
    #[error("controller is shut down")]
    Closed,
    /// The orchestrator refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Binding the interface failed; unrecoverable for the process.
    #[error("interface error: {0}")]
    Io(#[from] std::io::Error),
    /// The injected configuration is unusable.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Cloneable handle for talking to the orchestrator.
#[derive(Clone)]
pub struct Controller {
    commands: mpsc::Sender<RegistryCommand>,
    events: broadcast::Sender<Event>,
    inventory: Arc<ArcSwap<Vec<RtuDevice>>>,
}

impl Controller {
    /// Provision a new RTU at runtime.
    pub async fn add_rtu(&self, config: StationConfig) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::AddRtu { config, reply })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await
            .map_err(|_| ControllerError::Closed)?
            .map_err(ControllerError::Rejected)
    }

    /// Remove an RTU, releasing its session. Returns whether it existed.
    pub async fn remove_rtu(&self, station: &str) -> Result<bool, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::RemoveRtu {
                station: station.to_string(),
                reply,
            })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await.map_err(|_| ControllerError::Closed)
    }

    /// Start pursuing a connection for `station`.
    pub async fn enable(&self, station: &str) -> Result<(), ControllerError> {
        self.commands
            .send(RegistryCommand::Enable {
                station: station.to_string(),
            })
            .await
            .map_err(|_| ControllerError::Closed)
    }

    /// Drop `station`'s connection and stay offline.
    pub async fn disable(&self, station: &str) -> Result<(), ControllerError> {
        self.commands
            .send(RegistryCommand::Disable {
                station: station.to_string(),
            })
            .await
            .map_err(|_| ControllerError::Closed)
    }

    /// Tear `station`'s session down and reconnect immediately.
    pub async fn force_reconnect(&self, station: &str) -> Result<(), ControllerError> {
        self.commands
            .send(RegistryCommand::ForceReconnect {
                station: station.to_string(),
            })
            .await
            .map_err(|_| ControllerError::Closed)
    }

    /// A point-in-time clone of one RTU record.
    pub async fn snapshot(&self, station: &str) -> Result<Option<RtuDevice>, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::GetSnapshot {
                station: station.to_string(),
                reply,
            })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await.map_err(|_| ControllerError::Closed)
    }

    /// Stations DCP has seen, configured or not.
    pub async fn list_discovered(&self) -> Result<Vec<DcpDevice>, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::ListDiscovered { reply })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await.map_err(|_| ControllerError::Closed)
    }

    /// The latest full inventory, lock free.
    pub fn inventory(&self) -> Arc<Vec<RtuDevice>> {
        self.inventory.load_full()
    }

    /// Subscribe to alarm, sample and lifecycle events. A lagging subscriber loses oldest
    /// events rather than slowing the data plane.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Drive an actuator; accepted only under supervision with a fresh epoch.
    pub async fn issue_actuator_command(
        &self,
        station: &str,
        slot: u16,
        subslot: u16,
        output: ActuatorOutput,
    ) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::IssueActuatorCommand {
                station: station.to_string(),
                slot,
                subslot,
                output,
                reply,
            })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await
            .map_err(|_| ControllerError::Closed)?
            .map_err(ControllerError::Rejected)
    }

    /// Read an acyclic parameter record from a running session.
    pub async fn read_record(
        &self,
        station: &str,
        api: u32,
        slot: u16,
        subslot: u16,
        index: u16,
        max_len: u32,
    ) -> Result<Vec<u8>, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::ReadRecord {
                station: station.to_string(),
                api,
                slot,
                subslot,
                index,
                max_len,
                reply,
            })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await
            .map_err(|_| ControllerError::Closed)?
            .map_err(ControllerError::Rejected)
    }

    /// Write an acyclic parameter record through a running session.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_record(
        &self,
        station: &str,
        api: u32,
        slot: u16,
        subslot: u16,
        index: u16,
        data: Vec<u8>,
    ) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::WriteRecord {
                station: station.to_string(),
                api,
                slot,
                subslot,
                index,
                data,
                reply,
            })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await
            .map_err(|_| ControllerError::Closed)?
            .map_err(ControllerError::Rejected)
    }

    /// Write a station name to a device found by DCP, e.g. when commissioning.
    pub async fn set_station_name(
        &self,
        mac: [u8; 6],
        name: &str,
    ) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RegistryCommand::SetStationName {
                mac,
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await
            .map_err(|_| ControllerError::Closed)?
            .map_err(ControllerError::Rejected)
    }

    /// Take control of `station`'s actuators.
    pub async fn request_handoff(&self, station: &str) -> Result<(), ControllerError> {
        self.commands
            .send(RegistryCommand::RequestHandoff {
                station: station.to_string(),
            })
            .await
            .map_err(|_| ControllerError::Closed)
    }

    /// Give control of `station` back to its local logic.
    pub async fn release_handoff(&self, station: &str) -> Result<(), ControllerError> {
        self.commands
            .send(RegistryCommand::ReleaseHandoff {
                station: station.to_string(),
            })
            .await
            .map_err(|_| ControllerError::Closed)
    }

    /// Release every session and stop the orchestrator.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.commands
            .send(RegistryCommand::Shutdown)
            .await
            .map_err(|_| ControllerError::Closed)
    }
}

/// Owns the interface and every task; run it to completion on the host's runtime.
#[must_use = "the controller does nothing until its runner is run"]
pub struct ControllerRunner {
    config: ControllerConfig,
    controller: Controller,
    mailbox: mpsc::Receiver<RegistryCommand>,
    events: broadcast::Sender<Event>,
    inventory: Arc<ArcSwap<Vec<RtuDevice>>>,
}

/// Build a controller from an injected configuration.
pub fn new_controller(
    config: ControllerConfig,
) -> Result<(Controller, ControllerRunner), ControllerError> {
    if let Err(errors) = config.validate() {
        return Err(ControllerError::Config(ConfigError::ConfigInvalid(errors)));
    }
    let (commands, mailbox) = mpsc::channel(config.mailbox_capacity.max(1));
    let (events, _) = broadcast::channel(config.event_capacity.max(1));
    let inventory = Arc::new(ArcSwap::from_pointee(Vec::new()));
    let controller = Controller {
        commands,
        events: events.clone(),
        inventory: inventory.clone(),
    };
    let runner = ControllerRunner {
        config,
        controller: controller.clone(),
        mailbox,
        events,
        inventory,
    };
    Ok((controller, runner))
}

impl ControllerRunner {
    /// Bind the interface, spawn the task tree and serve until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        let interface = match self.config.interface.clone() {
            Some(interface) => interface,
            None => detect_interface()?,
        };
        let socket = Arc::new(RawEthernetSocket::open(&interface)?);
        info!(
            "controller {:?} on {} (mac {:02X?})",
            self.config.controller_station_name,
            interface,
            socket.mac()
        );

        let (frames_tx, frames_rx) = mpsc::channel(256);
        let writer = spawn_frame_writer(socket.clone(), frames_rx);

        let routes = FrameRoutes::new();
        let (dcp_tx, dcp_rx) = mpsc::channel(64);
        let dispatcher = spawn_dispatcher(socket.clone(), routes.clone(), dcp_tx);

        let (found_tx, found_rx) = mpsc::channel(64);
        let (discovery_tx, discovery_rx) = mpsc::channel(16);
        let discovery = DiscoveryEngine::new(
            socket.mac(),
            Duration::from_millis(self.config.discovery_interval_ms.max(1)),
            frames_tx.clone(),
            dcp_rx,
            discovery_rx,
            found_tx,
        );
        let discovery_handle = tokio::spawn(discovery.run());

        let deps = RegistryDeps {
            connector: Arc::new(UdpConnector),
            local_station_name: self.config.controller_station_name.clone(),
            local_mac: socket.mac(),
            local_ip: self.config.local_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            frames_tx,
            routes,
            retry: SessionRetryPolicy::default(),
            rpc_timeout: Duration::from_millis(self.config.rpc_timeout_ms.max(1)),
            cycle_time_ms: self.config.cycle_time_ms,
            watchdog_factor: self.config.watchdog_factor,
            stale_command_threshold_ms: self.config.stale_command_threshold_ms,
            authority_store: AuthorityStore::new(self.config.authority_file.clone()),
        };
        let registry = Registry::new(
            deps,
            self.mailbox,
            found_rx,
            discovery_tx,
            self.events.clone(),
            self.inventory.clone(),
        );
        let registry_handle = tokio::spawn(registry.run());

        // Seed the configured stations through the normal mailbox path.
        for station in self.config.stations.clone() {
            let name = station.station_name.clone();
            if let Err(e) = self.controller.add_rtu(station).await {
                error!("station {name:?} not added: {e}");
            }
        }

        let result = registry_handle.await;

        // The registry has drained and released every session; the plumbing can go.
        discovery_handle.abort();
        dispatcher.abort();
        writer.abort();

        result.map_err(|e| {
            ControllerError::Rejected(format!("registry task failed: {e}"))
        })
    }
}
