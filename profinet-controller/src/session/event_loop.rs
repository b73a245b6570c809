//! The per-RTU connection task: one state machine driving OFFLINE through RUNNING, the
//! reconnect back-off, and the authority handoff RPCs.
//!
//! While RUNNING, the cyclic scheduler runs as its own task; this task stays behind as the
//! session's worker, serving operator commands and record-write round trips that must not
//! stall the cyclic path.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use profinet_core::rpc::RpcClient;
use profinet_types::constants::PNIO_UDP_PORT;
use profinet_types::ActuatorOutput;

use super::connect::{self, LocalIdentity};
use super::cyclic::{CycleUpdate, CyclicExit, CyclicScheduler, SchedulerCommand};
use super::{ArSession, Connector, SessionError, SessionId};
use crate::authority::{
    encode_handoff_record, parse_ack_record, AuthorityContext, AuthorityState,
    HANDOFF_ACK_RECORD_INDEX, HANDOFF_RECORD_INDEX, RELEASE_RECORD_INDEX,
};
use crate::dispatch::FrameRoutes;
use crate::retry::SessionRetryPolicy;
use crate::rtu::{ConnectionState, SlotConfig};

/// How long the device gets to signal ApplicationReady after PrmEnd.
const APPLICATION_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-relative monotonic milliseconds, comparable across all sessions.
pub(crate) fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Operator and registry commands a connection task accepts.
#[derive(Debug)]
pub enum RtuCommand {
    /// Start pursuing a connection.
    Enable,
    /// Drop the connection and stay offline.
    Disable,
    /// Tear the session down and reconnect immediately.
    ForceReconnect,
    /// Discovery observed the station on the wire.
    Discovered {
        /// Address the station answered with.
        ip: Ipv4Addr,
        /// Its MAC.
        mac: [u8; 6],
    },
    /// Drive an actuator. Carries the epoch and mint time for authority validation.
    SetActuator {
        /// Slot addressed.
        slot: u16,
        /// Subslot addressed.
        subslot: u16,
        /// New output.
        output: ActuatorOutput,
        /// Epoch the command was minted under.
        epoch: u32,
        /// When it was minted, monotonic ms.
        issued_ms: u64,
    },
    /// Read an acyclic parameter record while the session runs.
    ReadRecord {
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
    /// Write an acyclic parameter record while the session runs.
    WriteRecord {
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
    /// Take control of the RTU's actuators.
    RequestHandoff,
    /// Give control back to the RTU.
    ReleaseHandoff,
    /// Release the AR and end the task.
    Shutdown,
}

impl RtuCommand {
    /// Answer a record command that arrived while no session was up; everything else is
    /// just logged by the caller.
    fn reject_if_record(self, station: &str) -> Option<RtuCommand> {
        match self {
            RtuCommand::ReadRecord { reply, .. } => {
                let _ = reply.send(Err(format!("station {station:?} is not connected")));
                None
            }
            RtuCommand::WriteRecord { reply, .. } => {
                let _ = reply.send(Err(format!("station {station:?} is not connected")));
                None
            }
            other => Some(other),
        }
    }
}

/// Events a connection task reports to the registry.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The state machine moved.
    StateChanged {
        /// Station concerned.
        station: String,
        /// New state.
        state: ConnectionState,
    },
    /// One cycle's decoded inputs.
    Cycle(CycleUpdate),
    /// The authority context changed; the registry persists it.
    Authority {
        /// Station concerned.
        station: String,
        /// Full context after the change.
        context: AuthorityContext,
    },
    /// A connect attempt or running session failed.
    Fault {
        /// Station concerned.
        station: String,
        /// Human-readable cause.
        detail: String,
    },
}

/// Everything a connection task needs from its surroundings.
pub struct TaskContext {
    /// Registry-issued session handle.
    pub session_id: SessionId,
    /// Transport seam.
    pub connector: Arc<dyn Connector>,
    /// Our station name, sent in the ARBlockReq and handoff records.
    pub local_station_name: String,
    /// Our MAC on the session's interface.
    pub local_mac: [u8; 6],
    /// Address RPC sockets bind to; unspecified lets the kernel route.
    pub local_ip: Ipv4Addr,
    /// The interface's frame writer queue.
    pub frames_tx: mpsc::Sender<Bytes>,
    /// FrameID demultiplexer registrations.
    pub routes: FrameRoutes,
    /// Event channel into the registry.
    pub events_tx: mpsc::Sender<SessionEvent>,
    /// Reconnect policy.
    pub retry: SessionRetryPolicy,
    /// Per-call RPC deadline.
    pub rpc_timeout: Duration,
    /// Cycle time for both CRs.
    pub cycle_time_ms: u32,
    /// Watchdog multiplier.
    pub watchdog_factor: u16,
    /// Stale-command threshold for authority validation.
    pub stale_command_threshold_ms: u64,
    /// Epoch recovered from the authority store at startup.
    pub initial_epoch: u32,
}

enum SessionOutcome {
    Watchdog,
    Faulted(String),
    Disabled,
    ForceReconnect,
    Shutdown,
}

/// The connection state machine of one RTU.
pub struct ConnectionTask {
    station: String,
    slots: Vec<SlotConfig>,
    ctx: TaskContext,
    commands: mpsc::Receiver<RtuCommand>,
    ip: Option<Ipv4Addr>,
    mac: Option<[u8; 6]>,
    authority: AuthorityContext,
    reconnects: u32,
}

impl ConnectionTask {
    /// Build a task for `station` with the given slot configuration.
    pub fn new(
        station: String,
        slots: Vec<SlotConfig>,
        ctx: TaskContext,
        commands: mpsc::Receiver<RtuCommand>,
    ) -> ConnectionTask {
        let mut authority = AuthorityContext::new(ctx.stale_command_threshold_ms);
        authority.epoch = ctx.initial_epoch;
        ConnectionTask {
            station,
            slots,
            ctx,
            commands,
            ip: None,
            mac: None,
            authority,
            reconnects: 0,
        }
    }

    async fn announce(&self, state: ConnectionState) {
        let _ = self
            .ctx
            .events_tx
            .send(SessionEvent::StateChanged {
                station: self.station.clone(),
                state,
            })
            .await;
    }

    async fn publish_authority(&self) {
        let _ = self
            .ctx
            .events_tx
            .send(SessionEvent::Authority {
                station: self.station.clone(),
                context: self.authority.clone(),
            })
            .await;
    }

    async fn fault(&self, detail: String) {
        warn!("{}: {detail}", self.station);
        let _ = self
            .ctx
            .events_tx
            .send(SessionEvent::Fault {
                station: self.station.clone(),
                detail,
            })
            .await;
    }

    fn local_identity(&self) -> LocalIdentity {
        LocalIdentity {
            station_name: self.ctx.local_station_name.clone(),
            mac: self.ctx.local_mac,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self) {
        info!("connection task for {} started", self.station);
        'offline: loop {
            self.announce(ConnectionState::Offline).await;
            // OFFLINE: remember discovery sightings, wait for Enable.
            loop {
                match self.commands.recv().await {
                    None | Some(RtuCommand::Shutdown) => break 'offline,
                    Some(RtuCommand::Enable) => break,
                    Some(RtuCommand::Discovered { ip, mac }) => {
                        self.ip = Some(ip);
                        self.mac = Some(mac);
                    }
                    Some(cmd) => {
                        if let Some(cmd) = cmd.reject_if_record(&self.station) {
                            debug!("{}: ignoring {cmd:?} while offline", self.station)
                        }
                    }
                }
            }

            // DISCOVERY: wait until the station has an address.
            self.announce(ConnectionState::Discovery).await;
            while self.ip.is_none() {
                match self.commands.recv().await {
                    None | Some(RtuCommand::Shutdown) => break 'offline,
                    Some(RtuCommand::Disable) => continue 'offline,
                    Some(RtuCommand::Discovered { ip, mac }) => {
                        self.ip = Some(ip);
                        self.mac = Some(mac);
                    }
                    Some(cmd) => {
                        if let Some(cmd) = cmd.reject_if_record(&self.station) {
                            debug!("{}: ignoring {cmd:?} during discovery", self.station)
                        }
                    }
                }
            }

            // CONNECTING / RUNNING with exponential back-off on failure.
            let mut backoff = self.ctx.retry.new_backoff();
            loop {
                self.announce(ConnectionState::Connecting).await;
                let failure = match self.establish().await {
                    Ok((rpc, session)) => {
                        // A successful session resets the back-off.
                        backoff = self.ctx.retry.new_backoff();
                        match self.run_session(rpc, session).await {
                            SessionOutcome::Watchdog => Some("cyclic watchdog expired".to_string()),
                            SessionOutcome::Faulted(detail) => Some(detail),
                            SessionOutcome::ForceReconnect => {
                                self.reconnects += 1;
                                continue;
                            }
                            SessionOutcome::Disabled => continue 'offline,
                            SessionOutcome::Shutdown => break 'offline,
                        }
                    }
                    Err(e) => Some(e.to_string()),
                };

                if let Some(detail) = failure {
                    self.fault(detail).await;
                    self.announce(ConnectionState::Error).await;
                    self.reconnects += 1;
                    let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                    debug!("{}: reconnecting in {delay:?}", self.station);
                    match self.wait_through_backoff(delay).await {
                        BackoffOutcome::Elapsed => {}
                        BackoffOutcome::Disabled => continue 'offline,
                        BackoffOutcome::Shutdown => break 'offline,
                    }
                }
            }
        }
        self.announce(ConnectionState::Offline).await;
        info!("connection task for {} stopped", self.station);
    }

    async fn wait_through_backoff(&mut self, delay: Duration) -> BackoffOutcome {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return BackoffOutcome::Elapsed,
                cmd = self.commands.recv() => match cmd {
                    None | Some(RtuCommand::Shutdown) => return BackoffOutcome::Shutdown,
                    Some(RtuCommand::Disable) => return BackoffOutcome::Disabled,
                    Some(RtuCommand::ForceReconnect) => return BackoffOutcome::Elapsed,
                    Some(RtuCommand::Discovered { ip, mac }) => {
                        self.ip = Some(ip);
                        self.mac = Some(mac);
                    }
                    Some(cmd) => {
                        if let Some(cmd) = cmd.reject_if_record(&self.station) {
                            debug!("{}: ignoring {cmd:?} during backoff", self.station)
                        }
                    }
                }
            }
        }
    }

    /// The Connect, PrmEnd, ApplicationReady sequence.
    async fn establish(&mut self) -> Result<(RpcClient, ArSession), SessionError> {
        let ip = self
            .ip
            .ok_or_else(|| SessionError::Protocol("station has no address".to_string()))?;
        let mut session = ArSession::new(
            self.ctx.session_id,
            self.station.clone(),
            SocketAddrV4::new(ip, PNIO_UDP_PORT),
            self.mac.unwrap_or([0; 6]),
            self.ctx.local_mac,
            &self.slots,
            self.ctx.cycle_time_ms,
            self.ctx.watchdog_factor,
        );
        let mut rpc = self
            .ctx
            .connector
            .connect(
                self.ctx.local_ip,
                session.remote,
                session.ar_uuid,
                self.ctx.rpc_timeout,
            )
            .await?;
        connect::connect(&mut rpc, &mut session, &self.slots, &self.local_identity()).await?;
        self.announce(ConnectionState::Connected).await;
        connect::prm_end(&mut rpc, &session).await?;
        connect::await_application_ready(&mut rpc, &session, APPLICATION_READY_TIMEOUT).await?;
        let _ = connect::read_identification(&mut rpc, &mut session).await;
        Ok((rpc, session))
    }

    /// RUNNING: supervise the cyclic scheduler and serve worker-side RPCs.
    async fn run_session(&mut self, mut rpc: RpcClient, session: ArSession) -> SessionOutcome {
        let (input_tx, input_rx) = mpsc::channel(64);
        let (sched_tx, sched_rx) = mpsc::channel(16);
        self.ctx.routes.insert(session.input_frame_id, input_tx);

        let scheduler = CyclicScheduler::new(
            session.clone(),
            self.authority.state == AuthorityState::Supervised,
            self.reconnects,
            self.ctx.frames_tx.clone(),
            input_rx,
            sched_rx,
            self.ctx.events_tx.clone(),
        );
        let mut cyclic = tokio::spawn(scheduler.run());

        self.announce(ConnectionState::Running).await;
        self.authority.controller_online = true;
        self.publish_authority().await;

        let mut session = session;
        let mut cyclic_done = false;
        let outcome = loop {
            tokio::select! {
                exit = &mut cyclic => {
                    cyclic_done = true;
                    match exit {
                        Ok(CyclicExit::Watchdog) => break SessionOutcome::Watchdog,
                        Ok(CyclicExit::Stopped) => {
                            break SessionOutcome::Faulted("cyclic scheduler stopped unexpectedly".to_string())
                        }
                        Err(e) => break SessionOutcome::Faulted(format!("cyclic task panicked: {e}")),
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    None | Some(RtuCommand::Shutdown) => {
                        self.teardown(&mut rpc, &session, &sched_tx, &mut cyclic, &mut cyclic_done).await;
                        break SessionOutcome::Shutdown;
                    }
                    Some(RtuCommand::Disable) => {
                        self.teardown(&mut rpc, &session, &sched_tx, &mut cyclic, &mut cyclic_done).await;
                        break SessionOutcome::Disabled;
                    }
                    Some(RtuCommand::ForceReconnect) => {
                        self.teardown(&mut rpc, &session, &sched_tx, &mut cyclic, &mut cyclic_done).await;
                        break SessionOutcome::ForceReconnect;
                    }
                    Some(RtuCommand::Enable) => {}
                    Some(RtuCommand::Discovered { ip, mac }) => {
                        self.ip = Some(ip);
                        self.mac = Some(mac);
                    }
                    Some(RtuCommand::SetActuator { slot, subslot, output, epoch, issued_ms }) => {
                        match self.authority.validate_command(epoch, issued_ms, now_ms()) {
                            Ok(()) => {
                                let _ = sched_tx
                                    .send(SchedulerCommand::SetActuator { slot, subslot, output })
                                    .await;
                            }
                            // The RTU would drop it silently; we at least say why.
                            Err(violation) => {
                                warn!("{}: actuator command dropped: {violation}", self.station)
                            }
                        }
                    }
                    Some(RtuCommand::ReadRecord { api, slot, subslot, index, max_len, reply }) => {
                        let result = connect::read_record(
                            &mut rpc, &mut session, api, slot, subslot, index, max_len,
                        )
                        .await
                        .map_err(|e| e.to_string());
                        let _ = reply.send(result);
                    }
                    Some(RtuCommand::WriteRecord { api, slot, subslot, index, data, reply }) => {
                        let result = connect::write_record(
                            &mut rpc, &mut session, api, slot, subslot, index, &data,
                        )
                        .await
                        .map_err(|e| e.to_string());
                        let _ = reply.send(result);
                    }
                    Some(RtuCommand::RequestHandoff) => {
                        self.request_handoff(&mut rpc, &mut session, &sched_tx).await;
                    }
                    Some(RtuCommand::ReleaseHandoff) => {
                        self.release_handoff(&mut rpc, &mut session, &sched_tx).await;
                    }
                },
            }
        };

        self.ctx.routes.remove(session.input_frame_id);
        self.authority.controller_online = false;
        if matches!(outcome, SessionOutcome::Watchdog)
            && self.authority.state == AuthorityState::Supervised
        {
            // Cyclic silence makes the RTU revert on its own; mirror that locally and
            // resynchronise the epoch on reconnect.
            let epoch = self.authority.epoch;
            self.authority.observe_autonomous_revert(epoch);
        }
        self.publish_authority().await;
        outcome
    }

    async fn teardown(
        &mut self,
        rpc: &mut RpcClient,
        session: &ArSession,
        sched_tx: &mpsc::Sender<SchedulerCommand>,
        cyclic: &mut tokio::task::JoinHandle<CyclicExit>,
        cyclic_done: &mut bool,
    ) {
        self.announce(ConnectionState::Disconnect).await;
        let _ = sched_tx.send(SchedulerCommand::Stop).await;
        if !*cyclic_done {
            let _ = cyclic.await;
            *cyclic_done = true;
        }
        if let Err(e) = connect::release(rpc, session).await {
            debug!("{}: release failed: {e}", self.station);
        }
    }

    async fn request_handoff(
        &mut self,
        rpc: &mut RpcClient,
        session: &mut ArSession,
        sched_tx: &mpsc::Sender<SchedulerCommand>,
    ) {
        let epoch = self
            .authority
            .begin_handoff(&self.ctx.local_station_name, now_ms());
        self.publish_authority().await;

        let record = match encode_handoff_record(epoch, &self.ctx.local_station_name) {
            Ok(r) => r,
            Err(e) => {
                self.fault(format!("handoff record encoding failed: {e}")).await;
                return;
            }
        };
        if let Err(e) =
            connect::write_record(rpc, session, 0, 0, 1, HANDOFF_RECORD_INDEX, &record).await
        {
            self.fault(format!("handoff record write failed: {e}")).await;
            return;
        }
        match connect::read_record(rpc, session, 0, 0, 1, HANDOFF_ACK_RECORD_INDEX, 16).await {
            Ok(data) => match parse_ack_record(&data) {
                Ok((ack_epoch, true)) if ack_epoch == epoch => {
                    self.authority.acknowledge_handoff(now_ms());
                    let _ = sched_tx
                        .send(SchedulerCommand::SetAuthority { supervised: true })
                        .await;
                    self.publish_authority().await;
                    info!("{}: supervising at epoch {epoch}", self.station);
                }
                Ok((ack_epoch, acked)) => {
                    self.fault(format!(
                        "handoff not acknowledged (epoch {ack_epoch}, acked {acked})"
                    ))
                    .await;
                }
                Err(e) => self.fault(format!("handoff ack unparseable: {e}")).await,
            },
            Err(e) => self.fault(format!("handoff ack read failed: {e}")).await,
        }
    }

    async fn release_handoff(
        &mut self,
        rpc: &mut RpcClient,
        session: &mut ArSession,
        sched_tx: &mpsc::Sender<SchedulerCommand>,
    ) {
        if self.authority.state != AuthorityState::Supervised {
            debug!("{}: release requested while not supervising", self.station);
            return;
        }
        self.authority.begin_release();
        self.publish_authority().await;

        let record = match encode_handoff_record(self.authority.epoch, &self.ctx.local_station_name)
        {
            Ok(r) => r,
            Err(e) => {
                self.fault(format!("release record encoding failed: {e}")).await;
                return;
            }
        };
        if let Err(e) =
            connect::write_record(rpc, session, 0, 0, 1, RELEASE_RECORD_INDEX, &record).await
        {
            self.fault(format!("release record write failed: {e}")).await;
            return;
        }
        match connect::read_record(rpc, session, 0, 0, 1, HANDOFF_ACK_RECORD_INDEX, 16).await {
            Ok(data) => match parse_ack_record(&data) {
                Ok((_, true)) => {
                    self.authority.acknowledge_release();
                    let _ = sched_tx
                        .send(SchedulerCommand::SetAuthority { supervised: false })
                        .await;
                    self.publish_authority().await;
                    info!(
                        "{}: autonomous again at epoch {}",
                        self.station, self.authority.epoch
                    );
                }
                Ok((ack_epoch, _)) => {
                    self.fault(format!("release not acknowledged at epoch {ack_epoch}"))
                        .await;
                }
                Err(e) => self.fault(format!("release ack unparseable: {e}")).await,
            },
            Err(e) => self.fault(format!("release ack read failed: {e}")).await,
        }
    }
}

enum BackoffOutcome {
    Elapsed,
    Disabled,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::dispatch::FrameRoutes;
    use crate::rtu::SlotKind;
    use crate::session::SessionId;
    use profinet_core::rpc::{
        NdrHeader, Opnum, RpcError, RpcHeader, RpcPacketType, NDR_HEADER_LEN,
    };
    use profinet_types::blocks::{
        ArBlockReq, ArBlockRes, BlockType, ControlBlock, ControlCommand, IocrType,
    };
    use profinet_types::{BinaryDecodable, BinaryEncodable, PnUuid};

    /// Ignores the configured endpoint and aims every session at the scripted device.
    struct LoopbackConnector {
        device: SocketAddrV4,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(
            &self,
            _local_ip: Ipv4Addr,
            _remote: SocketAddrV4,
            object_uuid: PnUuid,
            timeout: Duration,
        ) -> Result<profinet_core::rpc::RpcClient, RpcError> {
            profinet_core::rpc::RpcClient::bind(
                Ipv4Addr::LOCALHOST,
                self.device,
                object_uuid,
                timeout,
            )
            .await
        }
    }

    fn respond(request_header: &RpcHeader, payload: &[u8], status: u32) -> Vec<u8> {
        let mut out = Vec::new();
        RpcHeader::response_to(request_header, (NDR_HEADER_LEN + payload.len()) as u16)
            .encode(&mut out)
            .unwrap();
        let mut ndr = NdrHeader::for_response(payload.len());
        ndr.args_maximum = status;
        ndr.encode(&mut out).unwrap();
        out.extend_from_slice(payload);
        out
    }

    async fn recv_call(socket: &UdpSocket) -> (RpcHeader, Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 8192];
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(&buf[..n]);
        let header = RpcHeader::decode(&mut cursor).unwrap();
        let body_start = cursor.position() as usize + NDR_HEADER_LEN;
        (header, buf[body_start..n].to_vec(), peer)
    }

    /// A scripted device: Connect, PrmEnd, then it calls ApplicationReady, rejects the I&M
    /// read, and finally acknowledges Release.
    async fn scripted_device(socket: UdpSocket) {
        // Connect.
        let (header, body, peer) = recv_call(&socket).await;
        assert_eq!(Opnum::from_wire(header.opnum).unwrap(), Opnum::Connect);
        let mut cursor = std::io::Cursor::new(body.as_slice());
        let ar_req = ArBlockReq::decode(&mut cursor).unwrap();
        let ar_uuid = ar_req.ar_uuid;
        let session_key = ar_req.session_key;
        let mut blocks = ArBlockRes {
            ar_type: ar_req.ar_type,
            ar_uuid,
            session_key,
            cm_responder_mac: [0x00, 0x30, 0x11, 1, 2, 3],
            cm_responder_udp_rt_port: 0x8892,
        }
        .encode_to_vec();
        let input_res = profinet_types::blocks::IocrBlockRes {
            iocr_type: IocrType::Input,
            iocr_reference: 1,
            frame_id: 0xC101,
        };
        input_res.encode(&mut blocks).unwrap();
        socket
            .send_to(&respond(&header, &blocks, 0), peer)
            .await
            .unwrap();

        // PrmEnd.
        let (header, body, peer) = recv_call(&socket).await;
        assert_eq!(Opnum::from_wire(header.opnum).unwrap(), Opnum::Control);
        let prm_end = ControlBlock::decode(&mut body.as_slice()).unwrap();
        assert_eq!(prm_end.control_command, ControlCommand::PrmEnd);
        let mut ack = prm_end;
        ack.block_type = BlockType::IodControlPrmEndRes;
        ack.control_command = ControlCommand::Done;
        socket
            .send_to(&respond(&header, &ack.encode_to_vec(), 0), peer)
            .await
            .unwrap();

        // ApplicationReady, device initiated; the controller must answer explicitly.
        let ready = ControlBlock {
            block_type: BlockType::IodControlApplicationReadyReq,
            ar_uuid,
            session_key,
            control_command: ControlCommand::ApplicationReady,
            control_block_properties: 0,
        };
        let payload = ready.encode_to_vec();
        let mut request = Vec::new();
        RpcHeader::request(
            ar_uuid,
            PnUuid::new(),
            0,
            Opnum::Control,
            (NDR_HEADER_LEN + payload.len()) as u16,
        )
        .encode(&mut request)
        .unwrap();
        NdrHeader::for_request(payload.len(), 4096)
            .encode(&mut request)
            .unwrap();
        request.extend_from_slice(&payload);
        socket.send_to(&request, peer).await.unwrap();

        let mut buf = vec![0u8; 8192];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(&buf[..n]);
        let response = RpcHeader::decode(&mut cursor).unwrap();
        assert_eq!(response.packet_type, RpcPacketType::Response);
        let ready_ack =
            ControlBlock::decode(&mut &buf[cursor.position() as usize + NDR_HEADER_LEN..n])
                .unwrap();
        assert_eq!(
            ready_ack.block_type,
            BlockType::IodControlApplicationReadyRes
        );
        assert_eq!(ready_ack.control_command, ControlCommand::Done);

        // I&M0 read: rejected, the session must survive.
        let (header, _, peer) = recv_call(&socket).await;
        assert_eq!(Opnum::from_wire(header.opnum).unwrap(), Opnum::Read);
        socket
            .send_to(&respond(&header, &[], 0xDE80_B000), peer)
            .await
            .unwrap();

        // Release on shutdown.
        let (header, body, peer) = recv_call(&socket).await;
        assert_eq!(Opnum::from_wire(header.opnum).unwrap(), Opnum::Release);
        let release = ControlBlock::decode(&mut body.as_slice()).unwrap();
        assert_eq!(release.control_command, ControlCommand::Release);
        let mut ack = release;
        ack.block_type = BlockType::IodControlReleaseRes;
        ack.control_command = ControlCommand::Done;
        socket
            .send_to(&respond(&header, &ack.encode_to_vec(), 0), peer)
            .await
            .unwrap();
    }

    fn test_slots() -> Vec<SlotConfig> {
        let mut sensor = SlotConfig::dap(0x120, 0x121);
        sensor.slot = 1;
        sensor.kind = SlotKind::Sensor;
        let mut pump = SlotConfig::dap(0x220, 0x221);
        pump.slot = 2;
        pump.kind = SlotKind::Actuator;
        vec![SlotConfig::dap(0x10, 0x11), sensor, pump]
    }

    #[tokio::test]
    async fn full_connect_sequence_reaches_running_and_releases() {
        let device_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = match device_socket.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let device = tokio::spawn(scripted_device(device_socket));

        let (frames_tx, mut frames_rx) = mpsc::channel(64);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let routes = FrameRoutes::new();

        let ctx = TaskContext {
            session_id: SessionId(1),
            connector: Arc::new(LoopbackConnector {
                device: device_addr,
            }),
            local_station_name: "wtc-controller".to_string(),
            local_mac: [2, 0, 0, 0, 0, 1],
            local_ip: Ipv4Addr::LOCALHOST,
            frames_tx,
            routes: routes.clone(),
            events_tx,
            retry: SessionRetryPolicy::default(),
            rpc_timeout: Duration::from_secs(1),
            cycle_time_ms: 32,
            watchdog_factor: 3,
            stale_command_threshold_ms: 500,
            initial_epoch: 0,
        };
        let task = ConnectionTask::new("wtc-rtu-01".to_string(), test_slots(), ctx, commands_rx);
        let handle = tokio::spawn(task.run());

        commands_tx.send(RtuCommand::Enable).await.unwrap();
        commands_tx
            .send(RtuCommand::Discovered {
                ip: Ipv4Addr::LOCALHOST,
                mac: [0x00, 0x30, 0x11, 1, 2, 3],
            })
            .await
            .unwrap();

        // The state machine must pass through the canonical sequence.
        let states = tokio::time::timeout(Duration::from_secs(10), async {
            let mut states = Vec::new();
            while states.last() != Some(&ConnectionState::Running) {
                match events_rx.recv().await.unwrap() {
                    SessionEvent::StateChanged { state, .. } => states.push(state),
                    _ => {}
                }
            }
            states
        })
        .await
        .expect("never reached RUNNING");
        assert_eq!(
            states,
            vec![
                ConnectionState::Offline,
                ConnectionState::Discovery,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Running,
            ]
        );

        // The scheduler transmits output frames; the device moved our input CR to 0xC101.
        let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .expect("no output frame")
            .unwrap();
        assert!(routes.lookup(0xC101).is_some());
        let frame_id = u16::from_be_bytes([frame[14], frame[15]]);
        assert!((0xC000..=0xFBFF).contains(&frame_id));

        commands_tx.send(RtuCommand::Shutdown).await.unwrap();
        handle.await.unwrap();
        device.await.unwrap();
        assert!(routes.lookup(0xC101).is_none());
    }
}
