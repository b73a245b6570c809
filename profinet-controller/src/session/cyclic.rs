//! The per-session cyclic IO scheduler: one soft-real-time task per AR.
//!
//! The task owns a preformatted output C_SDU. Each tick it stamps the cycle counter and hands
//! the frame to the interface's writer queue; inputs are consumed opportunistically between
//! ticks. Historian-bound updates are sent with `try_send` so a congested consumer costs
//! samples, never cyclic frames.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use profinet_core::cyclic::{
    build_rt_frame, cycle_counter_advanced, parse_rt_frame, DATA_STATUS_DATA_VALID,
    DATA_STATUS_GOOD,
};
use profinet_types::{
    constants::{IOXS_BAD, IOXS_GOOD, SENSOR_WIRE_LEN},
    ActuatorOutput, Iops, Quality, SensorReading,
};

use super::{
    event_loop::SessionEvent, session_debug, session_trace, session_warn, ArSession,
};
use crate::rtu::{HealthCounters, SlotKind};

/// A raw PROFINET payload (FrameID onward) routed to this session by the dispatcher.
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    /// Bytes after the EtherType.
    pub payload: Vec<u8>,
}

/// Commands the owning connection task feeds the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    /// Update one actuator's output image.
    SetActuator {
        /// Slot addressed.
        slot: u16,
        /// Subslot addressed.
        subslot: u16,
        /// New output.
        output: ActuatorOutput,
    },
    /// Flip the consumer status of every output submodule: GOOD under supervision, BAD when
    /// the RTU is autonomous.
    SetAuthority {
        /// Whether the controller holds authority.
        supervised: bool,
    },
    /// Leave the loop cleanly.
    Stop,
}

/// Why the scheduler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclicExit {
    /// Commanded to stop.
    Stopped,
    /// No valid input within `watchdog_factor * cycle_time`.
    Watchdog,
}

/// One cycle's worth of decoded inputs for the registry.
#[derive(Debug, Clone)]
pub struct CycleUpdate {
    /// Station the readings belong to.
    pub station: String,
    /// Monotonic receive timestamp, milliseconds.
    pub timestamp_ms: u64,
    /// Decoded sensor readings by (slot, subslot).
    pub readings: Vec<(u16, u16, SensorReading)>,
    /// Health counters after this cycle.
    pub health: HealthCounters,
}

pub(crate) struct CyclicScheduler {
    session: ArSession,
    supervised: bool,
    frames_tx: mpsc::Sender<Bytes>,
    input_rx: mpsc::Receiver<IncomingFrame>,
    commands_rx: mpsc::Receiver<SchedulerCommand>,
    events_tx: mpsc::Sender<SessionEvent>,
    output_image: Vec<u8>,
    cycle_counter: u16,
    last_input_cycle: Option<u16>,
    health: HealthCounters,
    started: Instant,
}

impl CyclicScheduler {
    pub(crate) fn new(
        session: ArSession,
        supervised: bool,
        reconnects: u32,
        frames_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<IncomingFrame>,
        commands_rx: mpsc::Receiver<SchedulerCommand>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> CyclicScheduler {
        let mut scheduler = CyclicScheduler {
            supervised,
            frames_tx,
            input_rx,
            commands_rx,
            events_tx,
            output_image: vec![0u8; session.output_layout.total_len],
            cycle_counter: 0,
            last_input_cycle: None,
            health: HealthCounters {
                reconnect_count: reconnects,
                ..Default::default()
            },
            started: Instant::now(),
            session,
        };
        for entry in &scheduler.session.output_layout.entries.clone() {
            if entry.kind == SlotKind::Actuator {
                let wire = ActuatorOutput::default().to_wire();
                scheduler.output_image[entry.data_offset..entry.data_offset + entry.data_len]
                    .copy_from_slice(&wire);
            }
        }
        scheduler.apply_authority();
        scheduler
    }

    fn apply_authority(&mut self) {
        // Every status byte the controller writes follows its authority: provider statuses
        // on the data objects and the consumer statuses for the input submodules.
        let status = if self.supervised { IOXS_GOOD } else { IOXS_BAD };
        for entry in &self.session.output_layout.entries {
            self.output_image[entry.status_offset] = status;
        }
        for cs in &self.session.output_layout.consumer_statuses {
            self.output_image[cs.offset] = status;
        }
    }

    fn monotonic_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Drive the cyclic exchange until stopped or the watchdog fires.
    pub(crate) async fn run(mut self) -> CyclicExit {
        let mut ticker = tokio::time::interval(std::cmp::max(
            std::time::Duration::from_millis(self.session.cycle_time_ms as u64),
            std::time::Duration::from_millis(1),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let watchdog = self.session.watchdog();
        let mut last_input = Instant::now();
        let mut input_this_cycle = false;
        // The first tick fires immediately and opens the exchange.
        let mut first_cycle = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !first_cycle {
                        self.health.total_cycles += 1;
                        if input_this_cycle {
                            self.health.good_cycles += 1;
                        } else {
                            self.health.failed_cycles += 1;
                        }
                    }
                    first_cycle = false;
                    input_this_cycle = false;

                    if last_input.elapsed() > watchdog && self.health.total_cycles
                        >= self.session.watchdog_factor as u64
                    {
                        session_warn!(
                            self.session,
                            "watchdog: no valid input for {:?}",
                            last_input.elapsed()
                        );
                        return CyclicExit::Watchdog;
                    }

                    self.transmit();
                }
                cmd = self.commands_rx.recv() => match cmd {
                    Some(SchedulerCommand::SetActuator { slot, subslot, output }) => {
                        self.set_actuator(slot, subslot, output);
                    }
                    Some(SchedulerCommand::SetAuthority { supervised }) => {
                        session_debug!(self.session, "authority supervised={supervised}");
                        self.supervised = supervised;
                        self.apply_authority();
                    }
                    Some(SchedulerCommand::Stop) | None => return CyclicExit::Stopped,
                },
                frame = self.input_rx.recv() => match frame {
                    Some(frame) => {
                        if self.handle_input(&frame.payload) {
                            last_input = Instant::now();
                            input_this_cycle = true;
                        }
                    }
                    None => return CyclicExit::Stopped,
                },
            }
        }
    }

    fn transmit(&mut self) {
        let frame = build_rt_frame(
            self.session.remote_mac,
            self.session.local_mac,
            self.session.output_frame_id,
            &self.output_image,
            self.cycle_counter,
            DATA_STATUS_GOOD,
        );
        // Output frames are delivered to the writer queue in cycle order; a full queue
        // costs this cycle's frame and shows up in the health counters at the far end.
        if let Err(e) = self.frames_tx.try_send(Bytes::from(frame)) {
            session_warn!(self.session, "output frame dropped: {e}");
        }
        self.cycle_counter = self.cycle_counter.wrapping_add(self.session.reduction_ratio);
    }

    fn set_actuator(&mut self, slot: u16, subslot: u16, output: ActuatorOutput) {
        let Some(entry) = self.session.output_layout.entry(slot, subslot).copied() else {
            session_warn!(self.session, "actuator command for unknown slot {slot}.{subslot}");
            return;
        };
        let wire = output.to_wire();
        self.output_image[entry.data_offset..entry.data_offset + entry.data_len]
            .copy_from_slice(&wire);
    }

    /// Returns `true` when the frame advanced the exchange.
    fn handle_input(&mut self, payload: &[u8]) -> bool {
        let Some(frame) = parse_rt_frame(payload) else {
            session_trace!(self.session, "undecodable rt frame ignored");
            return false;
        };
        if frame.frame_id != self.session.input_frame_id {
            return false;
        }
        if let Some(previous) = self.last_input_cycle {
            if !cycle_counter_advanced(previous, frame.cycle_counter) {
                session_trace!(
                    self.session,
                    "stale frame, cycle {} after {}",
                    frame.cycle_counter,
                    previous
                );
                return false;
            }
        }
        self.last_input_cycle = Some(frame.cycle_counter);

        if frame.data_status & DATA_STATUS_DATA_VALID == 0 {
            session_trace!(self.session, "provider reports data invalid");
            return true;
        }
        if frame.data.len() < self.session.input_layout.total_len {
            session_warn!(
                self.session,
                "input C_SDU is {} bytes, layout needs {}",
                frame.data.len(),
                self.session.input_layout.total_len
            );
            return false;
        }

        let timestamp_ms = self.monotonic_ms();
        let mut readings = Vec::new();
        for entry in &self.session.input_layout.entries {
            if entry.kind != SlotKind::Sensor {
                continue;
            }
            let data = &frame.data[entry.data_offset..entry.data_offset + entry.data_len];
            let iops = frame.data[entry.status_offset];
            let reading = if entry.data_len == SENSOR_WIRE_LEN {
                SensorReading::decode_wire(data, iops, timestamp_ms).unwrap_or_else(|_| {
                    SensorReading {
                        value: 0.0,
                        quality: Quality::Bad,
                        iops: Iops::from_wire(iops),
                        timestamp_ms,
                        stale: false,
                    }
                })
            } else {
                // Discrete point: one byte, no quality on the wire.
                SensorReading {
                    value: if data[0] != 0 { 1.0 } else { 0.0 },
                    quality: Quality::Good,
                    iops: Iops::from_wire(iops),
                    timestamp_ms,
                    stale: false,
                }
            };
            readings.push((entry.slot, entry.subslot, reading));
        }

        let update = SessionEvent::Cycle(CycleUpdate {
            station: self.session.station_name.clone(),
            timestamp_ms,
            readings,
            health: self.health,
        });
        // Sample delivery is lossy by design under backpressure.
        let _ = self.events_tx.try_send(update);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use super::*;
    use crate::rtu::SlotConfig;
    use crate::session::SessionId;

    fn test_session() -> ArSession {
        let mut sensor = SlotConfig::dap(0x120, 0x121);
        sensor.slot = 1;
        sensor.kind = SlotKind::Sensor;
        let mut pump = SlotConfig::dap(0x220, 0x221);
        pump.slot = 2;
        pump.kind = SlotKind::Actuator;
        let slots = vec![SlotConfig::dap(0x10, 0x11), sensor, pump];
        ArSession::new(
            SessionId(1),
            "wtc-rtu-01".to_string(),
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 20), 34964),
            [0xAA; 6],
            [0xBB; 6],
            &slots,
            32,
            3,
        )
    }

    struct Harness {
        frames_rx: mpsc::Receiver<Bytes>,
        input_tx: mpsc::Sender<IncomingFrame>,
        commands_tx: mpsc::Sender<SchedulerCommand>,
        events_rx: mpsc::Receiver<SessionEvent>,
        handle: tokio::task::JoinHandle<CyclicExit>,
        session: ArSession,
    }

    fn spawn_scheduler(supervised: bool) -> Harness {
        let session = test_session();
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(64);
        let scheduler = CyclicScheduler::new(
            session.clone(),
            supervised,
            0,
            frames_tx,
            input_rx,
            commands_rx,
            events_tx,
        );
        Harness {
            frames_rx,
            input_tx,
            commands_tx,
            events_rx,
            handle: tokio::spawn(scheduler.run()),
            session,
        }
    }

    fn input_frame(session: &ArSession, cycle: u16, value: f32) -> IncomingFrame {
        let mut csdu = vec![0u8; session.input_layout.total_len];
        let entry = *session.input_layout.entry(1, 1).unwrap();
        csdu[entry.data_offset..entry.data_offset + 4].copy_from_slice(&value.to_be_bytes());
        csdu[entry.data_offset + 4] = 0x00; // quality good
        csdu[entry.status_offset] = IOXS_GOOD;
        // DAP status byte.
        csdu[session.input_layout.entry(0, 1).unwrap().status_offset] = IOXS_GOOD;
        let frame = build_rt_frame(
            [0xBB; 6],
            [0xAA; 6],
            session.input_frame_id,
            &csdu,
            cycle,
            DATA_STATUS_GOOD,
        );
        IncomingFrame {
            payload: frame[14..].to_vec(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_expires_without_input() {
        let harness = spawn_scheduler(false);
        let started = tokio::time::Instant::now();
        let exit = harness.handle.await.unwrap();
        assert_eq!(exit, CyclicExit::Watchdog);
        // watchdog_factor * cycle_time, give or take one cycle.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(96));
        assert!(elapsed <= Duration::from_millis(96 + 2 * 32));
        drop(harness.frames_rx);
    }

    #[tokio::test(start_paused = true)]
    async fn readings_decode_and_flow_out() {
        let mut harness = spawn_scheduler(true);
        harness
            .input_tx
            .send(input_frame(&harness.session, 32, 21.5))
            .await
            .unwrap();
        let event = harness.events_rx.recv().await.unwrap();
        let SessionEvent::Cycle(update) = event else {
            panic!("expected a cycle update");
        };
        assert_eq!(update.station, "wtc-rtu-01");
        let (slot, subslot, reading) = update.readings[0];
        assert_eq!((slot, subslot), (1, 1));
        assert_eq!(reading.value, 21.5);
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.iops, Iops::Good);

        harness.commands_tx.send(SchedulerCommand::Stop).await.unwrap();
        assert_eq!(harness.handle.await.unwrap(), CyclicExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cycle_counters_are_ignored() {
        let mut harness = spawn_scheduler(true);
        harness
            .input_tx
            .send(input_frame(&harness.session, 100, 1.0))
            .await
            .unwrap();
        let _ = harness.events_rx.recv().await.unwrap();
        // Same counter again: dropped.
        harness
            .input_tx
            .send(input_frame(&harness.session, 100, 2.0))
            .await
            .unwrap();
        // Older counter: dropped.
        harness
            .input_tx
            .send(input_frame(&harness.session, 99, 3.0))
            .await
            .unwrap();
        // Advanced counter: accepted.
        harness
            .input_tx
            .send(input_frame(&harness.session, 132, 4.0))
            .await
            .unwrap();
        let SessionEvent::Cycle(update) = harness.events_rx.recv().await.unwrap() else {
            panic!("expected a cycle update");
        };
        assert_eq!(update.readings[0].2.value, 4.0);

        harness.commands_tx.send(SchedulerCommand::Stop).await.unwrap();
        harness.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn output_frames_are_in_cycle_order() {
        let mut harness = spawn_scheduler(true);
        let mut last = None;
        for _ in 0..3 {
            let frame = harness.frames_rx.recv().await.unwrap();
            let trailer = frame.len() - 4;
            let cycle = u16::from_be_bytes([frame[trailer], frame[trailer + 1]]);
            if let Some(previous) = last {
                assert!(cycle_counter_advanced(previous, cycle));
            }
            last = Some(cycle);
        }
        harness.commands_tx.send(SchedulerCommand::Stop).await.unwrap();
        harness.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn authority_drives_iocs_bytes() {
        let mut harness = spawn_scheduler(false);
        // First transmitted frame: autonomous, so every IOCS is BAD.
        let frame = harness.frames_rx.recv().await.unwrap();
        let entry = *harness.session.output_layout.entry(2, 1).unwrap();
        let csdu_start = 14 + 2;
        assert_eq!(frame[csdu_start + entry.status_offset], IOXS_BAD);

        harness
            .commands_tx
            .send(SchedulerCommand::SetAuthority { supervised: true })
            .await
            .unwrap();
        // Drain until a frame shows the flip.
        let mut saw_good = false;
        for _ in 0..8 {
            let frame = harness.frames_rx.recv().await.unwrap();
            if frame[csdu_start + entry.status_offset] == IOXS_GOOD {
                saw_good = true;
                break;
            }
        }
        assert!(saw_good);

        harness.commands_tx.send(SchedulerCommand::Stop).await.unwrap();
        harness.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn actuator_commands_land_in_the_output_image() {
        let mut harness = spawn_scheduler(true);
        harness
            .commands_tx
            .send(SchedulerCommand::SetActuator {
                slot: 2,
                subslot: 1,
                output: ActuatorOutput {
                    command: profinet_types::ActuatorCommand::Pwm,
                    pwm_duty: 200,
                },
            })
            .await
            .unwrap();
        let entry = *harness.session.output_layout.entry(2, 1).unwrap();
        let csdu_start = 14 + 2;
        let mut saw_command = false;
        for _ in 0..8 {
            let frame = harness.frames_rx.recv().await.unwrap();
            if frame[csdu_start + entry.data_offset] == 2
                && frame[csdu_start + entry.data_offset + 1] == 200
            {
                saw_command = true;
                break;
            }
        }
        assert!(saw_command);

        harness.commands_tx.send(SchedulerCommand::Stop).await.unwrap();
        harness.handle.await.unwrap();
    }
}
