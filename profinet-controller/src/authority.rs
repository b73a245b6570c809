//! The authority arbiter: epoch-based handoff of actuator control between the controller and
//! the RTU's local autonomous logic.
//!
//! Epochs are strictly monotonic and persist across controller restarts; the persisted file is
//! rewritten with write-temp, fsync, rename on every transition so a crash can only ever
//! observe the old or the new epoch, never a torn one.

use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use log::{debug, warn};
use thiserror::Error;

use profinet_types::{
    constants::MAX_STATION_NAME_LEN, read_bytes, read_u16, read_u32, read_u8, write_u16,
    write_u32, write_u8, BinaryDecodable, BinaryEncodable, EncodingResult, Error as CodecError,
};

/// Record index the controller writes handoff requests to.
pub const HANDOFF_RECORD_INDEX: u16 = 0x0300;
/// Record index the controller reads handoff acknowledgements from.
pub const HANDOFF_ACK_RECORD_INDEX: u16 = 0x0301;
/// Record index the controller writes release requests to.
pub const RELEASE_RECORD_INDEX: u16 = 0x0302;

/// Who is in control of an RTU's actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AuthorityState {
    /// The RTU's local logic runs the process.
    #[default]
    Autonomous = 0,
    /// Handoff requested, awaiting the RTU's acknowledgement.
    HandoffPending = 1,
    /// The controller runs the process.
    Supervised = 2,
    /// Release requested, awaiting the RTU's acknowledgement.
    Releasing = 3,
}

impl AuthorityState {
    /// Decode a persisted state byte.
    pub fn from_wire(value: u8) -> EncodingResult<AuthorityState> {
        match value {
            0 => Ok(AuthorityState::Autonomous),
            1 => Ok(AuthorityState::HandoffPending),
            2 => Ok(AuthorityState::Supervised),
            3 => Ok(AuthorityState::Releasing),
            other => Err(CodecError::field_out_of_range(format!(
                "authority state {other} is not known"
            ))),
        }
    }
}

/// Reasons a command is refused before it reaches the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorityViolation {
    /// The controller does not hold authority at all.
    #[error("controller is not supervising (state {state:?})")]
    NotSupervised {
        /// The state the context was in.
        state: AuthorityState,
    },
    /// The command was minted under an older epoch.
    #[error("command epoch {command} is behind current epoch {current}")]
    StaleEpoch {
        /// Epoch carried by the command.
        command: u32,
        /// Epoch currently in force.
        current: u32,
    },
    /// The command sat in a queue past the staleness threshold.
    #[error("command is {age_ms} ms old, threshold is {threshold_ms} ms")]
    StaleCommand {
        /// How old the command is.
        age_ms: u64,
        /// The configured threshold.
        threshold_ms: u64,
    },
}

/// The authority context of one RTU.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorityContext {
    /// Monotonic epoch, bumped on every transition into SUPERVISED or AUTONOMOUS.
    pub epoch: u32,
    /// Current holder state.
    pub state: AuthorityState,
    /// When the pending handoff was requested.
    pub request_time_ms: Option<u64>,
    /// When supervision was granted.
    pub grant_time_ms: Option<u64>,
    /// Station name of the current holder, empty when autonomous.
    pub holder: String,
    /// Whether the RTU currently sees the controller.
    pub controller_online: bool,
    /// Whether the RTU acknowledged the last transition.
    pub rtu_acknowledged: bool,
    /// Commands older than this are dropped.
    pub stale_command_threshold_ms: u64,
}

impl AuthorityContext {
    /// A fresh autonomous context.
    pub fn new(stale_command_threshold_ms: u64) -> AuthorityContext {
        AuthorityContext {
            epoch: 0,
            state: AuthorityState::Autonomous,
            request_time_ms: None,
            grant_time_ms: None,
            holder: String::new(),
            controller_online: false,
            rtu_acknowledged: false,
            stale_command_threshold_ms,
        }
    }

    /// Begin a handoff: bump the epoch, enter HANDOFF_PENDING. Returns the new epoch for the
    /// handoff record write.
    pub fn begin_handoff(&mut self, holder: &str, now_ms: u64) -> u32 {
        self.epoch += 1;
        self.state = AuthorityState::HandoffPending;
        self.request_time_ms = Some(now_ms);
        self.grant_time_ms = None;
        self.holder = holder.to_string();
        self.rtu_acknowledged = false;
        self.epoch
    }

    /// The RTU acknowledged the handoff; supervision starts.
    pub fn acknowledge_handoff(&mut self, now_ms: u64) {
        self.state = AuthorityState::Supervised;
        self.grant_time_ms = Some(now_ms);
        self.rtu_acknowledged = true;
    }

    /// Begin giving control back.
    pub fn begin_release(&mut self) {
        self.state = AuthorityState::Releasing;
        self.rtu_acknowledged = false;
    }

    /// The RTU acknowledged the release; it is autonomous under a fresh epoch.
    pub fn acknowledge_release(&mut self) {
        self.epoch += 1;
        self.state = AuthorityState::Autonomous;
        self.holder.clear();
        self.grant_time_ms = None;
        self.rtu_acknowledged = true;
    }

    /// The RTU reverted to autonomous on its own (cyclic silence); adopt the larger epoch so
    /// ours stays strictly monotonic when we next hand off.
    pub fn observe_autonomous_revert(&mut self, rtu_epoch: u32) {
        warn!(
            "RTU reverted to autonomous at epoch {rtu_epoch}, local epoch {}",
            self.epoch
        );
        self.state = AuthorityState::Autonomous;
        self.holder.clear();
        self.grant_time_ms = None;
        self.rtu_acknowledged = false;
        self.epoch = self.epoch.max(rtu_epoch);
    }

    /// Check a command against the epoch and staleness rules.
    pub fn validate_command(
        &self,
        command_epoch: u32,
        issued_ms: u64,
        now_ms: u64,
    ) -> Result<(), AuthorityViolation> {
        if self.state != AuthorityState::Supervised {
            return Err(AuthorityViolation::NotSupervised { state: self.state });
        }
        if command_epoch < self.epoch {
            return Err(AuthorityViolation::StaleEpoch {
                command: command_epoch,
                current: self.epoch,
            });
        }
        let age_ms = now_ms.saturating_sub(issued_ms);
        if age_ms > self.stale_command_threshold_ms {
            return Err(AuthorityViolation::StaleCommand {
                age_ms,
                threshold_ms: self.stale_command_threshold_ms,
            });
        }
        Ok(())
    }
}

/// Payload of a handoff or release record: the epoch and the initiating station.
pub fn encode_handoff_record(epoch: u32, controller_station: &str) -> EncodingResult<Vec<u8>> {
    let name = controller_station.as_bytes();
    if name.is_empty() || name.len() > MAX_STATION_NAME_LEN {
        return Err(CodecError::field_out_of_range(format!(
            "controller station name is {} bytes, must be 1..={MAX_STATION_NAME_LEN}",
            name.len()
        )));
    }
    let mut out = Vec::with_capacity(6 + name.len());
    write_u32(&mut out, epoch)?;
    write_u16(&mut out, name.len() as u16)?;
    out.extend_from_slice(name);
    Ok(out)
}

/// Parse the acknowledgement record the RTU exposes: its current epoch and an ack flag.
pub fn parse_ack_record(data: &[u8]) -> EncodingResult<(u32, bool)> {
    let mut stream = Cursor::new(data);
    let epoch = read_u32(&mut stream)?;
    let acked = read_u8(&mut stream)? != 0;
    Ok((epoch, acked))
}

/// One RTU's persisted authority facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedAuthority {
    /// Station the record belongs to.
    pub station_name: String,
    /// Epoch at the last transition.
    pub epoch: u32,
    /// State at the last transition.
    pub state: AuthorityState,
    /// Holder at the last transition.
    pub holder: String,
}

fn write_name<S: Write + ?Sized>(stream: &mut S, name: &str) -> EncodingResult<()> {
    write_u16(stream, name.len() as u16)?;
    profinet_types::process_encode_io_result(stream.write_all(name.as_bytes()))
}

fn read_name<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<String> {
    let len = read_u16(stream)? as usize;
    if len > MAX_STATION_NAME_LEN {
        return Err(CodecError::field_out_of_range(format!(
            "persisted name length {len} exceeds {MAX_STATION_NAME_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    read_bytes(stream, &mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| CodecError::field_out_of_range(format!("persisted name is not UTF-8: {e}")))
}

impl BinaryEncodable for PersistedAuthority {
    fn byte_len(&self) -> usize {
        2 + self.station_name.len() + 4 + 1 + 2 + self.holder.len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_name(stream, &self.station_name)?;
        write_u32(stream, self.epoch)?;
        write_u8(stream, self.state as u8)?;
        write_name(stream, &self.holder)
    }
}

impl BinaryDecodable for PersistedAuthority {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        let station_name = read_name(stream)?;
        let epoch = read_u32(stream)?;
        let state = AuthorityState::from_wire(read_u8(stream)?)?;
        let holder = read_name(stream)?;
        Ok(PersistedAuthority {
            station_name,
            epoch,
            state,
            holder,
        })
    }
}

/// The single-writer epoch file.
pub struct AuthorityStore {
    path: PathBuf,
}

impl AuthorityStore {
    /// A store at the given path. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> AuthorityStore {
        AuthorityStore { path: path.into() }
    }

    /// The backing path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all persisted records; a missing file is an empty store.
    pub fn load(&self) -> io::Result<HashMap<String, PersistedAuthority>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };
        let mut stream = Cursor::new(bytes.as_slice());
        let count = read_u32(&mut stream).map_err(to_io)?;
        let mut records = HashMap::new();
        for _ in 0..count {
            let record = PersistedAuthority::decode(&mut stream).map_err(to_io)?;
            records.insert(record.station_name.clone(), record);
        }
        debug!("loaded {} authority records from {:?}", records.len(), self.path);
        Ok(records)
    }

    /// Replace the file atomically: write a temp sibling, fsync it, rename it over the live
    /// file.
    pub fn save<'a>(
        &self,
        records: impl ExactSizeIterator<Item = &'a PersistedAuthority>,
    ) -> io::Result<()> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, records.len() as u32).map_err(to_io)?;
        for record in records {
            record.encode(&mut bytes).map_err(to_io)?;
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
    }
}

fn to_io(e: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_release_epoch_sequence() {
        // Starting AUTONOMOUS epoch=7: request -> HANDOFF_PENDING epoch=8; ack ->
        // SUPERVISED epoch=8 with grant time; release -> AUTONOMOUS epoch=9.
        let mut ctx = AuthorityContext::new(500);
        ctx.epoch = 7;

        let pending = ctx.begin_handoff("wtc-controller", 1000);
        assert_eq!(pending, 8);
        assert_eq!(ctx.state, AuthorityState::HandoffPending);
        assert_eq!(ctx.request_time_ms, Some(1000));

        ctx.acknowledge_handoff(1200);
        assert_eq!(ctx.state, AuthorityState::Supervised);
        assert_eq!(ctx.epoch, 8);
        assert_eq!(ctx.grant_time_ms, Some(1200));

        // A command minted under epoch 7 is rejected.
        assert_eq!(
            ctx.validate_command(7, 1300, 1300),
            Err(AuthorityViolation::StaleEpoch {
                command: 7,
                current: 8
            })
        );
        assert!(ctx.validate_command(8, 1300, 1300).is_ok());

        ctx.begin_release();
        assert_eq!(ctx.state, AuthorityState::Releasing);
        ctx.acknowledge_release();
        assert_eq!(ctx.state, AuthorityState::Autonomous);
        assert_eq!(ctx.epoch, 9);
    }

    #[test]
    fn epochs_strictly_increase_across_transitions() {
        let mut ctx = AuthorityContext::new(500);
        let mut seen = vec![ctx.epoch];
        for round in 0..5u64 {
            ctx.begin_handoff("c", round * 10);
            ctx.acknowledge_handoff(round * 10 + 1);
            seen.push(ctx.epoch);
            ctx.begin_release();
            ctx.acknowledge_release();
            seen.push(ctx.epoch);
        }
        for pair in seen.windows(2) {
            assert!(pair[1] > pair[0], "epochs not strictly increasing: {seen:?}");
        }
    }

    #[test]
    fn stale_commands_rejected() {
        let mut ctx = AuthorityContext::new(500);
        ctx.begin_handoff("c", 0);
        ctx.acknowledge_handoff(10);
        assert!(ctx.validate_command(ctx.epoch, 1000, 1400).is_ok());
        assert_eq!(
            ctx.validate_command(ctx.epoch, 1000, 1501),
            Err(AuthorityViolation::StaleCommand {
                age_ms: 501,
                threshold_ms: 500
            })
        );
    }

    #[test]
    fn commands_require_supervision() {
        let ctx = AuthorityContext::new(500);
        assert!(matches!(
            ctx.validate_command(0, 0, 0),
            Err(AuthorityViolation::NotSupervised { .. })
        ));
    }

    #[test]
    fn autonomous_revert_adopts_larger_epoch() {
        let mut ctx = AuthorityContext::new(500);
        ctx.begin_handoff("c", 0);
        ctx.acknowledge_handoff(1);
        let before = ctx.epoch;
        ctx.observe_autonomous_revert(before + 4);
        assert_eq!(ctx.state, AuthorityState::Autonomous);
        assert_eq!(ctx.epoch, before + 4);
        // The next handoff still moves strictly forward.
        assert_eq!(ctx.begin_handoff("c", 2), before + 5);
    }

    #[test]
    fn store_round_trip() {
        let dir = std::env::temp_dir().join(format!("authority-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = AuthorityStore::new(dir.join("epochs.bin"));

        assert!(store.load().unwrap().is_empty());

        let records = vec![
            PersistedAuthority {
                station_name: "wtc-rtu-01".to_string(),
                epoch: 8,
                state: AuthorityState::Supervised,
                holder: "wtc-controller".to_string(),
            },
            PersistedAuthority {
                station_name: "wtc-rtu-02".to_string(),
                epoch: 3,
                state: AuthorityState::Autonomous,
                holder: String::new(),
            },
        ];
        store.save(records.iter()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["wtc-rtu-01"], records[0]);
        assert_eq!(loaded["wtc-rtu-02"], records[1]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn handoff_record_layout() {
        let record = encode_handoff_record(8, "wtc-controller").unwrap();
        assert_eq!(&record[0..4], &[0, 0, 0, 8]);
        assert_eq!(&record[4..6], &[0, 14]);
        assert_eq!(&record[6..], b"wtc-controller");
        let (epoch, acked) = parse_ack_record(&[0, 0, 0, 8, 1]).unwrap();
        assert_eq!(epoch, 8);
        assert!(acked);
    }
}
