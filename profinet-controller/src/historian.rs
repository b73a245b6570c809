//! The historian compression engine gating which samples reach the time-series sink.
//!
//! One [`CompressionState`] exists per historian tag. The compressor never stores anything
//! itself; callers persist whatever [`CompressionState::offer`] hands back.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use profinet_types::constants::BOXCAR_INTERVAL_MS;
use profinet_types::Quality;

/// One value heading for the historian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistorianSample {
    /// Source timestamp, milliseconds.
    pub timestamp_ms: u64,
    /// The tag this sample belongs to.
    pub tag_id: u32,
    /// The value.
    pub value: f32,
    /// Quality byte as defined by the sensor wire format.
    pub quality: u8,
}

/// Which gate a tag runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    /// Store everything.
    #[default]
    None,
    /// Store when the value moves more than the deadband from the last stored value.
    Deadband,
    /// Deadband, but store at least once per boxcar interval.
    Boxcar,
    /// Swinging door trending.
    SwingingDoor,
}

/// Per-tag compression state.
#[derive(Debug, Clone)]
pub struct CompressionState {
    /// The gate in use.
    pub algorithm: CompressionAlgorithm,
    /// Deadband in engineering units.
    pub deadband: f32,
    first_sample: bool,
    last_stored_value: f32,
    last_stored_time: u64,
    slope_max: f64,
    slope_min: f64,
    samples_in: u64,
    samples_out: u64,
}

impl CompressionState {
    /// Fresh state for one tag.
    pub fn new(algorithm: CompressionAlgorithm, deadband: f32) -> CompressionState {
        CompressionState {
            algorithm,
            deadband,
            first_sample: true,
            last_stored_value: 0.0,
            last_stored_time: 0,
            slope_max: f64::INFINITY,
            slope_min: f64::NEG_INFINITY,
            samples_in: 0,
            samples_out: 0,
        }
    }

    /// Samples seen.
    pub fn samples_in(&self) -> u64 {
        self.samples_in
    }

    /// Samples passed through the gate.
    pub fn samples_out(&self) -> u64 {
        self.samples_out
    }

    /// `samples_out / samples_in`, 1.0 before any input.
    pub fn compression_ratio(&self) -> f64 {
        if self.samples_in == 0 {
            1.0
        } else {
            self.samples_out as f64 / self.samples_in as f64
        }
    }

    fn store(&mut self, sample: HistorianSample) -> Option<HistorianSample> {
        self.samples_out += 1;
        self.last_stored_value = sample.value;
        self.last_stored_time = sample.timestamp_ms;
        Some(sample)
    }

    /// Run one sample through the gate, returning it if it should be stored.
    pub fn offer(&mut self, sample: HistorianSample) -> Option<HistorianSample> {
        self.samples_in += 1;
        if self.first_sample {
            self.first_sample = false;
            self.slope_max = f64::INFINITY;
            self.slope_min = f64::NEG_INFINITY;
            return self.store(sample);
        }
        match self.algorithm {
            CompressionAlgorithm::None => self.store(sample),
            CompressionAlgorithm::Deadband => {
                if (sample.value - self.last_stored_value).abs() > self.deadband {
                    self.store(sample)
                } else {
                    None
                }
            }
            CompressionAlgorithm::Boxcar => {
                let elapsed = sample.timestamp_ms.saturating_sub(self.last_stored_time);
                if (sample.value - self.last_stored_value).abs() > self.deadband
                    || elapsed >= BOXCAR_INTERVAL_MS
                {
                    self.store(sample)
                } else {
                    None
                }
            }
            CompressionAlgorithm::SwingingDoor => self.offer_swinging_door(sample),
        }
    }

    fn offer_swinging_door(&mut self, sample: HistorianSample) -> Option<HistorianSample> {
        let dt = sample.timestamp_ms as i64 - self.last_stored_time as i64;
        if dt <= 0 {
            // Counted but never stored.
            return None;
        }
        let dt = dt as f64;
        let deadband = self.deadband as f64;
        let up = (sample.value as f64 + deadband - self.last_stored_value as f64) / dt;
        let down = (sample.value as f64 - deadband - self.last_stored_value as f64) / dt;
        self.slope_max = self.slope_max.min(up);
        self.slope_min = self.slope_min.max(down);
        if self.slope_max < self.slope_min {
            // Door closed: the sample that closed it is kept and anchors the next door.
            // The slopes just computed from the old anchor seed that door, so the sample
            // after a step change closes it again and the step's far edge is kept too.
            self.slope_max = up;
            self.slope_min = down;
            self.store(sample)
        } else {
            None
        }
    }

    /// Store unconditionally, re-anchoring the gate. Used on quality transitions.
    pub fn force_store(&mut self, sample: HistorianSample) -> HistorianSample {
        self.samples_in += 1;
        self.first_sample = false;
        self.slope_max = f64::INFINITY;
        self.slope_min = f64::NEG_INFINITY;
        self.store(sample).unwrap_or(sample)
    }
}

/// The per-tag compression states of the whole historian path.
#[derive(Debug, Default)]
pub struct HistorianCompressor {
    tags: HashMap<u32, CompressionState>,
    last_quality: HashMap<u32, u8>,
}

impl HistorianCompressor {
    /// An empty compressor.
    pub fn new() -> HistorianCompressor {
        HistorianCompressor::default()
    }

    /// Install a tag's algorithm and deadband, resetting any prior state.
    pub fn configure(&mut self, tag_id: u32, algorithm: CompressionAlgorithm, deadband: f32) {
        self.tags
            .insert(tag_id, CompressionState::new(algorithm, deadband));
    }

    /// Gate one sample. Quality transitions bypass compression so the historian always sees
    /// the edge.
    pub fn offer(&mut self, sample: HistorianSample) -> Option<HistorianSample> {
        let state = self
            .tags
            .entry(sample.tag_id)
            .or_insert_with(|| CompressionState::new(CompressionAlgorithm::None, 0.0));
        let quality_changed = match self.last_quality.insert(sample.tag_id, sample.quality) {
            Some(previous) => previous != sample.quality,
            None => false,
        };
        if quality_changed {
            Some(state.force_store(sample))
        } else {
            state.offer(sample)
        }
    }

    /// Per-tag state, for diagnostics.
    pub fn state(&self, tag_id: u32) -> Option<&CompressionState> {
        self.tags.get(&tag_id)
    }
}

/// Reconstruct a regular-interval series by linear interpolation between the surrounding
/// samples. `samples` must be time-ordered. Output quality at each point is the worse of the
/// bracketing samples; past the end of the input the last value is clamped.
pub fn interpolate(
    samples: &[HistorianSample],
    start_ms: u64,
    interval_ms: u64,
    count: usize,
) -> Vec<HistorianSample> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    let last = samples[samples.len() - 1];
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let t = start_ms + i as u64 * interval_ms.max(1);
        let sample = if t <= first.timestamp_ms {
            HistorianSample {
                timestamp_ms: t,
                ..*first
            }
        } else if t >= last.timestamp_ms {
            HistorianSample {
                timestamp_ms: t,
                ..last
            }
        } else {
            // partition_point gives the first sample strictly after t.
            let after = samples.partition_point(|s| s.timestamp_ms <= t);
            let b = samples[after];
            let a = samples[after - 1];
            let span = (b.timestamp_ms - a.timestamp_ms) as f64;
            let frac = (t - a.timestamp_ms) as f64 / span;
            let quality = Quality::from_wire(a.quality)
                .and_then(|qa| Quality::from_wire(b.quality).map(|qb| qa.worst(qb) as u8))
                .unwrap_or(a.quality.max(b.quality));
            HistorianSample {
                timestamp_ms: t,
                tag_id: a.tag_id,
                value: a.value + (b.value - a.value) * frac as f32,
                quality,
            }
        };
        out.push(sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(t: u64, v: f32) -> HistorianSample {
        HistorianSample {
            timestamp_ms: t,
            tag_id: 1,
            value: v,
            quality: 0,
        }
    }

    #[test]
    fn none_stores_everything() {
        let mut state = CompressionState::new(CompressionAlgorithm::None, 0.0);
        for i in 0..10 {
            assert!(state.offer(s(i, i as f32)).is_some());
        }
        assert_eq!(state.compression_ratio(), 1.0);
    }

    #[test]
    fn deadband_gates_small_moves() {
        let mut state = CompressionState::new(CompressionAlgorithm::Deadband, 1.0);
        assert!(state.offer(s(0, 10.0)).is_some()); // first always stores
        assert!(state.offer(s(1, 10.5)).is_none());
        assert!(state.offer(s(2, 11.0)).is_none()); // exactly deadband, not over
        assert!(state.offer(s(3, 11.1)).is_some());
        assert!(state.offer(s(4, 11.0)).is_none()); // relative to new anchor 11.1
        assert_eq!(state.samples_in(), 5);
        assert_eq!(state.samples_out(), 2);
    }

    #[test]
    fn boxcar_stores_on_the_minute() {
        let mut state = CompressionState::new(CompressionAlgorithm::Boxcar, 1.0);
        assert!(state.offer(s(0, 10.0)).is_some());
        assert!(state.offer(s(30_000, 10.1)).is_none());
        assert!(state.offer(s(60_000, 10.1)).is_some()); // interval elapsed
        assert!(state.offer(s(60_001, 20.0)).is_some()); // deadband exceeded
    }

    #[test]
    fn swinging_door_keeps_trend_endpoints() {
        // A flat run, a step, then flat again: the step's both edges are kept.
        let mut state = CompressionState::new(CompressionAlgorithm::SwingingDoor, 1.0);
        let stored: Vec<u64> = [
            s(0, 10.0),
            s(1, 10.0),
            s(2, 10.0),
            s(3, 20.0),
            s(4, 20.0),
        ]
        .into_iter()
        .filter_map(|sample| state.offer(sample))
        .map(|sample| sample.timestamp_ms)
        .collect();
        assert_eq!(stored, vec![0, 3, 4]);
    }

    #[test]
    fn swinging_door_compresses_a_straight_ramp() {
        let mut state = CompressionState::new(CompressionAlgorithm::SwingingDoor, 0.5);
        let mut stored = 0;
        for i in 0..100u64 {
            if state.offer(s(i, i as f32 * 2.0)).is_some() {
                stored += 1;
            }
        }
        // Only the first point of a perfect linear ramp survives.
        assert_eq!(stored, 1);
        assert!(state.compression_ratio() <= 1.0);
    }

    #[test]
    fn swinging_door_non_advancing_time_counted_not_stored() {
        let mut state = CompressionState::new(CompressionAlgorithm::SwingingDoor, 1.0);
        assert!(state.offer(s(10, 1.0)).is_some());
        assert!(state.offer(s(10, 50.0)).is_none());
        assert!(state.offer(s(9, 50.0)).is_none());
        assert_eq!(state.samples_in(), 3);
        assert_eq!(state.samples_out(), 1);
    }

    #[test]
    fn ratio_stays_within_unit_interval() {
        let mut state = CompressionState::new(CompressionAlgorithm::SwingingDoor, 0.0);
        for i in 0..50u64 {
            state.offer(s(i, (i % 7) as f32));
        }
        assert!(state.samples_out() <= state.samples_in());
        let ratio = state.compression_ratio();
        assert!((0.0..=1.0).contains(&ratio));
    }

    #[test]
    fn zero_deadband_stores_nearly_everything() {
        let mut state = CompressionState::new(CompressionAlgorithm::SwingingDoor, 0.0);
        let mut stored = 0;
        for i in 0..100u64 {
            // Square wave: the slope flips sign every sample.
            let v = if i % 2 == 0 { 0.0 } else { 10.0 };
            if state.offer(s(i, v)).is_some() {
                stored += 1;
            }
        }
        assert!(stored >= 98);
    }

    #[test]
    fn force_store_bypasses_the_gate() {
        let mut state = CompressionState::new(CompressionAlgorithm::Deadband, 100.0);
        assert!(state.offer(s(0, 10.0)).is_some());
        assert!(state.offer(s(1, 10.1)).is_none());
        let stored = state.force_store(s(2, 10.1));
        assert_eq!(stored.timestamp_ms, 2);
        assert_eq!(state.samples_out(), 2);
    }

    #[test]
    fn quality_transition_forces_a_store() {
        let mut compressor = HistorianCompressor::new();
        compressor.configure(1, CompressionAlgorithm::Deadband, 100.0);
        assert!(compressor.offer(s(0, 10.0)).is_some());
        assert!(compressor.offer(s(1, 10.0)).is_none());
        let mut bad = s(2, 10.0);
        bad.quality = 0x80;
        assert!(compressor.offer(bad).is_some());
    }

    #[test]
    fn interpolation_brackets_and_clamps() {
        let samples = vec![s(0, 0.0), s(1000, 10.0), s(2000, 30.0)];
        let out = interpolate(&samples, 0, 500, 6);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0].value, 0.0);
        assert_eq!(out[1].value, 5.0);
        assert_eq!(out[2].value, 10.0);
        assert_eq!(out[3].value, 20.0);
        assert_eq!(out[4].value, 30.0);
        // Past the end: clamped to the last value.
        assert_eq!(out[5].value, 30.0);
        assert_eq!(out[5].timestamp_ms, 2500);
    }

    #[test]
    fn interpolation_quality_is_the_worse_bracket() {
        let mut a = s(0, 0.0);
        a.quality = 0x00;
        let mut b = s(1000, 10.0);
        b.quality = 0x40;
        let out = interpolate(&[a, b], 500, 100, 1);
        assert_eq!(out[0].quality, 0x40);
    }

    #[test]
    fn empty_input_interpolates_to_nothing() {
        assert!(interpolate(&[], 0, 100, 5).is_empty());
    }
}
