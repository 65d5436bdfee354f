//! Sensor registry: latest state per identity, merge, and change detection
//! (spec §4.F).
//!
//! Backed by a `Mutex<Vec<SensorRecord>>` rather than the teacher's
//! hand-rolled `StateGuard` — the access pattern (linear scan by identity,
//! whole-record mutation) doesn't need anything richer, and the hold order
//! (registry lock, then each metric's own `History` lock, never the
//! reverse) matches spec §5.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::history::History;
use crate::protocols::Decoder;
use crate::reading::{MetricBits, SensorIdentity, SensorReading};

/// One tracked physical device: its last-merged reading plus bounded
/// per-metric history.
#[derive(Debug)]
pub struct SensorRecord {
    pub identity: SensorIdentity,
    pub reading: SensorReading,
    /// Index into `GatewayConfig::sensors`, if this identity matches a
    /// user-declared `SensorDef`.
    pub sensor_index: Option<usize>,
    pub temperature_history: History,
    pub humidity_history: History,
}

/// Merge `new` into `stored` field-by-field and report which metrics
/// changed. Most decoders use this directly via `Decoder::update`'s default
/// body; TX7U overrides it because its frames carry temperature and
/// humidity disjointly and the "unchanged" comparison must be scoped to
/// whichever single metric the frame actually carries.
#[must_use]
pub fn default_update(new: &SensorReading, stored: &mut SensorReading, now: SystemTime, stale_gap: Duration) -> MetricBits {
    let gap = now.duration_since(stored.observed_at).unwrap_or(Duration::ZERO);

    let mut changed = MetricBits::empty();
    if let Some(t) = new.temperature_x10 {
        if stored.temperature_x10 != Some(t) {
            changed |= MetricBits::TEMPERATURE;
        }
    }
    if let Some(h) = new.humidity {
        if stored.humidity != Some(h) {
            changed |= MetricBits::HUMIDITY;
        }
    }
    if let Some(b) = new.battery_ok {
        if stored.battery_ok != Some(b) {
            changed |= MetricBits::BATTERY_STATUS;
        }
    }

    if changed.is_empty() {
        if gap < Duration::from_secs(2) {
            return MetricBits::TIME_NOT_CHANGED;
        }
        if !stale_gap.is_zero() && gap >= stale_gap {
            stored.observed_at = now;
            let mut republish = MetricBits::empty();
            if new.temperature_x10.is_some() {
                republish |= MetricBits::TEMPERATURE;
            }
            if new.humidity.is_some() {
                republish |= MetricBits::HUMIDITY;
            }
            if new.battery_ok.is_some() {
                republish |= MetricBits::BATTERY_STATUS;
            }
            return republish;
        }
        return MetricBits::empty();
    }

    apply_fields(new, stored, now);
    changed
}

fn apply_fields(new: &SensorReading, stored: &mut SensorReading, now: SystemTime) {
    if let Some(t) = new.temperature_x10 {
        stored.temperature_x10 = Some(t);
        stored.temperature_is_celsius = new.temperature_is_celsius;
    }
    if let Some(h) = new.humidity {
        stored.humidity = Some(h);
    }
    if let Some(b) = new.battery_ok {
        stored.battery_ok = Some(b);
    }
    stored.observed_at = now;
    stored.decoded_bits = new.decoded_bits;
    stored.decoding_status = new.decoding_status;
}

/// All tracked sensors, guarded by a single mutex (spec §4.F: "a
/// resizeable array guarded by a mutex").
pub struct SensorRegistry {
    records: Mutex<Vec<SensorRecord>>,
}

impl Default for SensorRegistry {
    fn default() -> Self {
        SensorRegistry::new()
    }
}

impl SensorRegistry {
    #[must_use]
    pub fn new() -> SensorRegistry {
        SensorRegistry { records: Mutex::new(Vec::new()) }
    }

    /// Run `f` against the record for `key`, if tracked.
    pub fn with_record<R>(&self, key: u64, f: impl FnOnce(&SensorRecord) -> R) -> Option<R> {
        let records = self.records.lock().expect("registry mutex poisoned");
        records.iter().find(|r| r.identity.as_key() == key).map(f)
    }

    /// Snapshot every tracked record (for the HTTP query API's `/` and
    /// `/sensors` endpoints); cloned under the lock, released before the
    /// caller serializes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SensorRecordSnapshot> {
        let records = self.records.lock().expect("registry mutex poisoned");
        records
            .iter()
            .map(|r| SensorRecordSnapshot {
                identity: r.identity,
                reading: r.reading.clone(),
                sensor_index: r.sensor_index,
                temperature_history_len: r.temperature_history.len(),
                humidity_history_len: r.humidity_history.len(),
            })
            .collect()
    }

    /// Merge `reading` into the tracked record for its identity, creating
    /// one on first sight (`NEW_UID` is folded into the returned bits).
    /// Appends to the relevant `History` for every metric the change set
    /// reports changed, using the reading's raw (un-derived) value.
    pub fn update(&self, decoder: &dyn Decoder, reading: SensorReading, now: SystemTime, stale_gap: Duration, sensor_index: Option<usize>) -> MetricBits {
        let key = reading.identity.as_key();
        let mut records = self.records.lock().expect("registry mutex poisoned");

        let position = records.iter().position(|r| r.identity.as_key() == key);
        let Some(position) = position else {
            let mut record = SensorRecord {
                identity: reading.identity,
                reading: reading.clone(),
                sensor_index,
                temperature_history: History::new(),
                humidity_history: History::new(),
            };
            if let Some(t) = reading.temperature_x10 {
                record.temperature_history.append(now, t);
            }
            if let Some(h) = reading.humidity {
                record.humidity_history.append(now, i32::from(h));
            }
            records.push(record);
            return MetricBits::TEMPERATURE | MetricBits::HUMIDITY | MetricBits::BATTERY_STATUS | MetricBits::NEW_UID;
        };

        let record = &mut records[position];
        let changed = decoder.update(&reading, &mut record.reading, now, stale_gap);
        if changed.contains(MetricBits::TEMPERATURE) {
            if let Some(t) = reading.temperature_x10 {
                record.temperature_history.append(now, t);
            }
        }
        if changed.contains(MetricBits::HUMIDITY) {
            if let Some(h) = reading.humidity {
                record.humidity_history.append(now, i32::from(h));
            }
        }
        changed
    }
}

/// A point-in-time, lock-released copy of a [`SensorRecord`]'s summary
/// fields, safe to hold while formatting JSON.
#[derive(Debug, Clone)]
pub struct SensorRecordSnapshot {
    pub identity: SensorIdentity,
    pub reading: SensorReading,
    pub sensor_index: Option<usize>,
    pub temperature_history_len: usize,
    pub humidity_history_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(identity: SensorIdentity, temperature_x10: Option<i32>, humidity: Option<u8>, observed_at: SystemTime) -> SensorReading {
        SensorReading {
            protocol_id: identity.protocol_index,
            variant: identity.variant,
            identity,
            channel: None,
            temperature_x10,
            temperature_is_celsius: false,
            humidity,
            battery_ok: Some(true),
            decoded_bits: 64,
            decoding_status: 0,
            observed_at,
        }
    }

    struct DummyDecoder;
    impl Decoder for DummyDecoder {
        fn protocol_index(&self) -> u8 {
            0
        }
        fn protocol_bit(&self) -> u32 {
            1
        }
        fn name(&self) -> &'static str {
            "dummy"
        }
        fn features(&self) -> crate::protocols::Features {
            crate::protocols::Features::RF
        }
        fn min_sequence_length(&self) -> usize {
            0
        }
        fn max_sequence_length(&self) -> usize {
            crate::MAX_SEQUENCE_LENGTH
        }
        fn decode(&self, _durations: &[i16]) -> Result<SensorReading, crate::protocols::DecodeFailure> {
            unreachable!("not exercised in this test")
        }
        fn identity_from_config(&self, _channel: Option<u8>, _rolling_code: u32) -> u64 {
            0
        }
    }

    #[test]
    fn first_sighting_is_new_uid() {
        let registry = SensorRegistry::new();
        let decoder = DummyDecoder;
        let id = SensorIdentity { protocol_index: 0, variant: 0, channel_bits: 0, rolling_code: 1 };
        let now = SystemTime::now();
        let changed = registry.update(&decoder, reading(id, Some(215), Some(44), now), now, Duration::ZERO, None);
        assert!(changed.contains(MetricBits::NEW_UID));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn rapid_repeat_is_suppressed() {
        let registry = SensorRegistry::new();
        let decoder = DummyDecoder;
        let id = SensorIdentity { protocol_index: 0, variant: 0, channel_bits: 0, rolling_code: 2 };
        let t0 = SystemTime::now();
        registry.update(&decoder, reading(id, Some(215), Some(44), t0), t0, Duration::ZERO, None);
        let t1 = t0 + Duration::from_millis(500);
        let changed = registry.update(&decoder, reading(id, Some(215), Some(44), t1), t1, Duration::ZERO, None);
        assert_eq!(changed, MetricBits::TIME_NOT_CHANGED);
    }

    #[test]
    fn stale_gap_forces_republish_of_unchanged_value() {
        let registry = SensorRegistry::new();
        let decoder = DummyDecoder;
        let id = SensorIdentity { protocol_index: 0, variant: 0, channel_bits: 0, rolling_code: 3 };
        let t0 = SystemTime::now();
        registry.update(&decoder, reading(id, Some(215), None, t0), t0, Duration::from_secs(60), None);
        let t1 = t0 + Duration::from_secs(61);
        let changed = registry.update(&decoder, reading(id, Some(215), None, t1), t1, Duration::from_secs(60), None);
        assert_eq!(changed, MetricBits::TEMPERATURE);
    }

    #[test]
    fn changed_value_updates_history() {
        let registry = SensorRegistry::new();
        let decoder = DummyDecoder;
        let id = SensorIdentity { protocol_index: 0, variant: 0, channel_bits: 0, rolling_code: 4 };
        let t0 = SystemTime::now();
        registry.update(&decoder, reading(id, Some(215), None, t0), t0, Duration::ZERO, None);
        let t1 = t0 + Duration::from_secs(5);
        let changed = registry.update(&decoder, reading(id, Some(220), None, t1), t1, Duration::ZERO, None);
        assert_eq!(changed, MetricBits::TEMPERATURE);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].temperature_history_len, 2);
    }
}
