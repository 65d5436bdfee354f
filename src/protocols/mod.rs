//! Protocol registry and the shared `Decoder` trait (spec §4.D, §4.E).
//!
//! The source's polymorphic `Protocol` hierarchy (virtual `decode`,
//! `getFeatures`, ...) becomes a single object-safe trait stored as a fixed
//! array of trait objects; the registry's bitset picks which to try. No
//! downcasting: every accessor a caller needs is on the trait itself or on
//! the plain [`crate::reading::SensorReading`] the decoder returns.

pub mod acurite00592txr;
pub mod ds18b20;
pub mod hg02832;
pub mod manchester;
pub mod nexus;
pub mod pwm;
pub mod tfa;
pub mod tx141;
pub mod tx7u;
pub mod wh2;
pub mod f007th;

use crate::reading::SensorReading;

/// Per-decoder feature bitset (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features(pub u16);

impl Features {
    pub const RF: Features = Features(1 << 0);
    pub const CHANNEL: Features = Features(1 << 1);
    pub const ROLLING_CODE: Features = Features(1 << 2);
    pub const TEMPERATURE: Features = Features(1 << 3);
    pub const HUMIDITY: Features = Features(1 << 4);
    pub const BATTERY_STATUS: Features = Features(1 << 5);
    pub const TEMPERATURE_CELSIUS: Features = Features(1 << 6);
    pub const ID32: Features = Features(1 << 7);

    #[must_use]
    pub fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Features {
    type Output = Features;
    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

/// `(category_nibble | subcode_nibble | position<<8)` composite per spec §7.
pub mod status {
    pub const OK: u16 = 0;
    pub const TOO_SHORT: u16 = 0x08;
    pub const NO_PREAMBLE: u16 = 0x10;
    pub const BIT_VIOLATION: u16 = 0x20;
    pub const MISSING_CHECKSUM: u16 = 0x40;
    pub const BAD_CHECKSUM: u16 = 0x80;
    pub const NON_RECOVERABLE_MASK: u16 = 0x3F;

    #[must_use]
    pub fn at_position(category: u16, position: usize) -> u16 {
        category | ((position as u16) << 8)
    }
}

/// A decode attempt that failed, kept for diagnostic printing of the
/// highest-confidence attempt across all protocols tried.
#[derive(Debug, Clone, Copy)]
pub struct DecodeFailure {
    pub protocol_index: u8,
    pub status: u16,
    pub decoded_bits: usize,
}

/// One pulse-sequence decoder. Implementors are stateless: all
/// per-transmission state lives in the `SensorReading` they produce.
pub trait Decoder: Send + Sync {
    /// Stable index into the registry's decoder array; also `identity.protocol_index`.
    fn protocol_index(&self) -> u8;
    fn protocol_bit(&self) -> u32;
    fn name(&self) -> &'static str;
    fn features(&self) -> Features;
    fn min_sequence_length(&self) -> usize;
    fn max_sequence_length(&self) -> usize;

    /// Attempt to decode a closed sequence's durations (already copied out
    /// of the pulse pool) into a reading.
    fn decode(&self, durations: &[i16]) -> Result<SensorReading, DecodeFailure>;

    /// Identity a config-time `(channel, rolling_code)` pair would produce,
    /// for binding rules to devices seen only after the gateway starts.
    fn identity_from_config(&self, channel: Option<u8>, rolling_code: u32) -> u64;

    /// Merge `new` into `stored` (in place on a clone supplied by the
    /// caller) and report which metrics changed. Most protocols delegate to
    /// the shared logic in [`crate::registry`]; TX7U overrides this because
    /// its frames carry temperature and humidity disjointly.
    fn update(
        &self,
        new: &SensorReading,
        stored: &mut SensorReading,
        now: std::time::SystemTime,
        stale_gap: std::time::Duration,
    ) -> crate::reading::MetricBits {
        crate::registry::default_update(new, stored, now, stale_gap)
    }
}

/// Owns every decoder and offers each sequence to the ones whose
/// `protocol_bit` is active, first match wins (spec §4.D).
pub struct ProtocolRegistry {
    decoders: Vec<Box<dyn Decoder>>,
    active_mask: u32,
}

impl ProtocolRegistry {
    #[must_use]
    pub fn new(active_mask: u32) -> ProtocolRegistry {
        let decoders: Vec<Box<dyn Decoder>> = vec![
            Box::new(f007th::F007thDecoder::new(0, false)),
            Box::new(f007th::F007thDecoder::new(1, true)),
            Box::new(acurite00592txr::Acurite00592TxrDecoder::new(2)),
            Box::new(tx7u::Tx7uDecoder::new(3)),
            Box::new(hg02832::Hg02832Decoder::new(4)),
            Box::new(wh2::Wh2Decoder::new(5, wh2::Variant::Wh2)),
            Box::new(wh2::Wh2Decoder::new(6, wh2::Variant::Ft007th)),
            Box::new(tx141::Tx141Decoder::new(7)),
            Box::new(nexus::NexusDecoder::new(8)),
            Box::new(tfa::TfaDecoder::new(9)),
        ];
        ProtocolRegistry { decoders, active_mask }
    }

    #[must_use]
    pub fn decoders(&self) -> &[Box<dyn Decoder>] {
        &self.decoders
    }

    pub fn decoder_by_index(&self, index: u8) -> Option<&dyn Decoder> {
        self.decoders.iter().find(|d| d.protocol_index() == index).map(std::convert::AsRef::as_ref)
    }

    /// Offer `durations` to every active decoder whose length limits admit
    /// it; return the first success, or the best (highest decoded-bit
    /// count) failure for diagnostics.
    #[must_use]
    pub fn try_decode(&self, durations: &[i16]) -> Result<SensorReading, Option<DecodeFailure>> {
        let mut best_failure: Option<DecodeFailure> = None;
        for decoder in &self.decoders {
            if self.active_mask & decoder.protocol_bit() == 0 {
                continue;
            }
            if durations.len() < decoder.min_sequence_length() || durations.len() > decoder.max_sequence_length() {
                continue;
            }
            match decoder.decode(durations) {
                Ok(reading) => return Ok(reading),
                Err(failure) => {
                    if best_failure.map_or(true, |b| failure.decoded_bits > b.decoded_bits) {
                        best_failure = Some(failure);
                    }
                }
            }
        }
        Err(best_failure)
    }

    /// A human-readable summary of why a sequence failed to decode, for a
    /// `tracing::debug!` dump of the best (highest confidence) attempt.
    #[must_use]
    pub fn describe_failure(&self, failure: DecodeFailure) -> String {
        let name = self
            .decoder_by_index(failure.protocol_index)
            .map_or("<unknown>", Decoder::name);
        format!(
            "protocol={name} status=0x{:04x} decoded_bits={}",
            failure.status, failure.decoded_bits
        )
    }
}
