//! LaCrosse TX3/TX6/TX7U, PWM with the sync header folded into the data
//! bits themselves rather than a separate preamble (spec §4.E).
//!
//! Frame is 44 bits: an 8-bit fixed header (`0000_1010`), a 4-bit type
//! nibble (0 = temperature, 14 = humidity), a 7-bit rolling code, a 9-bit
//! spare/value field, 3 BCD nibbles carrying either a temperature or a
//! humidity value depending on type, a parity bit, and a trailing 4-bit
//! nibble-sum checksum. Temperature and humidity never arrive in the same
//! frame, so [`Tx7uDecoder::update`] merges them into the stored reading
//! instead of the shared [`crate::registry::default_update`].

use std::time::SystemTime;

use crate::protocols::{status, DecodeFailure, Decoder, Features};
use crate::reading::{MetricBits, SensorIdentity, SensorReading};

const FRAME_BITS: usize = 44;
const HEADER: [bool; 8] = [false, false, false, false, true, false, true, false];
const LOW_MIN_US: u32 = 800;
const LOW_MAX_US: u32 = 1200;
const ZERO_MIN_US: u32 = 1100;
const ZERO_MAX_US: u32 = 1500;
const ONE_MIN_US: u32 = 400;
const ONE_MAX_US: u32 = 650;
const PARITY_TABLE: u16 = 0b0110_1001_1001_0110;

pub struct Tx7uDecoder {
    protocol_index: u8,
}

impl Tx7uDecoder {
    #[must_use]
    pub fn new(protocol_index: u8) -> Tx7uDecoder {
        Tx7uDecoder { protocol_index }
    }
}

fn decode_bit(hi: i16, lo: i16) -> Option<bool> {
    let hi = u32::from(hi.unsigned_abs());
    let lo = u32::from(lo.unsigned_abs());
    if lo <= LOW_MIN_US || lo >= LOW_MAX_US {
        return None;
    }
    if hi > ZERO_MIN_US && hi < ZERO_MAX_US {
        Some(false)
    } else if hi > ONE_MIN_US && hi < ONE_MAX_US {
        Some(true)
    } else {
        None
    }
}

/// Try to read `FRAME_BITS` bits starting at `start`; fails on the first
/// bit whose (high, low) pair doesn't fit either bucket.
fn read_frame(durations: &[i16], start: usize) -> Option<Vec<bool>> {
    let mut bits = Vec::with_capacity(FRAME_BITS);
    let mut i = start;
    for _ in 0..FRAME_BITS {
        if i + 1 >= durations.len() {
            return None;
        }
        bits.push(decode_bit(durations[i], durations[i + 1])?);
        i += 2;
    }
    Some(bits)
}

fn bits_to_u64(bits: &[bool]) -> u64 {
    bits.iter().fold(0u64, |acc, &b| (acc << 1) | u64::from(b))
}

impl Decoder for Tx7uDecoder {
    fn protocol_index(&self) -> u8 {
        self.protocol_index
    }

    fn protocol_bit(&self) -> u32 {
        crate::config::protocol_bits::TX7U
    }

    fn name(&self) -> &'static str {
        "TX7U"
    }

    fn features(&self) -> Features {
        Features::RF | Features::ROLLING_CODE | Features::TEMPERATURE | Features::TEMPERATURE_CELSIUS | Features::HUMIDITY
    }

    fn min_sequence_length(&self) -> usize {
        87
    }

    fn max_sequence_length(&self) -> usize {
        240
    }

    fn decode(&self, durations: &[i16]) -> Result<SensorReading, DecodeFailure> {
        let last_start = durations.len().saturating_sub(FRAME_BITS * 2);
        let mut start = 0;
        let frame = loop {
            if start > last_start {
                return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::NO_PREAMBLE, decoded_bits: 0 });
            }
            match read_frame(durations, start) {
                Some(bits) if bits[0..8] == HEADER => break bits,
                _ => start += 2,
            }
        };

        let checksum: u8 = (0..40).step_by(4).fold(0u8, |acc, i| acc.wrapping_add(bits_to_u64(&frame[i..i + 4]) as u8));
        let checksum_nibble = bits_to_u64(&frame[40..44]) as u8;
        if checksum & 0x0F != checksum_nibble {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, 40), decoded_bits: FRAME_BITS });
        }

        let k = (bits_to_u64(&frame[28..32]) ^ bits_to_u64(&frame[24..28]) ^ bits_to_u64(&frame[20..24])) as u16 & 0x0F;
        let parity_bit = frame[19];
        let expected = (PARITY_TABLE >> k) & 1 == 1;
        if parity_bit != expected {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, 19), decoded_bits: FRAME_BITS });
        }

        let type_nibble = bits_to_u64(&frame[8..12]) as u8;
        let rolling_code = bits_to_u64(&frame[12..19]) as u32;
        let nibble1 = bits_to_u64(&frame[20..24]) as i32;
        let nibble2 = bits_to_u64(&frame[24..28]) as i32;
        let nibble3 = bits_to_u64(&frame[28..32]) as i32;

        let (temperature_x10, humidity) = match type_nibble {
            0 => (Some(nibble1 * 100 + nibble2 * 10 + nibble3 - 500), None),
            14 => (None, Some((nibble1 * 10 + nibble2) as u8 & 0x7F)),
            _ => {
                return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BIT_VIOLATION, 8), decoded_bits: FRAME_BITS });
            }
        };

        let identity = SensorIdentity { protocol_index: self.protocol_index, variant: 0, channel_bits: 0, rolling_code };

        Ok(SensorReading {
            protocol_id: self.protocol_index,
            variant: 0,
            identity,
            channel: None,
            temperature_x10,
            temperature_is_celsius: true,
            humidity,
            battery_ok: None,
            decoded_bits: FRAME_BITS,
            decoding_status: status::OK,
            observed_at: SystemTime::now(),
        })
    }

    fn identity_from_config(&self, _channel: Option<u8>, rolling_code: u32) -> u64 {
        SensorIdentity { protocol_index: self.protocol_index, variant: 0, channel_bits: 0, rolling_code }.as_key()
    }

    /// Frames carry temperature xor humidity; only merge the field the
    /// frame actually supplies, leaving the other untouched in `stored`.
    fn update(&self, new: &SensorReading, stored: &mut SensorReading, now: SystemTime, stale_gap: std::time::Duration) -> MetricBits {
        let gap = now.duration_since(stored.observed_at).unwrap_or(std::time::Duration::ZERO);

        let (field_changed, metric_bit) = if let Some(t) = new.temperature_x10 {
            (stored.temperature_x10 != Some(t), MetricBits::TEMPERATURE)
        } else if let Some(h) = new.humidity {
            (stored.humidity != Some(h), MetricBits::HUMIDITY)
        } else {
            return MetricBits::empty();
        };

        if !field_changed {
            if gap < std::time::Duration::from_secs(2) {
                return MetricBits::TIME_NOT_CHANGED;
            }
            if !stale_gap.is_zero() && gap >= stale_gap {
                stored.observed_at = now;
                return metric_bit;
            }
            return MetricBits::empty();
        }

        stored.observed_at = now;
        stored.decoded_bits = new.decoded_bits;
        stored.decoding_status = new.decoding_status;
        if let Some(t) = new.temperature_x10 {
            stored.temperature_x10 = Some(t);
            stored.temperature_is_celsius = true;
        }
        if let Some(h) = new.humidity {
            stored.humidity = Some(h);
        }
        metric_bit
    }
}
