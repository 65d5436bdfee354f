//! Auriol HG02832, PWM behind a 4-pulse alternating-bound preamble
//! (spec §4.E).
//!
//! After the preamble, 40 PWM bits follow (bit = high duration > 400 µs):
//! an 8-bit rolling code, 8-bit humidity, a battery flag, a reserved bit,
//! a 2-bit channel, a 12-bit signed Celsius×10 temperature, and an 8-bit
//! CRC (`poly=0x31`) whose initial value is folded from the first 32 data
//! bits rather than a fixed constant.

use std::time::SystemTime;

use crate::protocols::{status, DecodeFailure, Decoder, Features};
use crate::reading::{SensorIdentity, SensorReading};

const FRAME_BITS: usize = 40;
const PREAMBLE_PULSES: usize = 8;

fn preamble_ok(durations: &[i16], start: usize) -> bool {
    let hi = |i: usize| u32::from(durations[start + i].unsigned_abs());
    for i in (0..PREAMBLE_PULSES).step_by(2) {
        if hi(i) <= 300 || hi(i) >= 450 {
            return false;
        }
        if hi(i + 1) <= 700 || hi(i + 1) >= 850 {
            return false;
        }
    }
    true
}

fn bit_at(durations: &[i16], i: usize) -> Option<bool> {
    let hi = u32::from(durations[i].unsigned_abs());
    let lo = u32::from(durations[i + 1].unsigned_abs());
    if !(150..=700).contains(&hi) || !(150..=700).contains(&lo) {
        return None;
    }
    let sum = hi + lo;
    if !(750..=950).contains(&sum) {
        return None;
    }
    Some(hi > 400)
}

fn read_bits(durations: &[i16], start: usize, count: usize) -> Option<Vec<bool>> {
    let mut bits = Vec::with_capacity(count);
    let mut i = start;
    for _ in 0..count {
        if i + 1 >= durations.len() {
            return None;
        }
        bits.push(bit_at(durations, i)?);
        i += 2;
    }
    Some(bits)
}

fn bits_to_u64(bits: &[bool]) -> u64 {
    bits.iter().fold(0u64, |acc, &b| (acc << 1) | u64::from(b))
}

fn crc8(data: u32) -> u8 {
    let mut sum = (0x53u32 ^ data ^ (data >> 8) ^ (data >> 16) ^ (data >> 24)) as u8;
    for _ in 0..8 {
        sum = if sum & 0x80 != 0 { (sum << 1) ^ 0x31 } else { sum << 1 };
    }
    sum
}

pub struct Hg02832Decoder {
    protocol_index: u8,
}

impl Hg02832Decoder {
    #[must_use]
    pub fn new(protocol_index: u8) -> Hg02832Decoder {
        Hg02832Decoder { protocol_index }
    }
}

impl Decoder for Hg02832Decoder {
    fn protocol_index(&self) -> u8 {
        self.protocol_index
    }

    fn protocol_bit(&self) -> u32 {
        crate::config::protocol_bits::HG02832
    }

    fn name(&self) -> &'static str {
        "HG02832"
    }

    fn features(&self) -> Features {
        Features::RF | Features::CHANNEL | Features::ROLLING_CODE | Features::TEMPERATURE | Features::TEMPERATURE_CELSIUS | Features::HUMIDITY | Features::BATTERY_STATUS
    }

    fn min_sequence_length(&self) -> usize {
        87
    }

    fn max_sequence_length(&self) -> usize {
        crate::MAX_SEQUENCE_LENGTH
    }

    fn decode(&self, durations: &[i16]) -> Result<SensorReading, DecodeFailure> {
        let last_preamble = durations.len().saturating_sub(87);
        let mut preamble_start = None;
        for start in 0..=last_preamble {
            if start + PREAMBLE_PULSES <= durations.len() && preamble_ok(durations, start) {
                preamble_start = Some(start + PREAMBLE_PULSES);
                break;
            }
        }
        let Some(data_start) = preamble_start else {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::NO_PREAMBLE, decoded_bits: 0 });
        };

        let bits = read_bits(durations, data_start, FRAME_BITS).ok_or(DecodeFailure {
            protocol_index: self.protocol_index,
            status: status::at_position(status::TOO_SHORT, data_start),
            decoded_bits: 0,
        })?;

        let data = bits_to_u64(&bits[0..32]) as u32;
        let checksum = bits_to_u64(&bits[32..40]) as u8;

        if data & 0x00FF_0FFF == 0 {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, 32), decoded_bits: FRAME_BITS });
        }
        if crc8(data) != checksum {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, 32), decoded_bits: FRAME_BITS });
        }

        let rolling_code = (data >> 24) & 0xFF;
        let humidity = ((data >> 16) & 0xFF) as u8;
        let battery_ok = data & 0x0000_8000 == 0;
        let channel_bits = ((data >> 12) & 3) as u8;
        let mut temp_raw = (data & 0x0FFF) as i32;
        if temp_raw & 0x0800 != 0 {
            temp_raw |= !0x0FFF;
        }

        let identity = SensorIdentity { protocol_index: self.protocol_index, variant: 0, channel_bits, rolling_code };

        Ok(SensorReading {
            protocol_id: self.protocol_index,
            variant: 0,
            identity,
            channel: Some(channel_bits + 1),
            temperature_x10: Some(temp_raw),
            temperature_is_celsius: true,
            humidity: Some(humidity),
            battery_ok: Some(battery_ok),
            decoded_bits: FRAME_BITS,
            decoding_status: status::OK,
            observed_at: SystemTime::now(),
        })
    }

    fn identity_from_config(&self, channel: Option<u8>, rolling_code: u32) -> u64 {
        let channel_bits = channel.map_or(0, |c| (c.saturating_sub(1)) & 3);
        SensorIdentity { protocol_index: self.protocol_index, variant: 0, channel_bits, rolling_code }.as_key()
    }
}
