//! Fine Offset Electronics WH2 / Telldus FT007TH, PWM behind an 8-pulse
//! sync train; FT007TH prepends one extra short pulse the plain WH2
//! preamble doesn't have (spec §4.E).
//!
//! 40-bit payload: a 4-bit type nibble (must be `4`), an 8-bit rolling
//! code, 2 reserved bits, a 10-bit temperature field, 1 reserved bit,
//! 7-bit humidity, and an 8-bit CRC (`poly=0x31`, `init=0`) over the
//! first 32 bits.

use std::time::SystemTime;

use crate::protocols::{status, DecodeFailure, Decoder, Features};
use crate::reading::{SensorIdentity, SensorReading};

const FRAME_BITS: usize = 40;
const SYNC_PAIRS: usize = 8;
const MEDIAN_US: u32 = 1000;
const MIN_HI_US: u32 = 450;
const MAX_HI_US: u32 = 1550;
const MIN_LO_US: u32 = 810;
const MAX_LO_US: u32 = 1020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Wh2,
    Ft007th,
}

pub struct Wh2Decoder {
    protocol_index: u8,
    variant: Variant,
}

impl Wh2Decoder {
    #[must_use]
    pub fn new(protocol_index: u8, variant: Variant) -> Wh2Decoder {
        Wh2Decoder { protocol_index, variant }
    }
}

fn dur(d: i16) -> u32 {
    u32::from(d.unsigned_abs())
}

/// Scan for the 8-pulse sync train (optionally preceded by FT007TH's extra
/// short leading pulse), returning the detected variant and the index of
/// the first data bit.
fn find_data_start(durations: &[i16]) -> Option<(Variant, usize)> {
    let mut start = 0;
    while start + 1 < durations.len() {
        let is_ft007th = (180..=220).contains(&dur(durations[start])) && (MIN_LO_US..=MAX_LO_US).contains(&dur(durations[start + 1]));
        let sync_start = if is_ft007th { start + 2 } else { start };

        let mut ok = true;
        for i in 0..SYNC_PAIRS {
            let idx = sync_start + i * 2;
            if idx + 1 >= durations.len() {
                ok = false;
                break;
            }
            if !(MIN_HI_US..=MAX_HI_US).contains(&dur(durations[idx])) || !(MIN_LO_US..=MAX_LO_US).contains(&dur(durations[idx + 1])) {
                ok = false;
                break;
            }
        }
        if ok {
            let variant = if is_ft007th { Variant::Ft007th } else { Variant::Wh2 };
            return Some((variant, sync_start + SYNC_PAIRS * 2));
        }
        start += 2;
    }
    None
}

fn read_bits(durations: &[i16], start: usize, count: usize) -> Option<Vec<bool>> {
    let mut bits = Vec::with_capacity(count);
    let mut i = start;
    for _ in 0..count {
        if i + 1 >= durations.len() {
            return None;
        }
        let hi = dur(durations[i]);
        bits.push(hi > MEDIAN_US);
        i += 2;
    }
    Some(bits)
}

fn bits_to_u64(bits: &[bool]) -> u64 {
    bits.iter().fold(0u64, |acc, &b| (acc << 1) | u64::from(b))
}

fn crc8(bytes: &[u8], poly: u8, init: u8) -> u8 {
    let mut result = init;
    for &byte in bytes {
        result ^= byte;
        for _ in 0..8 {
            result = if result & 0x80 != 0 { (result << 1) ^ poly } else { result << 1 };
        }
    }
    result
}

impl Decoder for Wh2Decoder {
    fn protocol_index(&self) -> u8 {
        self.protocol_index
    }

    fn protocol_bit(&self) -> u32 {
        crate::config::protocol_bits::WH2
    }

    fn name(&self) -> &'static str {
        match self.variant {
            Variant::Wh2 => "WH2",
            Variant::Ft007th => "FT007TH",
        }
    }

    fn features(&self) -> Features {
        Features::RF | Features::ROLLING_CODE | Features::TEMPERATURE | Features::TEMPERATURE_CELSIUS | Features::HUMIDITY
    }

    fn min_sequence_length(&self) -> usize {
        95
    }

    fn max_sequence_length(&self) -> usize {
        crate::MAX_SEQUENCE_LENGTH
    }

    fn decode(&self, durations: &[i16]) -> Result<SensorReading, DecodeFailure> {
        let (variant, data_start) = find_data_start(durations).ok_or(DecodeFailure {
            protocol_index: self.protocol_index,
            status: status::NO_PREAMBLE,
            decoded_bits: 0,
        })?;
        if variant != self.variant {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::NO_PREAMBLE, decoded_bits: 0 });
        }

        let bits = read_bits(durations, data_start, FRAME_BITS).ok_or(DecodeFailure {
            protocol_index: self.protocol_index,
            status: status::at_position(status::TOO_SHORT, data_start),
            decoded_bits: 0,
        })?;

        let data = bits_to_u64(&bits[0..32]) as u32;
        let checksum = bits_to_u64(&bits[32..40]) as u8;
        let bytes = [(data >> 24) as u8, (data >> 16) as u8, (data >> 8) as u8, data as u8];
        if crc8(&bytes, 0x31, 0) != checksum {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, 32), decoded_bits: FRAME_BITS });
        }

        let type_nibble = (data >> 28) & 0xF;
        if type_nibble != 4 {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BIT_VIOLATION, 0), decoded_bits: FRAME_BITS });
        }

        let rolling_code = (data >> 20) & 0xFF;
        let mut temp_raw = ((data >> 8) & 1023) as i32;
        if temp_raw & 0x0800 != 0 {
            temp_raw = -(temp_raw & 0x07FF);
        }
        let humidity = (data & 0x7F) as u8;

        let identity = SensorIdentity { protocol_index: self.protocol_index, variant: u8::from(variant == Variant::Ft007th), channel_bits: 0, rolling_code };

        Ok(SensorReading {
            protocol_id: self.protocol_index,
            variant: u8::from(variant == Variant::Ft007th),
            identity,
            channel: None,
            temperature_x10: Some(temp_raw),
            temperature_is_celsius: true,
            humidity: Some(humidity),
            battery_ok: None,
            decoded_bits: FRAME_BITS,
            decoding_status: status::OK,
            observed_at: SystemTime::now(),
        })
    }

    fn identity_from_config(&self, _channel: Option<u8>, rolling_code: u32) -> u64 {
        SensorIdentity { protocol_index: self.protocol_index, variant: u8::from(self.variant == Variant::Ft007th), channel_bits: 0, rolling_code }.as_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_bits(out: &mut Vec<bool>, value: u64, width: usize) {
        for i in (0..width).rev() {
            out.push((value >> i) & 1 == 1);
        }
    }

    fn encode_frame(ft007th: bool, rolling_code: u8, temp_raw: i32, humidity: u8) -> Vec<i16> {
        let mut bits = Vec::new();
        push_bits(&mut bits, 4, 4);
        push_bits(&mut bits, u64::from(rolling_code), 8);
        push_bits(&mut bits, 0, 2);
        push_bits(&mut bits, (temp_raw & 1023) as u64, 10);
        push_bits(&mut bits, 0, 1);
        push_bits(&mut bits, u64::from(humidity), 7);

        let data = bits_to_u64(&bits[0..32]) as u32;
        let bytes = [(data >> 24) as u8, (data >> 16) as u8, (data >> 8) as u8, data as u8];
        let checksum = crc8(&bytes, 0x31, 0);
        push_bits(&mut bits, u64::from(checksum), 8);

        let mut durations = Vec::new();
        if ft007th {
            durations.push(200i16);
            durations.push(900i16);
        }
        for _ in 0..SYNC_PAIRS {
            durations.push(500i16);
            durations.push(900i16);
        }
        for &b in &bits {
            durations.push(if b { 1200i16 } else { 500i16 });
            durations.push(900i16);
        }
        durations
    }

    #[test]
    fn round_trip_wh2() {
        let decoder = Wh2Decoder::new(5, Variant::Wh2);
        let durations = encode_frame(false, 0x5C, 234, 58);
        let reading = decoder.decode(&durations).expect("valid frame decodes");
        assert_eq!(reading.identity.rolling_code, 0x5C);
        assert_eq!(reading.temperature_x10, Some(234));
        assert_eq!(reading.humidity, Some(58));
    }

    #[test]
    fn ft007th_preamble_rejected_by_wh2_decoder() {
        let decoder = Wh2Decoder::new(5, Variant::Wh2);
        let durations = encode_frame(true, 0x5C, 234, 58);
        assert!(decoder.decode(&durations).is_err());
    }

    #[test]
    fn ft007th_decoded_by_matching_variant() {
        let decoder = Wh2Decoder::new(6, Variant::Ft007th);
        let durations = encode_frame(true, 0x5C, 234, 58);
        let reading = decoder.decode(&durations).expect("valid frame decodes");
        assert_eq!(reading.variant, 1);
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let decoder = Wh2Decoder::new(5, Variant::Wh2);
        let mut durations = encode_frame(false, 0x5C, 234, 58);
        let last = durations.len() - 2;
        durations[last] = if durations[last] == 1200 { 500 } else { 1200 };
        assert!(decoder.decode(&durations).is_err());
    }
}
