//! LaCrosse TX141-Bv2/Bv3/TX145wsdth, PWM with fixed-period bits behind a
//! 4-pulse equal-duration preamble (spec §4.E).
//!
//! 40-bit frame: 8-bit rolling code/id, a 4-bit flag nibble (battery,
//! test-button, 2-bit channel), 12-bit unsigned Celsius×10 temperature
//! (`temp/10 - 50` in the sensor's own units, offset by 50 before scaling
//! here), 8-bit humidity, and a table-driven CRC-8 over the first 4 bytes
//! plus a finalization round with no further input byte.

use std::time::SystemTime;

use crate::protocols::{status, DecodeFailure, Decoder, Features};
use crate::reading::{SensorIdentity, SensorReading};

const MIN_SEQUENCE: usize = 88;
const PREAMBLE_PULSES: usize = 8;
const PREAMBLE_MIN_US: u32 = 720;
const PREAMBLE_MAX_US: u32 = 1000;
const MIN_PERIOD_US: u32 = 650;
const MAX_PERIOD_US: u32 = 820;
const BIT0_MIN_HI_US: u32 = 140;
const BIT0_MAX_HI_US: u32 = 360;
const BIT0_MIN_LO_US: u32 = 340;
const BIT0_MAX_LO_US: u32 = 630;
const BIT1_MIN_HI_US: u32 = 340;
const BIT1_MAX_HI_US: u32 = 560;
const BIT1_MIN_LO_US: u32 = 160;
const BIT1_MAX_LO_US: u32 = 360;
const FRAME_BITS: usize = 40;

#[rustfmt::skip]
const CRC_TABLE: [u8; 256] = [
    0x00, 0x31, 0x62, 0x53, 0xC4, 0xF5, 0xA6, 0x97,
    0xB9, 0x88, 0xDB, 0xEA, 0x7D, 0x4C, 0x1F, 0x2E,
    0x43, 0x72, 0x21, 0x10, 0x87, 0xB6, 0xE5, 0xD4,
    0xFA, 0xCB, 0x98, 0xA9, 0x3E, 0x0F, 0x5C, 0x6D,
    0x86, 0xB7, 0xE4, 0xD5, 0x42, 0x73, 0x20, 0x11,
    0x3F, 0x0E, 0x5D, 0x6C, 0xFB, 0xCA, 0x99, 0xA8,
    0xC5, 0xF4, 0xA7, 0x96, 0x01, 0x30, 0x63, 0x52,
    0x7C, 0x4D, 0x1E, 0x2F, 0xB8, 0x89, 0xDA, 0xEB,
    0x3D, 0x0C, 0x5F, 0x6E, 0xF9, 0xC8, 0x9B, 0xAA,
    0x84, 0xB5, 0xE6, 0xD7, 0x40, 0x71, 0x22, 0x13,
    0x7E, 0x4F, 0x1C, 0x2D, 0xBA, 0x8B, 0xD8, 0xE9,
    0xC7, 0xF6, 0xA5, 0x94, 0x03, 0x32, 0x61, 0x50,
    0xBB, 0x8A, 0xD9, 0xE8, 0x7F, 0x4E, 0x1D, 0x2C,
    0x02, 0x33, 0x60, 0x51, 0xC6, 0xF7, 0xA4, 0x95,
    0xF8, 0xC9, 0x9A, 0xAB, 0x3C, 0x0D, 0x5E, 0x6F,
    0x41, 0x70, 0x23, 0x12, 0x85, 0xB4, 0xE7, 0xD6,
    0x7A, 0x4B, 0x18, 0x29, 0xBE, 0x8F, 0xDC, 0xED,
    0xC3, 0xF2, 0xA1, 0x90, 0x07, 0x36, 0x65, 0x54,
    0x39, 0x08, 0x5B, 0x6A, 0xFD, 0xCC, 0x9F, 0xAE,
    0x80, 0xB1, 0xE2, 0xD3, 0x44, 0x75, 0x26, 0x17,
    0xFC, 0xCD, 0x9E, 0xAF, 0x38, 0x09, 0x5A, 0x6B,
    0x45, 0x74, 0x27, 0x16, 0x81, 0xB0, 0xE3, 0xD2,
    0xBF, 0x8E, 0xDD, 0xEC, 0x7B, 0x4A, 0x19, 0x28,
    0x06, 0x37, 0x64, 0x55, 0xC2, 0xF3, 0xA0, 0x91,
    0x47, 0x76, 0x25, 0x14, 0x83, 0xB2, 0xE1, 0xD0,
    0xFE, 0xCF, 0x9C, 0xAD, 0x3A, 0x0B, 0x58, 0x69,
    0x04, 0x35, 0x66, 0x57, 0xC0, 0xF1, 0xA2, 0x93,
    0xBD, 0x8C, 0xDF, 0xEE, 0x79, 0x48, 0x1B, 0x2A,
    0xC1, 0xF0, 0xA3, 0x92, 0x05, 0x34, 0x67, 0x56,
    0x78, 0x49, 0x1A, 0x2B, 0xBC, 0x8D, 0xDE, 0xEF,
    0x82, 0xB3, 0xE0, 0xD1, 0x46, 0x77, 0x24, 0x15,
    0x3B, 0x0A, 0x59, 0x68, 0xFF, 0xCE, 0x9D, 0xAC,
];

fn crc8(data: u32) -> u8 {
    let bytes = [(data >> 24) as u8, (data >> 16) as u8, (data >> 8) as u8, data as u8];
    let mut crc = 0u8;
    for &b in &bytes {
        crc = CRC_TABLE[(crc ^ b) as usize];
    }
    CRC_TABLE[crc as usize]
}

fn dur(d: i16) -> u32 {
    u32::from(d.unsigned_abs())
}

fn preamble_ok(durations: &[i16], start: usize) -> bool {
    for i in (0..PREAMBLE_PULSES).step_by(2) {
        if !(PREAMBLE_MIN_US..=PREAMBLE_MAX_US).contains(&dur(durations[start + i])) {
            return false;
        }
        if !(PREAMBLE_MIN_US..=PREAMBLE_MAX_US).contains(&dur(durations[start + i + 1])) {
            return false;
        }
    }
    true
}

fn bit_at(durations: &[i16], i: usize) -> Option<bool> {
    let hi = dur(durations[i]);
    let lo = dur(durations[i + 1]);
    let period = hi + lo;
    if !(MIN_PERIOD_US..=MAX_PERIOD_US).contains(&period) {
        return None;
    }
    if (BIT0_MIN_HI_US..=BIT0_MAX_HI_US).contains(&hi) && (BIT0_MIN_LO_US..=BIT0_MAX_LO_US).contains(&lo) {
        Some(false)
    } else if (BIT1_MIN_HI_US..=BIT1_MAX_HI_US).contains(&hi) && (BIT1_MIN_LO_US..=BIT1_MAX_LO_US).contains(&lo) {
        Some(true)
    } else {
        None
    }
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

pub struct Tx141Decoder {
    protocol_index: u8,
}

impl Tx141Decoder {
    #[must_use]
    pub fn new(protocol_index: u8) -> Tx141Decoder {
        Tx141Decoder { protocol_index }
    }
}

impl Decoder for Tx141Decoder {
    fn protocol_index(&self) -> u8 {
        self.protocol_index
    }

    fn protocol_bit(&self) -> u32 {
        crate::config::protocol_bits::TX141
    }

    fn name(&self) -> &'static str {
        "TX141"
    }

    fn features(&self) -> Features {
        Features::RF | Features::CHANNEL | Features::ROLLING_CODE | Features::TEMPERATURE | Features::TEMPERATURE_CELSIUS | Features::HUMIDITY | Features::BATTERY_STATUS
    }

    fn min_sequence_length(&self) -> usize {
        MIN_SEQUENCE
    }

    fn max_sequence_length(&self) -> usize {
        crate::MAX_SEQUENCE_LENGTH
    }

    fn decode(&self, durations: &[i16]) -> Result<SensorReading, DecodeFailure> {
        let last_preamble = durations.len().saturating_sub(MIN_SEQUENCE);
        let mut preamble_start = None;
        for start in (0..=last_preamble).step_by(2) {
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
            status: status::at_position(status::BIT_VIOLATION, data_start),
            decoded_bits: 0,
        })?;

        let data = bits_to_u64(&bits[0..32]) as u32;
        let checksum = bits_to_u64(&bits[32..40]) as u8;
        if crc8(data) != checksum {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, 32), decoded_bits: FRAME_BITS });
        }

        let rolling_code = (data >> 24) & 0xFF;
        let battery_ok = data & 0x0080_0000 == 0;
        let channel_bits = ((data >> 20) & 3) as u8;
        let temp_raw = ((data >> 8) & 0x0FFF) as i32 - 500;
        let humidity = (data & 0xFF) as u8;

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

#[cfg(test)]
mod tests {
    use super::*;

    fn push_bits(out: &mut Vec<bool>, value: u64, width: usize) {
        for i in (0..width).rev() {
            out.push((value >> i) & 1 == 1);
        }
    }

    fn encode_frame(rolling_code: u8, battery_ok: bool, channel_bits: u8, temp_raw: i32, humidity: u8) -> Vec<i16> {
        let mut bits = Vec::new();
        push_bits(&mut bits, u64::from(rolling_code), 8);
        bits.push(!battery_ok);
        bits.push(false);
        push_bits(&mut bits, u64::from(channel_bits), 2);
        push_bits(&mut bits, ((temp_raw + 500) & 0x0FFF) as u64, 12);
        push_bits(&mut bits, u64::from(humidity), 8);

        let data = bits_to_u64(&bits[0..32]) as u32;
        let checksum = crc8(data);
        push_bits(&mut bits, u64::from(checksum), 8);

        let mut durations = Vec::new();
        for _ in 0..4 {
            durations.push(833i16);
            durations.push(833i16);
        }
        for &b in &bits {
            if b {
                durations.push(417i16);
                durations.push(208i16);
            } else {
                durations.push(208i16);
                durations.push(417i16);
            }
        }
        durations
    }

    #[test]
    fn round_trip() {
        let decoder = Tx141Decoder::new(7);
        let durations = encode_frame(0x9C, true, 1, 215, 47);
        let reading = decoder.decode(&durations).expect("valid frame decodes");
        assert_eq!(reading.identity.rolling_code, 0x9C);
        assert_eq!(reading.channel, Some(2));
        assert_eq!(reading.temperature_x10, Some(215));
        assert_eq!(reading.humidity, Some(47));
        assert_eq!(reading.battery_ok, Some(true));
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let decoder = Tx141Decoder::new(7);
        let mut durations = encode_frame(0x9C, true, 1, 215, 47);
        let last = durations.len() - 2;
        durations[last] = if durations[last] == 417 { 208 } else { 417 };
        assert!(decoder.decode(&durations).is_err());
    }
}
