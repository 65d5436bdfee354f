//! TFA Twin Plus 30.3049, Conrad KW9010, Ea2 BL999, PPM with the 36-bit
//! payload bit-reversed relative to transmission order (spec §4.E): the
//! first pulse decoded becomes the least-significant bit of the packed
//! value instead of the most-significant one.
//!
//! 36 bits: a 32-bit data word (rolling code and channel interleaved
//! across two split nibbles, a battery flag, a signed 12-bit Celsius×10
//! temperature, and an offset humidity field) followed by a 4-bit
//! nibble-sum checksum.

use std::time::SystemTime;

use crate::protocols::{status, DecodeFailure, Decoder, Features};
use crate::reading::{SensorIdentity, SensorReading};

const FRAME_BITS: usize = 36;
const MIN_SEQUENCE: usize = 73;
const HI_US: u32 = 500;
const HI_TOLERANCE_US: u32 = 125;
const LO0_US: u32 = 2000;
const LO1_US: u32 = 4000;
const LO_TOLERANCE_US: u32 = 200;
const REVERSE_2BITS: [u8; 4] = [0, 2, 1, 3];

fn dur(d: i16) -> u32 {
    u32::from(d.unsigned_abs())
}

fn decode_ppm_bit(hi: i16, lo: i16) -> Option<bool> {
    let hi = dur(hi);
    let lo = dur(lo);
    if hi.abs_diff(HI_US) > HI_TOLERANCE_US {
        return None;
    }
    if lo.abs_diff(LO0_US) <= LO_TOLERANCE_US {
        Some(false)
    } else if lo.abs_diff(LO1_US) <= LO_TOLERANCE_US {
        Some(true)
    } else {
        None
    }
}

fn read_bits_reversed(durations: &[i16], count: usize) -> Option<u64> {
    let mut value = 0u64;
    let mut i = 0;
    for bit_index in 0..count {
        if i + 1 >= durations.len() {
            return None;
        }
        let bit = decode_ppm_bit(durations[i], durations[i + 1])?;
        if bit {
            value |= 1u64 << bit_index;
        }
        i += 2;
    }
    Some(value)
}

pub struct TfaDecoder {
    protocol_index: u8,
}

impl TfaDecoder {
    #[must_use]
    pub fn new(protocol_index: u8) -> TfaDecoder {
        TfaDecoder { protocol_index }
    }
}

impl Decoder for TfaDecoder {
    fn protocol_index(&self) -> u8 {
        self.protocol_index
    }

    fn protocol_bit(&self) -> u32 {
        crate::config::protocol_bits::TFA
    }

    fn name(&self) -> &'static str {
        "TFA303049"
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
        let data = read_bits_reversed(durations, FRAME_BITS).ok_or(DecodeFailure {
            protocol_index: self.protocol_index,
            status: status::BIT_VIOLATION,
            decoded_bits: 0,
        })?;

        let n = data as u32;
        let checksum = ((data >> 32) & 0xF) as u8;
        let calculated: u8 = (0..8).fold(0u8, |acc, i| acc.wrapping_add(((n >> (i * 4)) & 0xF) as u8)) & 0xF;
        if checksum != calculated {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, 32), decoded_bits: FRAME_BITS });
        }
        if n & 0x8000_0000 == 0 {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BIT_VIOLATION, 31), decoded_bits: FRAME_BITS });
        }
        let sign_bits = (n >> 21) & 7;
        if sign_bits != 0 && sign_bits != 7 {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BIT_VIOLATION, 21), decoded_bits: FRAME_BITS });
        }

        let rolling_code = (n & 0x0F) | ((n >> 2) & 0x30);
        let channel_raw = ((n >> 4) & 3) as usize;
        let channel_bits = REVERSE_2BITS[channel_raw];
        let battery_ok = n & 0x0000_0100 == 0;
        let mut temp_raw = ((n >> 12) & 0x0FFF) as i32;
        if temp_raw & 0x0800 != 0 {
            temp_raw |= !0x0FFF;
        }
        let humidity = (((n >> 24) & 0x7F) as i32 - 28) as u8;

        let identity = SensorIdentity { protocol_index: self.protocol_index, variant: 0, channel_bits, rolling_code };

        Ok(SensorReading {
            protocol_id: self.protocol_index,
            variant: 0,
            identity,
            channel: Some(channel_bits),
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
        let channel_bits = channel.map_or(0, |c| REVERSE_2BITS[(c & 3) as usize]);
        SensorIdentity { protocol_index: self.protocol_index, variant: 0, channel_bits, rolling_code }.as_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(rolling_code: u8, channel_display: u8, battery_ok: bool, temp_raw: i32, humidity: u8) -> Vec<i16> {
        let n0_3 = u32::from(rolling_code) & 0x0F;
        let n6_7 = (u32::from(rolling_code) >> 4) & 3;
        let channel_raw = REVERSE_2BITS[(channel_display & 3) as usize];

        let mut n: u32 = 0;
        n |= n0_3;
        n |= u32::from(channel_raw) << 4;
        n |= n6_7 << 6;
        if !battery_ok {
            n |= 0x0000_0100;
        }
        n |= ((temp_raw & 0x0FFF) as u32) << 12;
        n |= (u32::from(humidity) + 28) << 24;
        n |= 0x8000_0000;

        let checksum: u8 = (0..8).fold(0u8, |acc, i| acc.wrapping_add(((n >> (i * 4)) & 0xF) as u8)) & 0xF;
        let data: u64 = u64::from(n) | (u64::from(checksum) << 32);

        let mut durations = Vec::new();
        for bit_index in 0..FRAME_BITS {
            let bit = (data >> bit_index) & 1 == 1;
            durations.push(HI_US as i16);
            durations.push(if bit { LO1_US as i16 } else { LO0_US as i16 });
        }
        durations
    }

    #[test]
    fn round_trip() {
        let decoder = TfaDecoder::new(9);
        let durations = encode_frame(0x2D, 2, true, 215, 47);
        let reading = decoder.decode(&durations).expect("valid frame decodes");
        assert_eq!(reading.identity.rolling_code, 0x2D);
        assert_eq!(reading.channel, Some(2));
        assert_eq!(reading.temperature_x10, Some(215));
        assert_eq!(reading.humidity, Some(47));
        assert_eq!(reading.battery_ok, Some(true));
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let decoder = TfaDecoder::new(9);
        let mut durations = encode_frame(0x2D, 2, true, 215, 47);
        let last = durations.len() - 1;
        durations[last] = if durations[last] as u32 == LO1_US { LO0_US as i16 } else { LO1_US as i16 };
        assert!(decoder.decode(&durations).is_err());
    }
}
