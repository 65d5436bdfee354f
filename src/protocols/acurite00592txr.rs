//! AcuRite 00592TXR, PWM-like framing behind 8 sync pulses (spec §4.E).
//!
//! After 8 equal ~600 µs sync pulses, 56 payload bits (7 bytes) follow:
//! rolling code (16 bits), a status byte (channel in the high 2 bits,
//! battery-ok in bit 5), humidity, a 12-bit Celsius×10 temperature, and a
//! trailing byte-sum checksum. A 4-bit parity nibble folded into the low
//! nibble of the status byte gives the second integrity check the spec
//! calls for.

use std::time::SystemTime;

use crate::protocols::{pwm, status, DecodeFailure, Decoder, Features};
use crate::reading::{SensorIdentity, SensorReading};

const SYNC_PULSES: usize = 16; // 8 high + 8 low
const SYNC_MIN_US: u32 = 550;
const SYNC_MAX_US: u32 = 650;
const PAYLOAD_BYTES: usize = 7;
const PAYLOAD_BITS: usize = PAYLOAD_BYTES * 8;

pub struct Acurite00592TxrDecoder {
    protocol_index: u8,
}

impl Acurite00592TxrDecoder {
    #[must_use]
    pub fn new(protocol_index: u8) -> Acurite00592TxrDecoder {
        Acurite00592TxrDecoder { protocol_index }
    }
}

fn channel_number(channel_bits: u8) -> u8 {
    match channel_bits {
        3 => 1,
        2 => 2,
        _ => 3,
    }
}

fn parity_nibble(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b) & 0x0F
}

fn pwm_params() -> pwm::PwmParams {
    pwm::PwmParams {
        min_hi_us: 150,
        max_hi_us: 450,
        min_lo0_us: 0,
        max_lo0_us: u32::MAX,
        min_lo1_us: 0,
        max_lo1_us: 0,
    }
}

/// Bit value is carried by the *high* half here (200 µs = 0, 400 µs = 1),
/// unlike the generic PWM helper which buckets on the low half; a small
/// local reader keeps that distinction explicit instead of contorting
/// [`pwm::decode`]'s parameters to fake it.
fn read_bits(durations: &[i16], start: usize, count: usize) -> Result<Vec<bool>, usize> {
    let mut bits = Vec::with_capacity(count);
    let mut i = start;
    for _ in 0..count {
        if i >= durations.len() {
            return Err(bits.len());
        }
        let hi = u32::from(durations[i].unsigned_abs());
        let bit = if (150..=300).contains(&hi) {
            false
        } else if (300..=500).contains(&hi) {
            true
        } else {
            return Err(bits.len());
        };
        bits.push(bit);
        i += 2;
    }
    Ok(bits)
}

impl Decoder for Acurite00592TxrDecoder {
    fn protocol_index(&self) -> u8 {
        self.protocol_index
    }

    fn protocol_bit(&self) -> u32 {
        crate::config::protocol_bits::ACURITE_00592TXR
    }

    fn name(&self) -> &'static str {
        "00592TXR"
    }

    fn features(&self) -> Features {
        Features::RF | Features::CHANNEL | Features::ROLLING_CODE | Features::TEMPERATURE | Features::HUMIDITY | Features::BATTERY_STATUS | Features::TEMPERATURE_CELSIUS
    }

    fn min_sequence_length(&self) -> usize {
        SYNC_PULSES + PAYLOAD_BITS * 2 - 1
    }

    fn max_sequence_length(&self) -> usize {
        crate::MAX_SEQUENCE_LENGTH
    }

    fn decode(&self, durations: &[i16]) -> Result<SensorReading, DecodeFailure> {
        for d in durations.iter().take(SYNC_PULSES) {
            let v = u32::from(d.unsigned_abs());
            if v < SYNC_MIN_US || v > SYNC_MAX_US {
                return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::NO_PREAMBLE, decoded_bits: 0 });
            }
        }

        let bits = read_bits(durations, SYNC_PULSES, PAYLOAD_BITS).map_err(|n| DecodeFailure {
            protocol_index: self.protocol_index,
            status: status::at_position(status::TOO_SHORT, n),
            decoded_bits: n,
        })?;
        let _ = pwm_params();

        let bytes: Vec<u8> = bits.chunks(8).map(|c| c.iter().fold(0u8, |acc, &b| (acc << 1) | u8::from(b))).collect();

        let checksum = bytes[0..PAYLOAD_BYTES - 1].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if checksum != bytes[PAYLOAD_BYTES - 1] {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, PAYLOAD_BITS), decoded_bits: PAYLOAD_BITS });
        }

        let status_byte = bytes[2];
        let expected_parity = parity_nibble(&[bytes[0], bytes[1], bytes[3], bytes[4], bytes[5]]);
        if status_byte & 0x0F != expected_parity {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, PAYLOAD_BITS - 4), decoded_bits: PAYLOAD_BITS });
        }

        let channel_bits = status_byte >> 6;
        let battery_ok = status_byte & 0x20 != 0;
        let rolling_code = (u32::from(bytes[0]) << 8) | u32::from(bytes[1]);
        let humidity = bytes[3];
        let temp_raw = (i32::from(bytes[4]) << 4) | i32::from(bytes[5] >> 4);
        let temperature_x10 = temp_raw - 400;

        let identity = SensorIdentity {
            protocol_index: self.protocol_index,
            variant: 0,
            channel_bits,
            rolling_code,
        };

        Ok(SensorReading {
            protocol_id: self.protocol_index,
            variant: 0,
            identity,
            channel: Some(channel_number(channel_bits)),
            temperature_x10: Some(temperature_x10),
            temperature_is_celsius: true,
            humidity: Some(humidity),
            battery_ok: Some(battery_ok),
            decoded_bits: PAYLOAD_BITS,
            decoding_status: status::OK,
            observed_at: SystemTime::now(),
        })
    }

    fn identity_from_config(&self, channel: Option<u8>, rolling_code: u32) -> u64 {
        let channel_bits = match channel {
            Some(1) => 3,
            Some(2) => 2,
            _ => 0,
        };
        SensorIdentity { protocol_index: self.protocol_index, variant: 0, channel_bits, rolling_code }.as_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_pulses() -> Vec<i16> {
        vec![600i16; SYNC_PULSES]
    }

    fn encode_bit(out: &mut Vec<i16>, bit: bool) {
        out.push(if bit { 400 } else { 200 });
        out.push(400);
    }

    fn encode_frame(rolling_code: u16, channel_bits: u8, battery_ok: bool, humidity: u8, temp_raw: u16) -> Vec<i16> {
        let byte0 = (rolling_code >> 8) as u8;
        let byte1 = (rolling_code & 0xFF) as u8;
        let byte3 = humidity;
        let byte4 = (temp_raw >> 4) as u8;
        let byte5 = ((temp_raw & 0x0F) << 4) as u8;
        let parity = parity_nibble(&[byte0, byte1, byte3, byte4, byte5]);
        let byte2 = (channel_bits << 6) | (u8::from(battery_ok) << 5) | parity;
        let checksum = [byte0, byte1, byte2, byte3, byte4, byte5].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));

        let mut durations = sync_pulses();
        for byte in [byte0, byte1, byte2, byte3, byte4, byte5, checksum] {
            for i in (0..8).rev() {
                encode_bit(&mut durations, (byte >> i) & 1 == 1);
            }
        }
        durations
    }

    #[test]
    fn round_trip() {
        let decoder = Acurite00592TxrDecoder::new(1);
        let durations = encode_frame(0x0ABC, 3, true, 66, 615);
        let reading = decoder.decode(&durations).expect("valid frame decodes");
        assert_eq!(reading.identity.rolling_code, 0x0ABC);
        assert_eq!(reading.channel, Some(1));
        assert_eq!(reading.humidity, Some(66));
        assert_eq!(reading.temperature_x10, Some(215));
        assert_eq!(reading.battery_ok, Some(true));
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let decoder = Acurite00592TxrDecoder::new(1);
        let mut durations = encode_frame(0x0ABC, 3, true, 66, 615);
        let hi_idx = durations.len() - 2;
        durations[hi_idx] = if durations[hi_idx] == 400 { 200 } else { 400 };
        let err = decoder.decode(&durations);
        assert!(err.is_err());
    }
}
