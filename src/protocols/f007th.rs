//! F007TH / F007TP (Ambient Weather), Manchester-encoded (spec §4.E).
//!
//! Frame, after Manchester recovery, is 64 bits: a 16-bit preamble/type,
//! 40 data bits (rolling code, battery, channel, temperature, humidity,
//! reserved), and an 8-bit XOR-hash checksum over those 40 data bits.
//! F007TP carries no humidity (its humidity field is always absent).

use std::time::SystemTime;

use crate::protocols::{manchester, status, DecodeFailure, Decoder, Features};
use crate::reading::{SensorIdentity, SensorReading};

const PREAMBLE_F007TH: u16 = 0xFD45;
const PREAMBLE_F007TP: u16 = 0xFD46;
const FRAME_BITS: usize = 64;
const HALF_MIN_US: u32 = 220;
const HALF_MAX_US: u32 = 720;

pub struct F007thDecoder {
    protocol_index: u8,
    is_tp: bool,
}

impl F007thDecoder {
    #[must_use]
    pub fn new(protocol_index: u8, is_tp: bool) -> F007thDecoder {
        F007thDecoder { protocol_index, is_tp }
    }

    fn preamble(&self) -> u16 {
        if self.is_tp {
            PREAMBLE_F007TP
        } else {
            PREAMBLE_F007TH
        }
    }
}

fn hash40(data_bits: &[bool]) -> u8 {
    let mut mask: u8 = 0x7C;
    let mut hash: u8 = 0x64;
    for &bit in data_bits {
        let carry = mask & 0x80 != 0;
        mask = mask.rotate_left(1);
        if carry {
            mask ^= 0x18;
        }
        if bit {
            hash ^= mask;
        }
    }
    hash
}

fn bits_to_u64(bits: &[bool]) -> u64 {
    bits.iter().fold(0u64, |acc, &b| (acc << 1) | u64::from(b))
}

impl Decoder for F007thDecoder {
    fn protocol_index(&self) -> u8 {
        self.protocol_index
    }

    fn protocol_bit(&self) -> u32 {
        // F007TH and F007TP share one wire family and one config switch.
        crate::config::protocol_bits::F007TH
    }

    fn name(&self) -> &'static str {
        if self.is_tp {
            "F007TP"
        } else {
            "F007TH"
        }
    }

    fn features(&self) -> Features {
        let base = Features::RF | Features::CHANNEL | Features::ROLLING_CODE | Features::TEMPERATURE | Features::BATTERY_STATUS;
        if self.is_tp {
            base
        } else {
            base | Features::HUMIDITY
        }
    }

    fn min_sequence_length(&self) -> usize {
        manchester::MIN_DECODED_BITS
    }

    fn max_sequence_length(&self) -> usize {
        crate::MAX_SEQUENCE_LENGTH
    }

    fn decode(&self, durations: &[i16]) -> Result<SensorReading, DecodeFailure> {
        let params = manchester::ManchesterParams { half_min_us: HALF_MIN_US, half_max_us: HALF_MAX_US };
        let result = manchester::decode(durations, 0, params).map_err(|(status, bits)| DecodeFailure {
            protocol_index: self.protocol_index,
            status,
            decoded_bits: bits,
        })?;

        if result.bits.len() < FRAME_BITS {
            return Err(DecodeFailure {
                protocol_index: self.protocol_index,
                status: status::at_position(status::TOO_SHORT, result.bits.len()),
                decoded_bits: result.bits.len(),
            });
        }

        let frame = &result.bits[..FRAME_BITS];
        let preamble = bits_to_u64(&frame[0..16]) as u16;
        if preamble != self.preamble() {
            return Err(DecodeFailure {
                protocol_index: self.protocol_index,
                status: status::NO_PREAMBLE,
                decoded_bits: result.decoded_bits,
            });
        }

        let data_bits = &frame[16..56];
        let expected_hash = hash40(data_bits);
        let actual_hash = bits_to_u64(&frame[56..64]) as u8;
        if expected_hash != actual_hash {
            return Err(DecodeFailure {
                protocol_index: self.protocol_index,
                status: status::at_position(status::BAD_CHECKSUM, FRAME_BITS),
                decoded_bits: result.decoded_bits,
            });
        }

        let rolling_code = bits_to_u64(&frame[16..24]) as u32;
        let battery_ok = frame[24];
        let channel = bits_to_u64(&frame[25..28]) as u8;
        let temp_raw = bits_to_u64(&frame[28..40]) as i32;
        let temperature_x10 = temp_raw - 400;
        let humidity = if self.is_tp { None } else { Some(bits_to_u64(&frame[40..48]) as u8) };

        let identity = SensorIdentity {
            protocol_index: self.protocol_index,
            variant: u8::from(self.is_tp),
            channel_bits: channel,
            rolling_code,
        };

        Ok(SensorReading {
            protocol_id: self.protocol_index,
            variant: u8::from(self.is_tp),
            identity,
            channel: Some(channel),
            temperature_x10: Some(temperature_x10),
            temperature_is_celsius: false,
            humidity,
            battery_ok: Some(battery_ok),
            decoded_bits: result.decoded_bits,
            decoding_status: status::OK,
            observed_at: SystemTime::now(),
        })
    }

    fn identity_from_config(&self, channel: Option<u8>, rolling_code: u32) -> u64 {
        SensorIdentity {
            protocol_index: self.protocol_index,
            variant: u8::from(self.is_tp),
            channel_bits: channel.unwrap_or(0),
            rolling_code,
        }
        .as_key()
    }
}
