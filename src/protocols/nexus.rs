//! Nexus / FreeTec NC-7345 / NX-3980 / Solight TE82S / TFA 30.3209, PPM
//! behind ~4000 µs sync gaps; a single transmission repeats the same
//! 36-bit packet several times, so a sequence is only accepted once at
//! least 3 identical packets are found (spec §4.E).
//!
//! 36-bit packet: 8-bit rolling code, a battery-ok flag, a 3-bit channel,
//! a signed 12-bit Celsius×10 temperature, a constant `1111` nibble used
//! as a sanity check, and 8-bit humidity.

use std::time::SystemTime;

use crate::protocols::{status, DecodeFailure, Decoder, Features};
use crate::reading::{SensorIdentity, SensorReading};

const PACKET_BITS: usize = 36;
const MIN_SEQUENCE: usize = 72;
const HI_US: u32 = 525;
const HI_TOLERANCE_US: u32 = 125;
const LO0_US: u32 = 900;
const LO1_US: u32 = 1850;
const LO_TOLERANCE_US: u32 = 150;
const SYNC_US: u32 = 4000;
const SYNC_TOLERANCE_US: u32 = 150;
const MIN_MATCHING_PACKETS: usize = 3;

fn dur(d: i16) -> u32 {
    u32::from(d.unsigned_abs())
}

fn is_sync_gap(d: i16) -> bool {
    dur(d).abs_diff(SYNC_US) <= SYNC_TOLERANCE_US
}

fn find_gap(durations: &[i16], start: usize) -> usize {
    (start..durations.len()).find(|&i| is_sync_gap(durations[i])).unwrap_or(durations.len())
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

fn decode_packet(durations: &[i16], start: usize, end: usize) -> Option<u64> {
    if end < start + PACKET_BITS * 2 {
        return None;
    }
    let mut value = 0u64;
    let mut i = start;
    for _ in 0..PACKET_BITS {
        let bit = decode_ppm_bit(durations[i], durations[i + 1])?;
        value = (value << 1) | u64::from(bit);
        i += 2;
    }

    if (value >> 8) & 0xF != 0xF {
        return None;
    }
    let channel_bits = ((value >> 28) & 7) as u8;
    if channel_bits > 3 {
        return None;
    }
    Some(value)
}

pub struct NexusDecoder {
    protocol_index: u8,
}

impl NexusDecoder {
    #[must_use]
    pub fn new(protocol_index: u8) -> NexusDecoder {
        NexusDecoder { protocol_index }
    }
}

impl Decoder for NexusDecoder {
    fn protocol_index(&self) -> u8 {
        self.protocol_index
    }

    fn protocol_bit(&self) -> u32 {
        crate::config::protocol_bits::NEXUS
    }

    fn name(&self) -> &'static str {
        "NEXUS"
    }

    fn features(&self) -> Features {
        Features::RF | Features::CHANNEL | Features::ROLLING_CODE | Features::TEMPERATURE | Features::TEMPERATURE_CELSIUS | Features::HUMIDITY | Features::BATTERY_STATUS
    }

    fn min_sequence_length(&self) -> usize {
        MIN_SEQUENCE * 3 - 1
    }

    fn max_sequence_length(&self) -> usize {
        crate::MAX_SEQUENCE_LENGTH
    }

    fn decode(&self, durations: &[i16]) -> Result<SensorReading, DecodeFailure> {
        let mut packets = Vec::new();
        let mut start = 0;
        while start + MIN_SEQUENCE <= durations.len() {
            let gap = find_gap(durations, start);
            if gap >= start + MIN_SEQUENCE {
                if let Some(value) = decode_packet(durations, start, gap) {
                    packets.push(value);
                }
            }
            start = gap + 1;
        }

        if packets.len() < MIN_MATCHING_PACKETS {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BIT_VIOLATION, 0), decoded_bits: 0 });
        }

        let agreed = packets.iter().find(|&&candidate| packets.iter().filter(|&&p| p == candidate).count() >= MIN_MATCHING_PACKETS);
        let Some(&value) = agreed else {
            return Err(DecodeFailure { protocol_index: self.protocol_index, status: status::at_position(status::BAD_CHECKSUM, 0), decoded_bits: PACKET_BITS });
        };

        let rolling_code = (value >> 28) as u32 & 0xFF;
        let battery_ok = (value >> 27) & 1 == 1;
        let channel_bits = ((value >> 24) & 7) as u8;
        let mut temp_raw = ((value >> 12) & 0x0FFF) as i32;
        if temp_raw & 0x0800 != 0 {
            temp_raw |= !0x0FFF;
        }
        let humidity = (value & 0xFF) as u8;

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
            decoded_bits: PACKET_BITS,
            decoding_status: status::OK,
            observed_at: SystemTime::now(),
        })
    }

    fn identity_from_config(&self, channel: Option<u8>, rolling_code: u32) -> u64 {
        let channel_bits = channel.map_or(0, |c| (c.saturating_sub(1)) & 7);
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

    fn build_value(rolling_code: u8, battery_ok: bool, channel_bits: u8, temp_raw: i32, humidity: u8) -> u64 {
        let mut bits = Vec::new();
        push_bits(&mut bits, u64::from(rolling_code), 8);
        bits.push(battery_ok);
        push_bits(&mut bits, u64::from(channel_bits), 3);
        push_bits(&mut bits, (temp_raw & 0x0FFF) as u64, 12);
        push_bits(&mut bits, 0x0F, 4);
        push_bits(&mut bits, u64::from(humidity), 8);
        bits.iter().fold(0u64, |acc, &b| (acc << 1) | u64::from(b))
    }

    fn encode_packet(value: u64) -> Vec<i16> {
        let mut durations = Vec::new();
        for i in (0..PACKET_BITS).rev() {
            let bit = (value >> i) & 1 == 1;
            durations.push(HI_US as i16);
            durations.push(if bit { LO1_US as i16 } else { LO0_US as i16 });
        }
        durations
    }

    fn encode_sequence(value: u64, repeats: usize) -> Vec<i16> {
        let mut durations = Vec::new();
        for _ in 0..repeats {
            durations.extend(encode_packet(value));
            durations.push(SYNC_US as i16);
        }
        durations
    }

    #[test]
    fn round_trip_with_matching_packets() {
        let decoder = NexusDecoder::new(8);
        let value = build_value(0x4D, true, 1, 215, 47);
        let durations = encode_sequence(value, 3);
        let reading = decoder.decode(&durations).expect("3 matching packets decode");
        assert_eq!(reading.identity.rolling_code, 0x4D);
        assert_eq!(reading.channel, Some(2));
        assert_eq!(reading.temperature_x10, Some(215));
        assert_eq!(reading.humidity, Some(47));
        assert_eq!(reading.battery_ok, Some(true));
    }

    #[test]
    fn insufficient_matching_packets_rejected() {
        let decoder = NexusDecoder::new(8);
        let value = build_value(0x4D, true, 1, 215, 47);
        let durations = encode_sequence(value, 2);
        assert!(decoder.decode(&durations).is_err());
    }
}
