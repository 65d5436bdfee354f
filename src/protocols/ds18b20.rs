//! DS18B20 1-Wire temperature sensors (spec §4.I).
//!
//! Unlike the RF protocols in this module, a DS18B20 reading never passes
//! through the pulse assembler: the kernel's `w1_therm` driver already does
//! the bus timing and CRC and exposes the result as text in
//! `<w1_root>/28-xxxxxxxxxxxx/w1_slave`. This module only parses that text
//! and builds the same [`SensorReading`]/[`SensorIdentity`] shapes the RF
//! decoders produce, so the rest of the pipeline (registry, history, rules)
//! doesn't need to know the reading didn't come off the radio.
//!
//! A DS18B20's identity is a 48-bit hex serial, which doesn't fit the
//! `{channel, rolling_code}` shape `SensorIdentityConfig` uses to bind a
//! user-declared sensor name to a reading (spec §3's identity is RF-protocol
//! shaped). DS18B20 readings therefore never resolve to a `sensor_index`:
//! they flow straight to the registry and into rule evaluation, but a
//! config's `sensors[]` list cannot name one.

use std::time::SystemTime;

use crate::reading::{SensorIdentity, SensorReading};

pub const PROTOCOL_INDEX: u8 = 10;

/// The kernel reports "no CRC" by writing this sentinel temperature.
const PRESENCE_FAILURE_MILLIDEGREES: i32 = 85_000;

/// Parse a `28-xxxxxxxxxxxx/w1_slave` file's two-line text format:
/// ```text
/// 4e 01 4b 46 7f ff 0c 10 7a : crc=7a YES
/// 4e 01 4b 46 7f ff 0c 10 7a t=20500
/// ```
/// Returns the millidegree-Celsius value from the second line, or `None` if
/// the CRC check failed or the text doesn't parse.
#[must_use]
pub fn parse_w1_slave(text: &str) -> Option<i32> {
    let mut lines = text.lines();
    let crc_line = lines.next()?;
    if !crc_line.trim_end().ends_with("YES") {
        return None;
    }
    let data_line = lines.next()?;
    let t_field = data_line.split_whitespace().find(|f| f.starts_with("t="))?;
    let millidegrees: i32 = t_field[2..].parse().ok()?;
    if millidegrees == PRESENCE_FAILURE_MILLIDEGREES {
        return None;
    }
    Some(millidegrees)
}

/// Parse the 48-bit hex serial out of a `28-xxxxxxxxxxxx` device directory
/// name, e.g. `"28-0000055e5c9a"`.
#[must_use]
pub fn parse_serial(device_dir_name: &str) -> Option<u64> {
    let (family, serial_hex) = device_dir_name.split_once('-')?;
    if family != "28" {
        return None;
    }
    u64::from_str_radix(serial_hex, 16).ok()
}

/// Build the identity this serial would produce. `rolling_code` holds the
/// low 32 bits of the 48-bit serial and `channel_bits` the high 16, so two
/// different serials never collide through truncation.
#[must_use]
pub fn identity_for_serial(serial: u64) -> SensorIdentity {
    SensorIdentity {
        protocol_index: PROTOCOL_INDEX,
        variant: 0,
        channel_bits: ((serial >> 32) & 0xFF) as u8,
        rolling_code: (serial & 0xFFFF_FFFF) as u32,
    }
}

/// Build a reading from a parsed millidegree-Celsius value.
#[must_use]
pub fn reading_from_millidegrees(serial: u64, millidegrees: i32) -> SensorReading {
    let identity = identity_for_serial(serial);
    SensorReading {
        protocol_id: PROTOCOL_INDEX,
        variant: 0,
        identity,
        channel: None,
        temperature_x10: Some(millidegrees / 100),
        temperature_is_celsius: true,
        humidity: None,
        battery_ok: None,
        decoded_bits: 0,
        decoding_status: crate::protocols::status::OK,
        observed_at: SystemTime::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_reading_parses_millidegrees() {
        let text = "4e 01 4b 46 7f ff 0c 10 7a : crc=7a YES\n4e 01 4b 46 7f ff 0c 10 7a t=20500\n";
        assert_eq!(parse_w1_slave(text), Some(20_500));
    }

    #[test]
    fn negative_temperature_parses() {
        let text = "50 05 4b 46 7f ff 0c 10 fb : crc=fb YES\n50 05 4b 46 7f ff 0c 10 fb t=-500\n";
        assert_eq!(parse_w1_slave(text), Some(-500));
    }

    #[test]
    fn bad_crc_returns_none() {
        let text = "4e 01 4b 46 7f ff 0c 10 7a : crc=7a NO\n4e 01 4b 46 7f ff 0c 10 7a t=20500\n";
        assert_eq!(parse_w1_slave(text), None);
    }

    #[test]
    fn presence_failure_sentinel_returns_none() {
        let text = "ff ff ff ff ff ff ff ff ff : crc=ff YES\nff ff ff ff ff ff ff ff ff t=85000\n";
        assert_eq!(parse_w1_slave(text), None);
    }

    #[test]
    fn serial_parses_from_device_dir_name() {
        assert_eq!(parse_serial("28-0000055e5c9a"), Some(0x0000_055e_5c9a));
        assert_eq!(parse_serial("10-000803c3e1a1"), None);
    }

    #[test]
    fn reading_converts_millidegrees_to_x10_celsius() {
        let r = reading_from_millidegrees(0x0000_055e_5c9a, 20_500);
        assert_eq!(r.temperature_x10, Some(205));
        assert!(r.temperature_is_celsius);
        assert_eq!(r.identity.protocol_index, PROTOCOL_INDEX);
    }
}
