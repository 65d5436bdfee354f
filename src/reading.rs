//! The output of a successful decode: [`SensorReading`] and its identity.

use std::time::SystemTime;

/// Module-local replacement for the `bitflags` crate macro: the set this
/// crate needs is small and fixed, so a hand-written newtype keeps the
/// dependency list aligned with the teacher rather than pulling in a crate
/// for four constants.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $($(#[$flag_meta:meta])* const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $($(#[$flag_meta])* pub const $flag: $name = $name($value);)*

            #[must_use]
            pub const fn empty() -> $name {
                $name(0)
            }

            #[must_use]
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            #[must_use]
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            #[must_use]
            pub fn union(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                self.union(rhs)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }
    };
}

bitflags_like! {
    /// Which metrics are present on a reading, and which changed on update.
    pub struct MetricBits: u8 {
        const TEMPERATURE = 1 << 0;
        const HUMIDITY = 1 << 1;
        const BATTERY_STATUS = 1 << 2;
        const NEW_UID = 1 << 3;
        /// Sentinel distinct from `empty()`: the reading repeats a value seen
        /// less than 2 s ago and was suppressed outright (spec §4.F).
        const TIME_NOT_CHANGED = 1 << 4;
    }
}

/// Protocol-defined composite key grouping readings from one physical
/// device across transmissions (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorIdentity {
    pub protocol_index: u8,
    pub variant: u8,
    pub channel_bits: u8,
    pub rolling_code: u32,
}

impl SensorIdentity {
    #[must_use]
    pub fn as_key(&self) -> u64 {
        (u64::from(self.protocol_index) << 56)
            | (u64::from(self.variant) << 48)
            | (u64::from(self.channel_bits) << 40)
            | u64::from(self.rolling_code)
    }
}

/// Render a ×10-scaled value as a one-decimal-place string, e.g. `725` ->
/// `"72.5"`. Shared by the message template renderer and JSON/line-protocol
/// formatting so both agree on how a scaled reading prints.
#[must_use]
pub fn format_x10_decimal(value_x10: i32) -> String {
    let sign = if value_x10 < 0 { "-" } else { "" };
    let magnitude = value_x10.unsigned_abs();
    format!("{sign}{}.{}", magnitude / 10, magnitude % 10)
}

/// One decoded metric set from a single protocol frame.
#[derive(Debug, Clone)]
pub struct SensorReading {
    pub protocol_id: u8,
    pub variant: u8,
    pub identity: SensorIdentity,
    pub channel: Option<u8>,
    /// Temperature, scaled ×10, in the protocol's native unit.
    pub temperature_x10: Option<i32>,
    pub temperature_is_celsius: bool,
    /// Relative humidity, integer percent.
    pub humidity: Option<u8>,
    pub battery_ok: Option<bool>,
    pub decoded_bits: usize,
    /// `0` on success; otherwise `(category_nibble | subcode_nibble | position<<8)`
    /// per spec §7.
    pub decoding_status: u16,
    pub observed_at: SystemTime,
}

impl SensorReading {
    #[must_use]
    pub fn metrics(&self) -> MetricBits {
        let mut bits = MetricBits::empty();
        if self.temperature_x10.is_some() {
            bits |= MetricBits::TEMPERATURE;
        }
        if self.humidity.is_some() {
            bits |= MetricBits::HUMIDITY;
        }
        if self.battery_ok.is_some() {
            bits |= MetricBits::BATTERY_STATUS;
        }
        bits
    }

    /// Temperature in whole-degree Fahrenheit ×10, converting from Celsius
    /// if needed.
    #[must_use]
    pub fn temperature_f_x10(&self) -> Option<i32> {
        self.temperature_x10.map(|v| {
            if self.temperature_is_celsius {
                v * 9 / 5 + 320
            } else {
                v
            }
        })
    }

    /// Temperature in whole-degree Celsius ×10, converting from Fahrenheit
    /// if needed.
    #[must_use]
    pub fn temperature_c_x10(&self) -> Option<i32> {
        self.temperature_x10.map(|v| {
            if self.temperature_is_celsius {
                v
            } else {
                (v - 320) * 5 / 9
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_key() {
        let id = SensorIdentity {
            protocol_index: 1,
            variant: 0,
            channel_bits: 3,
            rolling_code: 0x7A,
        };
        let other = SensorIdentity {
            protocol_index: 1,
            variant: 0,
            channel_bits: 3,
            rolling_code: 0x7A,
        };
        assert_eq!(id.as_key(), other.as_key());
    }

    #[test]
    fn fahrenheit_celsius_conversion() {
        let reading = SensorReading {
            protocol_id: 1,
            variant: 0,
            identity: SensorIdentity { protocol_index: 1, variant: 0, channel_bits: 0, rolling_code: 0 },
            channel: None,
            temperature_x10: Some(215),
            temperature_is_celsius: true,
            humidity: None,
            battery_ok: None,
            decoded_bits: 56,
            decoding_status: 0,
            observed_at: SystemTime::now(),
        };
        assert_eq!(reading.temperature_c_x10(), Some(215));
        assert_eq!(reading.temperature_f_x10(), Some(707));
    }
}
