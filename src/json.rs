//! Bit-exact JSON and InfluxDB line-protocol formatting for REST/HTTP output
//! (spec §6). Field order and punctuation match the wire format literally,
//! so this builds strings by hand rather than through `serde::Serialize`:
//! a derived `Serialize` impl can't guarantee key order against a future
//! refactor the way an explicit writer can.

use std::fmt::Write as _;
use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};

use crate::reading::SensorReading;

/// `YYYY-MM-DDTHH:MM:SS`, with a trailing `Z` iff `utc` is set (spec §6).
#[must_use]
pub fn format_time(time: SystemTime, utc: bool) -> String {
    if utc {
        let dt: DateTime<Utc> = time.into();
        format!("{}Z", dt.format("%Y-%m-%dT%H:%M:%S"))
    } else {
        let dt: DateTime<Local> = time.into();
        dt.format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}

/// Render one reading as the JSON object the REST query API emits. Fields a
/// reading doesn't carry (e.g. `humidity` on a temperature-only protocol)
/// are omitted rather than emitted as `null`.
#[must_use]
pub fn sensor_reading_json(
    reading: &SensorReading,
    protocol_name: &str,
    channel_label: &str,
    sensor_name: &str,
    celsius: bool,
    utc: bool,
) -> String {
    let temperature = if celsius { reading.temperature_c_x10() } else { reading.temperature_f_x10() };

    let mut out = String::new();
    out.push('{');
    write!(out, "\"time\":\"{}\",", format_time(reading.observed_at, utc)).unwrap();
    write!(out, "\"type\":{},", json_string(protocol_name)).unwrap();
    write!(out, "\"channel\":{},", json_string(channel_label)).unwrap();
    write!(out, "\"rolling_code\":{},", reading.identity.rolling_code).unwrap();
    write!(out, "\"name\":{}", json_string(sensor_name)).unwrap();
    if let Some(t) = temperature {
        write!(out, ",\"temperature\":{t}").unwrap();
    }
    if let Some(h) = reading.humidity {
        write!(out, ",\"humidity\":{h}").unwrap();
    }
    if let Some(b) = reading.battery_ok {
        write!(out, ",\"battery_ok\":{b}").unwrap();
    }
    out.push('}');
    out
}

fn json_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

/// Escape a tag value per InfluxDB line protocol: commas, spaces, and `=`
/// each need a preceding backslash.
#[must_use]
pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `<measurement>,name=<escaped> temperature=<v>,humidity=<v>,battery_ok=<t|f> <unix_ns>`
/// (spec §6). Fields the reading doesn't carry are omitted from the field set.
#[must_use]
pub fn line_protocol(measurement: &str, sensor_name: &str, reading: &SensorReading, celsius: bool, unix_ns: i128) -> String {
    let temperature = if celsius { reading.temperature_c_x10() } else { reading.temperature_f_x10() };

    let mut fields = Vec::new();
    if let Some(t) = temperature {
        fields.push(format!("temperature={}", crate::reading::format_x10_decimal(t)));
    }
    if let Some(h) = reading.humidity {
        fields.push(format!("humidity={h}"));
    }
    if let Some(b) = reading.battery_ok {
        fields.push(format!("battery_ok={}", if b { 't' } else { 'f' }));
    }

    format!(
        "{},name={} {} {unix_ns}",
        measurement,
        escape_tag_value(sensor_name),
        fields.join(",")
    )
}
