//! Compiled rule message templates (spec §6 substitution tokens).
//!
//! Compilation happens once, at config-load time, so a malformed token is a
//! startup error rather than something discovered mid-run on the decoder
//! thread. Rendering happens on every rule firing and must not allocate more
//! than the rendered string itself.

use crate::reading::{format_x10_decimal, SensorReading};

/// Render output beyond this many bytes is silently truncated (spec §4.H:
/// "a shared template formatter renders into a fixed-size buffer").
const MAX_RENDERED_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    FahrenheitDecimal,
    CelsiusDecimal,
    FahrenheitX10,
    CelsiusX10,
    SensorName,
    RuleId,
    Humidity,
    BatteryInt,
    BatteryStr,
    Percent,
}

impl Token {
    fn from_char(c: char) -> Option<Token> {
        match c {
            'F' => Some(Token::FahrenheitDecimal),
            'C' => Some(Token::CelsiusDecimal),
            'f' => Some(Token::FahrenheitX10),
            'c' => Some(Token::CelsiusX10),
            'N' => Some(Token::SensorName),
            'I' => Some(Token::RuleId),
            'H' => Some(Token::Humidity),
            'B' => Some(Token::BatteryInt),
            'b' => Some(Token::BatteryStr),
            '%' => Some(Token::Percent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Token(Token),
}

/// A parsed message template, ready to render against a reading.
#[derive(Debug, Clone, Default)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
}

impl MessageTemplate {
    /// Compile `text`, resolving every `%X` substitution token. Returns the
    /// offending character on the first unrecognized token (spec §6:
    /// "unknown `%X` is a configuration error detected at load time").
    pub fn compile(text: &str) -> Result<MessageTemplate, char> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            let Some(next) = chars.next() else {
                return Err('%');
            };
            let Some(token) = Token::from_char(next) else {
                return Err(next);
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Token(token));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(MessageTemplate { segments })
    }

    /// Render against `reading`, substituting `sensor_name` for `%N` and
    /// `rule_id` for `%I`. Fields a reading doesn't carry (e.g. `%F` on a
    /// humidity-only reading) render as an empty string rather than
    /// panicking: the rule engine only renders when the relevant metric is
    /// already known to be present.
    #[must_use]
    pub fn render(&self, reading: &SensorReading, sensor_name: &str, rule_id: &str) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token(token) => render_token(*token, reading, sensor_name, rule_id, &mut out),
            }
            if out.len() >= MAX_RENDERED_BYTES {
                break;
            }
        }
        if out.len() > MAX_RENDERED_BYTES {
            let mut cut = MAX_RENDERED_BYTES;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out.truncate(cut);
        }
        out
    }
}

fn render_token(token: Token, reading: &SensorReading, sensor_name: &str, rule_id: &str, out: &mut String) {
    match token {
        Token::FahrenheitDecimal => {
            if let Some(v) = reading.temperature_f_x10() {
                out.push_str(&format_x10_decimal(v));
            }
        }
        Token::CelsiusDecimal => {
            if let Some(v) = reading.temperature_c_x10() {
                out.push_str(&format_x10_decimal(v));
            }
        }
        Token::FahrenheitX10 => {
            if let Some(v) = reading.temperature_f_x10() {
                out.push_str(&v.to_string());
            }
        }
        Token::CelsiusX10 => {
            if let Some(v) = reading.temperature_c_x10() {
                out.push_str(&v.to_string());
            }
        }
        Token::SensorName => out.push_str(sensor_name),
        Token::RuleId => out.push_str(rule_id),
        Token::Humidity => {
            if let Some(h) = reading.humidity {
                out.push_str(&h.to_string());
            }
        }
        Token::BatteryInt => {
            if let Some(b) = reading.battery_ok {
                out.push(if b { '1' } else { '0' });
            }
        }
        Token::BatteryStr => {
            if let Some(b) = reading.battery_ok {
                out.push_str(if b { "OK" } else { "Bad" });
            }
        }
        Token::Percent => out.push('%'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::SensorIdentity;
    use std::time::SystemTime;

    fn reading(temperature_x10: Option<i32>, celsius: bool, humidity: Option<u8>, battery_ok: Option<bool>) -> SensorReading {
        SensorReading {
            protocol_id: 0,
            variant: 0,
            identity: SensorIdentity { protocol_index: 0, variant: 0, channel_bits: 0, rolling_code: 0 },
            channel: None,
            temperature_x10,
            temperature_is_celsius: celsius,
            humidity,
            battery_ok,
            decoded_bits: 0,
            decoding_status: 0,
            observed_at: SystemTime::now(),
        }
    }

    #[test]
    fn unknown_token_reports_offending_char() {
        let err = MessageTemplate::compile("%N is %Q F").unwrap_err();
        assert_eq!(err, 'Q');
    }

    #[test]
    fn fahrenheit_and_humidity_render_exactly() {
        let tmpl = MessageTemplate::compile("%F %H").unwrap();
        let r = reading(Some(725), false, Some(45), None);
        assert_eq!(tmpl.render(&r, "porch", "r1"), "72.5 45");
    }

    #[test]
    fn sensor_name_and_rule_id_substitute() {
        let tmpl = MessageTemplate::compile("%N triggered %I").unwrap();
        let r = reading(Some(215), true, None, None);
        assert_eq!(tmpl.render(&r, "Porch", "porch-hot"), "Porch triggered porch-hot");
    }

    #[test]
    fn battery_tokens_render_ok_and_bad() {
        let tmpl = MessageTemplate::compile("%B %b").unwrap();
        let ok = reading(None, false, None, Some(true));
        let bad = reading(None, false, None, Some(false));
        assert_eq!(tmpl.render(&ok, "s", "r"), "1 OK");
        assert_eq!(tmpl.render(&bad, "s", "r"), "0 Bad");
    }

    #[test]
    fn literal_percent_is_preserved() {
        let tmpl = MessageTemplate::compile("100%% full").unwrap();
        let r = reading(None, false, None, None);
        assert_eq!(tmpl.render(&r, "s", "r"), "100% full");
    }

    #[test]
    fn missing_metric_renders_empty_not_panicking() {
        let tmpl = MessageTemplate::compile("T=%F").unwrap();
        let r = reading(None, false, None, None);
        assert_eq!(tmpl.render(&r, "s", "r"), "T=");
    }
}
