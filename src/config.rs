//! Gateway configuration: parsing and validation.
//!
//! Mirrors the teacher's `Configuration::parse` shape — deserialize with
//! serde, then run a validation pass that can fail even on structurally
//! valid JSON (dangling rule references, out-of-range values). Rule lock
//! references are resolved in a second pass, after every rule has been
//! constructed, per the two-pass arena-index scheme described in the
//! design notes: `lock`/`unlock` id-strings become plain array indices
//! into `GatewayConfig::rules`, so cyclic locks (A locks B, B locks A) are
//! representable without reference counting.

use std::collections::HashMap;
use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bitmask of protocols the active configuration will offer a sequence to.
/// Mirrors `protocol_bit` on each decoder (spec §4.D).
pub mod protocol_bits {
    pub const F007TH: u32 = 1 << 0;
    pub const ACURITE_00592TXR: u32 = 1 << 1;
    pub const TX7U: u32 = 1 << 2;
    pub const HG02832: u32 = 1 << 3;
    pub const WH2: u32 = 1 << 4;
    pub const TX141: u32 = 1 << 5;
    pub const NEXUS: u32 = 1 << 6;
    pub const TFA: u32 = 1 << 7;
    pub const ALL: u32 = F007TH
        | ACURITE_00592TXR
        | TX7U
        | HG02832
        | WH2
        | TX141
        | NEXUS
        | TFA;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read configuration source: {0}")]
    Io(#[from] std::io::Error),
    #[error("rule {rule_id:?} references unknown sensor {sensor_ref:?}")]
    UnknownSensor { rule_id: String, sensor_ref: String },
    #[error("rule {rule_id:?} locks unknown rule id {target:?}")]
    UnknownLockTarget { rule_id: String, target: String },
    #[error("duplicate rule id {0:?}")]
    DuplicateRuleId(String),
    #[error("duplicate sensor id {0:?}")]
    DuplicateSensorId(String),
    #[error("message template for rule {rule_id:?} contains unknown token %{token}")]
    UnknownTemplateToken { rule_id: String, token: char },
    #[error("schedule for rule {0:?} is empty")]
    EmptySchedule(String),
    #[error("sink {0:?} is not configured but referenced by a rule")]
    UnknownSink(String),
}

/// Identity fields used to bind a [`SensorDef`] to readings observed later.
/// `protocol` names one of the `protocol_bits` constants' human-readable
/// spelling; `channel`/`rolling_code` follow the per-protocol conventions in
/// spec §4.E.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorIdentityConfig {
    pub protocol: String,
    #[serde(default)]
    pub channel: Option<u8>,
    #[serde(default)]
    pub rolling_code: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDefConfig {
    pub id: String,
    pub name: String,
    pub identity: SensorIdentityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundOutcome {
    Lower,
    Inside,
    Higher,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntryConfig {
    /// `"HH:MM"` time of day this bound pair takes effect.
    pub at: String,
    pub lo: i32,
    pub hi: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoundScheduleConfig {
    Fixed { lo: i32, hi: i32 },
    Scheduled(Vec<ScheduleEntryConfig>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeActionConfig {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub lock: Vec<String>,
    #[serde(default)]
    pub unlock: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMetric {
    Temperature,
    Humidity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKindConfig {
    /// Publishes the formatted message to an MQTT topic.
    Mqtt { sink: String, topic: String },
    /// Runs the formatted message as a subprocess command line.
    Action { sink: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub sensor: String,
    pub metric: RuleMetric,
    pub bound: BoundScheduleConfig,
    #[serde(default)]
    pub on_lower: OutcomeActionConfig,
    #[serde(default)]
    pub on_inside: OutcomeActionConfig,
    #[serde(default)]
    pub on_higher: OutcomeActionConfig,
    #[serde(flatten)]
    pub kind: RuleKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    Stdout,
    Mqtt {
        id: String,
        host: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        #[serde(default)]
        client_id: Option<String>,
    },
    Rest {
        id: String,
        url: String,
        #[serde(default)]
        influx_line_protocol: bool,
        #[serde(default)]
        measurement: Option<String>,
    },
    Exec {
        id: String,
    },
}

fn default_mqtt_port() -> u16 {
    1883
}

impl SinkConfig {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            SinkConfig::Stdout => "stdout",
            SinkConfig::Mqtt { id, .. } | SinkConfig::Rest { id, .. } | SinkConfig::Exec { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSourceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub gpio_pin: Option<u32>,
    #[serde(default)]
    pub device_path: Option<String>,
    #[serde(default)]
    pub replay_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default)]
    pub ds18b20_enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_w1_root")]
    pub w1_root: String,
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_w1_root() -> String {
    "/sys/bus/w1/devices".to_string()
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            ds18b20_enabled: false,
            interval_secs: default_poll_interval_secs(),
            w1_root: default_w1_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    pub edge_source: EdgeSourceConfig,
    #[serde(default = "default_protocols_all")]
    pub active_protocols: Vec<String>,
    #[serde(default)]
    pub celsius: bool,
    #[serde(default)]
    pub utc: bool,
    #[serde(default = "default_stale_gap_secs")]
    pub stale_gap_secs: u32,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub sensors: Vec<SensorDefConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

fn default_protocols_all() -> Vec<String> {
    vec![
        "f007th".into(),
        "00592txr".into(),
        "tx7u".into(),
        "hg02832".into(),
        "wh2".into(),
        "tx141".into(),
        "nexus".into(),
        "tfa".into(),
    ]
}

fn default_stale_gap_secs() -> u32 {
    0
}

fn protocol_bit_by_name(name: &str) -> Option<u32> {
    match name {
        "f007th" | "f007tp" => Some(protocol_bits::F007TH),
        "00592txr" | "acurite00592txr" => Some(protocol_bits::ACURITE_00592TXR),
        "tx7u" => Some(protocol_bits::TX7U),
        "hg02832" => Some(protocol_bits::HG02832),
        "wh2" | "ft007th" => Some(protocol_bits::WH2),
        "tx141" => Some(protocol_bits::TX141),
        "nexus" => Some(protocol_bits::NEXUS),
        "tfa" => Some(protocol_bits::TFA),
        _ => None,
    }
}

/// A fully resolved, ready-to-run configuration: every rule lock target has
/// been turned into an index into [`GatewayConfig::rules`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub edge_source: EdgeSourceConfig,
    pub active_protocol_mask: u32,
    pub celsius: bool,
    pub utc: bool,
    pub stale_gap_secs: u32,
    pub poll: PollConfig,
    pub sensors: Vec<SensorDefConfig>,
    pub sinks: Vec<SinkConfig>,
    pub rules: Vec<ResolvedRule>,
    /// `sensor.id -> index into sensors`, for registry binding.
    pub sensor_index: HashMap<String, usize>,
}

/// An outcome action whose lock/unlock targets are resolved indices.
#[derive(Debug, Clone, Default)]
pub struct ResolvedOutcome {
    pub message: Option<crate::rules::template::MessageTemplate>,
    pub lock: Vec<usize>,
    pub unlock: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub id: String,
    pub sensor_id: String,
    pub sensor_index: usize,
    pub metric: RuleMetric,
    pub bound: BoundScheduleConfig,
    pub on_lower: ResolvedOutcome,
    pub on_inside: ResolvedOutcome,
    pub on_higher: ResolvedOutcome,
    pub kind: RuleKindConfig,
}

impl GatewayConfig {
    /// Parse and fully validate a configuration from a JSON source.
    pub fn parse(source: &mut impl Read) -> Result<GatewayConfig, Error> {
        let mut text = String::new();
        source.read_to_string(&mut text)?;
        let raw: RawConfig = serde_json::from_str(&text)?;
        GatewayConfig::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<GatewayConfig, Error> {
        let mut sensor_index = HashMap::new();
        for (i, sensor) in raw.sensors.iter().enumerate() {
            if sensor_index.insert(sensor.id.clone(), i).is_some() {
                return Err(Error::DuplicateSensorId(sensor.id.clone()));
            }
        }

        let mut active_protocol_mask = 0u32;
        for name in &raw.active_protocols {
            if let Some(bit) = protocol_bit_by_name(name) {
                active_protocol_mask |= bit;
            }
        }
        if active_protocol_mask == 0 {
            active_protocol_mask = protocol_bits::ALL;
        }

        let sink_ids: std::collections::HashSet<&str> =
            raw.sinks.iter().map(SinkConfig::id).chain(std::iter::once("stdout")).collect();

        let mut rule_index = HashMap::new();
        for (i, rule) in raw.rules.iter().enumerate() {
            if rule_index.insert(rule.id.clone(), i).is_some() {
                return Err(Error::DuplicateRuleId(rule.id.clone()));
            }
        }

        let mut resolved_rules = Vec::with_capacity(raw.rules.len());
        for rule in &raw.rules {
            let sensor_index_value = *sensor_index.get(&rule.sensor).ok_or_else(|| Error::UnknownSensor {
                rule_id: rule.id.clone(),
                sensor_ref: rule.sensor.clone(),
            })?;

            let sink_id = match &rule.kind {
                RuleKindConfig::Mqtt { sink, .. } | RuleKindConfig::Action { sink } => sink,
            };
            if !sink_ids.contains(sink_id.as_str()) {
                return Err(Error::UnknownSink(sink_id.clone()));
            }

            if let BoundScheduleConfig::Scheduled(entries) = &rule.bound {
                if entries.is_empty() {
                    return Err(Error::EmptySchedule(rule.id.clone()));
                }
            }

            for outcome in [&rule.on_lower, &rule.on_inside, &rule.on_higher] {
                if let Some(message) = &outcome.message {
                    validate_template_tokens(&rule.id, message)?;
                }
            }

            resolved_rules.push(ResolvedRule {
                id: rule.id.clone(),
                sensor_id: rule.sensor.clone(),
                sensor_index: sensor_index_value,
                metric: rule.metric,
                bound: rule.bound.clone(),
                on_lower: resolve_outcome(&rule.id, &rule.on_lower, &rule_index)?,
                on_inside: resolve_outcome(&rule.id, &rule.on_inside, &rule_index)?,
                on_higher: resolve_outcome(&rule.id, &rule.on_higher, &rule_index)?,
                kind: rule.kind.clone(),
            });
        }

        Ok(GatewayConfig {
            edge_source: raw.edge_source,
            active_protocol_mask,
            celsius: raw.celsius,
            utc: raw.utc,
            stale_gap_secs: raw.stale_gap_secs,
            poll: raw.poll,
            sensors: raw.sensors,
            sinks: raw.sinks,
            rules: resolved_rules,
            sensor_index,
        })
    }
}

fn resolve_outcome(
    rule_id: &str,
    outcome: &OutcomeActionConfig,
    rule_index: &HashMap<String, usize>,
) -> Result<ResolvedOutcome, Error> {
    let message = match &outcome.message {
        Some(text) => Some(
            crate::rules::template::MessageTemplate::compile(text)
                .map_err(|token| Error::UnknownTemplateToken { rule_id: rule_id.to_string(), token })?,
        ),
        None => None,
    };
    let resolve_targets = |ids: &[String]| -> Result<Vec<usize>, Error> {
        ids.iter()
            .map(|target| {
                rule_index.get(target).copied().ok_or_else(|| Error::UnknownLockTarget {
                    rule_id: rule_id.to_string(),
                    target: target.clone(),
                })
            })
            .collect()
    };
    Ok(ResolvedOutcome {
        message,
        lock: resolve_targets(&outcome.lock)?,
        unlock: resolve_targets(&outcome.unlock)?,
    })
}

fn validate_template_tokens(rule_id: &str, text: &str) -> Result<(), Error> {
    crate::rules::template::MessageTemplate::compile(text)
        .map(|_| ())
        .map_err(|token| Error::UnknownTemplateToken { rule_id: rule_id.to_string(), token })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_json() -> &'static str {
        r#"{
          "edge_source": {"type": "kernel", "device_path": "/dev/gpio-ts0"},
          "active_protocols": ["f007th"],
          "celsius": false,
          "utc": true,
          "stale_gap_secs": 900,
          "sensors": [
            {"id": "porch", "name": "Porch", "identity": {"protocol": "f007th", "channel": 3, "rolling_code": 122}}
          ],
          "sinks": [
            {"type": "exec", "id": "notify"}
          ],
          "rules": [
            {
              "id": "porch-hot",
              "sensor": "porch",
              "metric": "temperature",
              "bound": {"lo": 600, "hi": 800},
              "on_higher": {"message": "%N is %F F", "lock": []},
              "kind": "action",
              "sink": "notify"
            }
          ]
        }"#
    }

    #[test]
    fn parses_and_resolves_valid_config() {
        let mut cursor = Cursor::new(sample_json());
        let cfg = GatewayConfig::parse(&mut cursor).expect("valid config");
        assert_eq!(cfg.rules.len(), 1);
        assert_eq!(cfg.rules[0].sensor_index, 0);
        assert_eq!(cfg.active_protocol_mask, protocol_bits::F007TH);
    }

    #[test]
    fn unknown_sensor_reference_is_fatal() {
        let json = sample_json().replace("\"sensor\": \"porch\"", "\"sensor\": \"missing\"");
        let mut cursor = Cursor::new(json);
        let err = GatewayConfig::parse(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::UnknownSensor { .. }));
    }

    #[test]
    fn unknown_template_token_is_fatal() {
        let json = sample_json().replace("%N is %F F", "%N is %Q F");
        let mut cursor = Cursor::new(json);
        let err = GatewayConfig::parse(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::UnknownTemplateToken { .. }));
    }

    #[test]
    fn cyclic_locks_resolve_without_error() {
        let json = r#"{
          "edge_source": {"type": "kernel"},
          "sensors": [{"id": "a", "name": "A", "identity": {"protocol": "f007th"}}],
          "sinks": [{"type": "exec", "id": "notify"}],
          "rules": [
            {"id": "r1", "sensor": "a", "metric": "temperature", "bound": {"lo": 0, "hi": 10},
             "on_higher": {"lock": ["r2"]}, "kind": "action", "sink": "notify"},
            {"id": "r2", "sensor": "a", "metric": "temperature", "bound": {"lo": 0, "hi": 10},
             "on_higher": {"lock": ["r1"]}, "kind": "action", "sink": "notify"}
          ]
        }"#;
        let mut cursor = Cursor::new(json);
        let cfg = GatewayConfig::parse(&mut cursor).expect("cyclic locks are legal");
        assert_eq!(cfg.rules[0].on_higher.lock, vec![1]);
        assert_eq!(cfg.rules[1].on_higher.lock, vec![0]);
    }
}
