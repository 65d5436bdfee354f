//! Rule evaluation (spec §4.H): bound comparison, schedule lookup, lock
//! arena, and message rendering dispatch.
//!
//! [`RuleEngine`] borrows the resolved rule table built once at startup
//! (`config::GatewayConfig::rules`) and owns only the small amount of
//! mutable state each rule accrues while running: whether it is currently
//! locked by another rule, and which outcome it last fired so a repeat
//! outcome can be suppressed (the "self-lock" in the glossary).

pub mod template;

use chrono::Timelike;

use crate::config::{BoundOutcome, BoundScheduleConfig, ResolvedOutcome, ResolvedRule, RuleMetric};
use crate::reading::{MetricBits, SensorReading};

/// Per-rule runtime state, indexed in parallel with `GatewayConfig::rules`.
#[derive(Debug, Clone, Default)]
struct RuleState {
    is_locked: bool,
    last_fired_outcome: Option<BoundOutcome>,
}

/// A fired rule's rendered output, ready to hand to a sink.
#[derive(Debug, Clone)]
pub struct Firing {
    pub rule_index: usize,
    pub sink_id: String,
    pub topic: Option<String>,
    pub message: Option<String>,
}

/// Evaluates the resolved rule table against incoming readings.
pub struct RuleEngine<'a> {
    rules: &'a [ResolvedRule],
    sensor_names: &'a [String],
    states: Vec<RuleState>,
}

impl<'a> RuleEngine<'a> {
    #[must_use]
    pub fn new(rules: &'a [ResolvedRule], sensor_names: &'a [String]) -> RuleEngine<'a> {
        RuleEngine { rules, sensor_names, states: vec![RuleState::default(); rules.len()] }
    }

    /// Evaluate every rule bound to `sensor_index` against `reading`,
    /// applying lock/unlock transitions in rule order as they fire (spec
    /// §4.H "Ordering": an earlier rule's lock is already visible to a
    /// later rule evaluated in the same pass). `changed` is the metric
    /// change set the registry reported for this update (spec §4.F); a rule
    /// whose metric isn't in it is `NotApplicable` and skipped outright
    /// (spec §4.H step 2), so an unrelated metric's change, or a schedule
    /// boundary crossing on an otherwise-unchanged value, can't spuriously
    /// re-evaluate it.
    pub fn evaluate(&mut self, sensor_index: usize, reading: &SensorReading, changed: MetricBits) -> Vec<Firing> {
        let mut firings = Vec::new();
        let now = now_local_day_minute();

        for i in 0..self.rules.len() {
            if self.rules[i].sensor_index != sensor_index {
                continue;
            }
            if self.states[i].is_locked {
                continue;
            }
            if !changed.contains(metric_bit(&self.rules[i].metric)) {
                continue;
            }

            let Some(value_x10) = metric_value_x10(&self.rules[i].metric, reading) else {
                continue;
            };
            let Some((lo, hi)) = resolve_bound(&self.rules[i].bound, now) else {
                continue;
            };
            let outcome = classify(value_x10, lo, hi);

            if self.states[i].last_fired_outcome == Some(outcome) {
                continue;
            }

            let resolved_outcome = match outcome {
                BoundOutcome::Lower => &self.rules[i].on_lower,
                BoundOutcome::Inside => &self.rules[i].on_inside,
                BoundOutcome::Higher => &self.rules[i].on_higher,
            };

            self.states[i].last_fired_outcome = Some(outcome);
            self.apply_locks(resolved_outcome);

            if let Some(firing) = self.build_firing(i, resolved_outcome, reading) {
                firings.push(firing);
            }
        }

        firings
    }

    fn apply_locks(&mut self, outcome: &ResolvedOutcome) {
        for &target in &outcome.lock {
            self.states[target].is_locked = true;
        }
        for &target in &outcome.unlock {
            self.states[target].is_locked = false;
        }
    }

    fn build_firing(&self, rule_index: usize, outcome: &ResolvedOutcome, reading: &SensorReading) -> Option<Firing> {
        let rule = &self.rules[rule_index];
        let sensor_name = self.sensor_names.get(rule.sensor_index).map_or("", String::as_str);
        let message = outcome.message.as_ref().map(|t| t.render(reading, sensor_name, &rule.id));

        match &rule.kind {
            crate::config::RuleKindConfig::Mqtt { sink, topic } => {
                Some(Firing { rule_index, sink_id: sink.clone(), topic: Some(topic.clone()), message })
            }
            crate::config::RuleKindConfig::Action { sink } => {
                Some(Firing { rule_index, sink_id: sink.clone(), topic: None, message })
            }
        }
    }
}

fn metric_bit(metric: &RuleMetric) -> MetricBits {
    match metric {
        RuleMetric::Temperature => MetricBits::TEMPERATURE,
        RuleMetric::Humidity => MetricBits::HUMIDITY,
    }
}

fn metric_value_x10(metric: &RuleMetric, reading: &SensorReading) -> Option<i32> {
    match metric {
        RuleMetric::Temperature => reading.temperature_f_x10(),
        RuleMetric::Humidity => reading.humidity.map(|h| i32::from(h) * 10),
    }
}

fn classify(value_x10: i32, lo_x10: i32, hi_x10: i32) -> BoundOutcome {
    if value_x10 < lo_x10 {
        BoundOutcome::Lower
    } else if value_x10 > hi_x10 {
        BoundOutcome::Higher
    } else {
        BoundOutcome::Inside
    }
}

/// Minutes since local midnight, used both for "now" and for parsing a
/// schedule entry's `"HH:MM"` field.
fn now_local_day_minute() -> u32 {
    let now = chrono::Local::now();
    now.hour() * 60 + now.minute()
}

fn parse_hhmm(text: &str) -> Option<u32> {
    let (h, m) = text.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Resolve a rule's configured bound to `(lo, hi)` ×10 values effective at
/// `now_minute`. A fixed bound always applies. A scheduled bound picks the
/// entry with the latest `at` that is `<= now_minute`, wrapping around
/// midnight to the last entry of the previous day if `now_minute` is
/// earlier than every entry (spec §4.H schedule lookup).
fn resolve_bound(bound: &BoundScheduleConfig, now_minute: u32) -> Option<(i32, i32)> {
    match bound {
        BoundScheduleConfig::Fixed { lo, hi } => Some((lo * 10, hi * 10)),
        BoundScheduleConfig::Scheduled(entries) => {
            let mut parsed: Vec<(u32, i32, i32)> =
                entries.iter().filter_map(|e| parse_hhmm(&e.at).map(|m| (m, e.lo, e.hi))).collect();
            if parsed.is_empty() {
                return None;
            }
            parsed.sort_by_key(|&(m, _, _)| m);

            let mut selected = parsed.last().copied();
            for &(m, lo, hi) in &parsed {
                if m <= now_minute {
                    selected = Some((m, lo, hi));
                } else {
                    break;
                }
            }
            selected.map(|(_, lo, hi)| (lo * 10, hi * 10))
        }
    }
}
