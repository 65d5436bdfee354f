//! Thread orchestration and signal handling (spec §5).
//!
//! `Gateway::start` spawns the capture/decode thread, the optional DS18B20
//! poll thread, and the rule/sink consumer thread inside one
//! `std::thread::scope`, mirroring the teacher's scoped-thread-fan-out
//! pattern (`slonk::server::run`) instead of an async runtime: nothing here
//! needs to overlap I/O within a single thread, so plain blocking threads
//! keep the control flow easy to follow.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};

use crate::assembler::{Assembler, AssemblerLimits};
use crate::capture::ring::{PulsePool, SequenceDirectory};
use crate::capture::{EdgeRecord, EdgeSource, Level};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::poll;
use crate::protocols::ProtocolRegistry;
use crate::queue::{DecodedMessage, DecodedMessageQueue};
use crate::reading::MetricBits;
use crate::registry::SensorRegistry;
use crate::rules::RuleEngine;
use crate::sinks::SinkTable;
use crate::stats::Stats;

/// Maps a config sensor's `{protocol, channel, rolling_code}` to the
/// decoder index `ProtocolRegistry` assigns it, mirroring the construction
/// order in `ProtocolRegistry::new`.
fn protocol_index_for_name(name: &str) -> Option<u8> {
    match name {
        "f007th" => Some(0),
        "f007tp" => Some(1),
        "00592txr" | "acurite00592txr" => Some(2),
        "tx7u" => Some(3),
        "hg02832" => Some(4),
        "wh2" => Some(5),
        "ft007th" => Some(6),
        "tx141" => Some(7),
        "nexus" => Some(8),
        "tfa" => Some(9),
        _ => None,
    }
}

/// Precompute `identity key -> sensor_index` for every configured sensor, so
/// the decode loop can bind a reading to a user-declared name without
/// rescanning the sensor list per sequence.
fn build_sensor_index_map(config: &GatewayConfig, protocol_registry: &ProtocolRegistry) -> std::collections::HashMap<u64, usize> {
    let mut map = std::collections::HashMap::new();
    for (i, sensor) in config.sensors.iter().enumerate() {
        let Some(protocol_index) = protocol_index_for_name(&sensor.identity.protocol) else { continue };
        let Some(decoder) = protocol_registry.decoder_by_index(protocol_index) else { continue };
        let key = decoder.identity_from_config(sensor.identity.channel, sensor.identity.rolling_code.unwrap_or(0));
        map.insert(key, i);
    }
    map
}

/// Whether an edge source replays canned input and whether it's the
/// interrupt-callback source the noise filter is restricted to (spec
/// §4.C.3: kernel-device and replay sources already deliver filtered
/// pulses and must not run it).
struct SourceTraits {
    is_replay: bool,
    noise_filter_enabled: bool,
}

fn open_edge_source(config: &GatewayConfig, shutdown: &Arc<AtomicBool>) -> Result<(Box<dyn EdgeSource>, SourceTraits), GatewayError> {
    match config.edge_source.kind.as_str() {
        "replay" => {
            let path = config.edge_source.replay_path.as_deref().ok_or_else(|| {
                GatewayError::Capture("replay edge source requires replay_path".to_string())
            })?;
            let source = crate::capture::source::ReplaySource::open(path).map_err(|e| GatewayError::Capture(e.to_string()))?;
            Ok((Box::new(source), SourceTraits { is_replay: true, noise_filter_enabled: false }))
        }
        "kernel" | "callback" => {
            let path = config.edge_source.device_path.clone().ok_or_else(|| {
                GatewayError::Capture("kernel/callback edge source requires device_path".to_string())
            })?;
            let (tx, rx) = std::sync::mpsc::channel();
            spawn_device_reader(path, tx, Arc::clone(shutdown));
            let is_callback = config.edge_source.kind == "callback";
            let source: Box<dyn EdgeSource> = if is_callback {
                Box::new(crate::capture::source::CallbackSource::new(rx))
            } else {
                Box::new(crate::capture::source::KernelDeviceSource::new(rx))
            };
            Ok((source, SourceTraits { is_replay: false, noise_filter_enabled: is_callback }))
        }
        other => Err(GatewayError::Capture(format!("unknown edge source type {other:?}"))),
    }
}

/// Reads 4-byte `(status:2, duration:30)` words from a character device and
/// forwards them as [`EdgeRecord`]s (spec §6's edge-source driver record
/// format). Runs on its own thread so the consuming [`EdgeSource`] impl can
/// present a plain blocking-channel interface.
fn spawn_device_reader(path: String, tx: std::sync::mpsc::Sender<EdgeRecord>, shutdown: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(error = %err, path = %path, "failed to open edge-source device");
                return;
            }
        };
        let mut reader = std::io::BufReader::new(file);
        let mut word = [0u8; 4];
        const SENTINEL_DURATION: u32 = 0x3FFF_FFFF;

        while !shutdown.load(Ordering::Relaxed) {
            if reader.read_exact(&mut word).is_err() {
                break;
            }
            let raw = u32::from_le_bytes(word);
            let status = (raw >> 30) & 0b11;
            let duration_us = (raw & SENTINEL_DURATION).min(SENTINEL_DURATION);
            let record = match status {
                0 => EdgeRecord::Pulse { level: Level::Low, duration_us },
                1 => EdgeRecord::Pulse { level: Level::High, duration_us },
                2 => EdgeRecord::Break,
                _ => EdgeRecord::OverflowInDriver,
            };
            if tx.send(record).is_err() {
                break;
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    mut source: Box<dyn EdgeSource>,
    is_replay: bool,
    noise_filter_enabled: bool,
    protocol_registry: &ProtocolRegistry,
    sensor_index_map: &std::collections::HashMap<u64, usize>,
    registry: &SensorRegistry,
    queue: &DecodedMessageQueue,
    stats: &Stats,
    stale_gap: Duration,
    shutdown: &AtomicBool,
) {
    source.set_min_duration_us(crate::DEFAULT_MIN_DURATION_US);
    source.set_max_duration_us(crate::DEFAULT_MAX_DURATION_US);
    source.set_min_sequence_length(crate::DEFAULT_MIN_SEQUENCE_LENGTH);

    let mut assembler = Assembler::new(AssemblerLimits::default(), noise_filter_enabled);
    let mut pool = PulsePool::new(crate::POOL_SIZE);
    let mut dir = SequenceDirectory::new(crate::MAX_CHAINS);
    let mut monotonic_us: u32 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        match source.read() {
            Ok(Some(EdgeRecord::Pulse { level, duration_us })) => {
                monotonic_us = monotonic_us.wrapping_add(duration_us);
                assembler.on_pulse(level, duration_us, &mut pool, &mut dir, monotonic_us, stats);
            }
            Ok(Some(EdgeRecord::Edge { .. })) => {
                // Raw edges need a prior edge to derive a duration from; every
                // implemented EdgeSource already delivers pre-formed Pulse
                // records, so this variant never reaches the assembler today.
            }
            Ok(Some(EdgeRecord::Break)) => assembler.on_break(&mut dir, stats),
            Ok(Some(EdgeRecord::OverflowInDriver)) => Stats::incr(&stats.overflow_in_driver),
            Ok(None) => {
                if is_replay {
                    assembler.on_break(&mut dir, stats);
                    break;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "edge source read failed, stopping capture");
                break;
            }
        }

        drain_sequences(&mut pool, &mut dir, protocol_registry, sensor_index_map, registry, queue, stats, stale_gap);
    }
    drain_sequences(&mut pool, &mut dir, protocol_registry, sensor_index_map, registry, queue, stats, stale_gap);
}

#[allow(clippy::too_many_arguments)]
fn drain_sequences(
    pool: &mut PulsePool,
    dir: &mut SequenceDirectory,
    protocol_registry: &ProtocolRegistry,
    sensor_index_map: &std::collections::HashMap<u64, usize>,
    registry: &SensorRegistry,
    queue: &DecodedMessageQueue,
    stats: &Stats,
    stale_gap: Duration,
) {
    while let Some(entry) = dir.try_pop() {
        let durations = pool.copy_out(entry.start_pool_index, entry.length);
        pool.advance_tail(entry.length);

        match protocol_registry.try_decode(&durations) {
            Ok(reading) => {
                Stats::incr(&stats.decoded);
                let Some(decoder) = protocol_registry.decoder_by_index(reading.identity.protocol_index) else { continue };
                let sensor_index = sensor_index_map.get(&reading.identity.as_key()).copied();
                let now = SystemTime::now();
                let changed = registry.update(decoder, reading.clone(), now, stale_gap, sensor_index);
                if changed.is_empty() || changed == MetricBits::TIME_NOT_CHANGED {
                    continue;
                }
                queue.push(DecodedMessage { sensor_index, reading, changed, received_at: now });
            }
            Err(Some(failure)) => {
                Stats::incr(&stats.decode_failed);
                tracing::debug!(detail = %protocol_registry.describe_failure(failure), "sequence did not decode");
            }
            Err(None) => {
                Stats::incr(&stats.decode_failed);
            }
        }
    }
}

fn consumer_loop(
    queue: &DecodedMessageQueue,
    config: &GatewayConfig,
    sink_table: &SinkTable,
    sensor_names: &[String],
    stats: &Stats,
    shutdown: &AtomicBool,
) {
    let mut engine = RuleEngine::new(&config.rules, sensor_names);

    loop {
        let Some(message) = queue.pop_timeout(Duration::from_millis(500)) else {
            if shutdown.load(Ordering::Relaxed) && queue.is_shutdown() {
                break;
            }
            continue;
        };

        let Some(sensor_index) = message.sensor_index else {
            continue;
        };
        for firing in engine.evaluate(sensor_index, &message.reading, message.changed) {
            let Some(sink) = sink_table.get(&firing.sink_id) else {
                tracing::warn!(sink = %firing.sink_id, "rule references unconfigured sink");
                continue;
            };
            let body = firing.message.as_deref().unwrap_or_default();
            if let Err(err) = sink.dispatch(firing.topic.as_deref(), body) {
                Stats::incr(&stats.publish_errors);
                tracing::warn!(error = %err, sink = %firing.sink_id, "sink dispatch failed");
            }
        }
    }
}

/// Owns every long-lived piece of state and runs the gateway's threads for
/// the lifetime of one `start`/`stop` cycle.
pub struct Gateway {
    config: GatewayConfig,
    registry: SensorRegistry,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl Gateway {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Gateway {
        Gateway {
            config,
            registry: SensorRegistry::new(),
            stats: Arc::new(Stats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Signal every running thread to stop; `start` returns once they join.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Run until stopped by `stop()`, a terminating signal, or (for a replay
    /// edge source) end of input. Spawns the capture/decode thread, the
    /// DS18B20 poll thread, and the rule/sink consumer thread, and blocks
    /// until all three exit.
    pub fn start(&self) -> Result<(), GatewayError> {
        signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown)).map_err(GatewayError::Io)?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown)).map_err(GatewayError::Io)?;
        signal_hook::flag::register(SIGUSR1, Arc::clone(&self.reload)).map_err(GatewayError::Io)?;

        let protocol_registry = ProtocolRegistry::new(self.config.active_protocol_mask);
        let sensor_index_map = build_sensor_index_map(&self.config, &protocol_registry);
        let sensor_names: Vec<String> = self.config.sensors.iter().map(|s| s.name.clone()).collect();
        let sink_table = SinkTable::new(&self.config.sinks);
        let stale_gap = Duration::from_secs(u64::from(self.config.stale_gap_secs));

        let (edge_source, source_traits) = open_edge_source(&self.config, &self.shutdown)?;
        let queue = Arc::new(DecodedMessageQueue::new());
        let poll_shutdown = Arc::clone(&self.shutdown);
        let poll_config = self.config.poll.clone();
        let poll_queue = Arc::clone(&queue);
        let poll_stats = Arc::clone(&self.stats);

        std::thread::scope(|scope| {
            let stats_for_reload = Arc::clone(&self.stats);
            let reload_flag = Arc::clone(&self.reload);
            let shutdown_for_reload = Arc::clone(&self.shutdown);
            scope.spawn(move || {
                while !shutdown_for_reload.load(Ordering::Relaxed) {
                    if reload_flag.swap(false, Ordering::Relaxed) {
                        let snapshot = stats_for_reload.snapshot();
                        tracing::info!(?snapshot, "stats dump (SIGUSR1)");
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
            });

            scope.spawn(|| {
                poll::run(poll_config, poll_queue, poll_stats, poll_shutdown);
            });

            let capture_handle = scope.spawn(|| {
                capture_loop(
                    edge_source,
                    source_traits.is_replay,
                    source_traits.noise_filter_enabled,
                    &protocol_registry,
                    &sensor_index_map,
                    &self.registry,
                    &queue,
                    &self.stats,
                    stale_gap,
                    &self.shutdown,
                );
                queue.shutdown();
                self.shutdown.store(true, Ordering::Relaxed);
            });

            consumer_loop(&queue, &self.config, &sink_table, &sensor_names, &self.stats, &self.shutdown);

            let _ = capture_handle.join();
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EdgeSourceConfig;

    #[test]
    fn protocol_index_mapping_matches_registry_construction_order() {
        assert_eq!(protocol_index_for_name("f007th"), Some(0));
        assert_eq!(protocol_index_for_name("tfa"), Some(9));
        assert_eq!(protocol_index_for_name("ds18b20"), None);
    }

    #[test]
    fn open_edge_source_rejects_unknown_kind() {
        let config = GatewayConfig {
            edge_source: EdgeSourceConfig { kind: "bogus".to_string(), gpio_pin: None, device_path: None, replay_path: None },
            active_protocol_mask: crate::config::protocol_bits::ALL,
            celsius: false,
            utc: false,
            stale_gap_secs: 0,
            poll: crate::config::PollConfig::default(),
            sensors: vec![],
            sinks: vec![],
            rules: vec![],
            sensor_index: std::collections::HashMap::new(),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        assert!(open_edge_source(&config, &shutdown).is_err());
    }

    #[test]
    fn noise_filter_enabled_only_for_callback_source() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let base = |kind: &str| GatewayConfig {
            edge_source: EdgeSourceConfig { kind: kind.to_string(), gpio_pin: None, device_path: Some("/dev/null".to_string()), replay_path: None },
            active_protocol_mask: crate::config::protocol_bits::ALL,
            celsius: false,
            utc: false,
            stale_gap_secs: 0,
            poll: crate::config::PollConfig::default(),
            sensors: vec![],
            sinks: vec![],
            rules: vec![],
            sensor_index: std::collections::HashMap::new(),
        };

        let (_source, kernel_traits) = open_edge_source(&base("kernel"), &shutdown).unwrap();
        assert!(!kernel_traits.noise_filter_enabled);
        assert!(!kernel_traits.is_replay);

        let (_source, callback_traits) = open_edge_source(&base("callback"), &shutdown).unwrap();
        assert!(callback_traits.noise_filter_enabled);
        assert!(!callback_traits.is_replay);
    }
}
