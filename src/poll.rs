//! Periodic DS18B20 poll loop (spec §4.I): scans a 1-Wire bus root for
//! `28-*` device directories and enqueues a reading for each one that parses
//! cleanly, on a fixed interval independent of the RF capture thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::PollConfig;
use crate::protocols::ds18b20;
use crate::queue::{DecodedMessage, DecodedMessageQueue};
use crate::stats::Stats;

/// Scan `w1_root` once, pushing one [`DecodedMessage`] per device whose
/// `w1_slave` file parses. Devices with a bad CRC or missing file are
/// skipped silently (spec §7.4: "logged, reading dropped, process
/// continues" applies equally to a poll source as to a decode failure).
fn poll_once(config: &PollConfig, queue: &DecodedMessageQueue, stats: &Stats) {
    let entries = match std::fs::read_dir(&config.w1_root) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(error = %err, root = %config.w1_root, "failed to read 1-wire bus root");
            return;
        }
    };

    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else { continue };
        let Some(serial) = ds18b20::parse_serial(&name) else { continue };

        let slave_path = entry.path().join("w1_slave");
        let text = match std::fs::read_to_string(&slave_path) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(error = %err, path = ?slave_path, "failed to read w1_slave");
                continue;
            }
        };

        let Some(millidegrees) = ds18b20::parse_w1_slave(&text) else {
            Stats::incr(&stats.decode_failed);
            continue;
        };

        let reading = ds18b20::reading_from_millidegrees(serial, millidegrees);
        Stats::incr(&stats.decoded);
        let changed = reading.metrics();
        queue.push(DecodedMessage { sensor_index: None, reading, changed, received_at: SystemTime::now() });
    }
}

/// Run the poll loop until `shutdown` is set. A no-op (returns immediately)
/// when `config.ds18b20_enabled` is false, so [`crate::gateway::Gateway`]
/// can always spawn this thread without branching on configuration.
pub fn run(config: PollConfig, queue: Arc<DecodedMessageQueue>, stats: Arc<Stats>, shutdown: Arc<AtomicBool>) {
    if !config.ds18b20_enabled {
        return;
    }
    let interval = Duration::from_secs(config.interval_secs.max(1));
    while !shutdown.load(Ordering::Relaxed) {
        poll_once(&config, &queue, &stats);
        let mut waited = Duration::ZERO;
        while waited < interval && !shutdown.load(Ordering::Relaxed) {
            let step = Duration::from_millis(200).min(interval - waited);
            std::thread::sleep(step);
            waited += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_once_enqueues_valid_device_and_skips_bad_crc() {
        let root = tempfile::tempdir().unwrap();
        let good = root.path().join("28-0000055e5c9a");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(
            good.join("w1_slave"),
            "4e 01 4b 46 7f ff 0c 10 7a : crc=7a YES\n4e 01 4b 46 7f ff 0c 10 7a t=20500\n",
        )
        .unwrap();

        let bad = root.path().join("28-0000055e5c9b");
        std::fs::create_dir(&bad).unwrap();
        std::fs::write(
            bad.join("w1_slave"),
            "50 05 4b 46 7f ff 0c 10 fb : crc=fb NO\n50 05 4b 46 7f ff 0c 10 fb t=20500\n",
        )
        .unwrap();

        let other_family = root.path().join("10-000803c3e1a1");
        std::fs::create_dir(&other_family).unwrap();

        let config = PollConfig { ds18b20_enabled: true, interval_secs: 1, w1_root: root.path().to_string_lossy().into_owned() };
        let queue = DecodedMessageQueue::new();
        let stats = Stats::new();
        poll_once(&config, &queue, &stats);

        let message = queue.pop_timeout(Duration::from_millis(10)).expect("one reading enqueued");
        assert_eq!(message.reading.temperature_x10, Some(205));
        assert!(queue.pop_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(stats.snapshot().decode_failed, 1);
    }

    #[test]
    fn disabled_poll_config_returns_immediately() {
        let config = PollConfig { ds18b20_enabled: false, ..PollConfig::default() };
        let queue = Arc::new(DecodedMessageQueue::new());
        let stats = Arc::new(Stats::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        run(config, queue, stats, shutdown);
    }
}
