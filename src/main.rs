use std::fs::File;
use std::io::BufReader;

use rf_gateway::config::GatewayConfig;
use rf_gateway::{Gateway, GatewayError};

/// # Arguments
///
/// The first argument to this executable (via `std::env::args`) is the path
/// to a configuration JSON file, formatted per the `GatewayConfig` schema.
fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match try_run() {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "gateway exited with error");
            err.exit_code()
        }
    }
}

fn try_run() -> Result<(), GatewayError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let json_path = args.first().ok_or_else(|| GatewayError::Capture("usage: rf-gateway <config.json>".to_string()))?;

    let config_file = File::open(json_path)?;
    let config = GatewayConfig::parse(&mut BufReader::new(config_file))?;
    tracing::info!(path = %json_path, sensors = config.sensors.len(), rules = config.rules.len(), "configuration loaded");

    let gateway = Gateway::new(config);
    gateway.start()
}
