//! Crate-level error aggregation.

use thiserror::Error;

use crate::config;

#[derive(Debug, Error)]
/// Errors that can cause the gateway to fail to start, or to stop abnormally.
///
/// Per-sequence and per-decode failures are *not* represented here: those are
/// counted in [`crate::stats::Stats`] and logged, never propagated as an
/// `Err` across a thread boundary (see spec §7, "no exception throwing
/// across thread boundaries").
pub enum GatewayError {
    /// The configuration file was malformed or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    /// An edge-source driver failed at startup (module missing, permission
    /// denied, device busy).
    #[error("capture source error: {0}")]
    Capture(String),
    /// An internal lock was poisoned by a panicking thread.
    #[error("internal lock poisoned")]
    Poison,
    /// An I/O error occurred while reading a replay log or a 1-wire node.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Thread spawning failed at startup.
    #[error("failed to spawn worker thread")]
    ThreadSpawn,
}

impl<T> From<std::sync::PoisonError<T>> for GatewayError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        GatewayError::Poison
    }
}

impl GatewayError {
    /// The process exit code associated with this error, per spec §6
    /// ("Exit code 0 on clean shutdown, 1 on configuration or I/O error at
    /// startup, 2 on unrecoverable signal, 3 on thread-spawn failure").
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Config(_) | GatewayError::Io(_) | GatewayError::Capture(_) => 1,
            GatewayError::ThreadSpawn => 3,
            GatewayError::Poison => 2,
        }
    }
}
