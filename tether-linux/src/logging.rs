//! Tracing subscriber setup.
//!
//! - ERROR: unreachable protocol states, radio failing to start
//! - WARN: send, decode and handler failures
//! - INFO: lifecycle and per-packet telemetry
//! - DEBUG: peer registration, waits, ack diagnostics
//! - TRACE: raw datagrams

use tracing_subscriber::EnvFilter;

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Human-readable output. Level from `RUST_LOG`, default `info`.
pub fn init() {
    tracing_subscriber::fmt().with_env_filter(filter("info")).init();
}

/// JSON lines, for journald or log shippers.
pub fn init_json() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter("info"))
        .init();
}

/// Pick the format from `TETHER_LOG_FORMAT` (`json` or anything else).
pub fn init_from_env() {
    match std::env::var("TETHER_LOG_FORMAT").as_deref() {
        Ok("json") => init_json(),
        _ => init(),
    }
}

/// Safe to call from every test.
#[cfg(test)]
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}
