//! Runtime tuning knobs for the fan-out executor.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Executor configuration. Defaults match long-standing production settings;
/// every knob can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Sleep between retries of one region RPC.
    pub retry_interval: Duration,
    /// Concurrent region RPCs allowed against a single store.
    pub single_store_concurrency: usize,
    /// Logical room this proxy runs in; enables read affinity when set.
    pub logical_room: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_micros(500_000),
            single_store_concurrency: 20,
            logical_room: None,
        }
    }
}

impl ProxyConfig {
    /// Builds a config from defaults plus `KEYSPAN_*` environment overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry_interval: Duration::from_micros(read_env_u64(
                "KEYSPAN_RETRY_INTERVAL_US",
                defaults.retry_interval.as_micros() as u64,
            )),
            single_store_concurrency: read_env_usize(
                "KEYSPAN_SINGLE_STORE_CONCURRENCY",
                defaults.single_store_concurrency,
            )
            .max(1),
            logical_room: env::var("KEYSPAN_LOGICAL_ROOM")
                .ok()
                .filter(|room| !room.trim().is_empty()),
        }
    }
}

pub(crate) fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

pub(crate) fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.retry_interval, Duration::from_micros(500_000));
        assert_eq!(cfg.single_store_concurrency, 20);
        assert!(cfg.logical_room.is_none());
    }
}
