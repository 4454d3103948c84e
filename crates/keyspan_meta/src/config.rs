//! Meta-plane tuning knobs.

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Expected interval between store heartbeats.
    pub store_heartbeat_interval: Duration,
    /// Heartbeat intervals the health sweeper waits between sweeps; also how
    /// many missed heartbeats mark an instance or region unhealthy.
    pub healthy_check_interval_times: u64,
    /// Balance evaluation period, in heartbeat intervals. New leaders wait
    /// two periods before making rebalance decisions.
    pub balance_periodicity: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            store_heartbeat_interval: Duration::from_micros(30_000_000),
            healthy_check_interval_times: 10,
            balance_periodicity: 60,
        }
    }
}

impl MetaConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_heartbeat_interval: Duration::from_micros(read_env_u64(
                "KEYSPAN_STORE_HEART_BEAT_INTERVAL_US",
                defaults.store_heartbeat_interval.as_micros() as u64,
            )),
            healthy_check_interval_times: read_env_u64(
                "KEYSPAN_HEALTHY_CHECK_INTERVAL_TIMES",
                defaults.healthy_check_interval_times,
            )
            .max(1),
            balance_periodicity: read_env_u64(
                "KEYSPAN_BALANCE_PERIODICITY",
                defaults.balance_periodicity,
            )
            .max(1),
        }
    }

    /// How long without a heartbeat before an instance or region is flagged.
    pub fn faulty_after(&self) -> Duration {
        self.store_heartbeat_interval * self.healthy_check_interval_times as u32
    }

    /// Stabilization window before a fresh leader may issue balance decisions.
    pub fn decide_after(&self) -> Duration {
        2 * self.balance_periodicity as u32 * self.store_heartbeat_interval
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}
