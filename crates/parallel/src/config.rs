use std::collections::HashMap;
use std::time::Duration;

use parallel_core::env::{
    PARALLEL_HEARTBEAT_INTERVAL_MS_VAR, PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR,
    PARALLEL_SKIP_BINARY_CHECK_VAR,
};

/// Process-wide ambient configuration, constructed exactly once by
/// [`crate::start_app`]. All environment-variable reads are confined to
/// [`RuntimeConfig::from_env`] so tests can build an equivalent config from
/// an in-memory map instead of mutating the real process environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long the master waits for a spawned child's reverse handshake.
    pub spawn_timeout: Duration,
    /// Default heartbeat tick interval handed to newly-spawned workers.
    pub heartbeat_interval: Duration,
    /// Default heartbeat dead-channel timeout handed to newly-spawned workers.
    pub heartbeat_timeout: Duration,
    /// Grace period `close_server` waits for live connections to quiesce.
    pub close_grace_period: Duration,
    /// Grace period `Connection::close` waits for outstanding calls to drain.
    pub close_call_timeout: Duration,
    /// Disables the binary-identity check at handshake time. Exists for
    /// mixed debug/release test harnesses; never set in production.
    pub skip_binary_check: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_millis(2_000),
            heartbeat_timeout: Duration::from_millis(10_000),
            close_grace_period: Duration::from_secs(5),
            close_call_timeout: Duration::from_secs(5),
            skip_binary_check: false,
        }
    }
}

impl RuntimeConfig {
    /// Builds a config from the real process environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let pairs: HashMap<String, String> = std::env::vars().collect();
        Self::from_pairs(&pairs)
    }

    /// Builds a config from an explicit set of environment pairs, used by
    /// tests that want deterministic configuration without touching the
    /// real process environment.
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = pairs
            .get(PARALLEL_HEARTBEAT_INTERVAL_MS_VAR)
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = pairs
            .get(PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR)
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = pairs.get(PARALLEL_SKIP_BINARY_CHECK_VAR) {
            config.skip_binary_check = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        config
    }
}
