//! Supervisor configuration.
//!
//! # Environment Variables
//!
//! - `PREFORK_SHUTDOWN_SIGNAL` - Signal replayed when the master closes a channel (default: QUIT)
//! - `PREFORK_SLOTS_PER_PAGE` - Heartbeat slots per shared page (default: platform page size / 64)
//! - `PREFORK_HEARTBEAT_TIMEOUT_MS` - Tick staleness window in milliseconds (default: 5000)

use crate::error::{PreforkError, Result};
use crate::worker::{HeartbeatStore, check_slots_per_page, is_uncatchable, parse_signal};
use nix::sys::signal::Signal;
use std::time::Duration;

/// Default staleness window for worker ticks.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by the master and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Signal a worker replays when its channel reaches end-of-stream.
    pub shutdown_signal: Signal,
    /// Heartbeat page geometry (None = platform default).
    pub slots_per_page: Option<usize>,
    /// How long a tick may stay unchanged before the worker counts as stale.
    pub heartbeat_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_signal: Signal::SIGQUIT,
            slots_per_page: None,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shutdown_signal(mut self, signal: Signal) -> Self {
        self.shutdown_signal = signal;
        self
    }

    pub fn with_slots_per_page(mut self, slots: usize) -> Self {
        self.slots_per_page = Some(slots);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Apply `PREFORK_*` environment overrides.
    ///
    /// Unparseable values are rejected rather than silently ignored.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var("PREFORK_SHUTDOWN_SIGNAL") {
            self.shutdown_signal = parse_signal(&value)?;
        }

        if let Ok(value) = std::env::var("PREFORK_SLOTS_PER_PAGE") {
            let slots = value.trim().parse::<usize>().map_err(|_| {
                PreforkError::Config(format!("PREFORK_SLOTS_PER_PAGE: '{}' is not a number", value))
            })?;
            self.slots_per_page = Some(slots);
        }

        if let Ok(value) = std::env::var("PREFORK_HEARTBEAT_TIMEOUT_MS") {
            let millis = value.trim().parse::<u64>().map_err(|_| {
                PreforkError::Config(format!(
                    "PREFORK_HEARTBEAT_TIMEOUT_MS: '{}' is not a number",
                    value
                ))
            })?;
            self.heartbeat_timeout = Duration::from_millis(millis);
        }

        Ok(self)
    }

    /// Check the configuration for values the core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if is_uncatchable(self.shutdown_signal) {
            return Err(PreforkError::Config(format!(
                "shutdown signal {} cannot be handled",
                self.shutdown_signal
            )));
        }
        if let Some(slots) = self.slots_per_page {
            check_slots_per_page(slots)?;
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(PreforkError::Config(
                "heartbeat timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Build a heartbeat store with this geometry.
    pub fn heartbeat_store(&self) -> Result<HeartbeatStore> {
        match self.slots_per_page {
            Some(slots) => HeartbeatStore::with_slots_per_page(slots),
            None => Ok(HeartbeatStore::new()),
        }
    }
}
