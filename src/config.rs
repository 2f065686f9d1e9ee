//! Defines the TOML-backed configuration tree for core tunables.
//!
//! Every knob has a production default; [`Config::for_tests`] shortens
//! the timers so integration suites run in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub locks: LockConfig,
    pub sessions: SessionConfig,
    pub shutdown: ShutdownConfig,
    pub retry: RetryConfig,
}

/// Slice cache tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Ceiling on buffered + cached bytes across all files.
    pub byte_budget: u64,
    pub flusher: FlusherConfig,
}

/// Background flusher tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlusherConfig {
    /// Sweep period in milliseconds.
    pub interval_ms: u64,
    /// Dirty-then-idle threshold before a background flush, in
    /// milliseconds.
    pub idle_timeout_ms: u64,
}

/// Lock and lease manager tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Reclaim window duration in milliseconds.
    pub grace_period_ms: u64,
    /// Wait before revoking a delegation/lease on recall, in
    /// milliseconds.
    pub recall_timeout_ms: u64,
    /// Wait before revoking a lease that blocks a byte-range lock, in
    /// milliseconds.
    pub lock_break_timeout_ms: u64,
}

/// NFSv4.1 session tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fore-channel slot table width per session.
    pub slot_count: u32,
    /// Session lease duration in milliseconds.
    pub lease_duration_ms: u64,
    pub reaper: ReaperConfig,
}

/// Session reaper tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Sweep period in milliseconds.
    pub interval_ms: u64,
}

/// Shutdown tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Per-adapter drain deadline on stop, in milliseconds.
    pub drain_timeout_ms: u64,
}

/// Coordinator read-retry tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Bounded attempts for retryable read failures.
    pub read_attempts: u32,
    /// Exponential backoff base in milliseconds.
    pub backoff_base_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { byte_budget: 256 * 1024 * 1024, flusher: FlusherConfig::default() }
    }
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000, idle_timeout_ms: 30_000 }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { grace_period_ms: 90_000, recall_timeout_ms: 35_000, lock_break_timeout_ms: 35_000 }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { slot_count: 16, lease_duration_ms: 90_000, reaper: ReaperConfig::default() }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_ms: 10_000 }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { drain_timeout_ms: 30_000 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { read_attempts: 4, backoff_base_ms: 10 }
    }
}

impl Config {
    /// Parses a configuration file. Missing sections take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|_| Error::Io)?;
        Self::parse(&text)
    }

    /// Parses TOML text. Unknown keys are rejected up front rather than
    /// discovered as dead tunables at runtime.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|_| Error::InvalidArgument)
    }

    /// Short-timer preset for test suites.
    pub fn for_tests() -> Self {
        Self {
            cache: CacheConfig {
                byte_budget: 1024 * 1024,
                flusher: FlusherConfig { interval_ms: 50, idle_timeout_ms: 100 },
            },
            locks: LockConfig {
                grace_period_ms: 500,
                recall_timeout_ms: 200,
                lock_break_timeout_ms: 200,
            },
            sessions: SessionConfig {
                slot_count: 4,
                lease_duration_ms: 2_000,
                reaper: ReaperConfig { interval_ms: 100 },
            },
            shutdown: ShutdownConfig { drain_timeout_ms: 1_000 },
            retry: RetryConfig { read_attempts: 3, backoff_base_ms: 1 },
        }
    }
}

impl CacheConfig {
    pub fn flusher_interval(&self) -> Duration {
        Duration::from_millis(self.flusher.interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.flusher.idle_timeout_ms)
    }
}

impl LockConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn recall_timeout(&self) -> Duration {
        Duration::from_millis(self.recall_timeout_ms)
    }

    pub fn lock_break_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_break_timeout_ms)
    }
}

impl SessionConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper.interval_ms)
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl RetryConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}
