//! Healer Configuration
//!
//! Loaded once at startup from a YAML file (usually a mounted ConfigMap) and
//! merged with command-line overrides. The resulting snapshot is immutable;
//! every component receives the settings it needs through the builder
//! methods below.

use crate::classifier::{ClassifierSettings, ReasonTable};
use crate::engine::EngineSettings;
use crate::error::{Error, Result};
use crate::limiter::RateLimitConfig;
use crate::types::EventCategory;
use crate::watch::{BackoffConfig, WatchSettings};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Longest server-side watch the API server accepts is just under 5 minutes
const MAX_WATCH_TIMEOUT_SECONDS: u64 = 290;

/// Upper bound for every configured window, timer and delay (30 days)
const MAX_DURATION_SECONDS: u64 = 30 * 24 * 60 * 60;

/// Main healer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealerConfig {
    /// Namespaces to watch, one pipeline each
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Evaluate everything but never delete
    #[serde(default)]
    pub dry_run: bool,

    /// Reason -> category overrides, merged over the built-in table
    #[serde(default)]
    pub reasons: BTreeMap<String, EventCategory>,

    /// Consecutive failures before remediation is considered
    #[serde(default = "default_flapping_threshold")]
    pub flapping_threshold: u32,

    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// `Added` events older than this at startup or re-sync are skipped
    #[serde(default = "default_freshness_window_seconds")]
    pub freshness_window_seconds: u64,

    /// Failures further apart than this start a new episode
    #[serde(default = "default_coalescing_window_seconds")]
    pub coalescing_window_seconds: u64,

    /// A suspect object without a repeat failure for this long is cleared
    #[serde(default = "default_failure_window_seconds")]
    pub failure_window_seconds: u64,

    /// Records kept per object
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_idle_eviction_seconds")]
    pub idle_eviction_seconds: u64,

    /// Interval of the timer that expires failure windows and cooldowns
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    #[serde(default)]
    pub watch: WatchOptions,

    #[serde(default)]
    pub rate_limit: RateLimitOptions,
}

/// Watch connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchOptions {
    /// Server-side timeout of each subscription
    #[serde(default = "default_watch_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Extra silence tolerated past the timeout before reconnecting
    #[serde(default = "default_idle_grace_seconds")]
    pub idle_grace_seconds: u64,

    /// Resume point for the first subscription; a fresh baseline when unset
    #[serde(default)]
    pub start_bookmark: Option<String>,

    #[serde(default)]
    pub backoff: BackoffOptions,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: default_watch_timeout_seconds(),
            idle_grace_seconds: default_idle_grace_seconds(),
            start_bookmark: None,
            backoff: BackoffOptions::default(),
        }
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffOptions {
    #[serde(default = "default_backoff_base_millis")]
    pub base_millis: u64,

    #[serde(default = "default_backoff_cap_millis")]
    pub cap_millis: u64,

    /// Fraction of each delay that is randomized (0.0 - 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_millis: default_backoff_base_millis(),
            cap_millis: default_backoff_cap_millis(),
            jitter: default_backoff_jitter(),
        }
    }
}

/// Process-wide remediation budget
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitOptions {
    #[serde(default = "default_max_actions")]
    pub max_actions: u32,

    #[serde(default = "default_rate_period_seconds")]
    pub period_seconds: u64,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            max_actions: default_max_actions(),
            period_seconds: default_rate_period_seconds(),
        }
    }
}

fn default_flapping_threshold() -> u32 {
    3
}

fn default_cooldown_seconds() -> u64 {
    600
}

fn default_freshness_window_seconds() -> u64 {
    300
}

fn default_coalescing_window_seconds() -> u64 {
    300
}

fn default_failure_window_seconds() -> u64 {
    600
}

fn default_history_capacity() -> usize {
    20
}

fn default_idle_eviction_seconds() -> u64 {
    3600
}

fn default_tick_seconds() -> u64 {
    10
}

fn default_watch_timeout_seconds() -> u64 {
    120
}

fn default_idle_grace_seconds() -> u64 {
    30
}

fn default_backoff_base_millis() -> u64 {
    500
}

fn default_backoff_cap_millis() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_max_actions() -> u32 {
    10
}

fn default_rate_period_seconds() -> u64 {
    60
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            dry_run: false,
            reasons: BTreeMap::new(),
            flapping_threshold: default_flapping_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            freshness_window_seconds: default_freshness_window_seconds(),
            coalescing_window_seconds: default_coalescing_window_seconds(),
            failure_window_seconds: default_failure_window_seconds(),
            history_capacity: default_history_capacity(),
            idle_eviction_seconds: default_idle_eviction_seconds(),
            tick_seconds: default_tick_seconds(),
            watch: WatchOptions::default(),
            rate_limit: RateLimitOptions::default(),
        }
    }
}

impl HealerConfig {
    /// Load configuration from a mounted file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse config YAML: {e}")))
    }

    /// Apply command-line overrides. Namespaces given on the command line
    /// replace the file's list; `--dry-run` can only switch dry-run on.
    #[must_use]
    pub fn with_overrides(mut self, namespaces: Vec<String>, dry_run: bool) -> Self {
        if !namespaces.is_empty() {
            self.namespaces = namespaces;
        }
        self.dry_run |= dry_run;
        self
    }

    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.namespaces.is_empty() {
            return Err(invalid("at least one namespace must be configured"));
        }
        let mut seen = BTreeSet::new();
        for namespace in &self.namespaces {
            if namespace.trim().is_empty() {
                return Err(invalid("namespace names must not be empty"));
            }
            if !seen.insert(namespace.as_str()) {
                return Err(invalid(format!("namespace '{namespace}' is listed twice")));
            }
        }
        if self.reasons.keys().any(|reason| reason.trim().is_empty()) {
            return Err(invalid("reason table keys must not be empty"));
        }

        if self.flapping_threshold == 0 {
            return Err(invalid("flappingThreshold must be at least 1"));
        }
        for (key, value) in [
            ("cooldownSeconds", self.cooldown_seconds),
            ("freshnessWindowSeconds", self.freshness_window_seconds),
            ("coalescingWindowSeconds", self.coalescing_window_seconds),
            ("failureWindowSeconds", self.failure_window_seconds),
            ("idleEvictionSeconds", self.idle_eviction_seconds),
            ("tickSeconds", self.tick_seconds),
            ("rateLimit.periodSeconds", self.rate_limit.period_seconds),
        ] {
            if value == 0 {
                return Err(invalid(format!("{key} must be greater than zero")));
            }
            if value > MAX_DURATION_SECONDS {
                return Err(invalid(format!(
                    "{key} must not exceed {MAX_DURATION_SECONDS} seconds"
                )));
            }
        }
        if self.history_capacity == 0 {
            return Err(invalid("historyCapacity must be at least 1"));
        }
        // Evicting an object mid-cooldown or mid-window would forget its state
        if self.idle_eviction_seconds < self.cooldown_seconds
            || self.idle_eviction_seconds < self.failure_window_seconds
        {
            return Err(invalid(
                "idleEvictionSeconds must be at least cooldownSeconds and failureWindowSeconds",
            ));
        }

        if self.watch.timeout_seconds == 0 || self.watch.timeout_seconds > MAX_WATCH_TIMEOUT_SECONDS {
            return Err(invalid(format!(
                "watch.timeoutSeconds must be between 1 and {MAX_WATCH_TIMEOUT_SECONDS}"
            )));
        }
        if self.watch.idle_grace_seconds > MAX_DURATION_SECONDS {
            return Err(invalid(format!(
                "watch.idleGraceSeconds must not exceed {MAX_DURATION_SECONDS} seconds"
            )));
        }
        let backoff = &self.watch.backoff;
        if backoff.base_millis == 0 {
            return Err(invalid("watch.backoff.baseMillis must be greater than zero"));
        }
        if backoff.cap_millis < backoff.base_millis {
            return Err(invalid("watch.backoff.capMillis must not be below baseMillis"));
        }
        if backoff.cap_millis > MAX_DURATION_SECONDS * 1000 {
            return Err(invalid(format!(
                "watch.backoff.capMillis must not exceed {} milliseconds",
                MAX_DURATION_SECONDS * 1000
            )));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(invalid("watch.backoff.jitter must be between 0.0 and 1.0"));
        }

        if self.rate_limit.max_actions == 0 {
            return Err(invalid("rateLimit.maxActions must be at least 1"));
        }
        Ok(())
    }

    pub fn reason_table(&self) -> ReasonTable {
        ReasonTable::with_overrides(&self.reasons)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            threshold: self.flapping_threshold,
            cooldown: seconds(self.cooldown_seconds),
            failure_window: seconds(self.failure_window_seconds),
        }
    }

    pub fn classifier_settings(&self) -> ClassifierSettings {
        ClassifierSettings {
            freshness: seconds(self.freshness_window_seconds),
            coalescing: seconds(self.coalescing_window_seconds),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            timeout: std::time::Duration::from_secs(self.watch.timeout_seconds),
            idle_grace: std::time::Duration::from_secs(self.watch.idle_grace_seconds),
            backoff: BackoffConfig {
                base: std::time::Duration::from_millis(self.watch.backoff.base_millis),
                cap: std::time::Duration::from_millis(self.watch.backoff.cap_millis),
                jitter: self.watch.backoff.jitter,
            },
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_actions: self.rate_limit.max_actions,
            period: seconds(self.rate_limit.period_seconds),
        }
    }

    pub fn idle_eviction(&self) -> Duration {
        seconds(self.idle_eviction_seconds)
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_seconds)
    }
}

fn seconds(value: u64) -> Duration {
    let capped = i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    Duration::seconds(capped)
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Config(message.into())
}
