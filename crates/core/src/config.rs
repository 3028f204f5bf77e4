//! Per-phase retry, polling and deadline settings.
//!
//! Defaults are compiled in; a YAML file may replace them and `KEEL_*` environment
//! variables override individual knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay_ms: 1_000, max_delay_ms: 30_000, multiplier: 2.0 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self { max_attempts, base_delay_ms: base.as_millis() as u64, max_delay_ms: max.as_millis() as u64, multiplier: 2.0 }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = (self.base_delay_ms as f64) * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    pub fn exhausted(&self, attempt: u32) -> bool { attempt >= self.max_attempts.max(1) }
}

/// Settings for one readiness wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Cap for the growing poll interval; equal to `poll_interval_ms` disables backoff.
    pub max_poll_interval_ms: u64,
    pub backoff_multiplier: f64,
    /// Consecutive query errors tolerated before the probe gives up.
    pub max_consecutive_errors: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_ms: 600_000, poll_interval_ms: 2_000, max_poll_interval_ms: 10_000, backoff_multiplier: 1.5, max_consecutive_errors: 5 }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
    pub fn max_poll_interval(&self) -> Duration { Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms)) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadinessConfig {
    pub probe: ProbeConfig,
    /// Whole-wait rounds before AwaitingReadiness fails with a timeout.
    pub rounds: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self { Self { probe: ProbeConfig::default(), rounds: 3 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthConfig {
    pub deadline_ms: u64,
    pub poll_interval_ms: u64,
    /// Window after initiation in which unsettled roles read as Converging.
    pub grace_ms: u64,
    /// Consecutive Unreachable observations tolerated before failing.
    pub unreachable_tolerance: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { deadline_ms: 300_000, poll_interval_ms: 5_000, grace_ms: 60_000, unreachable_tolerance: 6 }
    }
}

impl HealthConfig {
    pub fn deadline(&self) -> Duration { Duration::from_millis(self.deadline_ms) }
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
    pub fn grace(&self) -> Duration { Duration::from_millis(self.grace_ms) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub provision: RetryPolicy,
    pub readiness: ReadinessConfig,
    /// Dedicated budget for finding a reachable seed, separate from `initiate`.
    pub reachability: RetryPolicy,
    pub initiate: RetryPolicy,
    pub health: HealthConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            provision: RetryPolicy::default(),
            readiness: ReadinessConfig::default(),
            reachability: RetryPolicy { max_attempts: 10, base_delay_ms: 2_000, max_delay_ms: 15_000, multiplier: 1.5 },
            initiate: RetryPolicy::default(),
            health: HealthConfig::default(),
        }
    }
}

impl BootstrapConfig {
    /// Apply `KEEL_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|k| std::env::var(k).ok());
    }

    /// Apply overrides from any key lookup (environment in production, a map in tests).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let num = |k: &str| lookup(k).and_then(|s| s.trim().parse::<u64>().ok());
        // Counts that do not fit a u32 are ignored rather than truncated.
        let count = |k: &str| num(k).and_then(|v| u32::try_from(v).ok());
        let secs = |k: &str| num(k).map(|v| v.saturating_mul(1000));
        if let Some(v) = count("KEEL_PROVISION_MAX_ATTEMPTS") { self.provision.max_attempts = v; }
        if let Some(v) = num("KEEL_PROVISION_BASE_DELAY_MS") { self.provision.base_delay_ms = v; }
        if let Some(v) = secs("KEEL_READINESS_TIMEOUT_SECS") { self.readiness.probe.timeout_ms = v; }
        if let Some(v) = num("KEEL_READINESS_POLL_MS") { self.readiness.probe.poll_interval_ms = v; }
        if let Some(v) = count("KEEL_READINESS_ROUNDS") { self.readiness.rounds = v; }
        if let Some(v) = count("KEEL_PROBE_MAX_ERRORS") { self.readiness.probe.max_consecutive_errors = v; }
        if let Some(v) = count("KEEL_REACHABILITY_MAX_ATTEMPTS") { self.reachability.max_attempts = v; }
        if let Some(v) = count("KEEL_INITIATE_MAX_ATTEMPTS") { self.initiate.max_attempts = v; }
        if let Some(v) = secs("KEEL_HEALTH_DEADLINE_SECS") { self.health.deadline_ms = v; }
        if let Some(v) = num("KEEL_HEALTH_POLL_MS") { self.health.poll_interval_ms = v; }
        if let Some(v) = secs("KEEL_HEALTH_GRACE_SECS") { self.health.grace_ms = v; }
        if let Some(v) = count("KEEL_HEALTH_UNREACHABLE_TOLERANCE") { self.health.unreachable_tolerance = v; }
    }
}
