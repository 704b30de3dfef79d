//! Engine configuration loaded from environment variables.
//!
//! All settings have defaults so the engine runs with zero configuration.

use std::time::Duration;

use coursegate_shared::constants::*;
use coursegate_shared::{Course, CourseTier};

/// Tunables of the unlock engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Watch percentage at which a video counts as completed.
    /// Env: `COMPLETION_THRESHOLD_PCT`
    /// Default: `90`
    pub completion_threshold_pct: f64,

    /// Minimum gap between unforced progress writes for one video.
    /// Env: `PROGRESS_DEBOUNCE_SECS`
    /// Default: `5`
    pub progress_debounce: Duration,

    /// Lifetime of cached course metadata.
    /// Env: `CACHE_TTL_SECS`
    /// Default: `300`
    pub cache_ttl: Duration,

    /// Upper bound for one unlock transaction attempt.
    /// Env: `UNLOCK_TIMEOUT_SECS`
    /// Default: `5`
    pub unlock_timeout: Duration,

    /// Default skip-unlock cost per tier when a course sets none.
    /// Env: `TIER_COST_BEGINNER`, `TIER_COST_INTERMEDIATE`, `TIER_COST_ADVANCED`
    pub tier_costs: TierCosts,

    /// Buffered updates per sync subscription before a subscriber lags.
    /// Env: `SYNC_CHANNEL_CAPACITY`
    /// Default: `64`
    pub sync_channel_capacity: usize,
}

/// Per-tier default unlock prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCosts {
    pub beginner: u64,
    pub intermediate: u64,
    pub advanced: u64,
}

impl TierCosts {
    pub fn for_tier(&self, tier: CourseTier) -> u64 {
        match tier {
            CourseTier::Beginner => self.beginner,
            CourseTier::Intermediate => self.intermediate,
            CourseTier::Advanced => self.advanced,
        }
    }
}

impl Default for TierCosts {
    fn default() -> Self {
        Self {
            beginner: DEFAULT_COST_BEGINNER,
            intermediate: DEFAULT_COST_INTERMEDIATE,
            advanced: DEFAULT_COST_ADVANCED,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completion_threshold_pct: COMPLETION_THRESHOLD_PCT,
            progress_debounce: Duration::from_secs(DEFAULT_PROGRESS_DEBOUNCE_SECS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            unlock_timeout: Duration::from_secs(DEFAULT_UNLOCK_TIMEOUT_SECS),
            tier_costs: TierCosts::default(),
            sync_channel_capacity: DEFAULT_SYNC_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Unparseable values
    /// are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(pct) = parse_var::<f64, _>(&lookup, "COMPLETION_THRESHOLD_PCT") {
            if (0.0..=100.0).contains(&pct) {
                config.completion_threshold_pct = pct;
            } else {
                tracing::warn!(value = pct, "COMPLETION_THRESHOLD_PCT out of range, using default");
            }
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "PROGRESS_DEBOUNCE_SECS") {
            config.progress_debounce = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "UNLOCK_TIMEOUT_SECS") {
            if secs > 0 {
                config.unlock_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(cost) = parse_var(&lookup, "TIER_COST_BEGINNER") {
            config.tier_costs.beginner = cost;
        }
        if let Some(cost) = parse_var(&lookup, "TIER_COST_INTERMEDIATE") {
            config.tier_costs.intermediate = cost;
        }
        if let Some(cost) = parse_var(&lookup, "TIER_COST_ADVANCED") {
            config.tier_costs.advanced = cost;
        }

        if let Some(capacity) = parse_var::<usize, _>(&lookup, "SYNC_CHANNEL_CAPACITY") {
            config.sync_channel_capacity = capacity.max(1);
        }

        config
    }

    /// Skip-unlock price of a course: explicit override, else tier default.
    pub fn unlock_cost(&self, course: &Course) -> u64 {
        course
            .unlock_cost
            .unwrap_or_else(|| self.tier_costs.for_tier(course.tier))
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            None
        }
    }
}
