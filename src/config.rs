//! Fallback configuration

use std::{env, time::Duration};

use serde::{Deserialize, Serialize, Serializer};

use crate::{Error, Result};

/// Account selection strategy.
///
/// Unknown tags deserialise to [`FallbackStrategy::Hybrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// Order by ascending priority, then by today's usage
    PriorityFirst,
    /// Order by usage-adjusted effective weight
    Weighted,
    /// Least-recently-selected first
    RoundRobin,
    /// Order by ascending today's usage, then priority
    LeastUsed,
    /// Priority buckets scored by weight, usage, and status
    Hybrid,
}

impl FallbackStrategy {
    /// Return the snake_case tag used in configuration and results.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriorityFirst => "priority_first",
            Self::Weighted => "weighted",
            Self::RoundRobin => "round_robin",
            Self::LeastUsed => "least_used",
            Self::Hybrid => "hybrid",
        }
    }

    /// Parse a strategy tag. Anything unrecognised maps to `Hybrid`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "priority_first" => Self::PriorityFirst,
            "weighted" => Self::Weighted,
            "round_robin" => Self::RoundRobin,
            "least_used" => Self::LeastUsed,
            _ => Self::Hybrid,
        }
    }
}

impl Serialize for FallbackStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FallbackStrategy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&tag))
    }
}

/// Fallback configuration shared by all handlers of a manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Maximum attempts per request (further capped by the candidate count)
    pub max_retries: usize,
    /// Pause between failed attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Account selection strategy
    pub strategy: FallbackStrategy,
    /// Enable the per-group circuit breaker
    pub enable_circuit_breaker: bool,
    /// Failures within the failure window before the breaker opens
    pub circuit_breaker_threshold: u64,
    /// Window over which breaker failures accumulate
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,
    /// Time an open breaker waits before admitting probe traffic
    #[serde(with = "humantime_serde")]
    pub recovery_window: Duration,
    /// Enable per-account health tracking
    pub enable_health_check: bool,
    /// Interval of the periodic health sweep
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::ZERO,
            strategy: FallbackStrategy::PriorityFirst,
            enable_circuit_breaker: true,
            circuit_breaker_threshold: 5,
            failure_window: Duration::from_secs(5 * 60),
            recovery_window: Duration::from_secs(10 * 60),
            enable_health_check: true,
            health_check_interval: Duration::from_secs(2 * 60),
        }
    }
}

impl FallbackConfig {
    /// Build a configuration from defaults plus `FALLBACK_*` environment
    /// overrides.
    ///
    /// Each variable is parsed independently; a malformed value leaves that
    /// field's default untouched.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("FALLBACK_MAX_RETRIES") {
            if n > 0 {
                config.max_retries = n;
            }
        }
        if let Some(d) = env_duration("FALLBACK_RETRY_DELAY") {
            config.retry_delay = d;
        }
        if let Ok(tag) = env::var("FALLBACK_STRATEGY") {
            config.strategy = FallbackStrategy::from_tag(&tag);
        }
        if let Some(n) = env_parse::<u64>("FALLBACK_CIRCUIT_BREAKER_THRESHOLD") {
            if n > 0 {
                config.circuit_breaker_threshold = n;
            }
        }
        if let Some(d) = env_duration("FALLBACK_FAILURE_WINDOW") {
            config.failure_window = d;
        }
        if let Some(d) = env_duration("FALLBACK_RECOVERY_WINDOW") {
            config.recovery_window = d;
        }
        if let Some(d) = env_duration("FALLBACK_HEALTH_CHECK_INTERVAL") {
            config.health_check_interval = d;
        }
        if let Ok(flag) = env::var("FALLBACK_ENABLE_CIRCUIT_BREAKER") {
            config.enable_circuit_breaker = flag == "true" || flag == "1";
        }
        if let Ok(flag) = env::var("FALLBACK_ENABLE_HEALTH_CHECK") {
            config.enable_health_check = flag == "true" || flag == "1";
        }

        config
    }

    /// Validate administrative bounds before accepting a config update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first field that is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_retries) {
            return Err(Error::Config(
                "max_retries must be between 1 and 10".to_string(),
            ));
        }
        if self.retry_delay > Duration::from_secs(5 * 60) {
            return Err(Error::Config(
                "retry_delay must not exceed 5 minutes".to_string(),
            ));
        }
        if !(1..=100).contains(&self.circuit_breaker_threshold) {
            return Err(Error::Config(
                "circuit_breaker_threshold must be between 1 and 100".to_string(),
            ));
        }
        for (name, window) in [
            ("failure_window", self.failure_window),
            ("recovery_window", self.recovery_window),
        ] {
            if window < Duration::from_secs(60) || window > Duration::from_secs(24 * 3600) {
                return Err(Error::Config(format!(
                    "{name} must be between 1 minute and 24 hours"
                )));
            }
        }
        if self.health_check_interval < Duration::from_secs(60)
            || self.health_check_interval > Duration::from_secs(3600)
        {
            return Err(Error::Config(
                "health_check_interval must be between 1 minute and 1 hour".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

fn env_duration(name: &str) -> Option<Duration> {
    parse_duration(&env::var(name).ok()?).ok()
}

/// Parse a human-readable duration string ("100ms", "30s", "5m", "2h";
/// a bare number is taken as seconds).
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let parse = |value: &str| {
        value
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{s}': {e}"))
    };

    if let Some(ms) = s.strip_suffix("ms") {
        parse(ms).map(Duration::from_millis)
    } else if let Some(hours) = s.strip_suffix('h') {
        parse(hours).map(|h| Duration::from_secs(h * 3600))
    } else if let Some(mins) = s.strip_suffix('m') {
        parse(mins).map(|m| Duration::from_secs(m * 60))
    } else if let Some(secs) = s.strip_suffix('s') {
        parse(secs).map(Duration::from_secs)
    } else {
        // Assume seconds
        parse(s).map(Duration::from_secs)
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "250ms")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize a human-readable duration string (e.g., "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
