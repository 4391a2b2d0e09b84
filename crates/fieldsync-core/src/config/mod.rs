//! Core configuration.
//!
//! Every section has deployment-tunable defaults. A JSON file may override any
//! subset of fields, and `FIELDSYNC_*` environment variables override the most
//! commonly tuned sync knobs on top of that.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::non_blank;

/// Top-level configuration for the sync core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub sync: SyncSettings,
    pub retry: RetryPolicy,
    pub priority: PriorityWeights,
    pub severity: SeverityPolicy,
    pub resolution: ResolutionPolicy,
}

/// Background sync scheduling and session limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Whether scheduled sync runs at all
    pub enabled: bool,
    /// Seconds between scheduled sync sessions
    pub interval_secs: u64,
    /// Transient delivery failures tolerated before an item is marked failed
    pub max_retries: u32,
    /// Per-item server exchange timeout
    pub exchange_timeout_secs: u64,
    /// Upper bound on one session's duration
    pub session_timeout_secs: u64,
    /// Minimum battery percentage for background sync while not charging
    pub min_battery_level: u8,
    /// Independent entities exchanged concurrently
    pub max_parallel_exchanges: usize,
    /// Item durations kept for the time-remaining estimate
    pub duration_window: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            max_retries: 3,
            exchange_timeout_secs: 30,
            session_timeout_secs: 600,
            min_battery_level: 15,
            max_parallel_exchanges: 1,
            duration_window: 10,
        }
    }
}

impl SyncSettings {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub const fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Optimistic update retry ceiling and automatic backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Schedule retries automatically when an update fails
    pub auto_retry: bool,
    /// Retries allowed per update, manual or automatic
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: 3,
            base_delay_secs: 5,
            max_delay_secs: 300,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following `retry_count` earlier retries.
    ///
    /// Doubles from `base_delay_secs` and saturates at `max_delay_secs`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1_u64.checked_shl(retry_count.min(32)).unwrap_or(u64::MAX);
        let secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

/// Weights used by the priority assigner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityWeights {
    pub tier_low: i32,
    pub tier_normal: i32,
    pub tier_high: i32,
    /// Bonus for health-sector entities
    pub health_bonus: i32,
    /// Bonus when any emergency keyword appears in the payload text
    pub keyword_bonus: i32,
    pub emergency_keywords: Vec<String>,
    /// Largest population bonus
    pub population_max_bonus: i32,
    /// Affected population at which the bonus saturates
    pub population_saturation: u64,
    /// Payload fields read as affected population, first match wins
    pub population_fields: Vec<String>,
    /// Largest delivery-deadline bonus for responses
    pub delivery_max_bonus: i32,
    /// Extra bonus for responses in progress or overdue
    pub active_delivery_bonus: i32,
    /// Hours of queue age per bonus point
    pub age_hours_per_point: u32,
    pub age_max_bonus: i32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            tier_low: 10,
            tier_normal: 30,
            tier_high: 50,
            health_bonus: 25,
            keyword_bonus: 20,
            emergency_keywords: [
                "outbreak",
                "epidemic",
                "pandemic",
                "disease",
                "cholera",
                "critical",
                "emergency",
                "fatalities",
                "casualties",
            ]
            .map(String::from)
            .to_vec(),
            population_max_bonus: 15,
            population_saturation: 1000,
            population_fields: [
                "affected_population",
                "population_affected",
                "affected_people",
                "total_affected",
            ]
            .map(String::from)
            .to_vec(),
            delivery_max_bonus: 20,
            active_delivery_bonus: 10,
            age_hours_per_point: 2,
            age_max_bonus: 10,
        }
    }
}

/// Conflict severity policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeverityPolicy {
    /// Divergent field count at which a conflict becomes critical
    pub critical_field_count: usize,
    /// Divergent field count at which a conflict becomes high
    pub high_field_count: usize,
    /// Fields whose divergence is at least high severity
    pub sensitive_fields: Vec<String>,
    /// Fields treated as timestamps when classifying conflicts
    pub timestamp_fields: Vec<String>,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            critical_field_count: 3,
            high_field_count: 2,
            sensitive_fields: [
                "verification_status",
                "approval_status",
                "is_verified",
                "verified_by",
            ]
            .map(String::from)
            .to_vec(),
            timestamp_fields: [
                "updated_at",
                "modified_at",
                "last_modified",
                "synced_at",
                "last_synced_at",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

/// Minimum text requirements on resolutions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolutionPolicy {
    pub min_justification_len: usize,
    pub min_override_reason_len: usize,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            min_justification_len: 10,
            min_override_reason_len: 20,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file; a missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str::<Self>(&raw).map_err(|error| {
            Error::Config(format!(
                "Failed to parse config at {}: {error}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FIELDSYNC_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let read = |key: &str| non_blank(lookup(key));

        if let Some(value) = read("FIELDSYNC_SYNC_ENABLED") {
            self.sync.enabled = matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(value) = read("FIELDSYNC_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = parse_override("FIELDSYNC_SYNC_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read("FIELDSYNC_MAX_RETRIES") {
            let max_retries = parse_override("FIELDSYNC_MAX_RETRIES", &value)?;
            self.sync.max_retries = max_retries;
            self.retry.max_retries = max_retries;
        }
        if let Some(value) = read("FIELDSYNC_EXCHANGE_TIMEOUT_SECS") {
            self.sync.exchange_timeout_secs =
                parse_override("FIELDSYNC_EXCHANGE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read("FIELDSYNC_MIN_BATTERY") {
            self.sync.min_battery_level = parse_override("FIELDSYNC_MIN_BATTERY", &value)?;
        }
        if let Some(value) = read("FIELDSYNC_PARALLEL_EXCHANGES") {
            self.sync.max_parallel_exchanges =
                parse_override("FIELDSYNC_PARALLEL_EXCHANGES", &value)?;
        }

        self.validate()
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sync.max_parallel_exchanges == 0 {
            return Err(Error::Config(
                "sync.max_parallel_exchanges must be at least 1".to_string(),
            ));
        }
        if self.sync.min_battery_level > 100 {
            return Err(Error::Config(
                "sync.min_battery_level must be a percentage".to_string(),
            ));
        }
        if self.severity.high_field_count > self.severity.critical_field_count {
            return Err(Error::Config(
                "severity.high_field_count must not exceed critical_field_count".to_string(),
            ));
        }
        if self.priority.age_hours_per_point == 0 {
            return Err(Error::Config(
                "priority.age_hours_per_point must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{key} has invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{ "sync": { "max_retries": 7 } }"#).unwrap();
        assert_eq!(config.sync.max_retries, 7);
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.severity.critical_field_count, 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = serde_json::from_str::<CoreConfig>(r#"{ "sync": { "bogus": 1 } }"#)
            .unwrap_err()
            .to_string();
        assert!(error.contains("unknown field"));
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let vars = HashMap::from([
            ("FIELDSYNC_MAX_RETRIES", "5"),
            ("FIELDSYNC_SYNC_ENABLED", "off"),
            ("FIELDSYNC_MIN_BATTERY", " 20 "),
        ]);
        let mut config = CoreConfig::default();
        config
            .apply_overrides_from(|key| vars.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.sync.enabled);
        assert_eq!(config.sync.min_battery_level, 20);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = CoreConfig::default();
        let error = config
            .apply_overrides_from(|key| {
                (key == "FIELDSYNC_PARALLEL_EXCHANGES").then(|| "0".to_string())
            })
            .unwrap_err();
        assert!(error.to_string().contains("max_parallel_exchanges"));
    }

    #[test]
    fn retry_delay_doubles_and_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::load_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, CoreConfig::default());
    }
}
