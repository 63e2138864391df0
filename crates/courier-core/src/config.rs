//! Relay configuration.
//!
//! Sources, later wins:
//! 1. `RelayConfig::default()`
//! 2. a JSON document (`from_json`), missing fields keep their defaults
//! 3. `COURIER_*` environment variables (`from_env` / `with_env_overrides`)
//!
//! Durations are written in milliseconds.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Backoff, RetryPolicy, Topic};
use crate::error::ConfigError;

pub const ENV_GROUP_ID: &str = "COURIER_GROUP_ID";
pub const ENV_DELIVERY_INTERVAL_MS: &str = "COURIER_DELIVERY_INTERVAL_MS";
pub const ENV_DELIVERY_BATCH_SIZE: &str = "COURIER_DELIVERY_BATCH_SIZE";
pub const ENV_POLL_TIMEOUT_MS: &str = "COURIER_POLL_TIMEOUT_MS";
pub const ENV_ERROR_BACKOFF_MS: &str = "COURIER_ERROR_BACKOFF_MS";
pub const ENV_MAX_RETRY: &str = "COURIER_MAX_RETRY";
pub const ENV_BACKOFF_BASE_MS: &str = "COURIER_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_EXPONENT: &str = "COURIER_BACKOFF_EXPONENT";
pub const ENV_RETRY_TOPIC: &str = "COURIER_RETRY_TOPIC";
pub const ENV_HOSPITAL_TOPIC: &str = "COURIER_HOSPITAL_TOPIC";
pub const ENV_QUARANTINE_POISON: &str = "COURIER_QUARANTINE_POISON";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Consumer group shared by every run-loop of this service.
    pub group_id: String,
    pub delivery: DeliveryConfig,
    pub consumer: ConsumerConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub poll_timeout_ms: u64,
    /// Pause after a failed poll or an unroutable record.
    pub error_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retry: u32,
    pub backoff_base_ms: u64,
    pub backoff_exponent: f64,
    pub retry_topic: String,
    /// Unset means hospital records only go to the store.
    pub hospital_topic: Option<String>,
    /// Topic name → fixed re-poll delay in milliseconds.
    pub fixed_schedules_ms: HashMap<String, u64>,
    /// Hospitalize undecodable payloads immediately instead of retrying.
    pub quarantine_poison: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            group_id: "courier".to_string(),
            delivery: DeliveryConfig::default(),
            consumer: ConsumerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            batch_size: 100,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1_000,
            error_backoff_ms: 1_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            backoff_base_ms: 5 * 60 * 1_000,
            backoff_exponent: 1.5,
            retry_topic: Topic::DEAD_LETTER_RETRY.as_str().to_string(),
            hospital_topic: None,
            fixed_schedules_ms: HashMap::new(),
            quarantine_poison: false,
        }
    }
}

impl DeliveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl RetryConfig {
    pub fn retry_topic(&self) -> Topic {
        Topic::new(self.retry_topic.clone())
    }

    pub fn hospital_topic(&self) -> Option<Topic> {
        self.hospital_topic.clone().map(Topic::new)
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry: self.max_retry,
            backoff: Backoff::Geometric {
                base: Duration::from_millis(self.backoff_base_ms),
                exponent: self.backoff_exponent,
            },
            fixed_schedules: self
                .fixed_schedules_ms
                .iter()
                .map(|(topic, ms)| (Topic::new(topic.clone()), Duration::from_millis(*ms)))
                .collect(),
        }
    }
}

impl RelayConfig {
    /// Defaults overlaid with the process environment, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Parses a JSON document, then validates.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `COURIER_*` overrides from `get_env`, then validates.
    pub fn with_env_overrides<F>(mut self, get_env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(group_id) = get_env(ENV_GROUP_ID) {
            self.group_id = group_id;
        }
        override_parsed(&get_env, ENV_DELIVERY_INTERVAL_MS, &mut self.delivery.interval_ms)?;
        override_parsed(&get_env, ENV_DELIVERY_BATCH_SIZE, &mut self.delivery.batch_size)?;
        override_parsed(&get_env, ENV_POLL_TIMEOUT_MS, &mut self.consumer.poll_timeout_ms)?;
        override_parsed(&get_env, ENV_ERROR_BACKOFF_MS, &mut self.consumer.error_backoff_ms)?;
        override_parsed(&get_env, ENV_MAX_RETRY, &mut self.retry.max_retry)?;
        override_parsed(&get_env, ENV_BACKOFF_BASE_MS, &mut self.retry.backoff_base_ms)?;
        override_parsed(&get_env, ENV_BACKOFF_EXPONENT, &mut self.retry.backoff_exponent)?;
        override_parsed(&get_env, ENV_QUARANTINE_POISON, &mut self.retry.quarantine_poison)?;
        if let Some(topic) = get_env(ENV_RETRY_TOPIC) {
            self.retry.retry_topic = topic;
        }
        if let Some(topic) = get_env(ENV_HOSPITAL_TOPIC) {
            // 空文字で無効化できる
            self.retry.hospital_topic = Some(topic).filter(|t| !t.trim().is_empty());
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::Invalid("group_id must not be empty".into()));
        }
        if self.delivery.interval_ms == 0 {
            return Err(ConfigError::Invalid("delivery.interval_ms must be positive".into()));
        }
        if self.delivery.batch_size == 0 {
            return Err(ConfigError::Invalid("delivery.batch_size must be positive".into()));
        }
        if self.consumer.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid("consumer.poll_timeout_ms must be positive".into()));
        }
        if !self.retry.backoff_exponent.is_finite() || self.retry.backoff_exponent < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_exponent must be >= 1.0, got {}",
                self.retry.backoff_exponent
            )));
        }
        if self.retry.retry_topic.trim().is_empty() {
            return Err(ConfigError::Invalid("retry.retry_topic must not be empty".into()));
        }
        if self.retry.hospital_topic.as_deref() == Some(self.retry.retry_topic.as_str()) {
            return Err(ConfigError::Invalid(
                "retry.hospital_topic must differ from retry.retry_topic".into(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(get_env: &F, var: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = get_env(var) else {
        return Ok(());
    };
    *target = raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: raw.clone(),
        reason: err.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.delivery.interval(), Duration::from_secs(2));
        assert_eq!(config.delivery.batch_size, 100);
        assert_eq!(config.consumer.poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.retry.max_retry, 3);
        assert_eq!(config.retry.retry_topic(), Topic::DEAD_LETTER_RETRY);
        assert_eq!(config.retry.hospital_topic(), None);
        assert!(!config.retry.quarantine_poison);

        let policy = config.retry.policy();
        assert_eq!(
            policy.backoff,
            Backoff::Geometric {
                base: Duration::from_secs(300),
                exponent: 1.5
            }
        );
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let config = RelayConfig::default()
            .with_env_overrides(env(&[
                (ENV_GROUP_ID, "billing"),
                (ENV_DELIVERY_BATCH_SIZE, "25"),
                (ENV_MAX_RETRY, "5"),
                (ENV_BACKOFF_EXPONENT, "2.0"),
                (ENV_HOSPITAL_TOPIC, "DEAD_LETTER_HOSPITAL"),
                (ENV_QUARANTINE_POISON, "true"),
            ]))
            .unwrap();

        assert_eq!(config.group_id, "billing");
        assert_eq!(config.delivery.batch_size, 25);
        assert_eq!(config.retry.max_retry, 5);
        assert_eq!(config.retry.backoff_exponent, 2.0);
        assert_eq!(config.retry.hospital_topic(), Some(Topic::DEAD_LETTER_HOSPITAL));
        assert!(config.retry.quarantine_poison);
    }

    #[test]
    fn unparseable_env_value_names_the_variable() {
        let err = RelayConfig::default()
            .with_env_overrides(env(&[(ENV_POLL_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == ENV_POLL_TIMEOUT_MS));
    }

    #[test]
    fn json_keeps_defaults_for_missing_fields() {
        let config = RelayConfig::from_json(
            r#"{
                "delivery": { "batch_size": 10 },
                "retry": { "fixed_schedules_ms": { "AUDIT_FINDING": 30000 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.delivery.batch_size, 10);
        assert_eq!(config.delivery.interval_ms, 2_000);
        assert_eq!(
            config.retry.policy().next_delay(&Topic::AUDIT_FINDING, 2),
            Duration::from_secs(30)
        );
    }

    #[rstest]
    #[case(r#"{"delivery": {"batch_size": 0}}"#)]
    #[case(r#"{"delivery": {"interval_ms": 0}}"#)]
    #[case(r#"{"consumer": {"poll_timeout_ms": 0}}"#)]
    #[case(r#"{"retry": {"backoff_exponent": 0.5}}"#)]
    #[case(r#"{"retry": {"retry_topic": "X", "hospital_topic": "X"}}"#)]
    #[case(r#"{"group_id": "  "}"#)]
    fn invalid_documents_are_rejected(#[case] raw: &str) {
        assert!(matches!(
            RelayConfig::from_json(raw),
            Err(ConfigError::Invalid(_))
        ));
    }
}
