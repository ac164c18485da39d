//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub deduplication: DeduplicationConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Overridden by `DATABASE_URL` when set.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    /// Number of jobs processed in parallel by one process.
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
    /// Claims older than this are presumed abandoned and requeued.
    pub claim_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: "worker-1".to_string(),
            concurrency: 4,
            poll_interval_ms: 1000,
            error_backoff_ms: 5000,
            claim_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationConfig {
    /// Scheduled jobs hold the deduplication key too.
    pub including_scheduled: bool,
    /// Delay before the single follow-up of a deduplicated job runs.
    pub reschedule_delay_ms: u64,
}

impl DeduplicationConfig {
    pub fn reschedule_delay(&self) -> Duration {
        Duration::from_millis(self.reschedule_delay_ms)
    }
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            including_scheduled: true,
            reschedule_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Exponential backoff for the given zero-based attempt, capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse system configuration from KDL text.
///
/// Every node is optional; missing values keep their defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let name = node.name().value();
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::Duplicate(format!("{} node", name)));
        }

        match name {
            "database" => {
                if let Some(url) = get_string_prop(node, "url") {
                    config.database.url = Some(url);
                }
                if let Some(max) = get_u64_prop(node, "max-connections")? {
                    config.database.max_connections = to_u32("max-connections", max)?;
                }
            }
            "worker" => {
                if let Some(id) = get_string_prop(node, "id") {
                    config.worker.id = id;
                }
                if let Some(concurrency) = get_u64_prop(node, "concurrency")? {
                    config.worker.concurrency = concurrency as usize;
                }
                if let Some(ms) = get_u64_prop(node, "poll-interval-ms")? {
                    config.worker.poll_interval_ms = ms;
                }
                if let Some(ms) = get_u64_prop(node, "error-backoff-ms")? {
                    config.worker.error_backoff_ms = ms;
                }
                if let Some(ms) = get_u64_prop(node, "claim-timeout-ms")? {
                    config.worker.claim_timeout_ms = ms;
                }
            }
            "deduplication" => {
                if let Some(flag) = get_bool_prop(node, "including-scheduled") {
                    config.deduplication.including_scheduled = flag;
                }
                if let Some(ms) = get_u64_prop(node, "reschedule-delay-ms")? {
                    config.deduplication.reschedule_delay_ms = ms;
                }
            }
            "retry" => {
                if let Some(max) = get_u64_prop(node, "max-attempts")? {
                    config.retry.max_attempts = to_u32("max-attempts", max)?;
                }
                if let Some(ms) = get_u64_prop(node, "base-delay-ms")? {
                    config.retry.base_delay_ms = ms;
                }
                if let Some(ms) = get_u64_prop(node, "max-delay-ms")? {
                    config.retry.max_delay_ms = ms;
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &SystemConfig) -> ConfigResult<()> {
    if config.worker.id.trim().is_empty() {
        return Err(ConfigError::MissingField("worker id".to_string()));
    }
    if config.worker.concurrency == 0 {
        return Err(invalid("concurrency", "must be at least 1"));
    }
    if config.worker.claim_timeout_ms == 0 {
        return Err(invalid("claim-timeout-ms", "must be at least 1"));
    }
    if config.database.max_connections == 0 {
        return Err(invalid("max-connections", "must be at least 1"));
    }
    if config.retry.max_attempts == 0 {
        return Err(invalid("max-attempts", "must be at least 1"));
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(invalid(
            "base-delay-ms",
            "must not be greater than max-delay-ms",
        ));
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn to_u32(field: &str, value: u64) -> ConfigResult<u32> {
    u32::try_from(value).map_err(|_| invalid(field, "out of range"))
}

// Helper functions for extracting values from KDL nodes

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| invalid(name, "expected a non-negative integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            database url="postgres://localhost/slotlock" max-connections=20
            worker id="worker-7" concurrency=8 poll-interval-ms=250 error-backoff-ms=2000 claim-timeout-ms=60000
            deduplication including-scheduled=#false reschedule-delay-ms=500
            retry max-attempts=5 base-delay-ms=100 max-delay-ms=10000
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://localhost/slotlock")
        );
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.worker.id, "worker-7");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.worker.claim_timeout(), Duration::from_secs(60));
        assert!(!config.deduplication.including_scheduled);
        assert_eq!(config.deduplication.reschedule_delay_ms, 500);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert!(config.deduplication.including_scheduled);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let kdl = r#"
            worker concurrency=2
            worker concurrency=3
        "#;
        assert!(matches!(
            parse_system_config(kdl),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = parse_system_config("worker concurrency=0");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_non_integer_value_rejected() {
        let result = parse_system_config(r#"retry max-attempts="many""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(8), Duration::from_millis(1000));
        assert_eq!(retry.backoff(64), Duration::from_millis(1000));
    }
}
