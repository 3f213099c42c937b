//! Guard configuration.
//!
//! [`GuardConfig`] is loaded from JSON. Every section and field has a
//! default, so an empty object is a valid configuration:
//!
//! ```json
//! {
//!   "operations": {
//!     "default_role": "platform_admin",
//!     "requirements": { "viewPatientRecord": "staff" }
//!   },
//!   "audit": { "retry": { "max_retries": 5, "initial_delay": "50ms" } },
//!   "compliance": { "query_timeout": "10s" },
//!   "isolation": { "sensitive_tables": ["patients", "prescriptions"] }
//! }
//! ```
//!
//! Durations use humantime notation (`250ms`, `5s`, `1m`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::authz::OperationPolicy;
use crate::error::ConfigError;

#[cfg(feature = "sqlite")]
use crate::backends::sqlite::SqliteBackendConfig;

/// Top-level guard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Operation to required-role policy.
    #[serde(default)]
    pub operations: OperationPolicy,

    /// Audit pipeline settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Compliance reporting settings.
    #[serde(default)]
    pub compliance: ComplianceConfig,

    /// Tenant isolation settings.
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// SQLite backend settings.
    #[cfg(feature = "sqlite")]
    #[serde(default)]
    pub sqlite: SqliteBackendConfig,
}

impl GuardConfig {
    /// Parses a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::from_file(path)?;
        config
            .validate()
            .map_err(|problems| ConfigError::Invalid { problems })?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.audit.batch_size == 0 {
            errors.push("Audit batch size cannot be 0".to_string());
        }

        if self.audit.queue_capacity == 0 {
            errors.push("Audit queue capacity cannot be 0".to_string());
        }

        if self.audit.flush_interval.is_zero() {
            errors.push("Audit flush interval cannot be 0".to_string());
        }

        if self.audit.retry.backoff_multiplier < 1.0 {
            errors.push("Retry backoff multiplier cannot be below 1.0".to_string());
        }

        if self.audit.retry.initial_delay > self.audit.retry.max_delay {
            errors.push("Retry initial delay cannot exceed max delay".to_string());
        }

        if self.compliance.page_size == 0 {
            errors.push("Compliance page size cannot be 0".to_string());
        }

        if self.compliance.query_timeout.is_zero() {
            errors.push("Compliance query timeout cannot be 0".to_string());
        }

        if let Err(e) = regex::Regex::new(&self.isolation.tenant_id_pattern) {
            errors.push(format!("Invalid tenant id pattern: {}", e));
        }

        if self.isolation.max_tenant_id_length == 0 {
            errors.push("Max tenant id length cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Creates a configuration suitable for testing.
    ///
    /// Retries and dispatch intervals are shortened so failure paths finish
    /// quickly.
    pub fn for_testing() -> Self {
        Self {
            audit: AuditConfig {
                retry: RetryConfig {
                    max_retries: 2,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    backoff_multiplier: 2.0,
                },
                flush_interval: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Retry configuration for audit writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Audit pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Retry policy for outbox writes and deliveries.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Maximum number of outbox entries delivered per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Capacity of the dispatcher wake-up channel.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How often the dispatcher polls the outbox without a wake-up.
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,

    /// Record denied authorization attempts in the audit log.
    #[serde(default = "default_true")]
    pub audit_denials: bool,
}

fn default_batch_size() -> usize {
    100
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_true() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            flush_interval: default_flush_interval(),
            audit_denials: true,
        }
    }
}

/// Compliance reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Upper bound on a single report query.
    #[serde(with = "humantime_serde", default = "default_query_timeout")]
    pub query_timeout: Duration,

    /// Audit log rows read per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_page_size() -> usize {
    500
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            query_timeout: default_query_timeout(),
            page_size: default_page_size(),
        }
    }
}

/// Tenant isolation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Pattern every caller-supplied tenant id must match.
    #[serde(default = "default_tenant_id_pattern")]
    pub tenant_id_pattern: String,

    /// Maximum tenant id length.
    #[serde(default = "default_max_tenant_id_length")]
    pub max_tenant_id_length: usize,

    /// Tables whose reads are audited, not only their writes.
    #[serde(default = "default_sensitive_tables")]
    pub sensitive_tables: Vec<String>,
}

fn default_tenant_id_pattern() -> String {
    r"^[a-zA-Z0-9_\-]+$".to_string()
}

fn default_max_tenant_id_length() -> usize {
    64
}

fn default_sensitive_tables() -> Vec<String> {
    vec!["patients".to_string()]
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            tenant_id_pattern: default_tenant_id_pattern(),
            max_tenant_id_length: default_max_tenant_id_length(),
            sensitive_tables: default_sensitive_tables(),
        }
    }
}

/// Serde support for `Duration` in humantime notation.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Role;

    #[test]
    fn test_empty_object_is_default() {
        let config = GuardConfig::from_json_str("{}").unwrap();
        assert_eq!(config.audit.retry.max_retries, 3);
        assert_eq!(config.audit.flush_interval, Duration::from_millis(250));
        assert_eq!(config.compliance.query_timeout, Duration::from_secs(30));
        assert_eq!(config.isolation.sensitive_tables, vec!["patients"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_humantime_durations() {
        let config = GuardConfig::from_json_str(
            r#"{
                "audit": {"retry": {"initial_delay": "50ms", "max_delay": "2s"}},
                "compliance": {"query_timeout": "1m"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.audit.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(config.audit.retry.max_delay, Duration::from_secs(2));
        assert_eq!(config.compliance.query_timeout, Duration::from_secs(60));

        let json = serde_json::to_value(&config.audit.retry).unwrap();
        assert_eq!(json["initial_delay"], "50ms");
    }

    #[test]
    fn test_operation_requirements_from_json() {
        let config = GuardConfig::from_json_str(
            r#"{"operations": {"requirements": {"exportCharts": "practice_manager"}}}"#,
        )
        .unwrap();
        assert_eq!(
            config.operations.required_role("exportCharts"),
            Role::PracticeManager
        );
    }

    #[test]
    fn test_unknown_role_in_policy_is_a_load_error() {
        let result = GuardConfig::from_json_str(
            r#"{"operations": {"requirements": {"viewPatientRecord": "owner"}}}"#,
        );
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_collects_problems() {
        let mut config = GuardConfig::default();
        config.audit.batch_size = 0;
        config.compliance.page_size = 0;
        config.isolation.tenant_id_pattern = "([".to_string();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        std::fs::write(&path, r#"{"audit": {"audit_denials": false}}"#).unwrap();

        let config = GuardConfig::load(&path).unwrap();
        assert!(!config.audit.audit_denials);

        let missing = GuardConfig::from_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
