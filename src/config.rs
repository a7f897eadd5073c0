//! Host configuration
//!
//! Everything the engine needs from its host: identifiers, the remote
//! endpoint, the record types to sync, the tier table and a handful of
//! behavior flags. Loaded from YAML or JSON, or built in code with
//! [`HostConfig::builder`].

use crate::error::{Error, Result, ResultExt};
use crate::types::{RecordType, TierTable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Host Config
// ============================================================================

/// Complete host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Current account id; runs refuse to start without one
    #[serde(default)]
    pub account_id: Option<String>,

    /// Remote dataset that receives uploads
    #[serde(default)]
    pub upload_target_id: Option<String>,

    /// Base URL of the remote service
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token for the remote service
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Record types synced in both modes, in merge tie-break order
    pub record_types: Vec<RecordType>,

    /// Batch-size ladder
    #[serde(default)]
    pub tiers: TierConfig,

    /// Tier used when a mode has no persisted tier
    #[serde(default = "default_initial_tier_index")]
    pub initial_tier_index: usize,

    /// Never upload deletions
    #[serde(default)]
    pub suppress_deletes: bool,

    /// Skip the network and report every upload as successful
    #[serde(default)]
    pub simulate: bool,

    /// Log request bodies and tokens on failure
    #[serde(default)]
    pub include_sensitive_info: bool,

    /// How far before the first live start the live fence sits
    #[serde(default = "default_live_lookback_secs")]
    pub live_lookback_secs: u64,

    /// Delay before a scheduled retry re-enters start
    #[serde(default)]
    pub retry_delay_ms: u64,

    /// Page size for historical counting queries
    #[serde(default = "default_count_page_size")]
    pub count_page_size: usize,

    /// Remaining execution budget below which a run stops after its current batch
    #[serde(default = "default_budget_expiry_threshold_secs")]
    pub budget_expiry_threshold_secs: u64,

    /// Transport rate limit; unlimited when absent
    #[serde(default)]
    pub requests_per_second: Option<u32>,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_initial_tier_index() -> usize {
    1
}

fn default_live_lookback_secs() -> u64 {
    4 * 60 * 60
}

fn default_count_page_size() -> usize {
    5000
}

fn default_budget_expiry_threshold_secs() -> u64 {
    5
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            upload_target_id: None,
            base_url: default_base_url(),
            auth_token: None,
            record_types: Vec::new(),
            tiers: TierConfig::default(),
            initial_tier_index: default_initial_tier_index(),
            suppress_deletes: false,
            simulate: false,
            include_sensitive_info: false,
            live_lookback_secs: default_live_lookback_secs(),
            retry_delay_ms: 0,
            count_page_size: default_count_page_size(),
            budget_expiry_threshold_secs: default_budget_expiry_threshold_secs(),
            requests_per_second: None,
        }
    }
}

impl HostConfig {
    /// Start building a config
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config is usable
    pub fn validate(&self) -> Result<()> {
        if self.record_types.is_empty() {
            return Err(Error::invalid_value(
                "record_types",
                "at least one record type is required",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for record_type in &self.record_types {
            if record_type.as_str().is_empty() {
                return Err(Error::invalid_value("record_types", "empty record type"));
            }
            if !seen.insert(record_type) {
                return Err(Error::invalid_value(
                    "record_types",
                    format!("duplicate record type '{record_type}'"),
                ));
            }
        }
        if self.count_page_size == 0 {
            return Err(Error::invalid_value("count_page_size", "must be positive"));
        }
        url::Url::parse(&self.base_url)?;
        self.tier_table()?;
        Ok(())
    }

    /// Validated tier table
    pub fn tier_table(&self) -> Result<TierTable> {
        TierTable::from_columns(
            &self.tiers.batch_limits,
            &self.tiers.delete_limits,
            &self.tiers.timeouts_secs,
        )
    }

    /// Lookback for the live fence
    pub fn live_lookback(&self) -> Duration {
        Duration::from_secs(self.live_lookback_secs)
    }

    /// Delay before a retry
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Budget expiry threshold
    pub fn budget_expiry_threshold(&self) -> Duration {
        Duration::from_secs(self.budget_expiry_threshold_secs)
    }
}

// ============================================================================
// Tier Config
// ============================================================================

/// Tier table as three parallel columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Records per upload, largest first
    pub batch_limits: Vec<usize>,

    /// Deletions per upload
    pub delete_limits: Vec<usize>,

    /// Upload timeout in seconds
    pub timeouts_secs: Vec<u64>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            batch_limits: vec![500, 100, 20],
            delete_limits: vec![500, 100, 20],
            timeouts_secs: vec![60, 120, 240],
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`HostConfig`]
#[derive(Debug, Clone, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Set the account id
    #[must_use]
    pub fn account_id(mut self, id: impl Into<String>) -> Self {
        self.config.account_id = Some(id.into());
        self
    }

    /// Set the upload target id
    #[must_use]
    pub fn upload_target_id(mut self, id: impl Into<String>) -> Self {
        self.config.upload_target_id = Some(id.into());
        self
    }

    /// Set the base URL
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Set the auth token
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    /// Add a record type
    #[must_use]
    pub fn record_type(mut self, record_type: impl Into<RecordType>) -> Self {
        self.config.record_types.push(record_type.into());
        self
    }

    /// Replace the tier table
    #[must_use]
    pub fn tiers(mut self, tiers: TierConfig) -> Self {
        self.config.tiers = tiers;
        self
    }

    /// Set the initial tier index
    #[must_use]
    pub fn initial_tier_index(mut self, index: usize) -> Self {
        self.config.initial_tier_index = index;
        self
    }

    /// Suppress deletions
    #[must_use]
    pub fn suppress_deletes(mut self, suppress: bool) -> Self {
        self.config.suppress_deletes = suppress;
        self
    }

    /// Simulate uploads
    #[must_use]
    pub fn simulate(mut self, simulate: bool) -> Self {
        self.config.simulate = simulate;
        self
    }

    /// Include sensitive info in failure logs
    #[must_use]
    pub fn include_sensitive_info(mut self, include: bool) -> Self {
        self.config.include_sensitive_info = include;
        self
    }

    /// Set the live lookback
    #[must_use]
    pub fn live_lookback_secs(mut self, secs: u64) -> Self {
        self.config.live_lookback_secs = secs;
        self
    }

    /// Set the retry delay
    #[must_use]
    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    /// Set the counting page size
    #[must_use]
    pub fn count_page_size(mut self, size: usize) -> Self {
        self.config.count_page_size = size;
        self
    }

    /// Set the budget expiry threshold
    #[must_use]
    pub fn budget_expiry_threshold_secs(mut self, secs: u64) -> Self {
        self.config.budget_expiry_threshold_secs = secs;
        self
    }

    /// Set the transport rate limit
    #[must_use]
    pub fn requests_per_second(mut self, rps: u32) -> Self {
        self.config.requests_per_second = Some(rps);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<HostConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
record_types: [glucose, insulin]
"#;

        let config = HostConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.record_types.len(), 2);
        assert_eq!(config.initial_tier_index, 1);
        assert_eq!(config.live_lookback_secs, 14_400);
        assert_eq!(config.count_page_size, 5000);
        assert_eq!(config.budget_expiry_threshold_secs, 5);
        assert!(!config.simulate);
        assert_eq!(config.tiers, TierConfig::default());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
account_id: acct-1
upload_target_id: ds-9
base_url: "https://api.example.com"
auth_token: secret
record_types: [glucose]
tiers:
  batch_limits: [200, 50]
  delete_limits: [100, 25]
  timeouts_secs: [30, 90]
initial_tier_index: 0
suppress_deletes: true
retry_delay_ms: 250
requests_per_second: 5
"#;

        let config = HostConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.account_id.as_deref(), Some("acct-1"));
        assert_eq!(config.upload_target_id.as_deref(), Some("ds-9"));
        assert!(config.suppress_deletes);
        assert_eq!(config.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.requests_per_second, Some(5));

        let table = config.tier_table().unwrap();
        assert_eq!(table.max_index(), 1);
        assert_eq!(table.get(1).delete_limit, 25);
    }

    #[test]
    fn test_validate_rejects_empty_types() {
        let err = HostConfig::from_yaml_str("record_types: []").unwrap_err();
        assert!(err.to_string().contains("record_types"));
    }

    #[test]
    fn test_validate_rejects_duplicate_types() {
        let err = HostConfig::from_yaml_str("record_types: [glucose, glucose]").unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_uneven_tiers() {
        let yaml = r#"
record_types: [glucose]
tiers:
  batch_limits: [200, 50]
  delete_limits: [100]
  timeouts_secs: [30, 90]
"#;
        assert!(HostConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_builder() {
        let config = HostConfig::builder()
            .account_id("acct")
            .upload_target_id("target")
            .record_type("glucose")
            .record_type("insulin")
            .simulate(true)
            .build()
            .unwrap();

        assert_eq!(config.record_types[1].as_str(), "insulin");
        assert!(config.simulate);
        assert!(HostConfig::builder().build().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"record_types": ["steps"], "account_id": "a", "live_lookback_secs": 60}}"#
        )
        .unwrap();

        let config = HostConfig::from_file(file.path()).unwrap();
        assert_eq!(config.live_lookback(), Duration::from_secs(60));
        assert_eq!(config.account_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_from_missing_file() {
        let err = HostConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }
}
