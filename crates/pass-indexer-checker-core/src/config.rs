//! Configuration management for pass-indexer-checker
//!
//! Settings live in an optional `system.toml` whose keys mirror the PASS
//! property names as TOML dotted keys:
//!
//! ```toml
//! pass.fedora.baseurl = "http://localhost:8080/fcrepo/rest/"
//! pass.elasticsearch.url = "http://localhost:9200"
//! pass.elasticsearch.limit = 100
//!
//! [check]
//! retries = 50
//! ```
//!
//! A missing file yields defaults. `PASS_*` environment variables are applied
//! on top of the file. The resulting [`Config`] is passed explicitly to every
//! collaborator.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::wait::PollPolicy;

/// Default name of the settings file, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "system.toml";

/// Environment variables that override file settings, in the order applied.
pub const ENV_OVERRIDES: [&str; 5] = [
    "PASS_FEDORA_USER",
    "PASS_FEDORA_PASSWORD",
    "PASS_FEDORA_BASEURL",
    "PASS_ELASTICSEARCH_URL",
    "PASS_ELASTICSEARCH_LIMIT",
];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Repository and index endpoints
    #[serde(default)]
    pub pass: PassConfig,

    /// Check thresholds and polling
    #[serde(default)]
    pub check: CheckConfig,
}

/// Endpoints for the PASS backend services
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PassConfig {
    #[serde(default)]
    pub fedora: FedoraConfig,

    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

/// Fedora repository connection
#[derive(Clone, Serialize, Deserialize)]
pub struct FedoraConfig {
    /// Repository root, e.g. `http://localhost:8080/fcrepo/rest/`
    #[serde(default = "default_fedora_baseurl")]
    pub baseurl: String,

    #[serde(default = "default_fedora_user")]
    pub user: String,

    #[serde(default = "default_fedora_password")]
    pub password: String,
}

impl Default for FedoraConfig {
    fn default() -> Self {
        Self {
            baseurl: default_fedora_baseurl(),
            user: default_fedora_user(),
            password: default_fedora_password(),
        }
    }
}

impl fmt::Debug for FedoraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FedoraConfig")
            .field("baseurl", &self.baseurl)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn default_fedora_baseurl() -> String {
    "http://localhost:8080/fcrepo/rest/".to_string()
}

fn default_fedora_user() -> String {
    "fedoraAdmin".to_string()
}

fn default_fedora_password() -> String {
    "moo".to_string()
}

/// Elasticsearch index connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Cluster base URL; the mapping is read from `<url>/<index>`
    #[serde(default = "default_es_url")]
    pub url: String,

    /// Index holding PASS documents
    #[serde(default = "default_es_index")]
    pub index: String,

    /// Page size for multi-result searches
    #[serde(default = "default_es_limit")]
    pub limit: usize,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: default_es_url(),
            index: default_es_index(),
            limit: default_es_limit(),
        }
    }
}

fn default_es_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_es_index() -> String {
    "pass".to_string()
}

fn default_es_limit() -> usize {
    100
}

/// HTTP client settings shared by the repository and index clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
        }
    }
}

impl HttpConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_http_timeout() -> u64 {
    30
}

/// Check thresholds and poll budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// The mapping must have strictly more properties than this
    #[serde(default = "default_min_mapping_properties")]
    pub min_mapping_properties: usize,

    /// At least this many submitters must be indexed
    #[serde(default = "default_min_submitters")]
    pub min_submitters: usize,

    /// Poll attempts per awaited index change
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Seconds between poll attempts
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Optional wall-clock cap per awaited index change
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Fail the run after cleaning up a sentinel left by an earlier run
    #[serde(default = "default_true")]
    pub fail_on_stale_sentinel: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            min_mapping_properties: default_min_mapping_properties(),
            min_submitters: default_min_submitters(),
            retries: default_retries(),
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: None,
            fail_on_stale_sentinel: true,
        }
    }
}

impl CheckConfig {
    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.poll_interval_secs),
            self.retries,
            self.timeout_secs.map(Duration::from_secs),
        )
    }
}

fn default_min_mapping_properties() -> usize {
    10
}

fn default_min_submitters() -> usize {
    10
}

fn default_retries() -> u32 {
    50
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Load configuration from `path`, falling back to defaults when the file does not exist.
    pub fn load_optional(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No settings file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        debug!(path = %path.display(), "Loaded settings file");
        Self::from_toml(&text)
    }

    /// Load from `path`, apply process environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_optional(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PASS_*` overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in ENV_OVERRIDES {
            let Some(value) = lookup(key).filter(|v| !v.is_empty()) else {
                continue;
            };
            debug!(key, "Applying environment override");
            match key {
                "PASS_FEDORA_USER" => self.pass.fedora.user = value,
                "PASS_FEDORA_PASSWORD" => self.pass.fedora.password = value,
                "PASS_FEDORA_BASEURL" => self.pass.fedora.baseurl = value,
                "PASS_ELASTICSEARCH_URL" => self.pass.elasticsearch.url = value,
                "PASS_ELASTICSEARCH_LIMIT" => {
                    self.pass.elasticsearch.limit = value.parse().map_err(|_| {
                        ConfigError::ValidationError(format!(
                            "PASS_ELASTICSEARCH_LIMIT must be a positive integer, got {value:?}"
                        ))
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject values that would make the check meaningless.
    ///
    /// URLs are validated by the clients that consume them.
    pub fn validate(&self) -> Result<()> {
        if self.check.retries == 0 {
            return invalid("check.retries must be at least 1");
        }
        if self.check.poll_interval_secs == 0 {
            return invalid("check.poll_interval_secs must be at least 1");
        }
        if self.check.timeout_secs == Some(0) {
            return invalid("check.timeout_secs must be at least 1 when set");
        }
        if self.pass.elasticsearch.limit == 0 {
            return invalid("pass.elasticsearch.limit must be at least 1");
        }
        if self.pass.elasticsearch.index.trim().is_empty() {
            return invalid("pass.elasticsearch.index must not be empty");
        }
        if self.pass.http.timeout_secs == 0 {
            return invalid("pass.http.timeout_secs must be at least 1");
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Result<()> {
    Err(ConfigError::ValidationError(msg.to_string()).into())
}
