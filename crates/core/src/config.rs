//! Uploader configuration
//!
//! Configuration is assembled from defaults, an optional TOML file and
//! command-line overrides, then validated once before any traversal or
//! network call takes place.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "DVU_CONFIG_DIR";

const CONFIG_FILE_NAME: &str = "config.toml";
const MAX_RETRY_ATTEMPTS: u32 = 10;
const MAX_HTTP_CONCURRENCY: usize = 20;

/// Transport-level retry settings for a single HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for the exponential backoff (before jitter)
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2000,
            max_backoff_ms: 30000,
        }
    }
}

/// Everything the orchestrator and the repository adapter need for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Repository base URL, without trailing slash
    pub server_url: String,
    /// API token sent with every repository request
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Persistent identifier of the target dataset (e.g. `doi:10.5072/FK2/ABC`)
    pub dataset_pid: String,

    pub list_only: bool,
    pub verify_checksums: bool,
    pub force_new: bool,
    pub recurse_directories: bool,
    pub direct_upload: bool,

    /// Number of discovered resources to skip before doing any work
    pub skip_files: u64,
    /// Stop uploading once this many files were uploaded
    pub max_files: Option<u64>,

    /// Retry rounds for files that failed during the first pass
    pub max_retries: u32,
    /// Delay before the first retry round; doubled after every round
    pub retry_delay_ms: u64,
    /// Pause between two retried files
    pub retry_pause_ms: u64,

    pub fixity_algorithm: ChecksumAlgorithm,

    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Maximum number of in-flight HTTP requests
    pub http_concurrency: usize,
    pub http_retry: RetryConfig,
    /// Accept any TLS certificate (test servers only)
    pub trust_all_certs: bool,

    pub max_wait_lock_secs: u64,
    pub lock_poll_interval_ms: u64,

    /// Ask the repository not to ingest tabular files
    pub no_ingest: bool,
    /// Replace characters the repository rejects in file names
    pub fix_invalid_names: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_key: String::new(),
            dataset_pid: String::new(),
            list_only: false,
            verify_checksums: false,
            force_new: false,
            recurse_directories: false,
            direct_upload: true,
            skip_files: 0,
            max_files: None,
            max_retries: 3,
            retry_delay_ms: 5000,
            retry_pause_ms: 2000,
            fixity_algorithm: ChecksumAlgorithm::Md5,
            timeout_secs: 1200,
            connect_timeout_secs: 30,
            http_concurrency: 4,
            http_retry: RetryConfig::default(),
            trust_all_certs: false,
            max_wait_lock_secs: 60,
            lock_poll_interval_ms: 5000,
            no_ingest: false,
            fix_invalid_names: true,
        }
    }
}

impl UploaderConfig {
    /// Load a configuration file, falling back to defaults for missing keys
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Load the default configuration file if one exists
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Check the configuration before anything touches the network
    pub fn validate(&mut self) -> Result<()> {
        let trimmed = self.server_url.trim().trim_end_matches('/').to_string();
        if trimmed.is_empty() {
            return Err(Error::Validation("Server URL is required".into()));
        }
        let url = url::Url::parse(&trimmed)
            .map_err(|e| Error::Validation(format!("Invalid server URL '{trimmed}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "Server URL must use http or https, got '{}'",
                url.scheme()
            )));
        }
        self.server_url = trimmed;

        if self.api_key.trim().is_empty() {
            return Err(Error::Validation("API key is required".into()));
        }
        if self.dataset_pid.trim().is_empty() {
            return Err(Error::Validation(
                "Dataset persistent identifier is required".into(),
            ));
        }
        if self.max_files == Some(0) {
            return Err(Error::Validation("File limit must be greater than zero".into()));
        }
        if self.max_retries > MAX_RETRY_ATTEMPTS {
            return Err(Error::Validation(format!(
                "Retry attempts must be at most {MAX_RETRY_ATTEMPTS}"
            )));
        }
        if self.http_concurrency == 0 || self.http_concurrency > MAX_HTTP_CONCURRENCY {
            return Err(Error::Validation(format!(
                "HTTP concurrency must be between 1 and {MAX_HTTP_CONCURRENCY}"
            )));
        }
        if self.timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(Error::Validation("Timeouts must be greater than zero".into()));
        }
        if self.max_wait_lock_secs == 0 {
            return Err(Error::Validation(
                "Lock wait ceiling must be greater than zero".into(),
            ));
        }
        if self.http_retry.max_attempts == 0 {
            return Err(Error::Validation(
                "HTTP retry attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Location of the default configuration file
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir).join(CONFIG_FILE_NAME));
    }
    dirs::config_dir().map(|d| d.join("dvu").join(CONFIG_FILE_NAME))
}
