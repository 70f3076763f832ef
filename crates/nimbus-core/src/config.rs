use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{NimbusError, NimbusResult};

/// Default block size: 4 MiB.
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Top-level client configuration (loaded from nimbus.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub uploader: UploaderConfig,
    pub network: NetworkConfig,
    pub importer: ImporterConfig,
    pub crypto: CryptoConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Drafts whose operation graphs may run at once (default: 5)
    pub max_concurrent_uploads: usize,
    /// Block operations in flight per draft (default: 15)
    pub max_concurrent_blocks: usize,
    /// Plaintext bytes per block (default: 4 MiB)
    pub max_block_size: u64,
    /// Retry limit for transient failures of one network call
    pub max_retries: u32,
    /// Base delay between retries; attempt n waits n * base
    pub retry_backoff_ms: u64,
    /// Run the post-commit verification pass
    pub verify_uploads: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout for revision creation, listing and commit calls
    pub request_timeout_secs: u64,
    /// Timeout for a single block PUT or GET
    pub block_timeout_secs: u64,
    /// How long new uploads hold off after a server outage
    pub circuit_breaker_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// Drafts persisted per storage request (default: 20)
    pub batch_size: usize,
}

/// Argon2id parameters for unlocking passphrase-protected key material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Iterations (default: 3)
    pub time_cost: u32,
    /// Lanes (default: 4)
    pub parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint holding block objects
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    pub bucket: String,
    /// Refuse plain-HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level or EnvFilter directive (default: info)
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 5,
            max_concurrent_blocks: 15,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_retries: 3,
            retry_backoff_ms: 500,
            verify_uploads: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            block_timeout_secs: 30,
            circuit_breaker_cooldown_secs: 60,
        }
    }
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self { batch_size: 20 }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "nimbus-blocks".into(),
            enforce_tls: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl NimbusConfig {
    /// Load from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> NimbusResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| NimbusError::Config(format!("reading config {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| NimbusError::Config(format!("parsing config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> NimbusResult<()> {
        if self.uploader.max_block_size == 0 {
            return Err(NimbusError::Config("uploader.max_block_size must be > 0".into()));
        }
        if self.uploader.max_concurrent_uploads == 0 || self.uploader.max_concurrent_blocks == 0 {
            return Err(NimbusError::Config(
                "uploader concurrency limits must be > 0".into(),
            ));
        }
        if self.importer.batch_size == 0 {
            return Err(NimbusError::Config("importer.batch_size must be > 0".into()));
        }
        if self.storage.enforce_tls && self.storage.endpoint.starts_with("http://") {
            return Err(NimbusError::Config(format!(
                "storage.enforce_tls is set but endpoint is plain HTTP: {}",
                self.storage.endpoint
            )));
        }
        Ok(())
    }
}
