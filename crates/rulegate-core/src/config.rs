//! Pipeline configuration
//!
//! Loaded from TOML. Every section has defaults so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RulegateError};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "RULEGATE_CONFIG";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "rulegate.toml";

/// Main pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulegateConfig {
    /// Capability registry settings
    pub registry: RegistrySettings,

    /// Quality validator thresholds
    pub quality: QualitySettings,

    /// Audit recorder settings
    pub audit: AuditSettings,

    /// Policy store settings
    pub policy: PolicySettings,
}

impl RulegateConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default per-call handler timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.registry.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the quality thresholds
    pub fn with_quality_thresholds(mut self, min_quality: f64, max_bias: f64) -> Self {
        self.quality.min_quality = min_quality;
        self.quality.max_bias = max_bias;
        self
    }

    /// Set the audit sink
    pub fn with_audit_sink(mut self, sink: AuditSinkConfig) -> Self {
        self.audit.sink = sink;
        self
    }

    /// Set the audit fallback buffer capacity
    pub fn with_fallback_capacity(mut self, capacity: usize) -> Self {
        self.audit.fallback_capacity = capacity;
        self
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RulegateError::Config(e.to_string()))
    }

    /// Resolve configuration from `RULEGATE_CONFIG`, then `./rulegate.toml`,
    /// then defaults. An unreadable or invalid file falls back to defaults.
    pub fn load() -> Self {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !path.exists() {
            return Self::default();
        }

        match Self::from_file(&path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(
                    "Invalid config at {:?}: {}. Falling back to defaults.",
                    path,
                    error
                );
                Self::default()
            }
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.quality.min_quality) {
            return Err(RulegateError::Config(format!(
                "quality.min_quality must be in [0, 1], got {}",
                self.quality.min_quality
            )));
        }
        if !unit.contains(&self.quality.max_bias) {
            return Err(RulegateError::Config(format!(
                "quality.max_bias must be in [0, 1], got {}",
                self.quality.max_bias
            )));
        }
        if self.registry.default_timeout_ms == 0 {
            return Err(RulegateError::Config(
                "registry.default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.audit.queue_capacity == 0 || self.audit.fallback_capacity == 0 {
            return Err(RulegateError::Config(
                "audit queue and fallback capacities must be greater than zero".to_string(),
            ));
        }
        if self.audit.flush_interval_ms == 0 {
            return Err(RulegateError::Config(
                "audit.flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Per-call handler budget in milliseconds
    pub default_timeout_ms: u64,
}

impl RegistrySettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

/// Quality thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    /// Quality below this attaches a soft warning
    pub min_quality: f64,

    /// Bias above this blocks the response
    pub max_bias: f64,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            min_quality: 0.5,
            max_bias: 0.6,
        }
    }
}

/// Audit recorder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Bounded queue between the response path and the audit worker
    pub queue_capacity: usize,

    /// Ring buffer used while the sink is failing
    pub fallback_capacity: usize,

    /// Interval between attempts to re-drive buffered records
    pub flush_interval_ms: u64,

    /// Durable sink
    pub sink: AuditSinkConfig,
}

impl AuditSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            fallback_capacity: 512,
            flush_interval_ms: 5_000,
            sink: AuditSinkConfig::Memory,
        }
    }
}

/// Audit sink selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditSinkConfig {
    /// Process-local store, lost on exit
    Memory,
    /// Append-only JSON lines file
    Jsonl { path: PathBuf },
    /// SQLite database in WAL mode
    Sqlite { path: PathBuf },
}

impl Default for AuditSinkConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Policy store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Lifetime of cached policy lookups
    pub cache_ttl_secs: u64,
}

impl PolicySettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self { cache_ttl_secs: 300 }
    }
}
