use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MarginaliaError, Result};

/// Top-level configuration for Marginalia.
///
/// Loaded from `~/.marginalia/config.toml` by default. Every section falls
/// back to its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginaliaConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
}

impl MarginaliaConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MarginaliaConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimensions == 0 {
            return Err(MarginaliaError::Config(
                "embedding.dimensions must be greater than zero".to_string(),
            ));
        }
        if self.search.max_limit == 0 {
            return Err(MarginaliaError::Config(
                "search.max_limit must be greater than zero".to_string(),
            ));
        }
        if self.search.ivf_probes == 0 {
            return Err(MarginaliaError::Config(
                "search.ivf_probes must be greater than zero".to_string(),
            ));
        }
        if !(self.layout.spread > 0.0) {
            return Err(MarginaliaError::Config(
                "layout.spread must be positive".to_string(),
            ));
        }
        if !(self.layout.min_dist >= 0.0) {
            return Err(MarginaliaError::Config(
                "layout.min_dist must not be negative".to_string(),
            ));
        }
        if self.layout.max_entries == 0 {
            return Err(MarginaliaError::Config(
                "layout.max_entries must be greater than zero".to_string(),
            ));
        }
        if self.layout.timeout_secs == 0 {
            return Err(MarginaliaError::Config(
                "layout.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// API server port.
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.marginalia/data".to_string(),
            log_level: "info".to_string(),
            port: 3040,
        }
    }
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider: "mock" or "openai" (any OpenAI-compatible endpoint).
    pub provider: String,
    /// Embedding model name.
    pub model: String,
    /// Vision model used to describe images before embedding them.
    pub vision_model: String,
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Embedding dimension. Every stored entry has exactly this many components.
    pub dimensions: usize,
    /// Request timeout for provider calls.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "text-embedding-3-small".to_string(),
            vision_model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            dimensions: 1536,
            timeout_secs: 30,
        }
    }
}

/// Search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default number of results.
    pub default_limit: usize,
    /// Maximum number of results.
    pub max_limit: usize,
    /// Up to this many indexed entries every query is an exact scan.
    pub exact_search_threshold: usize,
    /// Number of inverted lists for the approximate index (0 = sqrt of N).
    pub ivf_lists: usize,
    /// Number of lists probed per approximate query.
    pub ivf_probes: usize,
    /// Seconds between background index rebuilds (0 disables the task).
    pub rebuild_interval_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 100,
            exact_search_threshold: 2_000,
            ivf_lists: 0,
            ivf_probes: 4,
            rebuild_interval_secs: 0,
        }
    }
}

/// Join graph configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Read-modify-write attempts after the first before a join reports a conflict.
    pub join_max_retries: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            join_max_retries: 5,
        }
    }
}

/// 2D layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Maximum number of entries projected per request (newest first).
    pub max_entries: usize,
    /// Minimum distance between embedded points.
    pub min_dist: f64,
    /// Effective scale of embedded points.
    pub spread: f64,
    /// RNG seed; a fixed seed makes layouts reproducible.
    pub seed: u64,
    /// Time budget for one projection.
    pub timeout_secs: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            max_entries: 2_000,
            min_dist: 0.3,
            spread: 2.0,
            seed: 42,
            timeout_secs: 30,
        }
    }
}
