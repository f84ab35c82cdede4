//! Configuration loading, validation, and management for planctx.
//!
//! Loads configuration from `~/.planctx/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.planctx/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Embedding store and ANN index
    #[serde(default)]
    pub store: StoreConfig,

    /// Token budget split between context parts
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Context builder limits
    #[serde(default)]
    pub context: ContextConfig,

    /// Job lifecycle settings
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite", "in_memory" or "none"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Database file; defaults to `~/.planctx/embeddings.sqlite`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Embedding dimensionality
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Attempts after a lost upsert race before surfacing a conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    #[serde(default)]
    pub hnsw: HnswConfig,
}

fn default_store_backend() -> String {
    "sqlite".into()
}
fn default_dimension() -> usize {
    1536
}
fn default_conflict_retries() -> u32 {
    3
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
            dimension: default_dimension(),
            conflict_retries: default_conflict_retries(),
            hnsw: HnswConfig::default(),
        }
    }
}

/// HNSW graph parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Graph degree (neighbours per node per layer; doubled on layer 0)
    #[serde(default = "default_hnsw_m")]
    pub m: usize,

    /// Candidate list size while building
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    /// Candidate list size while searching (raised to top_k when smaller)
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    /// Seed for level assignment, so graphs are reproducible
    #[serde(default = "default_hnsw_seed")]
    pub seed: u64,
}

fn default_hnsw_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    64
}
fn default_ef_search() -> usize {
    64
}
fn default_hnsw_seed() -> u64 {
    0x5eed
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: default_hnsw_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            seed: default_hnsw_seed(),
        }
    }
}

/// Weight and bounds of one budget category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub weight: f64,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_messages_category")]
    pub messages: CategoryConfig,

    #[serde(default = "default_memory_category")]
    pub memory: CategoryConfig,

    #[serde(default = "default_plan_category")]
    pub plan: CategoryConfig,

    /// Upper bound on redistribution passes
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,
}

fn default_messages_category() -> CategoryConfig {
    CategoryConfig { weight: 0.50, min: 100, max: 4000 }
}
fn default_memory_category() -> CategoryConfig {
    CategoryConfig { weight: 0.35, min: 50, max: 3000 }
}
fn default_plan_category() -> CategoryConfig {
    CategoryConfig { weight: 0.15, min: 50, max: 2000 }
}
fn default_max_passes() -> usize {
    4
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            messages: default_messages_category(),
            memory: default_memory_category(),
            plan: default_plan_category(),
            max_passes: default_max_passes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Overall token ceiling when the caller gives none
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,

    /// Most recent messages considered
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,

    /// Messages above this many tokens are offered to the summarizer
    #[serde(default = "default_long_message_threshold")]
    pub long_message_threshold: usize,

    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,

    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f32,

    /// Plan entries considered
    #[serde(default = "default_plan_entry_limit")]
    pub plan_entry_limit: usize,

    /// Deadline for one build; 0 disables it
    #[serde(default = "default_build_timeout_ms")]
    pub build_timeout_ms: u64,
}

fn default_context_max_tokens() -> usize {
    8000
}
fn default_message_limit() -> usize {
    20
}
fn default_long_message_threshold() -> usize {
    500
}
fn default_memory_top_k() -> usize {
    10
}
fn default_memory_threshold() -> f32 {
    0.7
}
fn default_plan_entry_limit() -> usize {
    5
}
fn default_build_timeout_ms() -> u64 {
    5000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_max_tokens(),
            message_limit: default_message_limit(),
            long_message_threshold: default_long_message_threshold(),
            memory_top_k: default_memory_top_k(),
            memory_threshold: default_memory_threshold(),
            plan_entry_limit: default_plan_entry_limit(),
            build_timeout_ms: default_build_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// "sqlite" or "in_memory"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Database file; defaults to `~/.planctx/jobs.sqlite`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Recoverable failures allowed before a job fails for good
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Re-reads allowed for cancellation racing other transitions
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Per-run handler deadline
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,

    /// Extra attempts at recording a run's outcome when the store errors
    #[serde(default = "default_report_retries")]
    pub report_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}
fn default_handler_timeout_secs() -> u64 {
    300
}
fn default_report_retries() -> u32 {
    3
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
            max_retries: default_max_retries(),
            conflict_retries: default_conflict_retries(),
            handler_timeout_secs: default_handler_timeout_secs(),
            report_retries: default_report_retries(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.planctx/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `PLANCTX_DB_PATH`
    /// - `PLANCTX_EMBEDDING_DIM`
    /// - `PLANCTX_HNSW_M`
    /// - `PLANCTX_HNSW_EF_CONSTRUCTION`
    /// - `PLANCTX_HNSW_EF_SEARCH`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in `load`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("PLANCTX_DB_PATH") {
            self.store.path = Some(path);
        }
        if let Some(value) = lookup("PLANCTX_EMBEDDING_DIM") {
            self.store.dimension = parse_override("PLANCTX_EMBEDDING_DIM", &value)?;
        }
        if let Some(value) = lookup("PLANCTX_HNSW_M") {
            self.store.hnsw.m = parse_override("PLANCTX_HNSW_M", &value)?;
        }
        if let Some(value) = lookup("PLANCTX_HNSW_EF_CONSTRUCTION") {
            self.store.hnsw.ef_construction =
                parse_override("PLANCTX_HNSW_EF_CONSTRUCTION", &value)?;
        }
        if let Some(value) = lookup("PLANCTX_HNSW_EF_SEARCH") {
            self.store.hnsw.ef_search = parse_override("PLANCTX_HNSW_EF_SEARCH", &value)?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".planctx")
    }

    /// Resolved embedding database path.
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("embeddings.sqlite"))
    }

    /// Resolved job database path.
    pub fn jobs_path(&self) -> PathBuf {
        self.jobs
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("jobs.sqlite"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.dimension == 0 {
            return Err(ConfigError::ValidationError("store.dimension must be > 0".into()));
        }

        let hnsw = &self.store.hnsw;
        if hnsw.m < 2 {
            return Err(ConfigError::ValidationError("store.hnsw.m must be >= 2".into()));
        }
        if hnsw.ef_construction < hnsw.m {
            return Err(ConfigError::ValidationError(
                "store.hnsw.ef_construction must be >= store.hnsw.m".into(),
            ));
        }
        if hnsw.ef_search == 0 {
            return Err(ConfigError::ValidationError("store.hnsw.ef_search must be > 0".into()));
        }

        let categories = [
            ("messages", &self.budget.messages),
            ("memory", &self.budget.memory),
            ("plan", &self.budget.plan),
        ];
        for (name, category) in categories {
            if !category.weight.is_finite() || category.weight < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "budget.{name}.weight must be a non-negative number"
                )));
            }
            if category.min > category.max {
                return Err(ConfigError::ValidationError(format!(
                    "budget.{name}.min must not exceed budget.{name}.max"
                )));
            }
        }
        let weight_sum: f64 = categories.iter().map(|(_, c)| c.weight).sum();
        if weight_sum <= 0.0 {
            return Err(ConfigError::ValidationError("budget weights must sum to > 0".into()));
        }
        if self.budget.max_passes == 0 {
            return Err(ConfigError::ValidationError("budget.max_passes must be > 0".into()));
        }

        if !(-1.0..=1.0).contains(&self.context.memory_threshold) {
            return Err(ConfigError::ValidationError(
                "context.memory_threshold must be between -1.0 and 1.0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key}: cannot parse '{value}'")))
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.dimension, 1536);
        assert_eq!(config.store.hnsw.m, 16);
        assert_eq!(config.store.hnsw.ef_construction, 64);
        assert_eq!(config.context.max_tokens, 8000);
        assert_eq!(config.budget.messages.max, 4000);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.store.backend, config.store.backend);
        assert_eq!(parsed.budget.memory, config.budget.memory);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[store.hnsw]
m = 32

[context]
message_limit = 8
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.hnsw.m, 32);
        assert_eq!(config.store.hnsw.ef_construction, 64);
        assert_eq!(config.context.message_limit, 8);
        assert_eq!(config.context.plan_entry_limit, 5);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.store.backend, "sqlite");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[jobs]\nmax_retries = 7\n").unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.jobs.max_retries, 7);
    }

    #[test]
    fn unparsable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[store\n").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn overrides_apply_hnsw_parameters() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PLANCTX_HNSW_M", "24"),
            ("PLANCTX_HNSW_EF_CONSTRUCTION", "200"),
            ("PLANCTX_DB_PATH", "/var/lib/planctx/e.sqlite"),
        ]);
        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store.hnsw.m, 24);
        assert_eq!(config.store.hnsw.ef_construction, 200);
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/planctx/e.sqlite"));
    }

    #[test]
    fn bad_override_rejected() {
        let mut config = AppConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "PLANCTX_EMBEDDING_DIM").then(|| "wide".to_string())
        });
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn inverted_bounds_rejected() {
        let mut config = AppConfig::default();
        config.budget.plan.min = 3000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_graph_degree_rejected() {
        let mut config = AppConfig::default();
        config.store.hnsw.m = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("ef_construction"));
        assert!(toml_str.contains("1536"));
    }
}
