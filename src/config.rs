//! Configuration management
//!
//! One section per pipeline component. Every field has a default so a
//! partial `config.toml` is always valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::verification::SafetyLevel;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// SQLite file; defaults to `<data_dir>/ledger.db`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl LedgerConfig {
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(p) => Ok(p.clone()),
            None => Ok(data_dir()?.join("ledger.db")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Longer directives are truncated before tokenizing
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_embedding_dim() -> usize {
    128
}

fn default_max_chars() -> usize {
    8192
}

fn default_cache_size() -> usize {
    256
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
            max_chars: default_max_chars(),
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Rules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Confidence added per matched indicator
    #[serde(default = "default_increment")]
    pub increment: f64,
    /// Multiplier applied to rejected alternatives
    #[serde(default = "default_alternative_discount")]
    pub alternative_discount: f64,
    /// Overall confidence below this is a classification failure
    #[serde(default)]
    pub min_confidence: f64,
}

fn default_increment() -> f64 {
    0.3
}

fn default_alternative_discount() -> f64 {
    0.5
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            increment: default_increment(),
            alternative_discount: default_alternative_discount(),
            min_confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub safety_level: SafetyLevel,
    /// Network-touching commands fail Behavioral unless set
    #[serde(default)]
    pub allow_network: bool,
    /// Execute-semantics operations allowed per requester per window
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Classification confidence below this draws an Intent warning
    #[serde(default = "default_intent_min_confidence")]
    pub intent_min_confidence: f64,
    /// Filler/pronoun word ratio above this is ambiguous
    #[serde(default = "default_ambiguity_threshold")]
    pub ambiguity_threshold: f64,
    /// Resource-intensive indicators tolerated before Behavioral fails
    #[serde(default = "default_resource_threshold")]
    pub resource_threshold: usize,
}

fn default_rate_limit_max() -> u32 {
    60
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_intent_min_confidence() -> f64 {
    0.5
}

fn default_ambiguity_threshold() -> f64 {
    0.5
}

fn default_resource_threshold() -> usize {
    3
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            safety_level: SafetyLevel::default(),
            allow_network: false,
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            intent_min_confidence: default_intent_min_confidence(),
            ambiguity_threshold: default_ambiguity_threshold(),
            resource_threshold: default_resource_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    /// Defaults to `<data_dir>/backups`
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default = "default_max_backup_bytes")]
    pub max_backup_bytes: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Simulate every execution
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_timeout_secs() -> u64 {
    120
}

fn default_max_backup_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            backup_dir: None,
            max_backup_bytes: default_max_backup_bytes(),
            max_output_bytes: default_max_output_bytes(),
            dry_run: false,
            working_dir: None,
        }
    }
}

impl ExecutionConfig {
    pub fn resolved_backup_dir(&self) -> Result<PathBuf> {
        match &self.backup_dir {
            Some(p) => Ok(p.clone()),
            None => Ok(data_dir()?.join("backups")),
        }
    }

    /// Configured timeout clamped to the hard maximum
    pub fn effective_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs.min(self.max_timeout_secs).max(1))
    }
}

/// Latency thresholds used to infer confidence from approval decisions.
/// The mapping is a heuristic, so every step is tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_fast_decision_ms")]
    pub fast_decision_ms: u64,
    #[serde(default = "default_slow_decision_ms")]
    pub slow_decision_ms: u64,
    #[serde(default = "default_fast_confidence")]
    pub fast_confidence: f64,
    #[serde(default = "default_medium_confidence")]
    pub medium_confidence: f64,
    #[serde(default = "default_slow_confidence")]
    pub slow_confidence: f64,
    /// Retries or undos sooner than this strongly imply a wrong result
    #[serde(default = "default_behavioral_fast_ms")]
    pub behavioral_fast_ms: u64,
}

fn default_fast_decision_ms() -> u64 {
    2_000
}

fn default_slow_decision_ms() -> u64 {
    10_000
}

fn default_fast_confidence() -> f64 {
    0.9
}

fn default_medium_confidence() -> f64 {
    0.7
}

fn default_slow_confidence() -> f64 {
    0.5
}

fn default_behavioral_fast_ms() -> u64 {
    30_000
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            fast_decision_ms: default_fast_decision_ms(),
            slow_decision_ms: default_slow_decision_ms(),
            fast_confidence: default_fast_confidence(),
            medium_confidence: default_medium_confidence(),
            slow_confidence: default_slow_confidence(),
            behavioral_fast_ms: default_behavioral_fast_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    /// Period of the background learning runner
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_window_days() -> i64 {
    7
}

fn default_interval_secs() -> u64 {
    3600
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            interval_secs: default_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Run pure reads immediately after verification passes
    #[serde(default = "default_true")]
    pub auto_execute_read_only: bool,
    /// Split "X and then Y" into child operations
    #[serde(default = "default_true")]
    pub decompose: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_execute_read_only: true,
            decompose: true,
        }
    }
}

impl Config {
    /// Load configuration from the platform config file, writing the
    /// defaults on first run
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Config rooted in `dir`: ledger and backups live inside it
    pub fn in_dir(dir: &Path) -> Self {
        let mut config = Config::default();
        config.ledger.path = Some(dir.join("ledger.db"));
        config.execution.backup_dir = Some(dir.join("backups"));
        config.execution.working_dir = Some(dir.to_path_buf());
        config
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "atomic-ops", "atomic-ops")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "atomic-ops", "atomic-ops")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
