//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/benchlens/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/benchlens/` (~/.config/benchlens/)
//! - Data: `$XDG_DATA_HOME/benchlens/` (~/.local/share/benchlens/)
//! - State/Logs: `$XDG_STATE_HOME/benchlens/` (~/.local/state/benchlens/)
//!
//! Entity types are configuration, not code: each `[entity_types.<name>]`
//! table names the overview query, the id column and the value columns that
//! the aggregate calculator and comparator work on.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// LLM configuration for insight text generation (optional)
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    /// Aggregate and classification settings
    #[serde(default)]
    pub benchmark: BenchmarkConfig,

    /// Insight validation bounds
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Generation run settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Per-entity-type query registry
    #[serde(default = "default_entity_types")]
    pub entity_types: BTreeMap<String, EntityTypeConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: None,
            benchmark: BenchmarkConfig::default(),
            validation: ValidationConfig::default(),
            generation: GenerationConfig::default(),
            entity_types: default_entity_types(),
            logging: LoggingConfig::default(),
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Provider type
    pub provider: LlmProvider,
    /// Model to use
    pub model: String,
    /// API endpoint (optional, uses default for provider)
    pub endpoint: Option<String>,
    /// API key (can also use env var)
    pub api_key: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Sampling temperature
    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,
    /// Upper bound on generated tokens
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_llm_temperature() -> f64 {
    0.3
}

fn default_llm_max_tokens() -> u32 {
    1500
}

/// Supported LLM providers
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenRouter,
    OpenAI,
    Claude,
    Ollama,
}

impl LlmProvider {
    /// Returns the default endpoint for this provider
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            LlmProvider::OpenRouter => "https://openrouter.ai/api",
            LlmProvider::OpenAI => "https://api.openai.com",
            LlmProvider::Claude => "https://api.anthropic.com",
            LlmProvider::Ollama => "http://localhost:11434",
        }
    }

    /// Environment variable consulted when no api_key is configured
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::OpenRouter => Some("OPENROUTER_API_KEY"),
            LlmProvider::OpenAI => Some("OPENAI_API_KEY"),
            LlmProvider::Claude => Some("ANTHROPIC_API_KEY"),
            LlmProvider::Ollama => None,
        }
    }
}

/// Which aggregate statistic the benchmark side compares against
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkReference {
    #[default]
    Mean,
    Median,
}

/// How the collaborator's claimed priority/comparison_type is treated
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationMode {
    /// Keep the claim once it passes enum validation
    #[default]
    Claimed,
    /// Replace the claim with the classification derived from the numbers
    Derived,
}

/// Aggregate and classification settings
#[derive(Debug, Deserialize, Clone)]
pub struct BenchmarkConfig {
    /// Percentile ranks computed for every value column
    #[serde(default = "default_percentile_ranks")]
    pub percentile_ranks: Vec<f64>,

    /// Statistic used as the benchmark reference
    #[serde(default)]
    pub benchmark_reference: BenchmarkReference,

    /// Treatment of claimed classifications
    #[serde(default)]
    pub classification: ClassificationMode,

    /// Deviation thresholds in percent
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            percentile_ranks: default_percentile_ranks(),
            benchmark_reference: BenchmarkReference::default(),
            classification: ClassificationMode::default(),
            thresholds: Thresholds::default(),
        }
    }
}

fn default_percentile_ranks() -> Vec<f64> {
    vec![25.0, 50.0, 75.0, 90.0]
}

/// Deviation thresholds (percent) for priority classification
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct Thresholds {
    #[serde(default = "default_self_high")]
    pub self_high: f64,
    #[serde(default = "default_benchmark_high")]
    pub benchmark_high: f64,
    #[serde(default = "default_self_medium")]
    pub self_medium: f64,
    #[serde(default = "default_benchmark_medium")]
    pub benchmark_medium: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            self_high: default_self_high(),
            benchmark_high: default_benchmark_high(),
            self_medium: default_self_medium(),
            benchmark_medium: default_benchmark_medium(),
        }
    }
}

fn default_self_high() -> f64 {
    30.0
}

fn default_benchmark_high() -> f64 {
    50.0
}

fn default_self_medium() -> f64 {
    15.0
}

fn default_benchmark_medium() -> f64 {
    25.0
}

/// Structural rules for insight candidates
#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_min_title_length")]
    pub min_title_length: usize,
    #[serde(default = "default_max_title_length")]
    pub max_title_length: usize,
    #[serde(default = "default_min_body_length")]
    pub min_observation_length: usize,
    #[serde(default = "default_min_body_length")]
    pub min_recommendation_length: usize,
    #[serde(default = "default_max_metrics")]
    pub max_metrics_per_insight: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_title_length: default_min_title_length(),
            max_title_length: default_max_title_length(),
            min_observation_length: default_min_body_length(),
            min_recommendation_length: default_min_body_length(),
            max_metrics_per_insight: default_max_metrics(),
        }
    }
}

fn default_min_title_length() -> usize {
    10
}

fn default_max_title_length() -> usize {
    100
}

fn default_min_body_length() -> usize {
    20
}

fn default_max_metrics() -> usize {
    5
}

/// Generation run settings
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Entities processed concurrently in a batch run
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Where insight records are written (defaults under the data dir)
    pub output_dir: Option<PathBuf>,
    /// Where dashboard raw files are discovered (defaults under the data dir)
    pub dashboard_dir: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            output_dir: None,
            dashboard_dir: None,
        }
    }
}

fn default_workers() -> usize {
    4
}

impl GenerationConfig {
    /// Resolved output directory for insight records
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("insights"))
    }

    /// Resolved directory holding dashboard raw files
    pub fn dashboard_dir(&self) -> PathBuf {
        self.dashboard_dir
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("dashboard").join("raw"))
    }
}

/// Registry entry describing one entity type
#[derive(Debug, Deserialize, Clone)]
pub struct EntityTypeConfig {
    /// Query whose rows carry the entity's headline metrics
    pub overview_query: String,
    /// Column holding the entity identifier in every query
    pub id_column: String,
    /// Numeric columns aggregated across entities and compared per entity
    pub value_columns: Vec<String>,
    /// Value columns that entities may leave unreported. A null, missing or
    /// zero value keeps that entity out of the column's statistics instead
    /// of counting as 0.
    #[serde(default)]
    pub sparse_columns: Vec<String>,
    /// Number of insights requested from the collaborator
    #[serde(default = "default_target_insights")]
    pub target_insights: usize,
    /// Known queries and the columns their rows must carry
    #[serde(default)]
    pub queries: BTreeMap<String, QuerySpec>,
}

fn default_target_insights() -> usize {
    6
}

/// Declared shape of one named query
#[derive(Debug, Deserialize, Clone, Default)]
pub struct QuerySpec {
    /// Human description, used in prompts
    pub description: Option<String>,
    /// Columns every row must carry; rows missing one are discarded
    #[serde(default)]
    pub required_columns: Vec<String>,
}

impl EntityTypeConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.overview_query.trim().is_empty() {
            return Err(Error::Config(format!(
                "entity_types.{name}.overview_query must not be empty"
            )));
        }
        if self.id_column.trim().is_empty() {
            return Err(Error::Config(format!(
                "entity_types.{name}.id_column must not be empty"
            )));
        }
        if self.value_columns.is_empty() {
            return Err(Error::Config(format!(
                "entity_types.{name}.value_columns must list at least one column"
            )));
        }
        if self.value_columns.iter().any(|c| c == &self.id_column) {
            return Err(Error::Config(format!(
                "entity_types.{name}: id column {} cannot also be a value column",
                self.id_column
            )));
        }
        if let Some(stray) = self
            .sparse_columns
            .iter()
            .find(|c| !self.value_columns.contains(c))
        {
            return Err(Error::Config(format!(
                "entity_types.{name}: sparse column {stray} is not a value column"
            )));
        }
        Ok(())
    }

    /// Whether unreported values of `column` are left out of its statistics
    pub fn is_sparse(&self, column: &str) -> bool {
        self.sparse_columns.iter().any(|c| c == column)
    }

    /// Required columns declared for a query (empty when undeclared)
    pub fn required_columns(&self, query_name: &str) -> &[String] {
        self.queries
            .get(query_name)
            .map(|q| q.required_columns.as_slice())
            .unwrap_or(&[])
    }
}

fn query(description: &str) -> QuerySpec {
    QuerySpec {
        description: Some(description.to_string()),
        required_columns: vec![],
    }
}

fn default_entity_types() -> BTreeMap<String, EntityTypeConfig> {
    let mut types = BTreeMap::new();

    types.insert(
        "buyer".to_string(),
        EntityTypeConfig {
            overview_query: "overview_metrics".to_string(),
            id_column: "buyer_org_id".to_string(),
            value_columns: vec![
                "current_period_purchases".to_string(),
                "current_period_quantity".to_string(),
                "suppliers_current".to_string(),
                "items_purchased_current".to_string(),
            ],
            sparse_columns: vec![
                "suppliers_current".to_string(),
                "items_purchased_current".to_string(),
            ],
            target_insights: default_target_insights(),
            queries: BTreeMap::from([
                (
                    "overview_metrics".to_string(),
                    query("Period-over-period buyer metrics"),
                ),
                ("top_products".to_string(), query("Top products by spend")),
                ("top_suppliers".to_string(), query("Top suppliers by spend")),
                ("top_categories".to_string(), query("Top categories by spend")),
            ]),
        },
    );

    types.insert(
        "seller".to_string(),
        EntityTypeConfig {
            overview_query: "performance_overview".to_string(),
            id_column: "vendor_id".to_string(),
            value_columns: vec![
                "total_sales".to_string(),
                "total_buyers".to_string(),
                "average_order_value".to_string(),
                "repeat_purchase_rate_pct".to_string(),
            ],
            sparse_columns: vec![
                "average_order_value".to_string(),
                "repeat_purchase_rate_pct".to_string(),
            ],
            target_insights: default_target_insights(),
            queries: BTreeMap::from([
                (
                    "performance_overview".to_string(),
                    query("Sales and customer metrics"),
                ),
                ("monthly_trends".to_string(), query("Monthly sales trends")),
                ("quarterly_trends".to_string(), query("Quarterly sales trends")),
                (
                    "product_line_breakdown".to_string(),
                    query("Revenue by product line"),
                ),
                (
                    "top_selling_products".to_string(),
                    query("Top products by revenue"),
                ),
                ("regional_distribution".to_string(), query("Sales by region")),
                ("order_analysis".to_string(), query("Order patterns and sizes")),
                (
                    "sales_time_series".to_string(),
                    query("Daily/weekly sales series"),
                ),
            ]),
        },
    );

    types
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if let Some(rank) = self
            .benchmark
            .percentile_ranks
            .iter()
            .find(|r| !(0.0..=100.0).contains(*r))
        {
            return Err(Error::Config(format!(
                "benchmark.percentile_ranks must be within 0..=100, got {rank}"
            )));
        }

        let t = &self.benchmark.thresholds;
        if t.self_medium > t.self_high || t.benchmark_medium > t.benchmark_high {
            return Err(Error::Config(
                "benchmark.thresholds medium values must not exceed high values".to_string(),
            ));
        }

        let v = &self.validation;
        if v.min_title_length > v.max_title_length {
            return Err(Error::Config(
                "validation.min_title_length must not exceed max_title_length".to_string(),
            ));
        }

        if self.generation.workers == 0 {
            return Err(Error::Config(
                "generation.workers must be at least 1".to_string(),
            ));
        }

        for (name, entity_type) in &self.entity_types {
            entity_type.validate(name)?;
        }

        Ok(())
    }

    /// Resolve the registry entry for an entity type
    pub fn entity_type(&self, name: &str) -> Result<&EntityTypeConfig> {
        self.entity_types
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown entity type: {name}")))
    }

    /// Names of all configured entity types
    pub fn entity_type_names(&self) -> Vec<String> {
        self.entity_types.keys().cloned().collect()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/benchlens/config.toml` (~/.config/benchlens/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("benchlens").join("config.toml")
    }

    /// Returns the data directory path (for the analytics database and outputs)
    ///
    /// `$XDG_DATA_HOME/benchlens/` (~/.local/share/benchlens/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("benchlens")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/benchlens/` (~/.local/state/benchlens/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("benchlens")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/benchlens/analytics.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("analytics.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/benchlens/benchlens.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("benchlens.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
