//! Core domain types for benchlens
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Entity** | A participant being benchmarked (a buyer organization, a seller) |
//! | **Entity type** | A configured category of entities sharing one query registry |
//! | **Baseline** | An entity's lifetime/historical query results, replaced on every sync |
//! | **Aggregate snapshot** | Population statistics over all entities of one type |
//! | **Dashboard period** | The current window an entity is evaluated on |
//! | **Insight** | A validated observation/recommendation pair with a priority |
//!
//! Rows are kept as JSON objects so arbitrary query shapes can flow through the
//! store. Numbers are pulled out of them with [`row_number`] at the points
//! where the pipeline needs a numeric view.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================
// Rows
// ============================================

/// One result row of one named query: column name to value.
pub type MetricRow = serde_json::Map<String, Value>;

/// Query name to its result rows.
pub type QueryRows = BTreeMap<String, Vec<MetricRow>>;

/// Read a column as a number.
///
/// Integers, floats and numeric strings are accepted. Anything else (null,
/// booleans, objects, unparsable strings, non-finite values) yields `None`.
pub fn row_number(row: &MetricRow, column: &str) -> Option<f64> {
    let value = match row.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

/// Batch of source-of-truth query results for one entity type.
///
/// This is the sync input: `{"entity_type": "...", "queries": {"<name>": [rows]}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResults {
    pub entity_type: String,
    #[serde(default)]
    pub queries: QueryRows,
}

impl QueryResults {
    /// Load sync input from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

// ============================================
// Baselines & aggregates
// ============================================

/// Historical query results for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBaseline {
    pub entity_id: String,
    pub entity_type: String,
    /// Every query known for the entity type is present, possibly empty
    pub queries: QueryRows,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityBaseline {
    /// Baseline with no query data, used when an entity has no history yet
    pub fn empty(entity_type: &str, entity_id: &str) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            queries: QueryRows::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True when no query carries any row
    pub fn is_empty(&self) -> bool {
        self.queries.values().all(|rows| rows.is_empty())
    }

    /// First row of the named query
    pub fn first_row(&self, query_name: &str) -> Option<&MetricRow> {
        self.queries.get(query_name).and_then(|rows| rows.first())
    }
}

/// The platform-wide summary row of the overview query, if one was returned.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Summary {
    Available(MetricRow),
    #[default]
    Absent,
}

impl Summary {
    pub fn is_available(&self) -> bool {
        matches!(self, Summary::Available(_))
    }
}

/// Central tendency and spread of one metric across entities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
}

/// Population statistics for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub entity_type: String,
    /// Number of entities whose values contributed to the statistics
    pub total_count: usize,
    /// Value column to its statistics
    pub metrics: BTreeMap<String, MetricStats>,
    /// `platform_total_<field>` copies of the summary row; empty without one
    #[serde(default)]
    pub platform_totals: BTreeMap<String, Value>,
    /// Value column to `p<rank>` to value
    pub percentiles: BTreeMap<String, BTreeMap<String, f64>>,
    pub calculated_at: DateTime<Utc>,
}

impl AggregateSnapshot {
    /// Reference value for a metric (mean or median)
    pub fn reference(&self, metric: &str, use_median: bool) -> Option<f64> {
        self.metrics
            .get(metric)
            .map(|s| if use_median { s.median } else { s.mean })
    }
}

/// Key used in percentile tables for a rank, e.g. `p25`, `p99.5`.
pub fn percentile_key(rank: f64) -> String {
    if rank.fract() == 0.0 {
        format!("p{}", rank as i64)
    } else {
        format!("p{rank}")
    }
}

// ============================================
// Dashboard period
// ============================================

/// The evaluated window, echoed into every insight record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardPeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
}

/// Current-window metrics for one entity. Never persisted by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardPeriodMetrics {
    pub entity_type: String,
    pub entity_id: String,
    pub period: DashboardPeriod,
    pub queries: QueryRows,
    /// File the metrics were read from, when loaded from disk
    pub source: Option<PathBuf>,
}

/// One query entry in a dashboard raw file: either the executor's wrapped
/// form (`{"description", "result_count", "data"}`) or a bare row list.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuery {
    Wrapped {
        #[serde(default)]
        data: Vec<MetricRow>,
        #[serde(default)]
        error: Option<String>,
    },
    Rows(Vec<MetricRow>),
}

#[derive(Deserialize)]
struct RawDashboard {
    entity_type: String,
    entity_id: Value,
    parameters: DashboardPeriod,
    #[serde(default)]
    queries: BTreeMap<String, RawQuery>,
}

impl DashboardPeriodMetrics {
    /// Parse a dashboard raw document
    pub fn from_raw_json(raw: &str) -> Result<Self> {
        let raw: RawDashboard = serde_json::from_str(raw)?;

        let entity_id = entity_id_from_value(&raw.entity_id).ok_or_else(|| {
            Error::Config(format!("dashboard entity_id is not usable: {}", raw.entity_id))
        })?;

        let queries = raw
            .queries
            .into_iter()
            .map(|(name, query)| match query {
                RawQuery::Wrapped { data, error } => {
                    if let Some(error) = error {
                        tracing::warn!(query = %name, error = %error, "Dashboard query reported an error");
                    }
                    (name, data)
                }
                RawQuery::Rows(rows) => (name, rows),
            })
            .collect();

        Ok(Self {
            entity_type: raw.entity_type,
            entity_id,
            period: raw.parameters,
            queries,
            source: None,
        })
    }

    /// Load a dashboard raw file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut metrics = Self::from_raw_json(&content)?;
        metrics.source = Some(path.to_path_buf());
        Ok(metrics)
    }

    /// First row of the named query
    pub fn first_row(&self, query_name: &str) -> Option<&MetricRow> {
        self.queries.get(query_name).and_then(|rows| rows.first())
    }
}

/// Normalize an entity identifier.
///
/// Strings (non-empty after trimming) and integral numbers are accepted;
/// `5098` and `"5098"` yield the same id. Everything else is rejected.
pub fn entity_id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                (f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15)
                    .then(|| (f as i64).to_string())
            }
        }
        _ => None,
    }
}

// ============================================
// Insights
// ============================================

/// Insight priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("unknown priority: {}", s)),
        }
    }
}

/// What the current value was compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonType {
    /// The entity's own history
    #[serde(rename = "self")]
    SelfHistory,
    /// The platform aggregate
    Benchmark,
    Both,
}

impl ComparisonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonType::SelfHistory => "self",
            ComparisonType::Benchmark => "benchmark",
            ComparisonType::Both => "both",
        }
    }
}

impl std::fmt::Display for ComparisonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComparisonType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "self" => Ok(ComparisonType::SelfHistory),
            "benchmark" => Ok(ComparisonType::Benchmark),
            "both" => Ok(ComparisonType::Both),
            _ => Err(format!("unknown comparison type: {}", s)),
        }
    }
}

/// Unvalidated insight as produced by the text collaborator.
///
/// Every field is optional so that a candidate with holes still parses and
/// can be rejected by the validator with a reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightCandidate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub comparison_type: Option<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// A candidate that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    pub observation: String,
    pub recommendation: String,
    pub priority: Priority,
    pub comparison_type: ComparisonType,
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// Accepted insights per priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityBreakdown {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl PriorityBreakdown {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// Accepted insights per comparison type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonBreakdown {
    #[serde(rename = "self")]
    pub self_history: usize,
    pub benchmark: usize,
    pub both: usize,
}

impl ComparisonBreakdown {
    pub fn total(&self) -> usize {
        self.self_history + self.benchmark + self.both
    }
}

/// Final output of one generation run for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub generated_at: DateTime<Utc>,
    pub dashboard_period: DashboardPeriod,
    pub insights: Vec<Insight>,
    pub insights_count: usize,
    pub high_priority_count: usize,
    pub priority_breakdown: PriorityBreakdown,
    pub comparison_types: ComparisonBreakdown,
    /// `calculated_at` of the aggregate snapshot the record was built against
    #[serde(rename = "total_data_version")]
    pub baseline_version: Option<DateTime<Utc>>,
    pub has_historical_data: bool,
    /// SHA-256 of the prompt sent to the text collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    /// Candidates dropped by validation
    #[serde(default)]
    pub rejected_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dashboard_file: Option<PathBuf>,
}

// ============================================
// Sync log
// ============================================

/// Outcome of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            _ => Err(format!("unknown sync status: {}", s)),
        }
    }
}

/// One row of the append-only sync log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Assigned by the store on insert
    pub id: Option<i64>,
    pub synced_at: DateTime<Utc>,
    pub entity_type: String,
    pub entities_count: usize,
    pub duration_seconds: f64,
    pub status: SyncStatus,
    pub error_message: Option<String>,
}

/// Snapshot of store contents, used by the sync binary's health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreHealth {
    /// Entity type to number of stored baselines
    pub entity_counts: BTreeMap<String, usize>,
    /// Entity types that have an aggregate snapshot
    pub aggregate_types: Vec<String>,
    pub last_sync: Option<SyncLogEntry>,
    pub database_bytes: u64,
}
