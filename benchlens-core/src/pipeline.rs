//! Insight generation pipeline
//!
//! ```text
//! DashboardPeriodMetrics
//!        │
//!        ▼
//!   load ── baseline (Database) + aggregate (AggregateCache)
//!        │
//!        ▼
//! generate ── compare ─► prompt ─► InsightClient ─► validate ─► reconcile
//!        │
//!        ▼
//!    build ── InsightRecord
//!        │
//!        ▼
//!    write ── <type>_<id>_insights_<timestamp>.json   (batch runs)
//! ```
//!
//! A missing baseline or aggregate is not an error: the record is built with
//! `has_historical_data = false` or without a benchmark side. A collaborator
//! failure yields a record with zero insights and the error attached to the
//! outcome.

use crate::benchmark::{self, Classifier};
use crate::cache::AggregateCache;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::insights::{
    build_prompt, build_record, parse_candidates, prompt_hash, InsightClient, InsightValidator,
    PromptInput, RecordProvenance,
};
use crate::types::{DashboardPeriodMetrics, EntityBaseline, InsightRecord};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Pipeline stage an entity failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Generate,
    Build,
    Write,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Generate => "generate",
            Stage::Build => "build",
            Stage::Write => "write",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-entity failure with the stage it happened in.
#[derive(Debug)]
pub struct StageError {
    /// Entity label: `type:id`, or the source file when it could not be read
    pub entity: String,
    pub stage: Stage,
    pub error: Error,
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed at {}: {}", self.entity, self.stage, self.error)
    }
}

/// Result of generating insights for one entity.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub record: InsightRecord,
    /// Set when the collaborator failed; the record then has no insights
    pub collaborator_error: Option<Error>,
    /// Validator rejections as (title, reason)
    pub rejected: Vec<(String, String)>,
    /// Response elements that were not insight objects
    pub malformed: usize,
    /// Insights whose classification was overwritten from the deviations
    pub reclassified: usize,
}

/// One unit of batch work.
#[derive(Debug, Clone)]
pub enum GenerationJob {
    /// A dashboard raw file to load
    File(PathBuf),
    /// Metrics already in memory
    Metrics(DashboardPeriodMetrics),
}

impl GenerationJob {
    fn label(&self) -> String {
        match self {
            GenerationJob::File(path) => path.display().to_string(),
            GenerationJob::Metrics(m) => format!("{}:{}", m.entity_type, m.entity_id),
        }
    }
}

/// A successful batch item.
#[derive(Debug)]
pub struct BatchSuccess {
    pub outcome: GenerationOutcome,
    /// Where the record was written, when an output directory was given
    pub output_path: Option<PathBuf>,
}

/// Result of a batch run.
#[derive(Debug, Default)]
pub struct GenerationBatch {
    pub successes: Vec<BatchSuccess>,
    pub failures: Vec<StageError>,
}

impl GenerationBatch {
    pub fn succeeded(&self) -> usize {
        self.successes.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Generates insight records against one store.
pub struct InsightPipeline {
    db: Arc<Database>,
    cache: Arc<AggregateCache>,
    client: Arc<dyn InsightClient>,
    validator: InsightValidator,
    classifier: Classifier,
    config: Config,
}

impl InsightPipeline {
    pub fn new(
        db: Arc<Database>,
        cache: Arc<AggregateCache>,
        client: Arc<dyn InsightClient>,
        config: Config,
    ) -> Self {
        Self {
            db,
            cache,
            client,
            validator: InsightValidator::new(config.validation.clone()),
            classifier: Classifier::new(config.benchmark.thresholds),
            config,
        }
    }

    /// Generate the insight record for one entity's current period.
    pub fn generate(&self, current: &DashboardPeriodMetrics) -> Result<GenerationOutcome> {
        self.run(current).map_err(|e| e.error)
    }

    fn run(&self, current: &DashboardPeriodMetrics) -> std::result::Result<GenerationOutcome, StageError> {
        let entity_type = current.entity_type.as_str();
        let entity_id = current.entity_id.as_str();
        let fail = |stage: Stage| {
            move |error: Error| StageError {
                entity: format!("{entity_type}:{entity_id}"),
                stage,
                error,
            }
        };

        // Load
        let type_config = self
            .config
            .entity_type(entity_type)
            .map_err(fail(Stage::Load))?;

        let stored = self
            .db
            .get_entity(entity_id, entity_type)
            .map_err(fail(Stage::Load))?;
        let has_historical_data = stored.as_ref().is_some_and(|b| !b.is_empty());
        let baseline = stored.unwrap_or_else(|| {
            let missing = Error::DataNotFound {
                what: "baseline",
                key: format!("{entity_type}:{entity_id}"),
            };
            tracing::warn!(entity_type, entity_id, error = %missing, "Proceeding without history");
            EntityBaseline::empty(entity_type, entity_id)
        });

        let aggregate = self.cache.get(entity_type).map_err(fail(Stage::Load))?;
        if aggregate.is_none() {
            let missing = Error::DataNotFound {
                what: "aggregate",
                key: entity_type.to_string(),
            };
            tracing::warn!(entity_type, entity_id, error = %missing, "Proceeding without benchmark");
        }

        // Generate
        let comparison = benchmark::compare(
            type_config,
            current,
            &baseline,
            aggregate.as_deref(),
            self.config.benchmark.benchmark_reference,
        );

        let prompt = build_prompt(&PromptInput {
            entity_type,
            type_config,
            current,
            baseline: &baseline,
            aggregate: aggregate.as_deref(),
            comparison: &comparison,
            thresholds: &self.config.benchmark.thresholds,
        });
        let hash = prompt_hash(&prompt);

        let parsed = self
            .client
            .complete(&prompt)
            .and_then(|raw| parse_candidates(&raw));

        let (candidates, malformed, collaborator_error) = match parsed {
            Ok(parsed) => (parsed.candidates, parsed.malformed, None),
            Err(e) => {
                tracing::warn!(
                    entity_type,
                    entity_id,
                    error = %e,
                    "Insight collaborator failed, continuing with no candidates"
                );
                (Vec::new(), 0, Some(e))
            }
        };

        let validation = self.validator.validate_all(&candidates);
        let mut insights = validation.accepted;

        let mut reclassified = 0;
        for insight in &mut insights {
            if self.classifier.reconcile(
                insight,
                &comparison,
                self.config.benchmark.classification,
            ) {
                reclassified += 1;
            }
        }

        // Build
        let record = build_record(
            current,
            insights,
            RecordProvenance {
                aggregate: aggregate.as_deref(),
                has_historical_data,
                prompt_hash: Some(hash),
                rejected_count: validation.rejected.len() + malformed,
            },
        )
        .map_err(fail(Stage::Build))?;

        tracing::info!(
            entity_type,
            entity_id,
            insights = record.insights_count,
            high_priority = record.high_priority_count,
            rejected = record.rejected_count,
            reclassified,
            has_historical_data,
            "Generated insight record"
        );

        Ok(GenerationOutcome {
            record,
            collaborator_error,
            rejected: validation.rejected,
            malformed,
            reclassified,
        })
    }

    fn run_job(&self, job: &GenerationJob, output_dir: Option<&Path>) -> std::result::Result<BatchSuccess, StageError> {
        let loaded;
        let current = match job {
            GenerationJob::File(path) => {
                loaded = DashboardPeriodMetrics::load(path).map_err(|error| StageError {
                    entity: job.label(),
                    stage: Stage::Load,
                    error,
                })?;
                &loaded
            }
            GenerationJob::Metrics(metrics) => metrics,
        };

        let mut outcome = self.run(current)?;

        if let Some(error) = outcome.collaborator_error.take() {
            return Err(StageError {
                entity: format!("{}:{}", current.entity_type, current.entity_id),
                stage: Stage::Generate,
                error,
            });
        }

        let output_path = match output_dir {
            Some(dir) => Some(write_record(&outcome.record, dir).map_err(|error| StageError {
                entity: format!("{}:{}", current.entity_type, current.entity_id),
                stage: Stage::Write,
                error,
            })?),
            None => None,
        };

        Ok(BatchSuccess {
            outcome,
            output_path,
        })
    }

    /// Generate records for many entities in parallel.
    ///
    /// Uses `generation.workers` threads. Failures are collected with their
    /// stage and never stop the batch. `on_done` is called once per job.
    pub fn generate_batch(
        &self,
        jobs: &[GenerationJob],
        output_dir: Option<&Path>,
        on_done: Option<&(dyn Fn() + Sync)>,
    ) -> GenerationBatch {
        let workers = self.config.generation.workers.clamp(1, jobs.len().max(1));
        let next = AtomicUsize::new(0);
        let batch = Mutex::new(GenerationBatch::default());

        tracing::info!(jobs = jobs.len(), workers, "Starting batch generation");

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(job) = jobs.get(index) else {
                        break;
                    };

                    let result = self.run_job(job, output_dir);
                    {
                        let mut batch = batch.lock().unwrap();
                        match result {
                            Ok(success) => batch.successes.push(success),
                            Err(failure) => {
                                tracing::warn!(
                                    entity = %failure.entity,
                                    stage = failure.stage.as_str(),
                                    error = %failure.error,
                                    "Batch item failed"
                                );
                                batch.failures.push(failure);
                            }
                        }
                    }
                    if let Some(on_done) = on_done {
                        on_done();
                    }
                });
            }
        });

        let batch = batch.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::info!(
            succeeded = batch.succeeded(),
            failed = batch.failed(),
            "Batch generation finished"
        );
        batch
    }

    /// Cache used for aggregate lookups
    pub fn cache(&self) -> &Arc<AggregateCache> {
        &self.cache
    }
}

/// File name for a record: `<type>_<id>_insights_<YYYYmmdd_HHMMSS>.json`.
pub fn record_file_name(record: &InsightRecord) -> String {
    format!(
        "{}_{}_insights_{}.json",
        record.entity_type,
        record.entity_id,
        record.generated_at.format("%Y%m%d_%H%M%S")
    )
}

/// Write a record as pretty JSON into `dir`, creating it if needed.
pub fn write_record(record: &InsightRecord, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(record_file_name(record));
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(&path, json)?;
    tracing::debug!(path = %path.display(), "Wrote insight record");
    Ok(path)
}

/// Find dashboard raw files in `dir`, optionally for one entity type.
pub fn discover_dashboard_files(dir: &Path, entity_type: Option<&str>) -> Result<Vec<PathBuf>> {
    let file_pattern = match entity_type {
        Some(t) => format!("{t}_*_dashboard_*.json"),
        None => "*_dashboard_*.json".to_string(),
    };
    let pattern = dir.join(file_pattern);
    let pattern = pattern
        .to_str()
        .ok_or_else(|| Error::Config(format!("dashboard dir is not valid UTF-8: {:?}", dir)))?;

    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| Error::Config(format!("invalid dashboard pattern: {e}")))?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable dashboard path");
                None
            }
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregateSnapshot, DashboardPeriod, MetricStats, QueryRows};
    use chrono::{NaiveDate, Utc};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    struct FixedClient(String);

    impl InsightClient for FixedClient {
        fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingClient;

    impl InsightClient for FailingClient {
        fn complete(&self, _prompt: &str) -> Result<String> {
            Err(Error::Llm("connection refused".to_string()))
        }
    }

    fn overview(value: Value) -> QueryRows {
        let mut q = QueryRows::new();
        q.insert(
            "overview_metrics".to_string(),
            vec![value.as_object().cloned().unwrap()],
        );
        q
    }

    fn current(id: &str, spend: f64) -> DashboardPeriodMetrics {
        DashboardPeriodMetrics {
            entity_type: "buyer".to_string(),
            entity_id: id.to_string(),
            period: DashboardPeriod {
                start_date: NaiveDate::from_ymd_opt(2025, 11, 14).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 2, 12).unwrap(),
                top_n: Some(10),
            },
            queries: overview(json!({"buyer_org_id": id, "current_period_purchases": spend, "suppliers_current": 5})),
            source: None,
        }
    }

    fn response() -> String {
        json!({"insights": [
            {
                "title": "Spend well above your norm",
                "observation": "Purchases are thirty percent above your lifetime level",
                "recommendation": "Check whether the extra volume is planned demand",
                "priority": "low",
                "comparison_type": "self",
                "metrics": ["current_period_purchases"]
            },
            {
                "title": "Bad",
                "observation": "too short",
                "recommendation": "too short",
                "priority": "urgent",
                "comparison_type": "self",
                "metrics": []
            }
        ]})
        .to_string()
    }

    fn setup(client: Arc<dyn InsightClient>, config: Config) -> InsightPipeline {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();

        let mut baseline = EntityBaseline::empty("buyer", "1");
        baseline.queries = overview(json!({"buyer_org_id": 1, "current_period_purchases": 200, "suppliers_current": 5}));
        db.replace_entities("buyer", &[baseline]).unwrap();
        db.put_aggregate(&AggregateSnapshot {
            entity_type: "buyer".to_string(),
            total_count: 1,
            metrics: BTreeMap::from([(
                "current_period_purchases".to_string(),
                MetricStats { mean: 200.0, median: 200.0, std: 0.0 },
            )]),
            platform_totals: BTreeMap::new(),
            percentiles: BTreeMap::new(),
            calculated_at: Utc::now(),
        })
        .unwrap();

        let cache = Arc::new(AggregateCache::new(Arc::clone(&db)));
        InsightPipeline::new(db, cache, client, config)
    }

    #[test]
    fn test_generate_validates_and_tallies() {
        let pipeline = setup(Arc::new(FixedClient(response())), Config::default());
        let outcome = pipeline.generate(&current("1", 260.0)).unwrap();

        let record = &outcome.record;
        assert_eq!(record.insights_count, 1);
        assert_eq!(record.rejected_count, 1);
        assert!(record.has_historical_data);
        assert!(record.baseline_version.is_some());
        assert!(record.prompt_hash.is_some());
        assert_eq!(record.comparison_types.total(), record.insights_count);
        // Claimed classification is kept by default
        assert_eq!(record.insights[0].priority.as_str(), "low");
        assert_eq!(outcome.reclassified, 0);
    }

    #[test]
    fn test_derived_classification_overrides_claim() {
        let mut config = Config::default();
        config.benchmark.classification = crate::config::ClassificationMode::Derived;
        let pipeline = setup(Arc::new(FixedClient(response())), config);

        let outcome = pipeline.generate(&current("1", 260.0)).unwrap();
        assert_eq!(outcome.reclassified, 1);
        assert_eq!(outcome.record.insights[0].priority.as_str(), "high");
        assert_eq!(outcome.record.insights[0].comparison_type.as_str(), "both");
        assert_eq!(outcome.record.high_priority_count, 1);
    }

    #[test]
    fn test_unknown_entity_has_no_history() {
        let pipeline = setup(Arc::new(FixedClient(response())), Config::default());
        let outcome = pipeline.generate(&current("999", 260.0)).unwrap();
        assert!(!outcome.record.has_historical_data);
        assert_eq!(outcome.record.insights_count, 1);
    }

    #[test]
    fn test_collaborator_failure_yields_empty_record() {
        let pipeline = setup(Arc::new(FailingClient), Config::default());
        let outcome = pipeline.generate(&current("1", 260.0)).unwrap();
        assert_eq!(outcome.record.insights_count, 0);
        assert!(matches!(outcome.collaborator_error, Some(Error::Llm(_))));
    }

    #[test]
    fn test_unknown_type_fails_at_load() {
        let pipeline = setup(Arc::new(FixedClient(response())), Config::default());
        let mut metrics = current("1", 260.0);
        metrics.entity_type = "distributor".to_string();

        let batch = pipeline.generate_batch(&[GenerationJob::Metrics(metrics)], None, None);
        assert_eq!(batch.failed(), 1);
        assert_eq!(batch.failures[0].stage, Stage::Load);
        assert!(matches!(batch.failures[0].error, Error::Config(_)));
    }

    #[test]
    fn test_batch_writes_records_and_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = setup(Arc::new(FixedClient(response())), Config::default());
        let jobs = vec![
            GenerationJob::Metrics(current("1", 260.0)),
            GenerationJob::File(dir.path().join("missing_dashboard.json")),
            GenerationJob::Metrics(current("2", 100.0)),
        ];
        let done = AtomicUsize::new(0);
        let tick = || {
            done.fetch_add(1, Ordering::Relaxed);
        };

        let out = dir.path().join("out");
        let batch = pipeline.generate_batch(&jobs, Some(&out), Some(&tick));

        assert_eq!(batch.succeeded(), 2);
        assert_eq!(batch.failed(), 1);
        assert_eq!(batch.failures[0].stage, Stage::Load);
        assert_eq!(done.load(Ordering::Relaxed), 3);
        for success in &batch.successes {
            let path = success.output_path.as_ref().unwrap();
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            assert!(name.starts_with("buyer_"));
            assert!(name.contains("_insights_"));
            let written: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
            assert!(written.get("total_data_version").is_some());
        }
        // Aggregate read once for the whole batch
        assert_eq!(pipeline.cache().store_reads(), 1);
    }

    #[test]
    fn test_batch_counts_collaborator_failure() {
        let pipeline = setup(Arc::new(FailingClient), Config::default());
        let batch = pipeline.generate_batch(
            &[GenerationJob::Metrics(current("1", 260.0))],
            None,
            None,
        );
        assert_eq!(batch.failed(), 1);
        assert_eq!(batch.failures[0].stage, Stage::Generate);
    }

    #[test]
    fn test_discover_dashboard_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "buyer_1_dashboard_20260212_143024.json",
            "seller_7_dashboard_20260212_143156.json",
            "buyer_1_insights_20260212_150000.json",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }

        let all = discover_dashboard_files(dir.path(), None).unwrap();
        assert_eq!(all.len(), 2);
        let buyers = discover_dashboard_files(dir.path(), Some("buyer")).unwrap();
        assert_eq!(buyers.len(), 1);
        assert!(buyers[0].ends_with("buyer_1_dashboard_20260212_143024.json"));
    }
}
