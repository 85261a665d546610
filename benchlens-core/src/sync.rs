//! Sync coordinator
//!
//! Runs the sync path for one or more entity types:
//!
//! ```text
//! QueryResults ──► organize ──► aggregate::calculate ──► Database
//!                                                     ├─ replace_type_snapshot
//!                                                     └─ append_sync_log
//! ```
//!
//! Syncs of the same entity type are serialized through a per-type lock;
//! different types proceed in parallel.

use crate::aggregate;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::organizer::{self, OrganizeReport};
use crate::types::{EntityBaseline, QueryResults, SyncLogEntry, SyncStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Result of syncing one entity type.
#[derive(Debug, Clone)]
pub struct TypeSyncResult {
    pub entity_type: String,
    /// Baselines written
    pub entities: usize,
    /// Entities that contributed to the aggregate
    pub contributing: usize,
    /// Whether the overview query carried a platform summary row
    pub summary_available: bool,
    pub report: OrganizeReport,
    pub duration: Duration,
}

/// Result of syncing several entity types.
#[derive(Debug, Default)]
pub struct SyncBatchResult {
    pub results: Vec<TypeSyncResult>,
    /// Entity type paired with the error that stopped its sync
    pub failures: Vec<(String, Error)>,
}

impl SyncBatchResult {
    pub fn succeeded(&self) -> usize {
        self.results.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Coordinates syncs against one store.
pub struct SyncCoordinator {
    db: Arc<Database>,
    config: Config,
    type_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncCoordinator {
    pub fn new(db: Arc<Database>, config: Config) -> Self {
        Self {
            db,
            config,
            type_locks: Mutex::new(HashMap::new()),
        }
    }

    fn type_lock(&self, entity_type: &str) -> Arc<Mutex<()>> {
        let mut locks = self.type_locks.lock().unwrap();
        Arc::clone(locks.entry(entity_type.to_string()).or_default())
    }

    /// Sync one entity type from its query results.
    ///
    /// On failure the previously committed baselines and aggregate stay in
    /// place and an `error` entry is written to the sync log.
    pub fn sync_entity_type(&self, input: &QueryResults) -> Result<TypeSyncResult> {
        let entity_type = input.entity_type.as_str();
        let lock = self.type_lock(entity_type);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let started = Instant::now();
        tracing::info!(entity_type, queries = input.queries.len(), "Starting sync");

        let outcome = self.run_sync(input, started);
        let duration = started.elapsed();

        let entry = match &outcome {
            Ok(result) => SyncLogEntry {
                id: None,
                synced_at: Utc::now(),
                entity_type: entity_type.to_string(),
                entities_count: result.entities,
                duration_seconds: duration.as_secs_f64(),
                status: SyncStatus::Success,
                error_message: None,
            },
            Err(e) => SyncLogEntry {
                id: None,
                synced_at: Utc::now(),
                entity_type: entity_type.to_string(),
                entities_count: 0,
                duration_seconds: duration.as_secs_f64(),
                status: SyncStatus::Error,
                error_message: Some(e.to_string()),
            },
        };

        if let Err(e) = self.db.append_sync_log(&entry) {
            tracing::warn!(entity_type, error = %e, "Failed to write sync log entry");
        }

        match &outcome {
            Ok(result) => tracing::info!(
                entity_type,
                entities = result.entities,
                contributing = result.contributing,
                summary_available = result.summary_available,
                duration_ms = duration.as_millis() as u64,
                "Sync complete"
            ),
            Err(e) => tracing::error!(
                entity_type,
                error = %e,
                kind = e.kind().as_str(),
                "Sync failed"
            ),
        }

        outcome
    }

    fn run_sync(&self, input: &QueryResults, started: Instant) -> Result<TypeSyncResult> {
        let entity_type = input.entity_type.as_str();
        let type_config = self.config.entity_type(entity_type)?;

        let organized = organizer::organize(entity_type, type_config, &input.queries);
        let summary = organized.summary(&type_config.overview_query);

        let snapshot = aggregate::calculate(
            entity_type,
            type_config,
            &organized.entities,
            &summary,
            &self.config.benchmark.percentile_ranks,
        );

        let now = Utc::now();
        let baselines: Vec<EntityBaseline> = organized
            .entities
            .into_iter()
            .map(|(entity_id, queries)| EntityBaseline {
                entity_id,
                entity_type: entity_type.to_string(),
                queries,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let entities = self.db.replace_type_snapshot(entity_type, &baselines, &snapshot)?;

        Ok(TypeSyncResult {
            entity_type: entity_type.to_string(),
            entities,
            contributing: snapshot.total_count,
            summary_available: summary.is_available(),
            report: organized.report,
            duration: started.elapsed(),
        })
    }

    /// Sync several entity types, one thread per type.
    ///
    /// Continues past failures; inputs for the same type are serialized by
    /// the per-type lock.
    pub fn sync_all(&self, inputs: &[QueryResults]) -> SyncBatchResult {
        let outcomes: Vec<(String, Result<TypeSyncResult>)> = std::thread::scope(|s| {
            let handles: Vec<_> = inputs
                .iter()
                .map(|input| {
                    let handle = s.spawn(move || self.sync_entity_type(input));
                    (input.entity_type.clone(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(entity_type, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        Err(Error::Persistence(format!("sync thread for {entity_type} panicked")))
                    });
                    (entity_type, outcome)
                })
                .collect()
        });

        let mut batch = SyncBatchResult::default();
        for (entity_type, outcome) in outcomes {
            match outcome {
                Ok(result) => batch.results.push(result),
                Err(e) => batch.failures.push((entity_type, e)),
            }
        }

        tracing::info!(
            succeeded = batch.succeeded(),
            failed = batch.failed(),
            "Batch sync finished"
        );
        batch
    }

    /// Store this coordinator writes to
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryRows;
    use serde_json::{json, Value};

    fn input(entity_type: &str, overview: &str, rows: Value) -> QueryResults {
        let rows = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().cloned().unwrap())
            .collect();
        let mut queries = QueryRows::new();
        queries.insert(overview.to_string(), rows);
        QueryResults {
            entity_type: entity_type.to_string(),
            queries,
        }
    }

    fn buyers(rows: Value) -> QueryResults {
        input("buyer", "overview_metrics", rows)
    }

    fn coordinator() -> SyncCoordinator {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        SyncCoordinator::new(db, Config::default())
    }

    #[test]
    fn test_sync_writes_entities_aggregate_and_log() {
        let coordinator = coordinator();
        let result = coordinator
            .sync_entity_type(&buyers(json!([
                {"buyer_org_id": 1, "current_period_purchases": 100, "suppliers_current": 2},
                {"buyer_org_id": 2, "current_period_purchases": 200, "suppliers_current": 4},
                {"buyer_org_id": 3, "current_period_purchases": 300, "suppliers_current": 6},
                {"buyer_org_id": null, "current_period_purchases": 600}
            ])))
            .unwrap();

        assert_eq!(result.entities, 3);
        assert!(result.summary_available);

        let db = coordinator.database();
        assert_eq!(db.count_entities("buyer").unwrap(), 3);
        let snapshot = db.get_aggregate("buyer").unwrap().unwrap();
        assert_eq!(snapshot.total_count, 3);
        assert_eq!(snapshot.metrics["current_period_purchases"].median, 200.0);
        assert_eq!(
            snapshot.platform_totals["platform_total_current_period_purchases"],
            json!(600)
        );

        let log = db.get_sync_log(5).unwrap();
        assert_eq!(log[0].status, SyncStatus::Success);
        assert_eq!(log[0].entities_count, 3);
    }

    #[test]
    fn test_unknown_type_is_config_error_and_logged() {
        let coordinator = coordinator();
        let err = coordinator
            .sync_entity_type(&input("distributor", "x", json!([])))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let log = coordinator.database().get_sync_log(1).unwrap();
        assert_eq!(log[0].status, SyncStatus::Error);
        assert!(log[0].error_message.as_deref().unwrap().contains("distributor"));
    }

    #[test]
    fn test_zero_entities_store_zero_snapshot() {
        let coordinator = coordinator();
        let result = coordinator.sync_entity_type(&buyers(json!([]))).unwrap();
        assert_eq!(result.entities, 0);
        let snapshot = coordinator.database().get_aggregate("buyer").unwrap().unwrap();
        assert_eq!(snapshot.total_count, 0);
    }

    #[test]
    fn test_sync_all_continues_past_failures() {
        let coordinator = coordinator();
        let inputs = vec![
            buyers(json!([{"buyer_org_id": 1, "current_period_purchases": 10}])),
            input("unknown", "x", json!([])),
            input(
                "seller",
                "performance_overview",
                json!([{"vendor_id": 7, "total_sales": 50, "total_buyers": 3}]),
            ),
        ];

        let batch = coordinator.sync_all(&inputs);
        assert_eq!(batch.succeeded(), 2);
        assert_eq!(batch.failed(), 1);
        assert_eq!(batch.failures[0].0, "unknown");
        assert_eq!(coordinator.database().count_entities("seller").unwrap(), 1);
    }

    #[test]
    fn test_same_type_syncs_serialize() {
        let coordinator = coordinator();
        let first = buyers(json!([
            {"buyer_org_id": 1, "current_period_purchases": 10},
            {"buyer_org_id": 2, "current_period_purchases": 20}
        ]));
        let second = buyers(json!([
            {"buyer_org_id": 3, "current_period_purchases": 30}
        ]));

        let batch = coordinator.sync_all(&[first, second]);
        assert_eq!(batch.succeeded(), 2);

        // Whichever ran last, the stored set is one complete input
        let ids = coordinator.database().list_entity_ids("buyer").unwrap();
        assert!(ids == vec!["1", "2"] || ids == vec!["3"], "mixed set: {ids:?}");
        let snapshot = coordinator.database().get_aggregate("buyer").unwrap().unwrap();
        assert_eq!(snapshot.total_count, ids.len());
    }
}
