//! Entity organizer
//!
//! Turns a flat set of named query results into per-entity baselines.
//!
//! ```text
//! QueryResults ──► organize() ──► OrganizedEntities
//!   {query: [rows]}                 ├─ entities: id → {query: [rows]}
//!                                   ├─ summaries: query → first id-less row
//!                                   └─ report (anomalies, discarded rows)
//! ```
//!
//! A row whose id column is absent or null is a summary candidate. The first
//! one per query is kept; later ones are anomalies. A row whose id column
//! holds something that is not an identifier, or that lacks a declared
//! required column, is discarded with a warning.

use crate::config::EntityTypeConfig;
use crate::types::{entity_id_from_value, MetricRow, QueryRows, Summary};
use serde_json::Value;
use std::collections::BTreeMap;

/// Counters describing what happened during organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizeReport {
    /// Distinct entities found
    pub entities: usize,
    /// Queries that yielded an authoritative summary row
    pub summary_rows: usize,
    /// Id-less rows beyond the first one of their query
    pub anomalies: usize,
    /// Rows dropped for a bad id or a missing required column
    pub discarded_rows: usize,
}

/// Result of grouping one entity type's query results.
#[derive(Debug, Clone, Default)]
pub struct OrganizedEntities {
    /// Entity id to its query rows; every known query key is present
    pub entities: BTreeMap<String, QueryRows>,
    /// Query name to its authoritative summary row
    pub summaries: BTreeMap<String, MetricRow>,
    pub report: OrganizeReport,
}

impl OrganizedEntities {
    /// Summary row of the given query as a tagged variant
    pub fn summary(&self, query_name: &str) -> Summary {
        match self.summaries.get(query_name) {
            Some(row) => Summary::Available(row.clone()),
            None => Summary::Absent,
        }
    }
}

enum RowKey {
    Entity(String),
    Unattached,
    Invalid,
}

fn row_key(row: &MetricRow, id_column: &str) -> RowKey {
    match row.get(id_column) {
        None | Some(Value::Null) => RowKey::Unattached,
        Some(value) => match entity_id_from_value(value) {
            Some(id) => RowKey::Entity(id),
            None => RowKey::Invalid,
        },
    }
}

/// Group query results by entity id.
///
/// `entity_type` is only used for log context.
pub fn organize(
    entity_type: &str,
    config: &EntityTypeConfig,
    queries: &QueryRows,
) -> OrganizedEntities {
    let id_column = config.id_column.as_str();
    let mut organized = OrganizedEntities::default();

    let mut query_names: Vec<&str> = queries.keys().map(String::as_str).collect();
    for declared in config.queries.keys() {
        if !queries.contains_key(declared) {
            tracing::debug!(
                entity_type,
                query = %declared,
                "Declared query missing from input, treating as empty"
            );
            query_names.push(declared);
        }
    }
    if !queries.contains_key(&config.overview_query)
        && !config.queries.contains_key(&config.overview_query)
    {
        query_names.push(&config.overview_query);
    }

    for (query_name, rows) in queries {
        let required = config.required_columns(query_name);

        for (index, row) in rows.iter().enumerate() {
            if let Some(missing) = required
                .iter()
                .find(|c| c.as_str() != id_column && !row.contains_key(c.as_str()))
            {
                tracing::warn!(
                    entity_type,
                    query = %query_name,
                    row = index,
                    column = %missing,
                    "Discarding row without required column"
                );
                organized.report.discarded_rows += 1;
                continue;
            }

            match row_key(row, id_column) {
                RowKey::Entity(id) => {
                    organized
                        .entities
                        .entry(id)
                        .or_default()
                        .entry(query_name.clone())
                        .or_default()
                        .push(row.clone());
                }
                RowKey::Unattached => {
                    if organized.summaries.contains_key(query_name) {
                        tracing::warn!(
                            entity_type,
                            query = %query_name,
                            row = index,
                            "Additional row without entity id ignored"
                        );
                        organized.report.anomalies += 1;
                    } else {
                        organized.summaries.insert(query_name.clone(), row.clone());
                    }
                }
                RowKey::Invalid => {
                    let value = row.get(id_column).cloned().unwrap_or(Value::Null);
                    tracing::warn!(
                        entity_type,
                        query = %query_name,
                        row = index,
                        id_column,
                        value = %value,
                        "Discarding row with unusable entity id"
                    );
                    organized.report.discarded_rows += 1;
                }
            }
        }
    }

    for entity_queries in organized.entities.values_mut() {
        for name in &query_names {
            entity_queries.entry((*name).to_string()).or_default();
        }
    }

    organized.report.entities = organized.entities.len();
    organized.report.summary_rows = organized.summaries.len();

    tracing::info!(
        entity_type,
        entities = organized.report.entities,
        summary_rows = organized.report.summary_rows,
        anomalies = organized.report.anomalies,
        discarded_rows = organized.report.discarded_rows,
        "Organized query results"
    );

    organized
}
