//! Aggregate calculator
//!
//! Computes population statistics per value column over the entities of one
//! type. Only entities with at least one overview row contribute; the first
//! overview row supplies the value, and a missing or null value counts as 0.
//! Sparse columns are the exception: there a null, missing or zero value means
//! the entity did not report the metric, so it is left out of that column's
//! statistics while still counting towards `total_count`.
//!
//! Percentiles use linear interpolation between closest ranks, matching
//! numpy's default `linear` method exactly (including its switch to
//! interpolating from the upper neighbour once the fraction reaches 0.5).
//!
//! A platform summary row, when present, is copied into `platform_totals`
//! and never mixed into the per-entity statistics.

use crate::config::EntityTypeConfig;
use crate::types::{
    percentile_key, row_number, AggregateSnapshot, MetricRow, MetricStats, QueryRows, Summary,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;

/// Linear-interpolation percentile of an ascending-sorted slice.
///
/// `rank` is in percent (0..=100). Returns 0.0 for an empty slice.
pub fn percentile(sorted: &[f64], rank: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let q = (rank / 100.0).clamp(0.0, 1.0);
    let virtual_index = (n - 1) as f64 * q;
    let lo = virtual_index.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let t = virtual_index - lo as f64;
    let (a, b) = (sorted[lo], sorted[hi]);
    let diff = b - a;
    if t >= 0.5 {
        b - diff * (1.0 - t)
    } else {
        a + diff * t
    }
}

/// Arithmetic mean; 0.0 for no values.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (ddof = 0); 0.0 for no values.
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Statistics for one column's values.
pub fn metric_stats(values: &[f64]) -> MetricStats {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    MetricStats {
        mean: mean(values),
        median: percentile(&sorted, 50.0),
        std: population_std(values),
    }
}

fn percentile_table(values: &[f64], ranks: &[f64]) -> BTreeMap<String, f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    ranks
        .iter()
        .map(|rank| (percentile_key(*rank), percentile(&sorted, *rank)))
        .collect()
}

/// Copy numeric summary fields to `platform_total_<field>`.
fn platform_totals(summary: &Summary, id_column: &str) -> BTreeMap<String, Value> {
    let Summary::Available(row) = summary else {
        return BTreeMap::new();
    };

    row.iter()
        .filter(|(field, _)| field.as_str() != id_column)
        .filter_map(|(field, value)| {
            let copied = match value {
                Value::Number(_) => value.clone(),
                Value::String(s) => {
                    let parsed = s.trim().parse::<f64>().ok()?;
                    serde_json::Number::from_f64(parsed).map(Value::Number)?
                }
                _ => return None,
            };
            Some((format!("platform_total_{field}"), copied))
        })
        .collect()
}

/// Compute the aggregate snapshot for one entity type.
pub fn calculate(
    entity_type: &str,
    config: &EntityTypeConfig,
    entities: &BTreeMap<String, QueryRows>,
    summary: &Summary,
    percentile_ranks: &[f64],
) -> AggregateSnapshot {
    let overview_rows: Vec<&MetricRow> = entities
        .values()
        .filter_map(|queries| queries.get(&config.overview_query)?.first())
        .collect();

    let mut metrics = BTreeMap::new();
    let mut percentiles = BTreeMap::new();

    for column in &config.value_columns {
        let values: Vec<f64> = if config.is_sparse(column) {
            overview_rows
                .iter()
                .filter_map(|row| row_number(row, column))
                .filter(|value| *value != 0.0)
                .collect()
        } else {
            overview_rows
                .iter()
                .map(|row| row_number(row, column).unwrap_or(0.0))
                .collect()
        };

        metrics.insert(column.clone(), metric_stats(&values));
        percentiles.insert(column.clone(), percentile_table(&values, percentile_ranks));
    }

    let snapshot = AggregateSnapshot {
        entity_type: entity_type.to_string(),
        total_count: overview_rows.len(),
        metrics,
        platform_totals: platform_totals(summary, &config.id_column),
        percentiles,
        calculated_at: Utc::now(),
    };

    match summary {
        Summary::Available(_) => tracing::info!(
            entity_type,
            total_count = snapshot.total_count,
            platform_totals = snapshot.platform_totals.len(),
            "Calculated aggregates with platform summary row"
        ),
        Summary::Absent => tracing::info!(
            entity_type,
            total_count = snapshot.total_count,
            "Calculated aggregates from entity rows only"
        ),
    }

    if snapshot.total_count == 0 {
        tracing::warn!(entity_type, "No contributing entities, statistics are zero");
    }

    snapshot
}
