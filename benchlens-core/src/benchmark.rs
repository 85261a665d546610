//! Benchmark comparator and classifier
//!
//! For each monitored metric (the entity type's value columns) the current
//! dashboard value is compared against:
//! - the entity's own baseline (`self_pct`)
//! - the platform aggregate mean or median (`benchmark_pct`)
//!
//! A zero or non-finite reference makes that side undefined; it is left out
//! rather than reported as infinity.
//!
//! The classifier turns deviations into a priority and a comparison type.
//! Thresholds are inclusive: a 30.0% self deviation is high with defaults.

use crate::config::{BenchmarkReference, ClassificationMode, EntityTypeConfig, Thresholds};
use crate::types::{
    row_number, AggregateSnapshot, ComparisonType, DashboardPeriodMetrics, EntityBaseline,
    Insight, Priority,
};
use serde::Serialize;

/// Relative change from `reference` to `current`, in percent.
///
/// `None` when the reference is zero or either value is not finite.
pub fn deviation_pct(current: f64, reference: f64) -> Option<f64> {
    if reference == 0.0 || !reference.is_finite() || !current.is_finite() {
        return None;
    }
    let pct = (current - reference) / reference * 100.0;
    pct.is_finite().then_some(pct)
}

/// Deviations of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deviation {
    pub metric: String,
    pub current: Option<f64>,
    pub baseline: Option<f64>,
    pub benchmark: Option<f64>,
    pub self_pct: Option<f64>,
    pub benchmark_pct: Option<f64>,
}

/// All metric deviations for one entity's current period.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Comparison {
    pub deviations: Vec<Deviation>,
}

impl Comparison {
    /// Deviations for the cited metric names, in citation order.
    ///
    /// Names are matched case-insensitively; unknown names are skipped.
    pub fn cited<'a>(&'a self, metrics: &[String]) -> Vec<&'a Deviation> {
        metrics
            .iter()
            .filter_map(|name| {
                let name = name.trim();
                self.deviations
                    .iter()
                    .find(|d| d.metric.eq_ignore_ascii_case(name))
            })
            .collect()
    }

    pub fn get(&self, metric: &str) -> Option<&Deviation> {
        self.deviations.iter().find(|d| d.metric == metric)
    }
}

/// Compare current-period metrics against baseline and aggregate.
pub fn compare(
    config: &EntityTypeConfig,
    current: &DashboardPeriodMetrics,
    baseline: &EntityBaseline,
    aggregate: Option<&AggregateSnapshot>,
    reference: BenchmarkReference,
) -> Comparison {
    let current_row = current.first_row(&config.overview_query);
    let baseline_row = baseline.first_row(&config.overview_query);
    let use_median = reference == BenchmarkReference::Median;

    let deviations = config
        .value_columns
        .iter()
        .map(|metric| {
            let current = current_row.and_then(|row| row_number(row, metric));
            let baseline = baseline_row.and_then(|row| row_number(row, metric));
            let benchmark = aggregate
                .filter(|a| a.total_count > 0)
                .and_then(|a| a.reference(metric, use_median));

            Deviation {
                metric: metric.clone(),
                current,
                baseline,
                benchmark,
                self_pct: current.zip(baseline).and_then(|(c, b)| deviation_pct(c, b)),
                benchmark_pct: current.zip(benchmark).and_then(|(c, b)| deviation_pct(c, b)),
            }
        })
        .collect();

    Comparison { deviations }
}

/// Derived classification for a set of cited metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub priority: Priority,
    /// `None` when no cited metric moves enough on either side
    pub comparison_type: Option<ComparisonType>,
}

/// Priority and comparison-type rules over deviation percentages.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    thresholds: Thresholds,
}

impl Classifier {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// Priority of one metric's deviations
    pub fn priority(&self, self_pct: Option<f64>, benchmark_pct: Option<f64>) -> Priority {
        let t = &self.thresholds;
        let s = self_pct.map(f64::abs).unwrap_or(0.0);
        let b = benchmark_pct.map(f64::abs).unwrap_or(0.0);

        if s >= t.self_high || b >= t.benchmark_high {
            Priority::High
        } else if s >= t.self_medium || b >= t.benchmark_medium {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    fn self_meaningful(&self, d: &Deviation) -> bool {
        d.self_pct
            .is_some_and(|p| p.abs() >= self.thresholds.self_medium)
    }

    fn benchmark_meaningful(&self, d: &Deviation) -> bool {
        d.benchmark_pct
            .is_some_and(|p| p.abs() >= self.thresholds.benchmark_medium)
    }

    /// Classify the cited deviations.
    ///
    /// Priority is the highest across metrics. `None` when no cited metric
    /// has a defined deviation on either side.
    pub fn classify(&self, cited: &[&Deviation]) -> Option<Classification> {
        let defined: Vec<&&Deviation> = cited
            .iter()
            .filter(|d| d.self_pct.is_some() || d.benchmark_pct.is_some())
            .collect();
        if defined.is_empty() {
            return None;
        }

        let priority = defined
            .iter()
            .map(|d| self.priority(d.self_pct, d.benchmark_pct))
            .min()
            .unwrap_or(Priority::Low);

        let any_self = defined.iter().any(|d| self.self_meaningful(d));
        let any_benchmark = defined.iter().any(|d| self.benchmark_meaningful(d));
        let comparison_type = match (any_self, any_benchmark) {
            (true, true) => Some(ComparisonType::Both),
            (true, false) => Some(ComparisonType::SelfHistory),
            (false, true) => Some(ComparisonType::Benchmark),
            (false, false) => None,
        };

        Some(Classification {
            priority,
            comparison_type,
        })
    }

    /// Reconcile an accepted insight's claimed classification with the numbers.
    ///
    /// In `Claimed` mode the claim is kept and disagreement is only logged.
    /// In `Derived` mode each derivable field is overwritten. Returns whether
    /// the insight changed.
    pub fn reconcile(
        &self,
        insight: &mut Insight,
        comparison: &Comparison,
        mode: ClassificationMode,
    ) -> bool {
        let Some(derived) = self.classify(&comparison.cited(&insight.metrics)) else {
            return false;
        };

        let priority_differs = derived.priority != insight.priority;
        let comparison_differs = derived
            .comparison_type
            .is_some_and(|c| c != insight.comparison_type);

        if !priority_differs && !comparison_differs {
            return false;
        }

        tracing::debug!(
            title = %insight.title,
            claimed_priority = %insight.priority,
            derived_priority = %derived.priority,
            claimed_comparison = %insight.comparison_type,
            derived_comparison = ?derived.comparison_type.map(|c| c.as_str()),
            "Claimed classification disagrees with deviations"
        );

        match mode {
            ClassificationMode::Claimed => false,
            ClassificationMode::Derived => {
                insight.priority = derived.priority;
                if let Some(comparison_type) = derived.comparison_type {
                    insight.comparison_type = comparison_type;
                }
                true
            }
        }
    }
}
