//! Insight record builder.

use crate::error::{Error, Result};
use crate::types::{
    AggregateSnapshot, ComparisonBreakdown, ComparisonType, DashboardPeriodMetrics, Insight,
    InsightRecord, Priority, PriorityBreakdown,
};
use chrono::Utc;

/// Inputs that describe how a record came to be, beyond its insights.
#[derive(Debug, Clone, Default)]
pub struct RecordProvenance<'a> {
    pub aggregate: Option<&'a AggregateSnapshot>,
    pub has_historical_data: bool,
    pub prompt_hash: Option<String>,
    pub rejected_count: usize,
}

/// Tally accepted insights and assemble the record.
///
/// Fails with [`Error::Invariant`] rather than emitting a record whose
/// breakdowns disagree with its insight count.
pub fn build_record(
    current: &DashboardPeriodMetrics,
    insights: Vec<Insight>,
    provenance: RecordProvenance<'_>,
) -> Result<InsightRecord> {
    let mut priorities = PriorityBreakdown::default();
    let mut comparisons = ComparisonBreakdown::default();

    for insight in &insights {
        match insight.priority {
            Priority::High => priorities.high += 1,
            Priority::Medium => priorities.medium += 1,
            Priority::Low => priorities.low += 1,
        }
        match insight.comparison_type {
            ComparisonType::SelfHistory => comparisons.self_history += 1,
            ComparisonType::Benchmark => comparisons.benchmark += 1,
            ComparisonType::Both => comparisons.both += 1,
        }
    }

    let count = insights.len();
    check_breakdowns(count, &priorities, &comparisons)?;

    Ok(InsightRecord {
        entity_type: current.entity_type.clone(),
        entity_id: current.entity_id.clone(),
        generated_at: Utc::now(),
        dashboard_period: current.period.clone(),
        insights,
        insights_count: count,
        high_priority_count: priorities.high,
        priority_breakdown: priorities,
        comparison_types: comparisons,
        baseline_version: provenance.aggregate.map(|a| a.calculated_at),
        has_historical_data: provenance.has_historical_data,
        prompt_hash: provenance.prompt_hash,
        rejected_count: provenance.rejected_count,
        source_dashboard_file: current.source.clone(),
    })
}

fn check_breakdowns(
    count: usize,
    priorities: &PriorityBreakdown,
    comparisons: &ComparisonBreakdown,
) -> Result<()> {
    if priorities.total() != count {
        return Err(Error::Invariant(format!(
            "priority breakdown sums to {}, expected {count}",
            priorities.total()
        )));
    }
    if comparisons.total() != count {
        return Err(Error::Invariant(format!(
            "comparison breakdown sums to {}, expected {count}",
            comparisons.total()
        )));
    }
    Ok(())
}

/// Re-check a record read back from disk or built elsewhere.
pub fn verify_record(record: &InsightRecord) -> Result<()> {
    if record.insights.len() != record.insights_count {
        return Err(Error::Invariant(format!(
            "{} insights but insights_count is {}",
            record.insights.len(),
            record.insights_count
        )));
    }
    if record.high_priority_count != record.priority_breakdown.high {
        return Err(Error::Invariant(
            "high_priority_count disagrees with priority breakdown".to_string(),
        ));
    }
    check_breakdowns(
        record.insights_count,
        &record.priority_breakdown,
        &record.comparison_types,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DashboardPeriod, QueryRows};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn current() -> DashboardPeriodMetrics {
        DashboardPeriodMetrics {
            entity_type: "buyer".to_string(),
            entity_id: "5098".to_string(),
            period: DashboardPeriod {
                start_date: NaiveDate::from_ymd_opt(2025, 11, 14).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 2, 12).unwrap(),
                top_n: Some(10),
            },
            queries: QueryRows::new(),
            source: None,
        }
    }

    fn insight(priority: Priority, comparison_type: ComparisonType) -> Insight {
        Insight {
            title: "Spending pattern shifted".to_string(),
            observation: "Spend moved well away from the usual range".to_string(),
            recommendation: "Review category budgets with procurement".to_string(),
            priority,
            comparison_type,
            metrics: vec![],
        }
    }

    #[test]
    fn test_counts_sum_to_insights_count() {
        let insights = vec![
            insight(Priority::High, ComparisonType::Both),
            insight(Priority::High, ComparisonType::SelfHistory),
            insight(Priority::Low, ComparisonType::Benchmark),
            insight(Priority::Medium, ComparisonType::Both),
        ];
        let snapshot = AggregateSnapshot {
            entity_type: "buyer".to_string(),
            total_count: 4,
            metrics: BTreeMap::new(),
            platform_totals: BTreeMap::new(),
            percentiles: BTreeMap::new(),
            calculated_at: Utc::now(),
        };

        let record = build_record(
            &current(),
            insights,
            RecordProvenance {
                aggregate: Some(&snapshot),
                has_historical_data: true,
                prompt_hash: Some("abc".to_string()),
                rejected_count: 2,
            },
        )
        .unwrap();

        assert_eq!(record.insights_count, 4);
        assert_eq!(record.high_priority_count, 2);
        assert_eq!(record.comparison_types.total(), record.insights_count);
        assert_eq!(record.comparison_types.both, 2);
        assert_eq!(record.priority_breakdown.total(), 4);
        assert_eq!(record.baseline_version, Some(snapshot.calculated_at));
        assert_eq!(record.dashboard_period, current().period);
        assert_eq!(record.rejected_count, 2);
        verify_record(&record).unwrap();
    }

    #[test]
    fn test_empty_record_without_aggregate() {
        let record = build_record(&current(), vec![], RecordProvenance::default()).unwrap();
        assert_eq!(record.insights_count, 0);
        assert_eq!(record.comparison_types.total(), 0);
        assert!(record.baseline_version.is_none());
        assert!(!record.has_historical_data);
    }

    #[test]
    fn test_verify_detects_tampered_counts() {
        let mut record = build_record(
            &current(),
            vec![insight(Priority::Low, ComparisonType::Benchmark)],
            RecordProvenance::default(),
        )
        .unwrap();
        record.comparison_types.both += 1;
        assert!(matches!(verify_record(&record), Err(Error::Invariant(_))));
    }
}
