//! Insight validator.
//!
//! Structural, length and enum checks on collaborator candidates. A failing
//! candidate is dropped whole; nothing is repaired or truncated, and the
//! accepted candidates keep their original order.

use crate::config::ValidationConfig;
use crate::error::{Error, Result};
use crate::types::{ComparisonType, Insight, InsightCandidate, Priority};

/// Outcome of validating a batch of candidates.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub accepted: Vec<Insight>,
    /// Titles (or `<untitled>`) paired with the rejection reason
    pub rejected: Vec<(String, String)>,
}

pub struct InsightValidator {
    rules: ValidationConfig,
}

fn required<'a>(field: &'static str, value: &'a Option<String>) -> std::result::Result<&'a str, String> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(format!("missing {field}")),
    }
}

impl InsightValidator {
    pub fn new(rules: ValidationConfig) -> Self {
        Self { rules }
    }

    /// Validate one candidate.
    pub fn validate(&self, candidate: &InsightCandidate) -> Result<Insight> {
        self.check(candidate).map_err(|reason| Error::Validation {
            title: candidate
                .title
                .clone()
                .unwrap_or_else(|| "<untitled>".to_string()),
            reason,
        })
    }

    fn check(&self, candidate: &InsightCandidate) -> std::result::Result<Insight, String> {
        let rules = &self.rules;

        let title = required("title", &candidate.title)?;
        let observation = required("observation", &candidate.observation)?;
        let recommendation = required("recommendation", &candidate.recommendation)?;
        let priority = required("priority", &candidate.priority)?;
        let comparison_type = required("comparison_type", &candidate.comparison_type)?;

        let title_len = title.chars().count();
        if title_len < rules.min_title_length || title_len > rules.max_title_length {
            return Err(format!(
                "title length {title_len} outside {}..={}",
                rules.min_title_length, rules.max_title_length
            ));
        }

        let observation_len = observation.chars().count();
        if observation_len < rules.min_observation_length {
            return Err(format!(
                "observation length {observation_len} below {}",
                rules.min_observation_length
            ));
        }

        let recommendation_len = recommendation.chars().count();
        if recommendation_len < rules.min_recommendation_length {
            return Err(format!(
                "recommendation length {recommendation_len} below {}",
                rules.min_recommendation_length
            ));
        }

        let priority: Priority = priority.parse()?;
        let comparison_type: ComparisonType = comparison_type.parse()?;

        if candidate.metrics.len() > rules.max_metrics_per_insight {
            return Err(format!(
                "{} metrics exceed limit of {}",
                candidate.metrics.len(),
                rules.max_metrics_per_insight
            ));
        }

        Ok(Insight {
            title: title.to_string(),
            observation: observation.to_string(),
            recommendation: recommendation.to_string(),
            priority,
            comparison_type,
            metrics: candidate.metrics.clone(),
        })
    }

    /// Validate candidates in order, dropping failures.
    pub fn validate_all(&self, candidates: &[InsightCandidate]) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        for candidate in candidates {
            match self.validate(candidate) {
                Ok(insight) => outcome.accepted.push(insight),
                Err(Error::Validation { title, reason }) => {
                    tracing::warn!(title = %title, reason = %reason, "Skipping invalid insight");
                    outcome.rejected.push((title, reason));
                }
                Err(other) => {
                    tracing::warn!(error = %other, "Skipping invalid insight");
                    outcome.rejected.push(("<untitled>".to_string(), other.to_string()));
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> InsightValidator {
        InsightValidator::new(ValidationConfig::default())
    }

    fn valid() -> InsightCandidate {
        InsightCandidate {
            title: Some("Supplier base shrank".to_string()),
            observation: Some("Active suppliers fell from 20 to 5 this quarter".to_string()),
            recommendation: Some("Re-engage two lapsed suppliers per category".to_string()),
            priority: Some("high".to_string()),
            comparison_type: Some("self".to_string()),
            metrics: vec!["suppliers_current".to_string()],
        }
    }

    fn rejected(candidate: InsightCandidate) -> bool {
        matches!(validator().validate(&candidate), Err(Error::Validation { .. }))
    }

    #[test]
    fn test_valid_candidate_accepted() {
        let insight = validator().validate(&valid()).unwrap();
        assert_eq!(insight.priority, Priority::High);
        assert_eq!(insight.comparison_type, ComparisonType::SelfHistory);
    }

    #[test]
    fn test_short_title_rejected() {
        assert!(rejected(InsightCandidate {
            title: Some("Short".to_string()),
            ..valid()
        }));
    }

    #[test]
    fn test_long_title_rejected() {
        assert!(rejected(InsightCandidate {
            title: Some("x".repeat(101)),
            ..valid()
        }));
        assert!(!rejected(InsightCandidate {
            title: Some("x".repeat(100)),
            ..valid()
        }));
    }

    #[test]
    fn test_short_observation_rejected() {
        assert!(rejected(InsightCandidate {
            observation: Some("Ten chars!".to_string()),
            ..valid()
        }));
    }

    #[test]
    fn test_short_recommendation_rejected() {
        assert!(rejected(InsightCandidate {
            recommendation: Some("Do more".to_string()),
            ..valid()
        }));
    }

    #[test]
    fn test_unknown_priority_rejected() {
        assert!(rejected(InsightCandidate {
            priority: Some("urgent".to_string()),
            ..valid()
        }));
    }

    #[test]
    fn test_unknown_comparison_type_rejected() {
        assert!(rejected(InsightCandidate {
            comparison_type: Some("peer".to_string()),
            ..valid()
        }));
    }

    #[test]
    fn test_too_many_metrics_rejected() {
        assert!(rejected(InsightCandidate {
            metrics: (0..6).map(|i| format!("m{i}")).collect(),
            ..valid()
        }));
        assert!(!rejected(InsightCandidate {
            metrics: (0..5).map(|i| format!("m{i}")).collect(),
            ..valid()
        }));
    }

    #[test]
    fn test_missing_or_blank_fields_rejected() {
        assert!(rejected(InsightCandidate {
            title: None,
            ..valid()
        }));
        assert!(rejected(InsightCandidate {
            recommendation: Some("   ".to_string()),
            ..valid()
        }));
        assert!(rejected(InsightCandidate {
            comparison_type: None,
            ..valid()
        }));
    }

    #[test]
    fn test_title_length_counts_characters() {
        // 10 characters, 20 bytes
        assert!(!rejected(InsightCandidate {
            title: Some("éééééééééé".to_string()),
            ..valid()
        }));
    }

    #[test]
    fn test_padding_counts_towards_length_and_is_kept() {
        // 7 letters plus 3 spaces of padding reach the minimum of 10
        let padded = validator()
            .validate(&InsightCandidate {
                title: Some(" Restock  ".to_string()),
                ..valid()
            })
            .unwrap();
        assert_eq!(padded.title, " Restock  ");

        // 9 letters without padding stay short
        assert!(rejected(InsightCandidate {
            title: Some("Restocked".to_string()),
            ..valid()
        }));
        assert!(rejected(InsightCandidate {
            priority: Some(" high".to_string()),
            ..valid()
        }));
    }

    #[test]
    fn test_validate_all_preserves_order() {
        let second = InsightCandidate {
            title: Some("Second valid insight".to_string()),
            ..valid()
        };
        let bad = InsightCandidate {
            priority: Some("urgent".to_string()),
            ..valid()
        };
        let outcome = validator().validate_all(&[valid(), bad, second]);

        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.accepted[0].title, "Supplier base shrank");
        assert_eq!(outcome.accepted[1].title, "Second valid insight");
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].0, "Supplier base shrank");
    }
}
