use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ensure_non_empty, ComplianceBandTable, RiskError};

pub const PSAP_MAX_TOTAL: f64 = 20.0;
const STANDARD_SCORE_MAX: f64 = 10.0;
const WEIGHT_TOTAL: f64 = 100.0;
const WEIGHT_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PsapStandardScore {
    pub code: String,
    /// Percentage weight; all weights in a scorecard sum to 100.
    pub weight: f64,
    /// Assessed score on the 0-10 scale.
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PsapScorecard {
    pub standards: Vec<PsapStandardScore>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PsapResult {
    pub weighted_total: f64,
    pub max_total: f64,
    pub label: String,
}

impl PsapScorecard {
    /// # Errors
    /// Returns [`RiskError::Validation`] for empty scorecards, duplicate or
    /// blank codes, scores outside 0-10, non-positive weights, or weights
    /// that do not sum to 100.
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.standards.is_empty() {
            return Err(RiskError::Validation(
                "PSAP scorecard MUST contain at least one standard".to_string(),
            ));
        }

        let mut codes = BTreeSet::new();
        let mut weight_sum = 0.0;
        for standard in &self.standards {
            ensure_non_empty("standard code", &standard.code)?;
            if !codes.insert(standard.code.as_str()) {
                return Err(RiskError::Validation(format!(
                    "duplicate PSAP standard {}",
                    standard.code
                )));
            }
            if !(0.0..=STANDARD_SCORE_MAX).contains(&standard.score) {
                return Err(RiskError::Validation(format!(
                    "standard {} score MUST be in [0, 10]",
                    standard.code
                )));
            }
            if !standard.weight.is_finite() || standard.weight <= 0.0 {
                return Err(RiskError::Validation(format!(
                    "standard {} weight MUST be > 0",
                    standard.code
                )));
            }
            weight_sum += standard.weight;
        }

        if (weight_sum - WEIGHT_TOTAL).abs() > WEIGHT_TOLERANCE {
            return Err(RiskError::Validation(format!(
                "PSAP weights MUST sum to 100, got {weight_sum}"
            )));
        }

        Ok(())
    }

    /// Weighted total on the 0-20 scale.
    ///
    /// # Errors
    /// See [`Self::validate`].
    pub fn weighted_total(&self) -> Result<f64, RiskError> {
        self.validate()?;
        let weighted: f64 = self
            .standards
            .iter()
            .map(|standard| standard.score * standard.weight)
            .sum();
        Ok(weighted / WEIGHT_TOTAL * (PSAP_MAX_TOTAL / STANDARD_SCORE_MAX))
    }

    /// # Errors
    /// Returns [`RiskError::Validation`] for invalid scorecards and
    /// [`RiskError::Configuration`] when `table` cannot rate the total.
    pub fn evaluate(&self, table: &ComplianceBandTable) -> Result<PsapResult, RiskError> {
        let weighted_total = self.weighted_total()?;
        Ok(PsapResult {
            weighted_total,
            max_total: PSAP_MAX_TOTAL,
            label: table.rate(weighted_total)?.to_string(),
        })
    }
}
