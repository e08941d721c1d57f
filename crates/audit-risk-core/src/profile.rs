use serde::Serialize;

use crate::{
    score, AssessmentInput, AssessmentKind, RatingBandTable, RiskAssessment, RiskError, SCALE_MAX,
    SCALE_MIN,
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HeatMapCell {
    pub likelihood: u8,
    pub impact: u8,
    pub score: u8,
    pub rating: String,
}

/// Full 5x5 matrix, rows from Almost Certain down to Rare and columns from
/// Insignificant up to Catastrophic.
///
/// # Errors
/// Returns [`RiskError::Configuration`] when `table` has no band for a cell.
pub fn heat_map(table: &RatingBandTable) -> Result<Vec<HeatMapCell>, RiskError> {
    let mut cells = Vec::with_capacity(25);
    for likelihood in (SCALE_MIN..=SCALE_MAX).rev() {
        for impact in SCALE_MIN..=SCALE_MAX {
            let score = score(likelihood, impact)?;
            cells.push(HeatMapCell {
                likelihood,
                impact,
                score,
                rating: table.rate(i32::from(score))?.to_string(),
            });
        }
    }
    Ok(cells)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RiskProfileBucket {
    pub rating: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RiskProfile {
    pub band_table: String,
    pub total: usize,
    pub buckets: Vec<RiskProfileBucket>,
    pub highest_rating: Option<String>,
}

/// Re-rates every input against `table` and counts them per band, most
/// severe band first.
///
/// # Errors
/// Returns [`RiskError::Validation`] for off-scale inputs and
/// [`RiskError::Configuration`] when `table` cannot rate a score.
pub fn risk_profile(
    inputs: &[AssessmentInput],
    table: &RatingBandTable,
) -> Result<RiskProfile, RiskError> {
    let mut counts = vec![0_usize; table.bands().len()];
    let mut highest: Option<usize> = None;

    for input in inputs {
        let assessed = RiskAssessment::assess(AssessmentKind::ProfileItem, *input, table)?;
        let rank = table.severity_rank(assessed.rating()).ok_or_else(|| {
            RiskError::Configuration(format!(
                "rating {} missing from table {}",
                assessed.rating(),
                table.name()
            ))
        })?;
        counts[rank] += 1;
        highest = Some(highest.map_or(rank, |current| current.min(rank)));
    }

    let buckets = table
        .bands()
        .iter()
        .zip(counts)
        .map(|(band, count)| RiskProfileBucket {
            rating: band.label.clone(),
            count,
        })
        .collect();

    Ok(RiskProfile {
        band_table: table.name().to_string(),
        total: inputs.len(),
        buckets,
        highest_rating: highest.map(|rank| table.bands()[rank].label.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn heat_map_covers_every_cell_in_display_order() {
        let cells = must_ok(heat_map(&RatingBandTable::heat_map()));
        assert_eq!(cells.len(), 25);
        assert_eq!((cells[0].likelihood, cells[0].impact), (5, 1));
        assert_eq!((cells[24].likelihood, cells[24].impact), (1, 5));
        assert!(cells.iter().all(|cell| cell.score == cell.likelihood * cell.impact));

        let top_right = &cells[4];
        assert_eq!(top_right.score, 25);
        assert_eq!(top_right.rating, "Extreme");
    }

    #[test]
    fn heat_map_surfaces_incomplete_tables() {
        let partial = must_ok(RatingBandTable::new(
            "partial",
            vec![crate::Band {
                min_score_inclusive: 10,
                label: "High".to_string(),
            }],
        ));
        assert!(matches!(
            heat_map(&partial),
            Err(RiskError::Configuration(_))
        ));
    }

    #[test]
    fn profile_counts_per_band_and_tracks_worst() {
        let inputs = [
            AssessmentInput {
                likelihood: 1,
                impact: 2,
            },
            AssessmentInput {
                likelihood: 3,
                impact: 4,
            },
            AssessmentInput {
                likelihood: 2,
                impact: 5,
            },
            AssessmentInput {
                likelihood: 2,
                impact: 2,
            },
        ];
        let profile = must_ok(risk_profile(&inputs, &RatingBandTable::register()));

        assert_eq!(profile.total, 4);
        let counts: Vec<(String, usize)> = profile
            .buckets
            .iter()
            .map(|bucket| (bucket.rating.clone(), bucket.count))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("Extreme".to_string(), 0),
                ("High".to_string(), 2),
                ("Moderate".to_string(), 0),
                ("Low".to_string(), 2),
            ]
        );
        assert_eq!(profile.highest_rating.as_deref(), Some("High"));
    }

    #[test]
    fn empty_profile_has_no_highest_rating() {
        let profile = must_ok(risk_profile(&[], &RatingBandTable::heat_map()));
        assert_eq!(profile.total, 0);
        assert!(profile.highest_rating.is_none());
        assert!(profile.buckets.iter().all(|bucket| bucket.count == 0));
    }
}
