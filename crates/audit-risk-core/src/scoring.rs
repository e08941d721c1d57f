use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{RatingBandTable, RiskError};

pub const SCALE_MIN: u8 = 1;
pub const SCALE_MAX: u8 = 5;

pub const LIKELIHOOD_LABELS: [&str; 5] =
    ["Rare", "Unlikely", "Possible", "Likely", "Almost Certain"];
pub const IMPACT_LABELS: [&str; 5] =
    ["Insignificant", "Minor", "Moderate", "Major", "Catastrophic"];

/// Multiplies likelihood by impact.
///
/// # Errors
/// Returns [`RiskError::Validation`] when either input is outside
/// `[SCALE_MIN, SCALE_MAX]`. Inputs are never clamped.
pub fn score(likelihood: u8, impact: u8) -> Result<u8, RiskError> {
    ensure_on_scale("likelihood", likelihood)?;
    ensure_on_scale("impact", impact)?;
    Ok(likelihood * impact)
}

fn ensure_on_scale(field: &str, value: u8) -> Result<(), RiskError> {
    if !(SCALE_MIN..=SCALE_MAX).contains(&value) {
        return Err(RiskError::Validation(format!(
            "{field} MUST be in [{SCALE_MIN}, {SCALE_MAX}], got {value}"
        )));
    }
    Ok(())
}

/// Accepts either the numeric level or its qualitative label.
///
/// # Errors
/// Returns [`RiskError::Validation`] for unknown labels or out-of-range levels.
pub fn parse_likelihood(raw: &str) -> Result<u8, RiskError> {
    parse_level("likelihood", raw, &LIKELIHOOD_LABELS)
}

/// Accepts either the numeric level or its qualitative label.
///
/// # Errors
/// Returns [`RiskError::Validation`] for unknown labels or out-of-range levels.
pub fn parse_impact(raw: &str) -> Result<u8, RiskError> {
    parse_level("impact", raw, &IMPACT_LABELS)
}

#[must_use]
pub fn likelihood_label(value: u8) -> Option<&'static str> {
    level_label(value, &LIKELIHOOD_LABELS)
}

#[must_use]
pub fn impact_label(value: u8) -> Option<&'static str> {
    level_label(value, &IMPACT_LABELS)
}

fn level_label(value: u8, labels: &[&'static str; 5]) -> Option<&'static str> {
    let index = usize::from(value.checked_sub(SCALE_MIN)?);
    labels.get(index).copied()
}

fn parse_level(field: &str, raw: &str, labels: &[&str; 5]) -> Result<u8, RiskError> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<u8>() {
        ensure_on_scale(field, value)?;
        return Ok(value);
    }

    let wanted = normalize_label(trimmed);
    labels
        .iter()
        .zip(SCALE_MIN..=SCALE_MAX)
        .find(|(label, _)| normalize_label(label) == wanted)
        .map(|(_, value)| value)
        .ok_or_else(|| RiskError::Validation(format!("unknown {field} level: {raw}")))
}

fn normalize_label(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !matches!(ch, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentKind {
    Inherent,
    Residual,
    ProfileItem,
}

impl AssessmentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inherent => "inherent",
            Self::Residual => "residual",
            Self::ProfileItem => "profile_item",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inherent" => Some(Self::Inherent),
            "residual" => Some(Self::Residual),
            "profile_item" => Some(Self::ProfileItem),
            _ => None,
        }
    }
}

/// Raw likelihood/impact pair as entered by a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssessmentInput {
    pub likelihood: u8,
    pub impact: u8,
}

/// A scored assessment. `score` and `rating` are derived and can only be
/// produced through [`RiskAssessment::assess`].
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct RiskAssessment {
    kind: AssessmentKind,
    likelihood: u8,
    impact: u8,
    score: u8,
    rating: String,
}

impl RiskAssessment {
    /// # Errors
    /// Returns [`RiskError::Validation`] for off-scale inputs and
    /// [`RiskError::Configuration`] when `table` cannot rate the score.
    pub fn assess(
        kind: AssessmentKind,
        input: AssessmentInput,
        table: &RatingBandTable,
    ) -> Result<Self, RiskError> {
        let score = score(input.likelihood, input.impact)?;
        let rating = table.rate(i32::from(score))?.to_string();
        Ok(Self {
            kind,
            likelihood: input.likelihood,
            impact: input.impact,
            score,
            rating,
        })
    }

    #[must_use]
    pub fn kind(&self) -> AssessmentKind {
        self.kind
    }

    #[must_use]
    pub fn likelihood(&self) -> u8 {
        self.likelihood
    }

    #[must_use]
    pub fn impact(&self) -> u8 {
        self.impact
    }

    #[must_use]
    pub fn input(&self) -> AssessmentInput {
        AssessmentInput {
            likelihood: self.likelihood,
            impact: self.impact,
        }
    }

    #[must_use]
    pub fn score(&self) -> u8 {
        self.score
    }

    #[must_use]
    pub fn rating(&self) -> &str {
        &self.rating
    }

    /// True when previously stored derived values agree with this assessment.
    #[must_use]
    pub fn matches_stored(&self, stored_score: i64, stored_rating: &str) -> bool {
        stored_score == i64::from(self.score) && stored_rating == self.rating
    }
}

impl Display for RiskAssessment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}x{}={} ({})",
            self.kind.as_str(),
            self.likelihood,
            self.impact,
            self.score,
            self.rating
        )
    }
}
