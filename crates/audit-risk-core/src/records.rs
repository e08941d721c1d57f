use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{
    ensure_can_create_risk, ensure_non_empty, AssessmentInput, Priority, RiskAssessment,
    RiskError, RiskEventStatus, SourceType,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskEvent {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub source_type: SourceType,
    pub priority: Priority,
    pub is_override: bool,
    pub status: RiskEventStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRiskEvent {
    pub title: String,
    pub description: Option<String>,
    pub source_type: SourceType,
    pub priority: Priority,
    pub is_override: bool,
}

impl NewRiskEvent {
    /// # Errors
    /// Returns [`RiskError::Validation`] when the title is blank.
    pub fn validate(&self) -> Result<(), RiskError> {
        ensure_non_empty("title", &self.title)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Engagement {
    pub id: Ulid,
    pub risk_event_id: Ulid,
    pub title: String,
    pub lead_auditor: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewEngagement {
    pub risk_event_id: Ulid,
    pub title: String,
    pub lead_auditor: Option<String>,
}

impl NewEngagement {
    /// # Errors
    /// Returns [`RiskError::Validation`] when the title is blank.
    pub fn validate(&self) -> Result<(), RiskError> {
        ensure_non_empty("title", &self.title)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegalReference {
    pub instrument: String,
    pub section: Option<String>,
}

impl LegalReference {
    /// Parses `instrument` or `instrument#section`.
    ///
    /// # Errors
    /// Returns [`RiskError::Validation`] when the instrument part is blank.
    pub fn parse(raw: &str) -> Result<Self, RiskError> {
        let (instrument, section) = match raw.split_once('#') {
            Some((instrument, section)) => (instrument.trim(), Some(section.trim())),
            None => (raw.trim(), None),
        };
        let reference = Self {
            instrument: instrument.to_string(),
            section: section
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
        };
        reference.validate()?;
        Ok(reference)
    }

    /// # Errors
    /// Returns [`RiskError::Validation`] when the instrument is blank.
    pub fn validate(&self) -> Result<(), RiskError> {
        ensure_non_empty("legal reference instrument", &self.instrument)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RiskRegisterEntry {
    pub id: Ulid,
    pub title: String,
    pub category: String,
    pub band_table: String,
    pub inherent: RiskAssessment,
    pub residual: Option<RiskAssessment>,
    pub legal_references: Vec<LegalReference>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRisk {
    pub title: String,
    pub category: String,
    pub band_table: String,
    pub inherent: AssessmentInput,
    pub residual: Option<AssessmentInput>,
    pub legal_references: Vec<LegalReference>,
}

impl NewRisk {
    /// Validates a register entry before insert.
    ///
    /// # Errors
    /// Returns [`RiskError::Validation`] for blank fields and
    /// [`RiskError::Precondition`] when no legal reference is attached.
    pub fn validate(&self) -> Result<(), RiskError> {
        ensure_non_empty("title", &self.title)?;
        ensure_non_empty("category", &self.category)?;
        ensure_non_empty("band_table", &self.band_table)?;
        ensure_can_create_risk(self.legal_references.len())?;
        for reference in &self.legal_references {
            reference.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KraStatus {
    NotStarted,
    OnTrack,
    Behind,
    Completed,
}

impl KraStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::OnTrack => "on_track",
            Self::Behind => "behind",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Self::NotStarted),
            "on_track" => Some(Self::OnTrack),
            "behind" => Some(Self::Behind),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KraProgress {
    pub kra_activity_id: String,
    pub financial_year: String,
    pub quarter: u8,
    pub target: f64,
    pub actual: f64,
    pub status: KraStatus,
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KraProgressInput {
    pub kra_activity_id: String,
    pub financial_year: String,
    pub quarter: u8,
    pub target: f64,
    pub actual: f64,
    pub status: KraStatus,
    pub comment: Option<String>,
}

impl KraProgressInput {
    /// # Errors
    /// Returns [`RiskError::Validation`] when the natural key is incomplete,
    /// the quarter is outside 1-4, or a figure is negative or not finite.
    pub fn validate(&self) -> Result<(), RiskError> {
        ensure_non_empty("kra_activity_id", &self.kra_activity_id)?;
        ensure_non_empty("financial_year", &self.financial_year)?;

        if !(1..=4).contains(&self.quarter) {
            return Err(RiskError::Validation(format!(
                "quarter MUST be in [1, 4], got {}",
                self.quarter
            )));
        }

        for (name, value) in [("target", self.target), ("actual", self.actual)] {
            if !value.is_finite() || value < 0.0 {
                return Err(RiskError::Validation(format!(
                    "{name} MUST be a non-negative number"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_risk() -> NewRisk {
        NewRisk {
            title: "Unreconciled suspense accounts".to_string(),
            category: "Financial".to_string(),
            band_table: "register".to_string(),
            inherent: AssessmentInput {
                likelihood: 4,
                impact: 4,
            },
            residual: None,
            legal_references: vec![LegalReference {
                instrument: "Public Finance Management Act".to_string(),
                section: Some("s.38".to_string()),
            }],
        }
    }

    fn fixture_kra() -> KraProgressInput {
        KraProgressInput {
            kra_activity_id: "KRA-1.2".to_string(),
            financial_year: "2025/26".to_string(),
            quarter: 2,
            target: 4.0,
            actual: 3.0,
            status: KraStatus::Behind,
            comment: None,
        }
    }

    #[test]
    fn new_risk_without_legal_reference_fails_precondition() {
        let mut risk = fixture_risk();
        assert!(risk.validate().is_ok());

        risk.legal_references.clear();
        assert!(matches!(risk.validate(), Err(RiskError::Precondition(_))));
    }

    #[test]
    fn new_risk_rejects_blank_reference_and_fields() {
        let mut risk = fixture_risk();
        risk.legal_references.push(LegalReference {
            instrument: " ".to_string(),
            section: None,
        });
        assert!(matches!(risk.validate(), Err(RiskError::Validation(_))));

        let mut risk = fixture_risk();
        risk.category = String::new();
        assert!(matches!(risk.validate(), Err(RiskError::Validation(_))));
    }

    #[test]
    fn legal_reference_parse_splits_section() {
        assert_eq!(
            LegalReference::parse("Treasury Regulations#16A.6"),
            Ok(LegalReference {
                instrument: "Treasury Regulations".to_string(),
                section: Some("16A.6".to_string()),
            })
        );
        assert_eq!(
            LegalReference::parse("Audit Charter"),
            Ok(LegalReference {
                instrument: "Audit Charter".to_string(),
                section: None,
            })
        );
        assert_eq!(
            LegalReference::parse("Audit Charter#"),
            Ok(LegalReference {
                instrument: "Audit Charter".to_string(),
                section: None,
            })
        );
        assert!(LegalReference::parse("#s.1").is_err());
    }

    #[test]
    fn kra_input_validates_quarter_and_figures() {
        assert!(fixture_kra().validate().is_ok());

        for quarter in [0, 5] {
            let mut input = fixture_kra();
            input.quarter = quarter;
            assert!(input.validate().is_err());
        }

        let mut input = fixture_kra();
        input.actual = -1.0;
        assert!(input.validate().is_err());

        let mut input = fixture_kra();
        input.target = f64::NAN;
        assert!(input.validate().is_err());

        let mut input = fixture_kra();
        input.financial_year = String::new();
        assert!(input.validate().is_err());
    }

    #[test]
    fn kra_status_round_trips_storage_names() {
        for status in [
            KraStatus::NotStarted,
            KraStatus::OnTrack,
            KraStatus::Behind,
            KraStatus::Completed,
        ] {
            assert_eq!(KraStatus::parse(status.as_str()), Some(status));
        }
    }
}
