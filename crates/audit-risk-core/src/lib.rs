//! Pure scoring and workflow rules for the audit, risk and compliance register.
//!
//! Nothing in this crate performs I/O. Storage backends implement
//! [`PersistenceGateway`] and call into these functions to derive and guard
//! every value they persist.

use time::{OffsetDateTime, UtcOffset};

mod bands;
mod profile;
mod psap;
mod records;
mod scoring;
mod workflow;

pub use bands::{
    rate, Band, BandTable, ComplianceBandTable, RatingBand, RatingBandTable, HEAT_MAP_TABLE,
    PSAP_TABLE, REGISTER_TABLE,
};
pub use profile::{heat_map, risk_profile, HeatMapCell, RiskProfile, RiskProfileBucket};
pub use psap::{PsapResult, PsapScorecard, PsapStandardScore, PSAP_MAX_TOTAL};
pub use records::{
    Engagement, KraProgress, KraProgressInput, KraStatus, LegalReference, NewEngagement,
    NewRisk, NewRiskEvent, RiskEvent, RiskRegisterEntry,
};
pub use scoring::{
    impact_label, likelihood_label, parse_impact, parse_likelihood, score, AssessmentInput,
    AssessmentKind, RiskAssessment, IMPACT_LABELS, LIKELIHOOD_LABELS, SCALE_MAX, SCALE_MIN,
};
pub use workflow::{
    can_create_engagement, can_create_risk, ensure_can_create_engagement, ensure_can_create_risk,
    ensure_transition, next_statuses, priority_override, transition_risk_event,
    PersistenceGateway, Priority, RiskEventStatus, SourceType, ENGAGEMENT_ELIGIBLE_STATUSES,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RiskError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: RiskEventStatus,
        to: RiskEventStatus,
    },
    #[error("external store error: {0}")]
    ExternalStore(String),
}

/// Rejects blank required text fields.
///
/// # Errors
/// Returns [`RiskError::Validation`] when `value` is empty after trimming.
pub fn ensure_non_empty(field: &str, value: &str) -> Result<(), RiskError> {
    if value.trim().is_empty() {
        return Err(RiskError::Validation(format!("{field} MUST be provided")));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RiskError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RiskError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RiskError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RiskError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`RiskError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RiskError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RiskError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip_keeps_utc() {
        let parsed = match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("expected valid timestamp: {err}"),
        };
        let formatted = match format_rfc3339(parsed) {
            Ok(value) => value,
            Err(err) => panic!("expected formatting to succeed: {err}"),
        };
        assert_eq!(formatted, "2026-02-07T12:00:00Z");
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        let err = parse_rfc3339_utc("2026-02-07T12:00:00+02:00");
        assert!(matches!(err, Err(RiskError::Validation(_))));
    }

    #[test]
    fn blank_fields_fail_validation() {
        assert!(ensure_non_empty("title", "  ").is_err());
        assert!(ensure_non_empty("title", "Procurement fraud").is_ok());
    }
}
