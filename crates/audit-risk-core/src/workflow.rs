use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{RiskError, RiskEvent};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventStatus {
    Pending,
    UnderReview,
    Approved,
    Allocated,
    InProgress,
    OnHold,
    Completed,
    Cancelled,
    Rejected,
}

pub const ENGAGEMENT_ELIGIBLE_STATUSES: [RiskEventStatus; 2] =
    [RiskEventStatus::Approved, RiskEventStatus::Allocated];

impl RiskEventStatus {
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::UnderReview,
        Self::Approved,
        Self::Allocated,
        Self::InProgress,
        Self::OnHold,
        Self::Completed,
        Self::Cancelled,
        Self::Rejected,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Allocated => "allocated",
            Self::InProgress => "in_progress",
            Self::OnHold => "on_hold",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::UnderReview => "Under Review",
            Self::Approved => "Approved",
            Self::Allocated => "Allocated",
            Self::InProgress => "In Progress",
            Self::OnHold => "On Hold",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
        }
    }

    /// Accepts the storage name (`under_review`) or the display label
    /// (`Under Review`), case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        next_statuses(self).is_empty()
    }
}

impl Display for RiskEventStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Statuses reachable in one step from `current`.
#[must_use]
pub fn next_statuses(current: RiskEventStatus) -> BTreeSet<RiskEventStatus> {
    use RiskEventStatus::{
        Allocated, Approved, Cancelled, Completed, InProgress, OnHold, Pending, Rejected,
        UnderReview,
    };

    let next: &[RiskEventStatus] = match current {
        Pending => &[UnderReview, Rejected],
        UnderReview => &[Approved, Rejected],
        Approved => &[Allocated],
        Allocated => &[InProgress],
        InProgress => &[OnHold, Completed, Cancelled],
        OnHold => &[InProgress],
        Rejected | Cancelled | Completed => &[],
    };
    next.iter().copied().collect()
}

/// # Errors
/// Returns [`RiskError::InvalidTransition`] when `to` is not in
/// [`next_statuses`] of `from`.
pub fn ensure_transition(from: RiskEventStatus, to: RiskEventStatus) -> Result<(), RiskError> {
    if next_statuses(from).contains(&to) {
        return Ok(());
    }
    Err(RiskError::InvalidTransition { from, to })
}

#[must_use]
pub fn can_create_engagement(event: &RiskEvent) -> bool {
    ENGAGEMENT_ELIGIBLE_STATUSES.contains(&event.status)
}

/// # Errors
/// Returns [`RiskError::Precondition`] unless the event is Approved or Allocated.
pub fn ensure_can_create_engagement(event: &RiskEvent) -> Result<(), RiskError> {
    if can_create_engagement(event) {
        return Ok(());
    }
    Err(RiskError::Precondition(format!(
        "engagements require an Approved or Allocated risk event; {} is {}",
        event.id, event.status
    )))
}

#[must_use]
pub fn can_create_risk(legal_reference_count: usize) -> bool {
    legal_reference_count >= 1
}

/// # Errors
/// Returns [`RiskError::Precondition`] when no legal reference is supplied.
pub fn ensure_can_create_risk(legal_reference_count: usize) -> Result<(), RiskError> {
    if can_create_risk(legal_reference_count) {
        return Ok(());
    }
    Err(RiskError::Precondition(
        "risk register entries require at least one legal reference".to_string(),
    ))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Planned,
    Secretary,
    Management,
    Request,
}

impl SourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Secretary => "secretary",
            Self::Management => "management",
            Self::Request => "request",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "planned" => Some(Self::Planned),
            "secretary" => Some(Self::Secretary),
            "management" => Some(Self::Management),
            "request" => Some(Self::Request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Secretary directives flagged as overrides are always Critical.
#[must_use]
pub fn priority_override(
    source_type: SourceType,
    is_override: bool,
    requested: Priority,
) -> Priority {
    if source_type == SourceType::Secretary && is_override {
        return Priority::Critical;
    }
    requested
}

/// Storage seam for status writes.
///
/// `compare_and_set_status` MUST only write when the persisted status still
/// equals `expected`, and report whether it wrote.
pub trait PersistenceGateway {
    /// # Errors
    /// Returns [`RiskError::ExternalStore`] when the backend read fails.
    fn risk_event_status(&self, id: Ulid) -> Result<Option<RiskEventStatus>, RiskError>;

    /// # Errors
    /// Returns [`RiskError::ExternalStore`] when the backend write fails.
    fn compare_and_set_status(
        &mut self,
        id: Ulid,
        expected: RiskEventStatus,
        next: RiskEventStatus,
        at: OffsetDateTime,
    ) -> Result<bool, RiskError>;
}

/// Moves a risk event to `next`, re-checking the current status at write time.
/// Returns the status the event moved from.
///
/// # Errors
/// Returns [`RiskError::Validation`] for unknown events,
/// [`RiskError::InvalidTransition`] for disallowed moves, and
/// [`RiskError::Precondition`] when a concurrent writer changed the status
/// between the read and the conditional write.
pub fn transition_risk_event<G>(
    gateway: &mut G,
    id: Ulid,
    next: RiskEventStatus,
    at: OffsetDateTime,
) -> Result<RiskEventStatus, RiskError>
where
    G: PersistenceGateway + ?Sized,
{
    let Some(current) = gateway.risk_event_status(id)? else {
        return Err(RiskError::Validation(format!("unknown risk event {id}")));
    };

    ensure_transition(current, next)?;

    if !gateway.compare_and_set_status(id, current, next, at)? {
        return Err(RiskError::Precondition(format!(
            "risk event {id} is no longer {current}; reload before changing status"
        )));
    }

    Ok(current)
}
