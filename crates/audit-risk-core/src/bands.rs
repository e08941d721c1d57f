use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RiskError;

pub const REGISTER_TABLE: &str = "register";
pub const HEAT_MAP_TABLE: &str = "heat_map";
pub const PSAP_TABLE: &str = "psap";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Band<T> {
    pub min_score_inclusive: T,
    pub label: String,
}

pub type RatingBand = Band<i32>;

/// Score-to-label lookup, sorted strictly descending by threshold.
///
/// A table is not required to end in a catch-all band; [`rate`] reports the
/// gap as a configuration error when a score falls below every threshold.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BandTable<T> {
    name: String,
    bands: Vec<Band<T>>,
}

pub type RatingBandTable = BandTable<i32>;
pub type ComplianceBandTable = BandTable<f64>;

#[derive(Debug, Deserialize)]
struct BandTableDocument<T> {
    name: String,
    bands: Vec<Band<T>>,
}

/// Returns the label of the first band whose threshold is `<= score`.
///
/// # Errors
/// Returns [`RiskError::Configuration`] when no band matches, which means the
/// table lacks a catch-all band for this score.
pub fn rate<T>(score: T, bands: &[Band<T>]) -> Result<&str, RiskError>
where
    T: PartialOrd + Copy + Display,
{
    bands
        .iter()
        .find(|band| band.min_score_inclusive <= score)
        .map(|band| band.label.as_str())
        .ok_or_else(|| {
            RiskError::Configuration(format!(
                "no rating band matches score {score}; table is missing a catch-all band"
            ))
        })
}

impl<T> BandTable<T>
where
    T: PartialOrd + Copy + Display,
{
    /// Builds a validated band table.
    ///
    /// # Errors
    /// Returns [`RiskError::Configuration`] when the table is empty, has blank
    /// or duplicate labels, or thresholds that are not strictly descending.
    pub fn new(name: impl Into<String>, bands: Vec<Band<T>>) -> Result<Self, RiskError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RiskError::Configuration(
                "band table name MUST be provided".to_string(),
            ));
        }

        if bands.is_empty() {
            return Err(RiskError::Configuration(format!(
                "band table {name} MUST contain at least one band"
            )));
        }

        let mut labels = BTreeSet::new();
        for band in &bands {
            if band.label.trim().is_empty() {
                return Err(RiskError::Configuration(format!(
                    "band table {name} contains a blank label"
                )));
            }
            if !labels.insert(band.label.as_str()) {
                return Err(RiskError::Configuration(format!(
                    "band table {name} repeats label {}",
                    band.label
                )));
            }
            // NaN thresholds never compare and would silently never match.
            if band
                .min_score_inclusive
                .partial_cmp(&band.min_score_inclusive)
                .is_none()
            {
                return Err(RiskError::Configuration(format!(
                    "band table {name} has a non-comparable threshold for {}",
                    band.label
                )));
            }
        }

        for pair in bands.windows(2) {
            if pair[0].min_score_inclusive.partial_cmp(&pair[1].min_score_inclusive)
                != Some(Ordering::Greater)
            {
                return Err(RiskError::Configuration(format!(
                    "band table {name} thresholds MUST be strictly descending ({} then {})",
                    pair[0].min_score_inclusive, pair[1].min_score_inclusive
                )));
            }
        }

        Ok(Self { name, bands })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn bands(&self) -> &[Band<T>] {
        &self.bands
    }

    /// Rates `score` against this table.
    ///
    /// # Errors
    /// See [`rate`].
    pub fn rate(&self, score: T) -> Result<&str, RiskError> {
        rate(score, &self.bands)
    }

    /// Position of `label` in the table; 0 is the most severe band.
    #[must_use]
    pub fn severity_rank(&self, label: &str) -> Option<usize> {
        self.bands.iter().position(|band| band.label == label)
    }

    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.bands.iter().map(|band| band.label.as_str()).collect()
    }

    /// True when the lowest band catches every score at or above `floor`.
    #[must_use]
    pub fn is_complete(&self, floor: T) -> bool {
        self.bands
            .last()
            .is_some_and(|band| band.min_score_inclusive <= floor)
    }

    /// # Errors
    /// Returns [`RiskError::Configuration`] when [`Self::is_complete`] is false.
    pub fn ensure_complete(&self, floor: T) -> Result<(), RiskError> {
        if self.is_complete(floor) {
            return Ok(());
        }
        Err(RiskError::Configuration(format!(
            "band table {} MUST end with a catch-all band at or below {floor}",
            self.name
        )))
    }
}

impl<T> BandTable<T>
where
    T: PartialOrd + Copy + Display + DeserializeOwned,
{
    /// Decodes and validates a band table from JSON.
    ///
    /// # Errors
    /// Returns [`RiskError::Configuration`] when JSON decoding fails or the
    /// decoded table violates band table constraints.
    pub fn from_json(value: &Value) -> Result<Self, RiskError> {
        let document: BandTableDocument<T> =
            serde_json::from_value(value.clone()).map_err(|err| {
                RiskError::Configuration(format!("invalid band table JSON payload: {err}"))
            })?;
        Self::new(document.name, document.bands)
    }
}

fn bands_from<T: Copy>(entries: &[(T, &str)]) -> Vec<Band<T>> {
    entries
        .iter()
        .map(|(min_score_inclusive, label)| Band {
            min_score_inclusive: *min_score_inclusive,
            label: (*label).to_string(),
        })
        .collect()
}

impl RatingBandTable {
    /// Thresholds used by the risk register and risk profile pages.
    #[must_use]
    pub fn register() -> Self {
        Self {
            name: REGISTER_TABLE.to_string(),
            bands: bands_from(&[(15, "Extreme"), (10, "High"), (5, "Moderate"), (1, "Low")]),
        }
    }

    /// Thresholds used by the heat map page.
    #[must_use]
    pub fn heat_map() -> Self {
        Self {
            name: HEAT_MAP_TABLE.to_string(),
            bands: bands_from(&[(20, "Extreme"), (12, "High"), (6, "Medium"), (1, "Low")]),
        }
    }

    #[must_use]
    pub fn builtins() -> Vec<Self> {
        vec![Self::register(), Self::heat_map()]
    }

    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        Self::builtins().into_iter().find(|table| table.name == name)
    }
}

impl ComplianceBandTable {
    /// PSAP compliance labels on the 0-20 weighted scale.
    #[must_use]
    pub fn psap() -> Self {
        Self {
            name: PSAP_TABLE.to_string(),
            bands: bands_from(&[
                (18.0, "Fully Compliant"),
                (14.0, "Substantially Compliant"),
                (10.0, "Partially Compliant"),
                (5.0, "Minimally Compliant"),
                (0.0, "Non-Compliant"),
            ]),
        }
    }
}
