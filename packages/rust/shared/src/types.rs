//! Caller-facing input types and the immutable case identity.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppraisalError, Result};
use crate::record::FieldValue;

/// Current schema version for the serialized case record.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// PropertyClass
// ---------------------------------------------------------------------------

/// Property classification driving stage applicability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyClass {
    Retail,
    Office,
    Industrial,
    MultiFamily,
    MixedUse,
    VacantLand,
    SpecialPurpose,
}

impl PropertyClass {
    /// Stable identifier used in logs and collaborator context.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retail => "retail",
            Self::Office => "office",
            Self::Industrial => "industrial",
            Self::MultiFamily => "multi_family",
            Self::MixedUse => "mixed_use",
            Self::VacantLand => "vacant_land",
            Self::SpecialPurpose => "special_purpose",
        }
    }

    /// Whether the property carries improvements (buildings) to value.
    pub fn is_improved(&self) -> bool {
        !matches!(self, Self::VacantLand)
    }
}

impl std::fmt::Display for PropertyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PropertyClass {
    type Err = AppraisalError;

    /// Accepts loose spellings such as `"Single-Tenant Retail"`, `"multi family"`
    /// or `"land"`.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        let class = match normalized.as_str() {
            "retail" | "singletenantretail" | "multitenantretail" | "shoppingcenter" => {
                Self::Retail
            }
            "office" | "medicaloffice" => Self::Office,
            "industrial" | "warehouse" | "flex" => Self::Industrial,
            "multifamily" | "apartment" | "apartments" => Self::MultiFamily,
            "mixeduse" => Self::MixedUse,
            "vacantland" | "land" => Self::VacantLand,
            "specialpurpose" | "church" | "school" => Self::SpecialPurpose,
            _ => {
                return Err(AppraisalError::validation(format!(
                    "unknown property classification '{s}'"
                )));
            }
        };
        Ok(class)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Where the subject property sits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locality {
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
}

/// Immutable identity of a case, fixed at record creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseIdentity {
    /// Street address of the subject (e.g., `123 Main St`).
    pub address: String,
    pub locality: Locality,
    pub classification: PropertyClass,
    /// Effective date of the requested valuation.
    pub valuation_date: NaiveDate,
}

/// Caller options that steer stages without being derived by them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseRequest {
    /// How many comparable sales to keep. Falls back to configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_comps: Option<usize>,
    /// Subject building size used for comparable ranking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_size_sqft: Option<f64>,
    /// Subject year built used for comparable ranking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_year_built: Option<i32>,
    /// User-supplied final value; bypasses valuation fusion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_override: Option<f64>,
}

// ---------------------------------------------------------------------------
// CaseInput
// ---------------------------------------------------------------------------

/// Raw caller request, as deserialized from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseInput {
    pub address: String,
    pub city: String,
    #[serde(default)]
    pub county: Option<String>,
    /// Required; a missing state fails validation.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip: Option<String>,
    /// Free-form classification, parsed into [`PropertyClass`].
    pub property_type: String,
    /// `YYYY-MM-DD`.
    pub valuation_date: String,
    #[serde(default)]
    pub number_of_comps: Option<usize>,
    #[serde(default)]
    pub subject_size_sqft: Option<f64>,
    #[serde(default)]
    pub subject_year_built: Option<i32>,
    #[serde(default)]
    pub overrides: Overrides,
}

/// Values the caller pins instead of letting stages derive them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Overrides {
    /// Attributes seeded into the record as user overrides.
    #[serde(default)]
    pub attributes: BTreeMap<String, FieldValue>,
    /// Final value fed straight into reconciliation.
    #[serde(default)]
    pub value_override: Option<f64>,
}

/// Input after validation, ready to build a record from.
#[derive(Debug, Clone)]
pub struct ValidatedInput {
    pub identity: CaseIdentity,
    pub request: CaseRequest,
    pub attribute_overrides: BTreeMap<String, FieldValue>,
}

impl CaseInput {
    /// Check the caller input and split it into identity, options and overrides.
    ///
    /// This is the only fallible step before a pipeline run starts.
    pub fn validate(&self) -> Result<ValidatedInput> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(AppraisalError::validation("address is required"));
        }
        let city = self.city.trim();
        if city.is_empty() {
            return Err(AppraisalError::validation("city is required"));
        }
        let state = self.state.trim();
        if state.is_empty() {
            return Err(AppraisalError::validation("state is required"));
        }

        let classification: PropertyClass = self.property_type.parse()?;

        let valuation_date = NaiveDate::parse_from_str(self.valuation_date.trim(), "%Y-%m-%d")
            .map_err(|e| {
                AppraisalError::validation(format!(
                    "valuation_date '{}' is not YYYY-MM-DD: {e}",
                    self.valuation_date
                ))
            })?;

        if let Some(value) = self.overrides.value_override {
            if !value.is_finite() || value <= 0.0 {
                return Err(AppraisalError::validation(format!(
                    "value_override must be a positive number, got {value}"
                )));
            }
        }

        if self.number_of_comps == Some(0) {
            return Err(AppraisalError::validation(
                "number_of_comps must be at least 1",
            ));
        }

        let non_blank = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        Ok(ValidatedInput {
            identity: CaseIdentity {
                address: address.to_string(),
                locality: Locality {
                    city: city.to_string(),
                    county: non_blank(&self.county),
                    state: state.to_uppercase(),
                    zip: non_blank(&self.zip),
                },
                classification,
                valuation_date,
            },
            request: CaseRequest {
                number_of_comps: self.number_of_comps,
                subject_size_sqft: self.subject_size_sqft.filter(|s| *s > 0.0),
                subject_year_built: self.subject_year_built,
                value_override: self.overrides.value_override,
            },
            attribute_overrides: self.overrides.attributes.clone(),
        })
    }
}
