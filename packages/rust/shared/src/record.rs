//! The case record: the single document threaded through the pipeline.
//!
//! Every section except identity starts empty and is filled by stages. The
//! record itself never fails; all validation happens before it is built
//! (see [`crate::CaseInput::validate`]).

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RollupWeights;
use crate::types::{CURRENT_SCHEMA_VERSION, CaseIdentity, CaseRequest, RunId, ValidatedInput};

/// Well-known attribute names written by the extraction stages.
pub mod fields {
    pub const PARCEL_ID: &str = "parcel_id";
    pub const LOCATION_ID: &str = "location_id";
    pub const MAP_PARCEL_ID: &str = "map_parcel_id";
    pub const LOT_SIZE: &str = "lot_size";
    pub const ZONING: &str = "zoning";
    pub const FLOOD_ZONE: &str = "flood_zone";
    pub const ASSESSED_VALUE: &str = "assessed_value";
    pub const LAND_VALUE: &str = "land_value";
    pub const BUILDING_VALUE: &str = "building_value";
    pub const OTHER_VALUE: &str = "other_value";
    pub const FISCAL_YEAR: &str = "fiscal_year";
    pub const LAST_SALE_DATE: &str = "last_sale_date";
    pub const LAST_SALE_PRICE: &str = "last_sale_price";
    pub const DEED_REFERENCE: &str = "deed_reference";
    pub const YEAR_BUILT: &str = "year_built";
    pub const BUILDING_AREA: &str = "building_area";
    pub const RESIDENTIAL_AREA: &str = "residential_area";
    pub const GIS_PARCEL_AREA: &str = "gis_parcel_area";
    pub const USE_CODE: &str = "use_code";
    pub const USE_DESCRIPTION: &str = "use_description";
    pub const OWNER_NAME: &str = "owner_name";
    pub const STORIES: &str = "stories";
    pub const UNITS: &str = "units";
}

// ---------------------------------------------------------------------------
// Field values and provenance
// ---------------------------------------------------------------------------

/// A typed attribute value. Each category compares the same way under fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Numeric measurement with a unit (e.g., `1.2 acres`, `14000 sqft`).
    Quantity { amount: f64, unit: String },
    /// Currency amount in USD.
    Money { amount: f64 },
    Date(NaiveDate),
    Text(String),
    /// Structured sub-record (e.g., a deed reference).
    Record(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Numeric view of quantities and money, used by ranking helpers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Quantity { amount, .. } | Self::Money { amount } => Some(*amount),
            _ => None,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn money(amount: f64) -> Self {
        Self::Money { amount }
    }

    pub fn quantity(amount: f64, unit: impl Into<String>) -> Self {
        Self::Quantity {
            amount,
            unit: unit.into(),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quantity { amount, unit } => write!(f, "{amount} {unit}"),
            Self::Money { amount } => write!(f, "${amount:.0}"),
            Self::Date(d) => write!(f, "{d}"),
            Self::Text(s) => f.write_str(s),
            Self::Record(map) => write!(f, "{{{} fields}}", map.len()),
        }
    }
}

/// Kind of source an estimate came from. Order encodes tie-break priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Inferred,
    BroadSearch,
    Structured,
    UserOverride,
}

impl SourceKind {
    /// Higher wins confidence ties.
    pub fn priority(&self) -> u8 {
        match self {
            Self::UserOverride => 3,
            Self::Structured => 2,
            Self::BroadSearch => 1,
            Self::Inferred => 0,
        }
    }
}

/// Where a value came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub kind: SourceKind,
    /// Free-form label, e.g. `massgis-l3` or `broad-search:assessor-site`.
    pub label: String,
}

impl Provenance {
    pub fn new(kind: SourceKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
        }
    }

    pub fn user_override() -> Self {
        Self::new(SourceKind::UserOverride, "user-override")
    }
}

/// A present attribute: value, provenance and confidence travel together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub value: FieldValue,
    pub provenance: Provenance,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Comparables
// ---------------------------------------------------------------------------

/// One comparable sale. Field aliases accept the camelCase feed shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableSale {
    #[serde(default)]
    pub address: Option<String>,
    /// Kept as text; unparseable dates are penalized rather than dropped.
    #[serde(default, alias = "saleDate")]
    pub sale_date: Option<String>,
    #[serde(default, alias = "salePrice")]
    pub sale_price: Option<f64>,
    #[serde(default, alias = "buildingSizeSqFt")]
    pub building_size_sqft: Option<f64>,
    #[serde(default, alias = "yearBuilt")]
    pub year_built: Option<i32>,
    #[serde(default, alias = "propertyType")]
    pub property_type: Option<String>,
    #[serde(default = "unknown_source")]
    pub source: String,
    #[serde(default = "default_comp_confidence", alias = "confidenceScore")]
    pub confidence: f64,
}

fn unknown_source() -> String {
    "Unknown".into()
}

fn default_comp_confidence() -> f64 {
    0.5
}

/// Comparable sales selected for the subject, with a search summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparablesSection {
    pub sales: Vec<ComparableSale>,
    pub summary: String,
    pub raw_count: usize,
    pub unique_count: usize,
    pub recent_count: usize,
}

// ---------------------------------------------------------------------------
// Narratives and valuations
// ---------------------------------------------------------------------------

/// Report sections produced as free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeSection {
    SiteDescription,
    MarketAnalysis,
    HighestAndBestUse,
    ValuationApproaches,
    Reconciliation,
    Summary,
    Transmittal,
    Certification,
}

impl NarrativeSection {
    pub const ALL: [NarrativeSection; 8] = [
        Self::SiteDescription,
        Self::MarketAnalysis,
        Self::HighestAndBestUse,
        Self::ValuationApproaches,
        Self::Reconciliation,
        Self::Summary,
        Self::Transmittal,
        Self::Certification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SiteDescription => "site_description",
            Self::MarketAnalysis => "market_analysis",
            Self::HighestAndBestUse => "highest_and_best_use",
            Self::ValuationApproaches => "valuation_approaches",
            Self::Reconciliation => "reconciliation",
            Self::Summary => "summary",
            Self::Transmittal => "transmittal",
            Self::Certification => "certification",
        }
    }
}

/// Generated text for one report section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub text: String,
    pub confidence: f64,
}

/// The three classic valuation approaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationMethod {
    SalesComparison,
    Income,
    Cost,
}

impl ValuationMethod {
    pub const ALL: [ValuationMethod; 3] = [Self::SalesComparison, Self::Income, Self::Cost];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SalesComparison => "sales_comparison",
            Self::Income => "income",
            Self::Cost => "cost",
        }
    }
}

/// Indicated value from one approach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationResult {
    pub indicated_value: f64,
    /// Supporting line items (e.g., `noi`, `cap_rate`, `land_value`).
    #[serde(default)]
    pub breakdown: BTreeMap<String, f64>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
}

/// Final value after reconciliation (or a user override).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledValue {
    pub value: f64,
    pub provenance: Provenance,
    pub confidence: f64,
    /// Weight each approach carried in the reconciled value.
    #[serde(default)]
    pub weights: BTreeMap<ValuationMethod, f64>,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Addressable part of the record, used for stage read/write declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    Identity,
    Attributes,
    Comparables,
    Narrative(NarrativeSection),
    Valuation(ValuationMethod),
    Reconciled,
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity => f.write_str("identity"),
            Self::Attributes => f.write_str("attributes"),
            Self::Comparables => f.write_str("comparables"),
            Self::Narrative(n) => write!(f, "narrative.{}", n.as_str()),
            Self::Valuation(m) => write!(f, "valuation.{}", m.as_str()),
            Self::Reconciled => f.write_str("valuation.reconciled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

/// Outcome of one scheduled stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Attempted,
    Success,
    Error,
    Skipped,
    NotFound,
}

impl StageStatus {
    /// Every status except `ATTEMPTED` means the stage handed control back.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Attempted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempted => "ATTEMPTED",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status entry in the bookkeeping map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub status: StageStatus,
    /// Error message, skip reason or extraction warnings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    #[default]
    NotStarted,
    Running { index: usize, stage: String },
    Completed,
}

/// How a fused field got its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionRule {
    /// No prior value; the candidate filled a gap.
    Inserted,
    /// Confidence ranking picked the winner.
    Ranked,
    /// Existing value sits at or above the promotion threshold of an
    /// authoritative source; supplementary candidates cannot replace it.
    AuthoritativeKept,
    /// Existing value is a user override.
    OverrideLocked,
}

/// Audit entry for one fusion decision on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionDecision {
    pub field: String,
    pub stage: String,
    pub rule: FusionRule,
    pub winner: Provenance,
    pub winner_confidence: f64,
    /// Previous attribute, when this decision replaced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displaced: Option<Attribute>,
    /// Candidates that lost.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<Attribute>,
    /// True when competing candidates carried different values.
    pub conflict: bool,
}

/// Role the broad-search stage played this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadSearchMode {
    /// Competes with the structured source field by field.
    Competitive,
    /// Fills gaps only; fields at or above the threshold are protected.
    Supplementary,
    /// Not run; the structured source was authoritative.
    Skipped,
}

/// Extraction policy decided after the structured lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPolicy {
    /// Mean confidence of structured fields; `None` when the stage wrote nothing.
    pub structured_aggregate: Option<f64>,
    pub threshold: f64,
    pub authoritative: bool,
    pub broad_search: BroadSearchMode,
}

/// Status, audit and confidence metadata accumulated during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bookkeeping {
    pub status: BTreeMap<String, StageEntry>,
    pub run_state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionPolicy>,
    #[serde(default)]
    pub fusion_log: Vec<FusionDecision>,
    pub overall_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// CaseRecord
// ---------------------------------------------------------------------------

/// The case file. Owned by the pipeline for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub schema_version: u32,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub identity: CaseIdentity,
    #[serde(default)]
    pub request: CaseRequest,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparables: Option<ComparablesSection>,
    #[serde(default)]
    pub narratives: BTreeMap<NarrativeSection, Narrative>,
    #[serde(default)]
    pub valuations: BTreeMap<ValuationMethod, ValuationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<ReconciledValue>,
    #[serde(default)]
    pub bookkeeping: Bookkeeping,
}

impl CaseRecord {
    /// Build a minimal record with every optional section empty.
    pub fn new(identity: CaseIdentity, request: CaseRequest) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id: RunId::new(),
            created_at: Utc::now(),
            identity,
            request,
            attributes: BTreeMap::new(),
            comparables: None,
            narratives: BTreeMap::new(),
            valuations: BTreeMap::new(),
            reconciled: None,
            bookkeeping: Bookkeeping::default(),
        }
    }

    /// Build a record from validated input, seeding caller overrides as
    /// locked attributes.
    pub fn from_validated(input: ValidatedInput) -> Self {
        let mut record = Self::new(input.identity, input.request);
        for (name, value) in input.attribute_overrides {
            record.attributes.insert(
                name,
                Attribute {
                    value,
                    provenance: Provenance::user_override(),
                    confidence: 1.0,
                },
            );
        }
        record
    }

    /// Whether the section currently holds data.
    pub fn has_section(&self, section: Section) -> bool {
        match section {
            Section::Identity => true,
            Section::Attributes => !self.attributes.is_empty(),
            Section::Comparables => self.comparables.is_some(),
            Section::Narrative(n) => self.narratives.contains_key(&n),
            Section::Valuation(m) => self.valuations.contains_key(&m),
            Section::Reconciled => self.reconciled.is_some(),
        }
    }

    /// JSON slice of the record restricted to identity plus `sections`.
    ///
    /// This is the only view of the record a collaborator ever sees.
    pub fn context_slice(&self, sections: &[Section]) -> serde_json::Value {
        let mut ctx = serde_json::Map::new();
        ctx.insert("identity".into(), to_json(&self.identity));
        if self.request != CaseRequest::default() {
            ctx.insert("request".into(), to_json(&self.request));
        }

        for section in sections {
            let value = match section {
                Section::Identity => continue,
                Section::Attributes => to_json(&self.attributes),
                Section::Comparables => to_json(&self.comparables),
                Section::Narrative(n) => to_json(&self.narratives.get(n)),
                Section::Valuation(m) => to_json(&self.valuations.get(m)),
                Section::Reconciled => to_json(&self.reconciled),
            };
            ctx.insert(section.to_string(), value);
        }

        serde_json::Value::Object(ctx)
    }

    /// Status of a stage, if it was reached.
    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.bookkeeping.status.get(stage).map(|e| e.status)
    }

    /// Record (or overwrite) the bookkeeping entry for a stage.
    pub fn set_status(&mut self, stage: &str, status: StageStatus, message: Option<String>) {
        let entry = self
            .bookkeeping
            .status
            .entry(stage.to_string())
            .or_insert(StageEntry {
                status,
                message: None,
                elapsed_ms: None,
            });
        entry.status = status;
        entry.message = message;
    }

    /// Stages whose status is `ERROR`, in name order.
    pub fn failed_stages(&self) -> Vec<&str> {
        self.bookkeeping
            .status
            .iter()
            .filter(|(_, e)| e.status == StageStatus::Error)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Populated sections whose confidence is below `threshold`, as
    /// `(section, confidence)` pairs. Used to flag a run for human review.
    pub fn low_confidence_sections(&self, threshold: f64) -> Vec<(String, f64)> {
        let mut flagged = Vec::new();
        for (name, attr) in &self.attributes {
            if attr.confidence < threshold {
                flagged.push((format!("attributes.{name}"), attr.confidence));
            }
        }
        for (section, narrative) in &self.narratives {
            if narrative.confidence < threshold {
                flagged.push((Section::Narrative(*section).to_string(), narrative.confidence));
            }
        }
        for (method, result) in &self.valuations {
            if result.confidence < threshold {
                flagged.push((Section::Valuation(*method).to_string(), result.confidence));
            }
        }
        if let Some(reconciled) = &self.reconciled {
            if reconciled.confidence < threshold {
                flagged.push((Section::Reconciled.to_string(), reconciled.confidence));
            }
        }
        flagged
    }

    /// Weighted mean of per-category mean confidences, over populated
    /// categories only. Returns 0 when nothing is populated.
    pub fn rollup_confidence(&self, weights: &RollupWeights) -> f64 {
        let attributes = mean(self.attributes.values().map(|a| a.confidence));
        let narratives = mean(self.narratives.values().map(|n| n.confidence));
        let valuations = mean(
            self.valuations
                .values()
                .map(|v| v.confidence)
                .chain(self.reconciled.iter().map(|r| r.confidence)),
        );

        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for (value, weight) in [
            (attributes, weights.attributes),
            (narratives, weights.narratives),
            (valuations, weights.valuations),
        ] {
            if let Some(v) = value {
                total += v * weight;
                weight_sum += weight;
            }
        }

        if weight_sum > 0.0 {
            total / weight_sum
        } else {
            0.0
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Arithmetic mean, `None` for an empty iterator.
pub fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}
