//! Parcel lookup against the structured (assessor/GIS) source.
//!
//! The source answers with the parcel extractor's envelope:
//! `{error, data, warnings, match_confidence, field_confidence?}`, where
//! `data` uses camelCase keys and loosely typed values (numbers may arrive as
//! strings, missing values as `0` or `""`).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, instrument};

use appraisal_shared::{
    AppraisalError, CaseRecord, FieldValue, Provenance, Result, Section, SourceKind, fields,
};

use super::names::STRUCTURED_LOOKUP;
use crate::collaborator::Collaborator;
use crate::fusion::Candidate;
use crate::stage::{Stage, StageOutput, StageSpec, check_confidence, parse_payload};

/// Envelope returned by the parcel source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParcelLookup {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub match_confidence: Option<f64>,
    /// Per-field overrides of `match_confidence`, keyed by attribute name.
    #[serde(default)]
    pub field_confidence: BTreeMap<String, f64>,
    #[serde(default)]
    pub source_loc_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Text,
    Money,
    Quantity(&'static str),
    Date,
}

/// Parcel key, attribute name, value kind.
const MAPPING: &[(&str, &str, Kind)] = &[
    ("propertyId", fields::PARCEL_ID, Kind::Text),
    ("locationId", fields::LOCATION_ID, Kind::Text),
    ("mapParId", fields::MAP_PARCEL_ID, Kind::Text),
    ("totalValue", fields::ASSESSED_VALUE, Kind::Money),
    ("landValue", fields::LAND_VALUE, Kind::Money),
    ("buildingValue", fields::BUILDING_VALUE, Kind::Money),
    ("otherValue", fields::OTHER_VALUE, Kind::Money),
    ("fiscalYear", fields::FISCAL_YEAR, Kind::Text),
    ("landSaleDate", fields::LAST_SALE_DATE, Kind::Date),
    ("landSalePrice", fields::LAST_SALE_PRICE, Kind::Money),
    ("useCode", fields::USE_CODE, Kind::Text),
    ("useDescription", fields::USE_DESCRIPTION, Kind::Text),
    ("zoning", fields::ZONING, Kind::Text),
    ("yearBuilt", fields::YEAR_BUILT, Kind::Quantity("year")),
    ("buildingAreaSqFt", fields::BUILDING_AREA, Kind::Quantity("sqft")),
    ("residentialAreaSqFt", fields::RESIDENTIAL_AREA, Kind::Quantity("sqft")),
    // Measured from the parcel polygon, not the assessor roll.
    ("gisParcelAreaSqFt", fields::GIS_PARCEL_AREA, Kind::Quantity("sqft")),
    ("units", fields::UNITS, Kind::Quantity("units")),
    ("stories", fields::STORIES, Kind::Quantity("stories")),
    ("ownerName", fields::OWNER_NAME, Kind::Text),
];

fn as_text(value: &serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Positive finite number; zero means "not recorded" in assessor data.
fn as_amount(value: &serde_json::Value) -> Option<f64> {
    let amount = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().replace(',', "").parse().ok()?,
        _ => return None,
    };
    (amount.is_finite() && amount > 0.0).then_some(amount)
}

fn as_date(value: &serde_json::Value) -> Option<FieldValue> {
    let text = as_text(value)?;
    ["%Y%m%d", "%Y-%m-%d", "%m/%d/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&text, fmt).ok())
        .map(FieldValue::Date)
        .or(Some(FieldValue::Text(text)))
}

fn convert(kind: Kind, value: &serde_json::Value) -> Option<FieldValue> {
    match kind {
        Kind::Text => as_text(value).map(FieldValue::Text),
        Kind::Money => as_amount(value).map(FieldValue::money),
        Kind::Quantity(unit) => as_amount(value).map(|a| FieldValue::quantity(a, unit)),
        Kind::Date => as_date(value),
    }
}

fn lot_unit(code: Option<&serde_json::Value>) -> String {
    match code.and_then(as_text).as_deref() {
        None | Some("A") | Some("a") => "acres".into(),
        Some("S") | Some("s") => "sqft".into(),
        Some(other) => other.to_lowercase(),
    }
}

impl ParcelLookup {
    /// Attribute values carried by `data`, keyed by attribute name.
    pub fn values(&self) -> BTreeMap<&'static str, FieldValue> {
        let mut values = BTreeMap::new();
        let Some(data) = &self.data else {
            return values;
        };

        for (key, field, kind) in MAPPING {
            if let Some(value) = data.get(*key).and_then(|v| convert(*kind, v)) {
                values.insert(*field, value);
            }
        }

        if let Some(size) = data.get("lotSize").and_then(as_amount) {
            values.insert(
                fields::LOT_SIZE,
                FieldValue::quantity(size, lot_unit(data.get("lotUnits"))),
            );
        }

        let deed: BTreeMap<String, FieldValue> = [("book", "landSaleBook"), ("page", "landSalePage")]
            .into_iter()
            .filter_map(|(name, key)| {
                data.get(key)
                    .and_then(as_text)
                    .map(|v| (name.to_string(), FieldValue::Text(v)))
            })
            .collect();
        if !deed.is_empty() {
            values.insert(fields::DEED_REFERENCE, FieldValue::Record(deed));
        }

        values
    }
}

/// Stage 1: pull assessor facts for the subject parcel.
pub struct StructuredLookupStage {
    spec: StageSpec,
    collaborator: Arc<dyn Collaborator>,
    label: String,
}

impl StructuredLookupStage {
    pub fn new(collaborator: Arc<dyn Collaborator>, label: impl Into<String>) -> Self {
        Self {
            spec: StageSpec::new(STRUCTURED_LOOKUP)
                .requires(Section::Identity)
                .writes(Section::Attributes),
            collaborator,
            label: label.into(),
        }
    }
}

#[async_trait]
impl Stage for StructuredLookupStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    #[instrument(skip_all, fields(address = %record.identity.address))]
    async fn execute(&self, record: &CaseRecord) -> Result<StageOutput> {
        let response = self.collaborator.call(&self.spec.request(record)).await?;
        let lookup: ParcelLookup = parse_payload(STRUCTURED_LOOKUP, response)?;

        let mut notes: Vec<String> = Vec::new();
        if let Some(error) = &lookup.error {
            notes.push(error.clone());
        }
        notes.extend(lookup.warnings.iter().cloned());

        let mut output = StageOutput::default();
        let values = lookup.values();

        if !values.is_empty() {
            let base = lookup.match_confidence.ok_or_else(|| {
                AppraisalError::parse(format!(
                    "{STRUCTURED_LOOKUP}: data present without match_confidence"
                ))
            })?;
            check_confidence(STRUCTURED_LOOKUP, base)?;

            for (field, value) in values {
                let confidence = match lookup.field_confidence.get(field) {
                    Some(c) => check_confidence(STRUCTURED_LOOKUP, *c)?,
                    None => base,
                };
                output.add_candidate(
                    field,
                    Candidate::new(
                        value,
                        Provenance::new(SourceKind::Structured, self.label.clone()),
                        confidence,
                    ),
                );
            }
            debug!(
                fields = output.attributes.len(),
                match_confidence = base,
                "parcel matched"
            );
        } else if notes.is_empty() {
            notes.push("parcel source returned no data".into());
        }

        if !notes.is_empty() {
            output.note = Some(notes.join("; "));
        }
        Ok(output)
    }
}
