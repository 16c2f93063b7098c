//! Comparable sales search.
//!
//! The collaborator returns raw sales; selection (dedup, recency, ranking,
//! count) happens locally in [`crate::comps`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use appraisal_shared::{CaseRecord, ComparableSale, Result, Section, fields};

use super::names::COMPARABLE_SALES;
use crate::collaborator::Collaborator;
use crate::comps::{self, CompParams, Subject};
use crate::stage::{Stage, StageOutput, StageSpec, check_confidence, parse_payload};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SalesPayload {
    #[serde(default)]
    pub sales: Vec<ComparableSale>,
}

/// Stage 3.
pub struct ComparableSalesStage {
    spec: StageSpec,
    collaborator: Arc<dyn Collaborator>,
    years_back: u32,
    default_count: usize,
}

impl ComparableSalesStage {
    pub fn new(collaborator: Arc<dyn Collaborator>, years_back: u32, default_count: usize) -> Self {
        Self {
            spec: StageSpec::new(COMPARABLE_SALES)
                .requires(Section::Identity)
                .reads(Section::Attributes)
                .writes(Section::Comparables),
            collaborator,
            years_back,
            default_count,
        }
    }
}

fn attribute_number(record: &CaseRecord, field: &str) -> Option<f64> {
    record.attributes.get(field).and_then(|a| a.value.as_number())
}

#[async_trait]
impl Stage for ComparableSalesStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn execute(&self, record: &CaseRecord) -> Result<StageOutput> {
        let response = self.collaborator.call(&self.spec.request(record)).await?;
        let payload: SalesPayload = parse_payload(COMPARABLE_SALES, response)?;

        if payload.sales.is_empty() {
            return Ok(StageOutput {
                note: Some("no comparable sales returned".into()),
                ..StageOutput::default()
            });
        }
        for sale in &payload.sales {
            check_confidence(COMPARABLE_SALES, sale.confidence)?;
        }

        let identity = &record.identity;
        let subject = Subject {
            address: &identity.address,
            property_type: identity.classification.as_str(),
            city: &identity.locality.city,
            county: identity.locality.county.as_deref(),
            valuation_date: identity.valuation_date,
            size_sqft: record
                .request
                .subject_size_sqft
                .or_else(|| attribute_number(record, fields::BUILDING_AREA)),
            year_built: record
                .request
                .subject_year_built
                .or_else(|| attribute_number(record, fields::YEAR_BUILT).map(|y| y as i32)),
        };
        let params = CompParams {
            years_back: self.years_back,
            limit: record.request.number_of_comps.unwrap_or(self.default_count),
        };

        let section = comps::process(payload.sales, &subject, params);
        info!(
            raw = section.raw_count,
            unique = section.unique_count,
            recent = section.recent_count,
            selected = section.sales.len(),
            "comparable sales selected"
        );

        if section.sales.is_empty() {
            return Ok(StageOutput {
                note: Some(section.summary),
                ..StageOutput::default()
            });
        }

        Ok(StageOutput {
            comparables: Some(section),
            ..StageOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedCollaborator, record};
    use appraisal_shared::{Attribute, FieldValue, Provenance, SourceKind};
    use serde_json::json;

    fn stage(payload: serde_json::Value) -> ComparableSalesStage {
        ComparableSalesStage::new(
            Arc::new(ScriptedCollaborator::new().reply(COMPARABLE_SALES, payload)),
            3,
            2,
        )
    }

    fn sales() -> serde_json::Value {
        json!({
            "sales": [
                {"address": "12 Elm St", "saleDate": "2025-03-01", "salePrice": 900000, "buildingSizeSqFt": 12000, "source": "CoStar", "confidenceScore": 0.8},
                {"address": "12 Elm Street", "saleDate": "2025-03-01", "salePrice": 905000, "source": "LoopNet", "confidenceScore": 0.6},
                {"address": "40 Oak Ave", "saleDate": "2024-11-15", "salePrice": 1100000, "buildingSizeSqFt": 15000, "source": "CoStar", "confidenceScore": 0.7},
                {"address": "9 Pine Rd", "saleDate": "2018-01-01", "salePrice": 700000, "source": "Registry", "confidenceScore": 0.9},
                {"address": "100 Main St", "saleDate": "2025-01-01", "salePrice": 1000000, "source": "Registry", "confidenceScore": 0.9}
            ]
        })
    }

    #[tokio::test]
    async fn selects_recent_unique_non_subject_sales() {
        let output = stage(sales()).execute(&record()).await.expect("execute");
        let section = output.comparables.expect("comparables");

        assert_eq!(section.raw_count, 5);
        assert_eq!(section.unique_count, 4);
        assert_eq!(section.sales.len(), 2);
        assert!(section.sales.iter().all(|s| s.address.as_deref() != Some("100 Main St")));
        assert!(section.sales.iter().all(|s| s.address.as_deref() != Some("9 Pine Rd")));
        assert!(section.summary.starts_with("Comparable sales search for"));
    }

    #[tokio::test]
    async fn request_count_overrides_default() {
        let mut record = record();
        record.request.number_of_comps = Some(1);
        let output = stage(sales()).execute(&record).await.expect("execute");
        assert_eq!(output.comparables.expect("comparables").sales.len(), 1);
    }

    #[tokio::test]
    async fn subject_size_falls_back_to_attributes() {
        let mut record = record();
        record.attributes.insert(
            fields::BUILDING_AREA.into(),
            Attribute {
                value: FieldValue::quantity(15_000.0, "sqft"),
                provenance: Provenance::new(SourceKind::Structured, "parcel-db"),
                confidence: 0.9,
            },
        );
        let output = stage(sales()).execute(&record).await.expect("execute");
        let section = output.comparables.expect("comparables");
        assert_eq!(section.sales.len(), 2);
    }

    #[tokio::test]
    async fn no_sales_is_empty() {
        let output = stage(json!({"sales": []})).execute(&record()).await.expect("execute");
        assert!(output.is_empty());
        assert_eq!(output.note.as_deref(), Some("no comparable sales returned"));
    }

    #[tokio::test]
    async fn only_stale_sales_is_empty_with_summary() {
        let output = stage(json!({
            "sales": [{"address": "9 Pine Rd", "saleDate": "2015-01-01", "salePrice": 700000, "source": "Registry"}]
        }))
        .execute(&record())
        .await
        .expect("execute");
        assert!(output.is_empty());
        assert!(output.note.expect("note").contains("Comparable sales search"));
    }
}
