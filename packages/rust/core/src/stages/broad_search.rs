//! Open-ended attribute search (web, listings, news).
//!
//! Runs after the structured lookup and sees what it found, so the service
//! can focus on gaps. Whether its candidates compete with or only supplement
//! the structured values is decided by the pipeline, not here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use appraisal_shared::{CaseRecord, FieldValue, Provenance, Result, Section, SourceKind};

use super::names::BROAD_SEARCH;
use crate::collaborator::Collaborator;
use crate::fusion::Candidate;
use crate::stage::{Stage, StageOutput, StageSpec, check_confidence, parse_payload};

/// One attribute estimate from the search.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchField {
    pub name: String,
    /// `None` when the search looked but found nothing.
    #[serde(default)]
    pub value: Option<FieldValue>,
    pub confidence: f64,
    /// Where the value was seen (site, listing, article).
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BroadSearchPayload {
    #[serde(default)]
    pub fields: Vec<SearchField>,
}

/// Stage 2.
pub struct BroadSearchStage {
    spec: StageSpec,
    collaborator: Arc<dyn Collaborator>,
}

impl BroadSearchStage {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self {
            spec: StageSpec::new(BROAD_SEARCH)
                .requires(Section::Identity)
                .reads(Section::Attributes)
                .writes(Section::Attributes),
            collaborator,
        }
    }
}

#[async_trait]
impl Stage for BroadSearchStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn execute(&self, record: &CaseRecord) -> Result<StageOutput> {
        let response = self.collaborator.call(&self.spec.request(record)).await?;
        let payload: BroadSearchPayload = parse_payload(BROAD_SEARCH, response)?;

        let mut output = StageOutput::default();
        for field in payload.fields {
            let name = field.name.trim();
            if name.is_empty() {
                continue;
            }
            let confidence = check_confidence(BROAD_SEARCH, field.confidence)?;
            let label = match field.source.as_deref().map(str::trim) {
                Some(source) if !source.is_empty() => format!("broad-search:{source}"),
                _ => "broad-search".to_string(),
            };
            output.add_candidate(
                name,
                Candidate {
                    value: field.value,
                    provenance: Provenance::new(SourceKind::BroadSearch, label),
                    confidence,
                },
            );
        }

        debug!(candidates = output.attributes.len(), "broad search returned");
        if output.is_empty() {
            output.note = Some("search found no usable attributes".into());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedCollaborator, record};
    use appraisal_shared::{AppraisalError, fields};
    use serde_json::json;

    fn stage(payload: serde_json::Value) -> BroadSearchStage {
        BroadSearchStage::new(Arc::new(
            ScriptedCollaborator::new().reply(BROAD_SEARCH, payload),
        ))
    }

    #[tokio::test]
    async fn fields_become_broad_search_candidates() {
        let output = stage(json!({
            "fields": [
                {"name": "zoning", "value": {"kind": "text", "value": "B-2"}, "confidence": 0.7, "source": "town-gis"},
                {"name": "lot_size", "value": {"kind": "quantity", "value": {"amount": 1.1, "unit": "acres"}}, "confidence": 0.5},
                {"name": "flood_zone", "value": null, "confidence": 0.0}
            ]
        }))
        .execute(&record())
        .await
        .expect("execute");

        let zoning = &output.attributes[fields::ZONING][0];
        assert_eq!(zoning.value, Some(FieldValue::text("B-2")));
        assert_eq!(zoning.provenance.label, "broad-search:town-gis");
        assert_eq!(zoning.provenance.kind, SourceKind::BroadSearch);

        let lot = &output.attributes[fields::LOT_SIZE][0];
        assert_eq!(lot.value, Some(FieldValue::quantity(1.1, "acres")));
        assert_eq!(lot.provenance.label, "broad-search");

        assert!(!output.attributes[fields::FLOOD_ZONE][0].survives());
        assert!(!output.is_empty());
        assert!(output.note.is_none());
    }

    #[tokio::test]
    async fn nothing_usable_is_empty() {
        let output = stage(json!({"fields": [{"name": "zoning", "value": null, "confidence": 0.0}]}))
            .execute(&record())
            .await
            .expect("execute");
        assert!(output.is_empty());
        assert!(output.note.is_some());
    }

    #[tokio::test]
    async fn context_includes_known_attributes() {
        let collaborator = Arc::new(ScriptedCollaborator::new().reply(BROAD_SEARCH, json!({"fields": []})));
        let stage = BroadSearchStage::new(collaborator.clone());
        stage.execute(&record()).await.expect("execute");

        let context = collaborator.context_for(BROAD_SEARCH).expect("called");
        assert!(context.get("attributes").is_some());
        assert_eq!(context["identity"]["address"], "100 Main St");
    }

    #[tokio::test]
    async fn malformed_payload_is_a_parse_error() {
        let err = stage(json!({"fields": "zoning=B-2"}))
            .execute(&record())
            .await
            .unwrap_err();
        assert!(matches!(err, AppraisalError::Parse { .. }));
    }
}
