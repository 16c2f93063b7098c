//! Free-text report sections.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use appraisal_shared::{CaseRecord, Narrative, NarrativeSection, Result};

use crate::collaborator::Collaborator;
use crate::stage::{Stage, StageOutput, StageSpec, check_confidence, parse_payload};

#[derive(Debug, Clone, Deserialize)]
pub struct NarrativePayload {
    pub text: String,
    pub confidence: f64,
}

/// Writes one narrative section from one collaborator call.
pub struct NarrativeStage {
    spec: StageSpec,
    section: NarrativeSection,
    collaborator: Arc<dyn Collaborator>,
}

impl NarrativeStage {
    pub fn new(spec: StageSpec, section: NarrativeSection, collaborator: Arc<dyn Collaborator>) -> Self {
        Self {
            spec,
            section,
            collaborator,
        }
    }
}

#[async_trait]
impl Stage for NarrativeStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn execute(&self, record: &CaseRecord) -> Result<StageOutput> {
        let name = self.spec.name;
        let response = self.collaborator.call(&self.spec.request(record)).await?;
        let payload: NarrativePayload = parse_payload(name, response)?;
        let confidence = check_confidence(name, payload.confidence)?;

        let text = payload.text.trim();
        if text.is_empty() {
            return Ok(StageOutput {
                note: Some("collaborator returned empty text".into()),
                ..StageOutput::default()
            });
        }

        Ok(StageOutput::default().with_narrative(
            self.section,
            Narrative {
                text: text.to_string(),
                confidence,
            },
        ))
    }
}
