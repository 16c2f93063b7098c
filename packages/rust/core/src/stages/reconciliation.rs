//! Reconciliation of the valuation approaches into one final value.
//!
//! The number is computed here, deterministically: a confidence-weighted mean
//! of the approaches present, or the caller's override. The collaborator only
//! writes the two narratives, and sees the computed value while doing so.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use appraisal_shared::{
    CaseRecord, Narrative, NarrativeSection, Provenance, ReconciledValue, Result, Section,
    SourceKind, ValuationMethod, ValuationResult, record::mean,
};

use super::names::RECONCILIATION;
use crate::collaborator::{Collaborator, CollaboratorRequest};
use crate::stage::{Stage, StageOutput, StageSpec, check_confidence, parse_payload};

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationPayload {
    #[serde(default)]
    pub approaches_text: String,
    #[serde(default)]
    pub reconciliation_text: String,
    pub confidence: f64,
}

/// Final value from the approaches present, or the override.
///
/// Returns `None` when there is no override and no approach carries weight.
pub fn reconcile(
    valuations: &BTreeMap<ValuationMethod, ValuationResult>,
    value_override: Option<f64>,
) -> Option<ReconciledValue> {
    if let Some(value) = value_override {
        return Some(ReconciledValue {
            value,
            provenance: Provenance::user_override(),
            confidence: 1.0,
            weights: BTreeMap::new(),
        });
    }

    let total: f64 = valuations.values().map(|v| v.confidence).sum();
    if total <= 0.0 || !total.is_finite() {
        return None;
    }

    let weights: BTreeMap<ValuationMethod, f64> = valuations
        .iter()
        .map(|(method, v)| (*method, v.confidence / total))
        .collect();
    let value = valuations
        .iter()
        .map(|(method, v)| v.indicated_value * weights[method])
        .sum();
    let confidence = mean(valuations.values().map(|v| v.confidence))?;

    let label = valuations
        .keys()
        .map(ValuationMethod::as_str)
        .collect::<Vec<_>>()
        .join("+");

    Some(ReconciledValue {
        value,
        provenance: Provenance::new(SourceKind::Inferred, format!("reconciliation:{label}")),
        confidence,
        weights,
    })
}

/// Stage 10.
pub struct ReconciliationStage {
    spec: StageSpec,
    collaborator: Arc<dyn Collaborator>,
}

impl ReconciliationStage {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        let mut spec = StageSpec::new(RECONCILIATION);
        for method in ValuationMethod::ALL {
            spec = spec.reads(Section::Valuation(method));
        }
        for section in [
            NarrativeSection::SiteDescription,
            NarrativeSection::MarketAnalysis,
            NarrativeSection::HighestAndBestUse,
        ] {
            spec = spec.reads(Section::Narrative(section));
        }
        let spec = spec
            .writes(Section::Reconciled)
            .writes(Section::Narrative(NarrativeSection::ValuationApproaches))
            .writes(Section::Narrative(NarrativeSection::Reconciliation));

        Self { spec, collaborator }
    }
}

#[async_trait]
impl Stage for ReconciliationStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    async fn execute(&self, record: &CaseRecord) -> Result<StageOutput> {
        let reconciled = reconcile(&record.valuations, record.request.value_override);

        let mut request: CollaboratorRequest = self.spec.request(record);
        if let (Some(value), Some(context)) = (&reconciled, request.context.as_object_mut()) {
            let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
            context.insert(Section::Reconciled.to_string(), json);
        }

        let response = self.collaborator.call(&request).await?;
        let payload: ReconciliationPayload = parse_payload(RECONCILIATION, response)?;
        let confidence = check_confidence(RECONCILIATION, payload.confidence)?;

        let mut output = StageOutput::default();
        for (section, text) in [
            (NarrativeSection::ValuationApproaches, payload.approaches_text),
            (NarrativeSection::Reconciliation, payload.reconciliation_text),
        ] {
            let text = text.trim();
            if !text.is_empty() {
                output.narratives.insert(
                    section,
                    Narrative {
                        text: text.to_string(),
                        confidence,
                    },
                );
            }
        }

        match &reconciled {
            Some(value) => info!(
                value = value.value,
                confidence = value.confidence,
                source = ?value.provenance.kind,
                "value reconciled"
            ),
            None => output.note = Some("no valuation available to reconcile".into()),
        }
        output.reconciled = reconciled;
        Ok(output)
    }
}
