//! The three valuation approaches.
//!
//! Each approach is the same stage shape with its own dependencies and
//! applicability: the cost approach needs improvements to depreciate, and the
//! income approach needs a property that trades on income.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use appraisal_shared::{
    AppraisalError, CaseRecord, PropertyClass, Result, ValuationMethod, ValuationResult,
};

use crate::collaborator::Collaborator;
use crate::stage::{Applicability, Stage, StageOutput, StageSpec, check_confidence, parse_payload};

#[derive(Debug, Clone, Deserialize)]
pub struct ValuationPayload {
    /// `None` when the approach could not be developed.
    #[serde(default)]
    pub indicated_value: Option<f64>,
    #[serde(default)]
    pub breakdown: BTreeMap<String, f64>,
    pub confidence: f64,
    #[serde(default)]
    pub narrative: Option<String>,
}

pub struct ValuationStage {
    spec: StageSpec,
    method: ValuationMethod,
    collaborator: Arc<dyn Collaborator>,
}

impl ValuationStage {
    pub fn new(spec: StageSpec, method: ValuationMethod, collaborator: Arc<dyn Collaborator>) -> Self {
        Self {
            spec,
            method,
            collaborator,
        }
    }
}

#[async_trait]
impl Stage for ValuationStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    fn applicability(&self, record: &CaseRecord) -> Applicability {
        match (self.method, record.identity.classification) {
            (ValuationMethod::Cost, class) if !class.is_improved() => Applicability::Inapplicable(
                "cost approach not applicable: property has no improvements".into(),
            ),
            (ValuationMethod::Income, PropertyClass::SpecialPurpose) => {
                Applicability::Inapplicable(
                    "income approach not applicable to special-purpose property".into(),
                )
            }
            _ => Applicability::Applicable,
        }
    }

    async fn execute(&self, record: &CaseRecord) -> Result<StageOutput> {
        let name = self.spec.name;
        let response = self.collaborator.call(&self.spec.request(record)).await?;
        let payload: ValuationPayload = parse_payload(name, response)?;
        let confidence = check_confidence(name, payload.confidence)?;

        let Some(value) = payload.indicated_value else {
            return Ok(StageOutput {
                note: Some(
                    payload
                        .narrative
                        .unwrap_or_else(|| "approach could not be developed".into()),
                ),
                ..StageOutput::default()
            });
        };
        if !value.is_finite() || value <= 0.0 {
            return Err(AppraisalError::parse(format!(
                "{name}: indicated value must be positive, got {value}"
            )));
        }

        Ok(StageOutput::default().with_valuation(
            self.method,
            ValuationResult {
                indicated_value: value,
                breakdown: payload.breakdown,
                confidence,
                narrative: payload.narrative.filter(|n| !n.trim().is_empty()),
            },
        ))
    }
}
