//! Stage units and the isolation combinator that runs them.
//!
//! A stage declares what it reads and writes, makes one collaborator call and
//! returns a [`StageOutput`]. It never mutates the record. [`run_isolated`]
//! is the single place that checks dependencies and applicability, applies
//! the timeout, enforces the write contract and turns failures into a status.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};

use appraisal_shared::{
    AppraisalError, CaseRecord, ComparablesSection, Narrative, NarrativeSection, ReconciledValue,
    Result, Section, StageStatus, ValuationMethod, ValuationResult,
};

use crate::collaborator::{CollaboratorRequest, CollaboratorResponse};
use crate::fusion::Candidate;

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// A section a stage reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// The stage cannot run without it.
    Required(Section),
    /// The stage runs degraded without it.
    Optional(Section),
}

impl Dependency {
    pub fn section(&self) -> Section {
        match self {
            Self::Required(s) | Self::Optional(s) => *s,
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required(_))
    }
}

/// Static description of a stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Also the status-map key.
    pub name: &'static str,
    pub dependencies: Vec<Dependency>,
    pub writes: Vec<Section>,
}

impl StageSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            dependencies: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn requires(mut self, section: Section) -> Self {
        self.dependencies.push(Dependency::Required(section));
        self
    }

    pub fn reads(mut self, section: Section) -> Self {
        self.dependencies.push(Dependency::Optional(section));
        self
    }

    pub fn writes(mut self, section: Section) -> Self {
        self.writes.push(section);
        self
    }

    /// Every section the stage may see.
    pub fn read_sections(&self) -> Vec<Section> {
        self.dependencies.iter().map(Dependency::section).collect()
    }

    /// Collaborator request carrying only the declared reads.
    pub fn request(&self, record: &CaseRecord) -> CollaboratorRequest {
        CollaboratorRequest::new(self.name, record.context_slice(&self.read_sections()))
    }
}

/// Whether a stage makes sense for this case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applicability {
    Applicable,
    Inapplicable(String),
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Partial record produced by one stage. The pipeline merges it.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Candidates per attribute; merged through the fusion resolver.
    pub attributes: BTreeMap<String, Vec<Candidate>>,
    pub comparables: Option<ComparablesSection>,
    pub narratives: BTreeMap<NarrativeSection, Narrative>,
    pub valuations: BTreeMap<ValuationMethod, ValuationResult>,
    pub reconciled: Option<ReconciledValue>,
    /// Warnings or remarks recorded alongside the status.
    pub note: Option<String>,
}

impl StageOutput {
    pub fn add_candidate(&mut self, field: impl Into<String>, candidate: Candidate) {
        self.attributes.entry(field.into()).or_default().push(candidate);
    }

    pub fn with_narrative(mut self, section: NarrativeSection, narrative: Narrative) -> Self {
        self.narratives.insert(section, narrative);
        self
    }

    pub fn with_valuation(mut self, method: ValuationMethod, result: ValuationResult) -> Self {
        self.valuations.insert(method, result);
        self
    }

    /// True when nothing would be written.
    pub fn is_empty(&self) -> bool {
        !self.attributes.values().flatten().any(Candidate::survives)
            && self.comparables.is_none()
            && self.narratives.is_empty()
            && self.valuations.is_empty()
            && self.reconciled.is_none()
    }

    /// Sections this output would write to.
    pub fn touched_sections(&self) -> BTreeSet<Section> {
        let mut touched = BTreeSet::new();
        if !self.attributes.is_empty() {
            touched.insert(Section::Attributes);
        }
        if self.comparables.is_some() {
            touched.insert(Section::Comparables);
        }
        touched.extend(self.narratives.keys().map(|n| Section::Narrative(*n)));
        touched.extend(self.valuations.keys().map(|m| Section::Valuation(*m)));
        if self.reconciled.is_some() {
            touched.insert(Section::Reconciled);
        }
        touched
    }
}

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

/// A unit of pipeline work.
#[async_trait]
pub trait Stage: Send + Sync {
    fn spec(&self) -> &StageSpec;

    /// Checked after dependencies, before any collaborator call.
    fn applicability(&self, _record: &CaseRecord) -> Applicability {
        Applicability::Applicable
    }

    /// Make the collaborator call and type its payload.
    async fn execute(&self, record: &CaseRecord) -> Result<StageOutput>;
}

/// Deserialize a collaborator payload, reporting the stage on failure.
pub fn parse_payload<T: DeserializeOwned>(stage: &str, response: CollaboratorResponse) -> Result<T> {
    serde_json::from_value(response.payload)
        .map_err(|e| AppraisalError::parse(format!("{stage}: malformed payload: {e}")))
}

/// Reject confidences outside `[0, 1]`.
pub fn check_confidence(stage: &str, confidence: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(confidence)
    } else {
        Err(AppraisalError::parse(format!(
            "{stage}: confidence {confidence} is outside [0, 1]"
        )))
    }
}

// ---------------------------------------------------------------------------
// Isolation combinator
// ---------------------------------------------------------------------------

/// Plan-level facts the combinator needs.
#[derive(Debug, Clone)]
pub struct StageContext<'a> {
    /// Stage names that write each section, in plan order.
    pub writers: &'a BTreeMap<Section, Vec<&'static str>>,
    pub timeout: Duration,
}

/// Result of running one stage in isolation.
#[derive(Debug)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub message: Option<String>,
    /// Present only for `SUCCESS`.
    pub output: Option<StageOutput>,
    pub elapsed: Duration,
}

impl StageOutcome {
    fn finished(status: StageStatus, message: Option<String>, started: Instant) -> Self {
        Self {
            status,
            message,
            output: None,
            elapsed: started.elapsed(),
        }
    }
}

enum Gate {
    Open,
    Defect(String),
    Blocked(String),
}

fn check_dependencies(
    spec: &StageSpec,
    record: &CaseRecord,
    writers: &BTreeMap<Section, Vec<&'static str>>,
) -> Gate {
    for dependency in &spec.dependencies {
        let section = dependency.section();
        if section == Section::Identity {
            continue;
        }

        let section_writers: Vec<&str> = writers
            .get(&section)
            .map(|w| w.iter().copied().filter(|name| *name != spec.name).collect())
            .unwrap_or_default();

        for writer in &section_writers {
            match record.status_of(writer) {
                Some(status) if status.is_terminal() => {}
                Some(status) => {
                    return Gate::Defect(format!(
                        "ordering defect: {section} writer '{writer}' is still {status}"
                    ));
                }
                None => {
                    return Gate::Defect(format!(
                        "ordering defect: {section} writer '{writer}' has not run"
                    ));
                }
            }
        }

        if dependency.is_required() && !record.has_section(section) {
            let detail = if section_writers.is_empty() {
                "no writer".to_string()
            } else {
                section_writers
                    .iter()
                    .map(|w| {
                        let status = record
                            .status_of(w)
                            .map_or("UNKNOWN", |s| s.as_str());
                        format!("{w}: {status}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            return Gate::Blocked(format!("blocked: {section} unavailable ({detail})"));
        }
    }
    Gate::Open
}

/// Run one stage with every failure captured as a status.
#[instrument(skip_all, fields(stage = stage.spec().name))]
pub async fn run_isolated(
    stage: &dyn Stage,
    record: &CaseRecord,
    ctx: &StageContext<'_>,
) -> StageOutcome {
    let started = Instant::now();
    let spec = stage.spec();

    match check_dependencies(spec, record, ctx.writers) {
        Gate::Open => {}
        Gate::Defect(message) => {
            warn!(%message, "stage dependency check failed");
            return StageOutcome::finished(StageStatus::Error, Some(message), started);
        }
        Gate::Blocked(message) => {
            warn!(%message, "stage blocked");
            return StageOutcome::finished(StageStatus::Skipped, Some(message), started);
        }
    }

    if let Applicability::Inapplicable(reason) = stage.applicability(record) {
        info!(%reason, "stage not applicable");
        return StageOutcome::finished(StageStatus::Skipped, Some(reason), started);
    }

    let output = match tokio::time::timeout(ctx.timeout, stage.execute(record)).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(error = %e, "stage failed");
            return StageOutcome::finished(StageStatus::Error, Some(e.to_string()), started);
        }
        Err(_) => {
            let e = AppraisalError::Timeout {
                stage: spec.name.to_string(),
                budget: ctx.timeout,
            };
            warn!(error = %e, "stage timed out");
            return StageOutcome::finished(StageStatus::Error, Some(e.to_string()), started);
        }
    };

    let undeclared: Vec<String> = output
        .touched_sections()
        .into_iter()
        .filter(|s| !spec.writes.contains(s))
        .map(|s| s.to_string())
        .collect();
    if !undeclared.is_empty() {
        let e = AppraisalError::contract(format!(
            "{} wrote undeclared sections: {}",
            spec.name,
            undeclared.join(", ")
        ));
        warn!(error = %e, "stage output rejected");
        return StageOutcome::finished(StageStatus::Error, Some(e.to_string()), started);
    }

    if output.is_empty() {
        let message = output.note.clone().or_else(|| Some("no data".to_string()));
        info!("stage found nothing");
        return StageOutcome::finished(StageStatus::NotFound, message, started);
    }

    StageOutcome {
        status: StageStatus::Success,
        message: output.note.clone(),
        output: Some(output),
        elapsed: started.elapsed(),
    }
}
