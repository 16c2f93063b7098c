//! The pipeline controller: runs the fixed stage plan against one record.
//!
//! The controller is the only code that mutates the record during a run. It
//! marks each stage `ATTEMPTED`, runs it through [`run_isolated`], merges the
//! returned output (attributes through the fusion resolver) and records the
//! final status. After the structured lookup it decides how broad search may
//! interact with what was found.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use appraisal_shared::{
    AppraisalError, Attribute, BroadSearchMode, CaseInput, CaseRecord, ComparablesSection,
    ExtractionPolicy, FieldValue, FusionDecision, Narrative, PipelineSettings, Provenance,
    ReconciledValue, Result, RunState, Section, SourceKind, StageEntry, StageStatus,
    ValuationResult, record::mean,
};

use crate::collaborator::Collaborators;
use crate::fusion::{self, MergeMode};
use crate::stage::{Stage, StageContext, StageOutput, StageSpec, run_isolated};
use crate::stages::{self, names};

/// Reason recorded when broad search is not run.
pub const AUTHORITATIVE_SKIP: &str = "structured source authoritative";

/// Appended to a re-run failure whose earlier output stays in the record.
pub const RETAINED_NOTE: &str = "output from an earlier run retained";

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait PipelineProgress: Send + Sync {
    /// Called once before the first stage.
    fn run_started(&self, record: &CaseRecord, total: usize);
    /// Called when a stage is about to run.
    fn stage_started(&self, index: usize, total: usize, stage: &str);
    /// Called with the final status entry of a stage.
    fn stage_finished(&self, stage: &str, entry: &StageEntry);
    /// Called once after the last stage.
    fn run_finished(&self, record: &CaseRecord);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl PipelineProgress for SilentProgress {
    fn run_started(&self, _record: &CaseRecord, _total: usize) {}
    fn stage_started(&self, _index: usize, _total: usize, _stage: &str) {}
    fn stage_finished(&self, _stage: &str, _entry: &StageEntry) {}
    fn run_finished(&self, _record: &CaseRecord) {}
}

// ---------------------------------------------------------------------------
// Extraction policy
// ---------------------------------------------------------------------------

/// Decide the broad-search role from the structured stage's aggregate
/// confidence.
///
/// Below the threshold (or with nothing found) broad search competes field by
/// field. At or above it, broad search is skipped unless verification is
/// switched on, in which case it runs as a supplementary pass that cannot
/// displace values at or above the threshold.
pub fn extraction_policy(aggregate: Option<f64>, settings: &PipelineSettings) -> ExtractionPolicy {
    let threshold = settings.promotion_threshold;
    let authoritative = aggregate.is_some_and(|a| a >= threshold);
    let broad_search = match (authoritative, settings.verify_authoritative) {
        (false, _) => BroadSearchMode::Competitive,
        (true, true) => BroadSearchMode::Supplementary,
        (true, false) => BroadSearchMode::Skipped,
    };
    ExtractionPolicy {
        structured_aggregate: aggregate,
        threshold,
        authoritative,
        broad_search,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A configured stage plan.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    settings: PipelineSettings,
    /// Stage names writing each section, in plan order.
    writers: BTreeMap<Section, Vec<&'static str>>,
}

impl Pipeline {
    /// Build a pipeline over an explicit plan. Stage names must be unique.
    pub fn new(stages: Vec<Box<dyn Stage>>, settings: PipelineSettings) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut writers: BTreeMap<Section, Vec<&'static str>> = BTreeMap::new();
        for stage in &stages {
            let spec = stage.spec();
            if !seen.insert(spec.name) {
                return Err(AppraisalError::config(format!(
                    "duplicate stage '{}' in plan",
                    spec.name
                )));
            }
            for section in &spec.writes {
                writers.entry(*section).or_default().push(spec.name);
            }
        }
        Ok(Self {
            stages,
            settings,
            writers,
        })
    }

    /// The thirteen-stage appraisal plan.
    pub fn standard(collaborators: &Collaborators, settings: PipelineSettings) -> Result<Self> {
        let stages = stages::standard_plan(collaborators, &settings);
        Self::new(stages, settings)
    }

    pub fn plan(&self) -> Vec<&StageSpec> {
        self.stages.iter().map(|s| s.spec()).collect()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Validate `input` and run every stage.
    ///
    /// Returns `Err` only when the input is invalid; stage failures are
    /// recorded in the returned record's bookkeeping.
    pub async fn run(&self, input: &CaseInput) -> Result<CaseRecord> {
        self.run_with_progress(input, &SilentProgress).await
    }

    pub async fn run_with_progress(
        &self,
        input: &CaseInput,
        progress: &dyn PipelineProgress,
    ) -> Result<CaseRecord> {
        let validated = input.validate()?;
        let record = CaseRecord::from_validated(validated);
        Ok(self.execute(record, progress).await)
    }

    /// Run every stage against an already-built record.
    #[instrument(skip_all, fields(run_id = %record.run_id, address = %record.identity.address))]
    pub async fn execute(
        &self,
        mut record: CaseRecord,
        progress: &dyn PipelineProgress,
    ) -> CaseRecord {
        let started = Instant::now();
        let total = self.stages.len();
        let ctx = StageContext {
            writers: &self.writers,
            timeout: self.settings.stage_timeout,
        };

        info!(
            stages = total,
            classification = %record.identity.classification,
            "starting appraisal run"
        );
        progress.run_started(&record, total);

        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.spec().name;
            record.bookkeeping.run_state = RunState::Running {
                index,
                stage: name.to_string(),
            };
            progress.stage_started(index, total, name);

            let mode = if name == names::BROAD_SEARCH {
                match record.bookkeeping.extraction.as_ref().map(|p| p.broad_search) {
                    Some(BroadSearchMode::Skipped) => {
                        info!(stage = name, "skipping: {AUTHORITATIVE_SKIP}");
                        record.set_status(
                            name,
                            StageStatus::Skipped,
                            Some(AUTHORITATIVE_SKIP.to_string()),
                        );
                        self.report(&record, name, progress);
                        continue;
                    }
                    Some(BroadSearchMode::Supplementary) => MergeMode::Supplementary {
                        threshold: self.settings.promotion_threshold,
                    },
                    Some(BroadSearchMode::Competitive) | None => MergeMode::Competitive,
                }
            } else {
                MergeMode::Competitive
            };

            let previous = record.status_of(name);
            record.set_status(name, StageStatus::Attempted, None);
            let mut outcome = run_isolated(stage.as_ref(), &record, &ctx).await;
            if outcome.status == StageStatus::Error && previous == Some(StageStatus::Success) {
                outcome.message = Some(format!(
                    "{}; {RETAINED_NOTE}",
                    outcome.message.unwrap_or_default()
                ));
            }

            if name == names::STRUCTURED_LOOKUP {
                let aggregate = outcome
                    .output
                    .as_ref()
                    .and_then(|o| fusion::aggregate_confidence(o.attributes.values().flatten()));
                let policy = extraction_policy(aggregate, &self.settings);
                info!(
                    aggregate = ?policy.structured_aggregate,
                    authoritative = policy.authoritative,
                    broad_search = ?policy.broad_search,
                    "extraction policy decided"
                );
                record.bookkeeping.extraction = Some(policy);
            }

            if let Some(output) = outcome.output {
                merge_output(&mut record, name, output, mode);
            }
            record.set_status(name, outcome.status, outcome.message);
            if let Some(entry) = record.bookkeeping.status.get_mut(name) {
                entry.elapsed_ms = Some(outcome.elapsed.as_millis() as u64);
            }
            self.report(&record, name, progress);
        }

        record.bookkeeping.run_state = RunState::Completed;
        record.bookkeeping.overall_confidence = record.rollup_confidence(&self.settings.rollup);
        record.bookkeeping.completed_at = Some(Utc::now());

        let failed = record.failed_stages();
        if failed.is_empty() {
            info!(
                confidence = record.bookkeeping.overall_confidence,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "appraisal run complete"
            );
        } else {
            warn!(
                failed = ?failed,
                confidence = record.bookkeeping.overall_confidence,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "appraisal run complete with stage errors"
            );
        }
        progress.run_finished(&record);
        record
    }

    fn report(&self, record: &CaseRecord, name: &str, progress: &dyn PipelineProgress) {
        if let Some(entry) = record.bookkeeping.status.get(name) {
            info!(stage = name, status = %entry.status, "stage finished");
            progress.stage_finished(name, entry);
        }
    }
}

/// Commit a stage's output to the record.
///
/// Attributes fuse field by field. Every other section fuses as a whole, so
/// re-running a record never swaps in a weaker section than it already holds.
fn merge_output(record: &mut CaseRecord, stage: &str, output: StageOutput, mode: MergeMode) {
    for (field, candidates) in output.attributes {
        if let Some(decision) =
            fusion::merge_attribute(&mut record.attributes, &field, candidates, stage, mode)
        {
            record.bookkeeping.fusion_log.push(decision);
        }
    }

    let log = &mut record.bookkeeping.fusion_log;
    if let Some(comparables) = output.comparables {
        let current = record.comparables.as_ref().map(|c| comparables_summary(c, stage));
        let incoming = comparables_summary(&comparables, stage);
        if commit_section(log, Section::Comparables, current, incoming, stage) {
            record.comparables = Some(comparables);
        }
    }
    for (section, narrative) in output.narratives {
        let current = record.narratives.get(&section).map(|n| narrative_summary(n, stage));
        let incoming = narrative_summary(&narrative, stage);
        if commit_section(log, Section::Narrative(section), current, incoming, stage) {
            record.narratives.insert(section, narrative);
        }
    }
    for (method, result) in output.valuations {
        let current = record.valuations.get(&method).map(|v| valuation_summary(v, stage));
        let incoming = valuation_summary(&result, stage);
        if commit_section(log, Section::Valuation(method), current, incoming, stage) {
            record.valuations.insert(method, result);
        }
    }
    if let Some(reconciled) = output.reconciled {
        let current = record.reconciled.as_ref().map(reconciled_summary);
        let incoming = reconciled_summary(&reconciled);
        if commit_section(log, Section::Reconciled, current, incoming, stage) {
            record.reconciled = Some(reconciled);
        }
    }
}

fn commit_section(
    log: &mut Vec<FusionDecision>,
    section: Section,
    current: Option<Attribute>,
    incoming: Attribute,
    stage: &str,
) -> bool {
    let (replace, decision) =
        fusion::merge_section(current, incoming, &section.to_string(), stage);
    log.push(decision);
    replace
}

// Sections without their own provenance are attributed to the writing stage.

fn comparables_summary(section: &ComparablesSection, stage: &str) -> Attribute {
    Attribute {
        value: FieldValue::text(&section.summary),
        provenance: Provenance::new(SourceKind::Inferred, stage),
        confidence: mean(section.sales.iter().map(|s| s.confidence)).unwrap_or(0.0),
    }
}

fn narrative_summary(narrative: &Narrative, stage: &str) -> Attribute {
    Attribute {
        value: FieldValue::text(&narrative.text),
        provenance: Provenance::new(SourceKind::Inferred, stage),
        confidence: narrative.confidence,
    }
}

fn valuation_summary(result: &ValuationResult, stage: &str) -> Attribute {
    Attribute {
        value: FieldValue::money(result.indicated_value),
        provenance: Provenance::new(SourceKind::Inferred, stage),
        confidence: result.confidence,
    }
}

fn reconciled_summary(reconciled: &ReconciledValue) -> Attribute {
    Attribute {
        value: FieldValue::money(reconciled.value),
        provenance: reconciled.provenance.clone(),
        confidence: reconciled.confidence,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::testing::ScriptedCollaborator;
    use appraisal_shared::{
        FieldValue, FusionRule, NarrativeSection, Overrides, SourceKind, ValuationMethod, fields,
    };
    use crate::stages::names::*;
    use serde_json::json;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            stage_timeout: Duration::from_secs(5),
            ..PipelineSettings::default()
        }
    }

    fn input() -> CaseInput {
        CaseInput {
            address: "100 Main St".into(),
            city: "Springfield".into(),
            county: Some("Hampden".into()),
            state: "MA".into(),
            zip: None,
            property_type: "Retail".into(),
            valuation_date: "2026-06-30".into(),
            number_of_comps: None,
            subject_size_sqft: None,
            subject_year_built: None,
            overrides: Overrides::default(),
        }
    }

    fn parcel(confidence: f64) -> serde_json::Value {
        json!({
            "error": null,
            "data": {"propertyId": "F_123_456", "lotSize": 1.2, "lotUnits": "A"},
            "warnings": [],
            "match_confidence": confidence
        })
    }

    fn search(fields: serde_json::Value) -> serde_json::Value {
        json!({ "fields": fields })
    }

    fn text(body: &str, confidence: f64) -> serde_json::Value {
        json!({"text": body, "confidence": confidence})
    }

    fn valuation(value: f64, confidence: f64) -> serde_json::Value {
        json!({"indicated_value": value, "breakdown": {}, "confidence": confidence})
    }

    /// Every stage answers; structured below threshold so broad search runs.
    fn full_script() -> ScriptedCollaborator {
        ScriptedCollaborator::new()
            .reply(STRUCTURED_LOOKUP, parcel(0.6))
            .reply(
                BROAD_SEARCH,
                search(json!([
                    {"name": "zoning", "value": {"kind": "text", "value": "B-2"}, "confidence": 0.7}
                ])),
            )
            .reply(
                COMPARABLE_SALES,
                json!({"sales": [
                    {"address": "12 Elm St", "saleDate": "2025-03-01", "salePrice": 900000, "source": "CoStar", "confidenceScore": 0.8}
                ]}),
            )
            .reply(SITE_DESCRIPTION, text("Level corner lot.", 0.8))
            .reply(MARKET_ANALYSIS, text("Stable retail demand.", 0.7))
            .reply(HIGHEST_AND_BEST_USE, text("Continued retail use.", 0.7))
            .reply(SALES_COMPARISON, valuation(1_000_000.0, 0.6))
            .reply(INCOME_APPROACH, valuation(1_200_000.0, 0.2))
            .reply(COST_APPROACH, valuation(1_100_000.0, 0.2))
            .reply(
                RECONCILIATION,
                json!({"approaches_text": "All three developed.", "reconciliation_text": "Sales comparison weighted.", "confidence": 0.7}),
            )
            .reply(CERTIFICATION, text("I certify...", 0.9))
            .reply(SUMMARY, text("Summary of salient facts.", 0.8))
            .reply(TRANSMITTAL, text("Transmitted herewith.", 0.8))
    }

    fn pipeline(collaborator: Arc<ScriptedCollaborator>, settings: PipelineSettings) -> Pipeline {
        Pipeline::standard(&Collaborators::single(collaborator), settings).expect("plan")
    }

    fn status(record: &CaseRecord, stage: &str) -> StageStatus {
        record.status_of(stage).expect("status entry")
    }

    #[tokio::test]
    async fn full_run_succeeds_and_bookkeeping_is_complete() {
        let collaborator = Arc::new(full_script());
        let record = pipeline(collaborator.clone(), settings())
            .run(&input())
            .await
            .expect("run");

        assert_eq!(record.bookkeeping.status.len(), names::ALL.len());
        for stage in names::ALL {
            assert_eq!(status(&record, stage), StageStatus::Success, "{stage}");
            assert!(record.bookkeeping.status[stage].elapsed_ms.is_some());
        }
        assert_eq!(record.bookkeeping.run_state, RunState::Completed);
        assert!(record.bookkeeping.completed_at.is_some());
        assert_eq!(record.narratives.len(), NarrativeSection::ALL.len());
        assert_eq!(record.valuations.len(), 3);

        let reconciled = record.reconciled.as_ref().expect("reconciled");
        assert!((reconciled.value - 1_060_000.0).abs() < 1e-6);
        assert_eq!(reconciled.provenance.kind, SourceKind::Inferred);

        assert_eq!(collaborator.calls(), names::ALL.to_vec());
        assert!(record.bookkeeping.overall_confidence > 0.0);
    }

    #[tokio::test]
    async fn invalid_input_aborts_before_any_stage() {
        let collaborator = Arc::new(full_script());
        let mut bad = input();
        bad.valuation_date = "June 30".into();

        let err = pipeline(collaborator.clone(), settings())
            .run(&bad)
            .await
            .unwrap_err();
        assert!(matches!(err, AppraisalError::Validation { .. }));
        assert!(collaborator.calls().is_empty());
    }

    #[tokio::test]
    async fn forced_failure_is_isolated() {
        let collaborator = Arc::new(full_script().fail(MARKET_ANALYSIS, "model overloaded"));
        let record = pipeline(collaborator, settings())
            .run(&input())
            .await
            .expect("run");

        assert_eq!(record.failed_stages(), vec![MARKET_ANALYSIS]);
        assert!(
            record.bookkeeping.status[MARKET_ANALYSIS]
                .message
                .as_deref()
                .unwrap_or_default()
                .contains("model overloaded")
        );
        for stage in names::ALL.iter().filter(|s| **s != MARKET_ANALYSIS) {
            assert_eq!(status(&record, stage), StageStatus::Success, "{stage}");
        }
        assert_eq!(record.bookkeeping.status.len(), names::ALL.len());
    }

    #[tokio::test]
    async fn scenario_structured_and_broad_fuse_per_field() {
        let collaborator = Arc::new(
            full_script()
                .reply(STRUCTURED_LOOKUP, parcel(0.95))
                .reply(
                    BROAD_SEARCH,
                    search(json!([
                        {"name": "zoning", "value": {"kind": "text", "value": "B-2"}, "confidence": 0.7},
                        {"name": "lot_size", "value": {"kind": "quantity", "value": {"amount": 1.0, "unit": "acres"}}, "confidence": 0.5}
                    ])),
                ),
        );
        let settings = PipelineSettings {
            verify_authoritative: true,
            ..settings()
        };
        let record = pipeline(collaborator, settings)
            .run(&input())
            .await
            .expect("run");

        assert_eq!(status(&record, STRUCTURED_LOOKUP), StageStatus::Success);
        assert_eq!(status(&record, BROAD_SEARCH), StageStatus::Success);

        assert_eq!(record.attributes[fields::PARCEL_ID].provenance.kind, SourceKind::Structured);
        assert_eq!(record.attributes[fields::LOT_SIZE].provenance.kind, SourceKind::Structured);
        assert_eq!(record.attributes[fields::LOT_SIZE].value, FieldValue::quantity(1.2, "acres"));
        assert_eq!(record.attributes[fields::LOT_SIZE].confidence, 0.95);
        assert_eq!(record.attributes[fields::ZONING].provenance.kind, SourceKind::BroadSearch);
        assert_eq!(record.attributes[fields::ZONING].confidence, 0.7);

        let policy = record.bookkeeping.extraction.as_ref().expect("policy");
        assert!(policy.authoritative);
        assert_eq!(policy.broad_search, BroadSearchMode::Supplementary);
    }

    #[tokio::test]
    async fn scenario_rollup_is_weighted_mean_of_populated_categories() {
        // Only extraction answers; every later stage fails or is blocked.
        let collaborator = Arc::new(
            ScriptedCollaborator::new()
                .reply(STRUCTURED_LOOKUP, parcel(0.95))
                .reply(
                    BROAD_SEARCH,
                    search(json!([
                        {"name": "zoning", "value": {"kind": "text", "value": "B-2"}, "confidence": 0.7},
                        {"name": "lot_size", "value": {"kind": "quantity", "value": {"amount": 1.0, "unit": "acres"}}, "confidence": 0.5}
                    ])),
                ),
        );
        let settings = PipelineSettings {
            verify_authoritative: true,
            ..settings()
        };
        let record = pipeline(collaborator, settings)
            .run(&input())
            .await
            .expect("run");

        assert!(record.narratives.is_empty());
        assert!(record.valuations.is_empty());
        let expected = (0.95 + 0.95 + 0.7) / 3.0;
        assert!((record.bookkeeping.overall_confidence - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn authoritative_structured_value_survives_stronger_verification() {
        let broad = search(json!([
            {"name": "lot_size", "value": {"kind": "quantity", "value": {"amount": 2.0, "unit": "acres"}}, "confidence": 0.95}
        ]));
        let verify = PipelineSettings {
            verify_authoritative: true,
            ..settings()
        };

        let above = Arc::new(
            full_script()
                .reply(STRUCTURED_LOOKUP, parcel(0.9))
                .reply(BROAD_SEARCH, broad.clone()),
        );
        let record = pipeline(above, verify.clone()).run(&input()).await.expect("run");
        let lot = &record.attributes[fields::LOT_SIZE];
        assert_eq!(lot.value, FieldValue::quantity(1.2, "acres"));
        assert_eq!(lot.provenance.kind, SourceKind::Structured);
        assert!(
            record
                .bookkeeping
                .fusion_log
                .iter()
                .any(|d| d.field == fields::LOT_SIZE && d.rule == FusionRule::AuthoritativeKept)
        );

        let below = Arc::new(
            full_script()
                .reply(STRUCTURED_LOOKUP, parcel(0.6))
                .reply(BROAD_SEARCH, broad),
        );
        let record = pipeline(below, verify).run(&input()).await.expect("run");
        let lot = &record.attributes[fields::LOT_SIZE];
        assert_eq!(lot.value, FieldValue::quantity(2.0, "acres"));
        assert_eq!(lot.confidence, 0.95);
        assert_eq!(lot.provenance.kind, SourceKind::BroadSearch);
        let decision = record
            .bookkeeping
            .fusion_log
            .iter()
            .find(|d| d.field == fields::LOT_SIZE && d.stage == BROAD_SEARCH)
            .expect("decision");
        assert_eq!(decision.rule, FusionRule::Ranked);
        assert!(decision.displaced.is_some());
        assert!(decision.conflict);
    }

    #[tokio::test]
    async fn authoritative_source_skips_broad_search_by_default() {
        let collaborator = Arc::new(full_script().reply(STRUCTURED_LOOKUP, parcel(0.9)));
        let record = pipeline(collaborator.clone(), settings())
            .run(&input())
            .await
            .expect("run");

        assert_eq!(status(&record, BROAD_SEARCH), StageStatus::Skipped);
        assert_eq!(
            record.bookkeeping.status[BROAD_SEARCH].message.as_deref(),
            Some(AUTHORITATIVE_SKIP)
        );
        assert!(!collaborator.calls().iter().any(|t| t == BROAD_SEARCH));
        assert!(!record.attributes.contains_key(fields::ZONING));
        assert_eq!(
            record.bookkeeping.extraction.as_ref().map(|p| p.broad_search),
            Some(BroadSearchMode::Skipped)
        );
    }

    #[tokio::test]
    async fn missing_attributes_block_dependent_stages() {
        let collaborator = Arc::new(
            full_script()
                .reply(
                    STRUCTURED_LOOKUP,
                    json!({"error": "No properties found for city: Springfield", "data": null, "warnings": [], "match_confidence": 0.0}),
                )
                .fail(BROAD_SEARCH, "search backend down"),
        );
        let record = pipeline(collaborator.clone(), settings())
            .run(&input())
            .await
            .expect("run");

        assert_eq!(status(&record, STRUCTURED_LOOKUP), StageStatus::NotFound);
        assert_eq!(status(&record, BROAD_SEARCH), StageStatus::Error);
        assert_eq!(
            record.bookkeeping.extraction.as_ref().map(|p| p.broad_search),
            Some(BroadSearchMode::Competitive)
        );

        for blocked in [SITE_DESCRIPTION, HIGHEST_AND_BEST_USE, COST_APPROACH] {
            assert_eq!(status(&record, blocked), StageStatus::Skipped, "{blocked}");
            let message = record.bookkeeping.status[blocked].message.clone().unwrap_or_default();
            assert!(message.starts_with("blocked:"), "{message}");
        }
        assert!(
            record.bookkeeping.status[SITE_DESCRIPTION]
                .message
                .as_deref()
                .unwrap_or_default()
                .contains("broad_search: ERROR")
        );
        assert!(!collaborator.calls().iter().any(|t| t == SITE_DESCRIPTION));

        // Stages with only optional reads carry on.
        assert_eq!(status(&record, MARKET_ANALYSIS), StageStatus::Success);
        assert_eq!(status(&record, SALES_COMPARISON), StageStatus::Success);
        assert_eq!(status(&record, RECONCILIATION), StageStatus::Success);
        assert_eq!(record.bookkeeping.status.len(), names::ALL.len());
    }

    #[tokio::test]
    async fn overrides_are_locked_and_bypass_reconciliation() {
        let collaborator = Arc::new(
            full_script().reply(
                BROAD_SEARCH,
                search(json!([
                    {"name": "zoning", "value": {"kind": "text", "value": "B-2"}, "confidence": 0.99}
                ])),
            ),
        );
        let mut input = input();
        input
            .overrides
            .attributes
            .insert(fields::ZONING.into(), FieldValue::text("C-1"));
        input.overrides.value_override = Some(1_500_000.0);

        let record = pipeline(collaborator, settings())
            .run(&input)
            .await
            .expect("run");

        let zoning = &record.attributes[fields::ZONING];
        assert_eq!(zoning.value, FieldValue::text("C-1"));
        assert_eq!(zoning.provenance.kind, SourceKind::UserOverride);
        assert!(
            record
                .bookkeeping
                .fusion_log
                .iter()
                .any(|d| d.field == fields::ZONING && d.rule == FusionRule::OverrideLocked)
        );

        let reconciled = record.reconciled.as_ref().expect("reconciled");
        assert_eq!(reconciled.value, 1_500_000.0);
        assert_eq!(reconciled.confidence, 1.0);
        assert_eq!(reconciled.provenance.kind, SourceKind::UserOverride);
        assert_eq!(record.valuations.len(), 3);
    }

    #[tokio::test]
    async fn inapplicable_approaches_are_skipped() {
        let collaborator = Arc::new(full_script());
        let mut input = input();
        input.property_type = "Vacant Land".into();

        let record = pipeline(collaborator.clone(), settings())
            .run(&input)
            .await
            .expect("run");
        assert_eq!(status(&record, COST_APPROACH), StageStatus::Skipped);
        assert!(!record.valuations.contains_key(&ValuationMethod::Cost));
        assert!(!collaborator.calls().iter().any(|t| t == COST_APPROACH));
    }

    #[tokio::test]
    async fn hung_collaborator_times_out() {
        let collaborator = Arc::new(full_script().hang(SUMMARY));
        let settings = PipelineSettings {
            stage_timeout: Duration::from_millis(50),
            ..settings()
        };
        let record = pipeline(collaborator, settings)
            .run(&input())
            .await
            .expect("run");

        assert_eq!(status(&record, SUMMARY), StageStatus::Error);
        assert!(
            record.bookkeeping.status[SUMMARY]
                .message
                .as_deref()
                .unwrap_or_default()
                .contains("timed out")
        );
        // Transmittal only reads the summary optionally.
        assert_eq!(status(&record, TRANSMITTAL), StageStatus::Success);
    }

    #[tokio::test]
    async fn rerunning_a_record_is_idempotent() {
        let collaborator = Arc::new(full_script());
        let pipeline = pipeline(collaborator, settings());
        let first = pipeline.run(&input()).await.expect("run");
        let second = pipeline.execute(first.clone(), &SilentProgress).await;

        assert_eq!(first.attributes, second.attributes);
        assert_eq!(first.reconciled, second.reconciled);
    }

    #[tokio::test]
    async fn weaker_rerun_keeps_stronger_sections() {
        let strong = pipeline(
            Arc::new(full_script().reply(SITE_DESCRIPTION, text("Level corner lot.", 0.9))),
            settings(),
        );
        let first = strong.run(&input()).await.expect("run");

        let weak = pipeline(
            Arc::new(
                full_script()
                    .reply(SITE_DESCRIPTION, text("Lot.", 0.1))
                    .reply(SALES_COMPARISON, valuation(700_000.0, 0.1)),
            ),
            settings(),
        );
        let second = weak.execute(first.clone(), &SilentProgress).await;

        let site = &second.narratives[&NarrativeSection::SiteDescription];
        assert_eq!(site.text, "Level corner lot.");
        assert_eq!(site.confidence, 0.9);
        let sales = &second.valuations[&ValuationMethod::SalesComparison];
        assert_eq!(sales.indicated_value, 1_000_000.0);
        assert_eq!(first.reconciled, second.reconciled);

        for (section, narrative) in &first.narratives {
            assert!(second.narratives[section].confidence >= narrative.confidence);
        }

        let decision = second
            .bookkeeping
            .fusion_log
            .iter()
            .rev()
            .find(|d| d.field == "narrative.site_description")
            .expect("section decision");
        assert_eq!(decision.stage, SITE_DESCRIPTION);
        assert_eq!(decision.rule, FusionRule::Ranked);
        assert_eq!(decision.winner_confidence, 0.9);
        assert!(decision.displaced.is_none());
        assert_eq!(decision.rejected[0].confidence, 0.1);
        assert!(decision.conflict);
    }

    #[tokio::test]
    async fn stronger_rerun_replaces_section_with_audit() {
        let first = pipeline(Arc::new(full_script()), settings())
            .run(&input())
            .await
            .expect("run");
        let better = full_script().reply(
            SITE_DESCRIPTION,
            text("Level corner lot with 200 ft of frontage.", 0.95),
        );
        let second = pipeline(Arc::new(better), settings())
            .execute(first, &SilentProgress)
            .await;

        let site = &second.narratives[&NarrativeSection::SiteDescription];
        assert_eq!(site.confidence, 0.95);
        let decision = second
            .bookkeeping
            .fusion_log
            .iter()
            .rev()
            .find(|d| d.field == "narrative.site_description")
            .expect("section decision");
        assert_eq!(decision.displaced.as_ref().map(|d| d.confidence), Some(0.8));
    }

    #[tokio::test]
    async fn failed_rerun_says_earlier_output_is_kept() {
        let first = pipeline(Arc::new(full_script()), settings())
            .run(&input())
            .await
            .expect("run");
        let second = pipeline(
            Arc::new(full_script().fail(SITE_DESCRIPTION, "model overloaded")),
            settings(),
        )
        .execute(first, &SilentProgress)
        .await;

        assert_eq!(status(&second, SITE_DESCRIPTION), StageStatus::Error);
        let message = second.bookkeeping.status[SITE_DESCRIPTION]
            .message
            .clone()
            .unwrap_or_default();
        assert!(message.contains("model overloaded"), "{message}");
        assert!(message.ends_with(RETAINED_NOTE), "{message}");
        assert_eq!(
            second.narratives[&NarrativeSection::SiteDescription].text,
            "Level corner lot."
        );
        assert_eq!(status(&second, HIGHEST_AND_BEST_USE), StageStatus::Success);
    }

    #[tokio::test]
    async fn failure_in_any_stage_only_reaches_its_dependents() {
        let plan: Vec<StageSpec> = pipeline(Arc::new(full_script()), settings())
            .plan()
            .into_iter()
            .cloned()
            .collect();

        for failing in names::ALL {
            // Stages expected to end without SUCCESS: the failing one, then
            // any stage whose required section lost every writer.
            let mut down: HashSet<&str> = HashSet::from([failing]);
            for spec in &plan {
                let blocked = spec.dependencies.iter().any(|d| {
                    d.is_required()
                        && d.section() != Section::Identity
                        && plan
                            .iter()
                            .filter(|w| w.writes.contains(&d.section()))
                            .all(|w| down.contains(w.name))
                });
                if blocked {
                    down.insert(spec.name);
                }
            }

            let collaborator = Arc::new(full_script().fail(failing, "injected failure"));
            let record = pipeline(collaborator, settings())
                .run(&input())
                .await
                .expect("run");

            assert_eq!(record.bookkeeping.status.len(), names::ALL.len(), "{failing}");
            assert_eq!(record.failed_stages(), vec![failing], "{failing}");
            for stage in names::ALL {
                let expected = if stage == failing {
                    StageStatus::Error
                } else if down.contains(stage) {
                    StageStatus::Skipped
                } else {
                    StageStatus::Success
                };
                assert_eq!(status(&record, stage), expected, "{failing} -> {stage}");
            }
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<String>>,
    }

    impl PipelineProgress for RecordingProgress {
        fn run_started(&self, _record: &CaseRecord, total: usize) {
            self.events.lock().unwrap().push(format!("start:{total}"));
        }
        fn stage_started(&self, index: usize, _total: usize, stage: &str) {
            self.events.lock().unwrap().push(format!("{index}:{stage}"));
        }
        fn stage_finished(&self, stage: &str, entry: &StageEntry) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{stage}={}", entry.status));
        }
        fn run_finished(&self, _record: &CaseRecord) {
            self.events.lock().unwrap().push("done".into());
        }
    }

    #[tokio::test]
    async fn progress_sees_every_stage_in_order() {
        let progress = RecordingProgress::default();
        pipeline(Arc::new(full_script()), settings())
            .run_with_progress(&input(), &progress)
            .await
            .expect("run");

        let events = progress.events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("start:13"));
        assert_eq!(events.last().map(String::as_str), Some("done"));
        assert_eq!(events[1], "0:structured_lookup");
        assert_eq!(events[2], "structured_lookup=SUCCESS");
        assert_eq!(events.len(), 2 + 2 * names::ALL.len());
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let collaborators = Collaborators::single(Arc::new(ScriptedCollaborator::new()));
        let mut stages = stages::standard_plan(&collaborators, &settings());
        stages.extend(stages::standard_plan(&collaborators, &settings()));
        assert!(Pipeline::new(stages, settings()).is_err());
    }

    #[test]
    fn policy_matrix() {
        let mut s = settings();
        assert_eq!(
            extraction_policy(None, &s).broad_search,
            BroadSearchMode::Competitive
        );
        assert_eq!(
            extraction_policy(Some(0.79), &s).broad_search,
            BroadSearchMode::Competitive
        );
        assert_eq!(
            extraction_policy(Some(0.8), &s).broad_search,
            BroadSearchMode::Skipped
        );
        s.verify_authoritative = true;
        let policy = extraction_policy(Some(0.9), &s);
        assert!(policy.authoritative);
        assert_eq!(policy.broad_search, BroadSearchMode::Supplementary);
    }
}
