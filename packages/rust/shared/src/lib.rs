//! Shared types, error model, and configuration for the appraisal pipeline.
//!
//! This crate is the foundation depended on by all other appraisal crates.
//! It provides:
//! - [`AppraisalError`]: the unified error type
//! - The case record schema ([`CaseRecord`] and its sections)
//! - Caller input ([`CaseInput`]) and its validation
//! - Configuration ([`AppConfig`], [`PipelineSettings`], config loading)

pub mod config;
pub mod error;
pub mod record;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, CollaboratorConfig, CollaboratorKind, ComparablesConfig,
    PipelineConfig, PipelineSettings, RollupWeights, StructuredSourceConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
    validate_config,
};
pub use error::{AppraisalError, Result};
pub use record::{
    Attribute, Bookkeeping, BroadSearchMode, CaseRecord, ComparableSale, ComparablesSection,
    ExtractionPolicy, FieldValue, FusionDecision, FusionRule, Narrative, NarrativeSection,
    Provenance, ReconciledValue, RunState, Section, SourceKind, StageEntry, StageStatus,
    ValuationMethod, ValuationResult, fields,
};
pub use types::{
    CURRENT_SCHEMA_VERSION, CaseIdentity, CaseInput, CaseRequest, Locality, Overrides,
    PropertyClass, RunId, ValidatedInput,
};
