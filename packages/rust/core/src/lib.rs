//! Pipeline orchestration and domain logic for appraisal reports.
//!
//! This crate holds the stage abstraction and its isolation combinator, the
//! source-fusion resolver, comparable-sales processing, the collaborator
//! transports (bridge subprocess, one-shot command, HTTP) and the pipeline
//! controller that runs the fixed stage plan over a case record.

pub mod bridge;
pub mod collaborator;
pub mod command;
pub mod comps;
pub mod fusion;
pub mod http;
pub mod pipeline;
pub mod stage;
pub mod stages;

#[cfg(test)]
pub(crate) mod testing;

pub use collaborator::{
    CachedCollaborator, Collaborator, CollaboratorRequest, CollaboratorResponse, Collaborators,
    collaborators_from_config,
};
pub use pipeline::{Pipeline, PipelineProgress, SilentProgress, extraction_policy};
pub use stage::{Applicability, Dependency, Stage, StageOutput, StageSpec, run_isolated};
