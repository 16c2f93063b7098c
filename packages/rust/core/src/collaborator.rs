//! The narrative/extraction service every stage delegates to.
//!
//! A [`Collaborator`] takes a task name plus the slice of the case record the
//! stage is allowed to read and returns an untyped JSON payload. Stages own
//! the typing of their payload. Transports live in [`crate::bridge`],
//! [`crate::command`] and [`crate::http`]; [`CachedCollaborator`] adds a
//! libSQL response cache in front of any of them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use appraisal_shared::{AppConfig, CollaboratorKind, Result};
use appraisal_storage::{CacheKey, Storage};

use crate::bridge::{BridgeCollaborator, BridgeConfig};
use crate::command::CommandCollaborator;
use crate::http::{HttpCollaborator, HttpConfig};

/// One call to a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorRequest {
    /// Stage name; tells the service which payload shape to produce.
    pub task: String,
    /// Read-restricted JSON view of the case record.
    pub context: serde_json::Value,
}

impl CollaboratorRequest {
    pub fn new(task: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            task: task.into(),
            context,
        }
    }
}

/// Raw reply from a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorResponse {
    pub payload: serde_json::Value,
    /// Model or source that produced the payload.
    #[serde(default)]
    pub model: String,
}

/// An external service a stage calls exactly once per run.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn call(&self, request: &CollaboratorRequest) -> Result<CollaboratorResponse>;

    /// Identifier used to key cached responses.
    fn model_id(&self) -> &str;

    /// Release transport resources. Calls after this may restart them.
    async fn close(&self) {}
}

/// First 200 characters of `text`, for error messages.
pub(crate) fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Digest of a request for cache keying.
pub fn context_hash(request: &CollaboratorRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.task.as_bytes());
    hasher.update(request.context.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Wraps a collaborator with a persistent response cache.
///
/// Cache failures are logged and otherwise ignored; they never fail a call.
pub struct CachedCollaborator {
    inner: Arc<dyn Collaborator>,
    storage: Arc<Storage>,
}

impl CachedCollaborator {
    pub fn new(inner: Arc<dyn Collaborator>, storage: Arc<Storage>) -> Self {
        Self { inner, storage }
    }
}

#[async_trait]
impl Collaborator for CachedCollaborator {
    async fn call(&self, request: &CollaboratorRequest) -> Result<CollaboratorResponse> {
        let hash = context_hash(request);
        let key = CacheKey {
            task: &request.task,
            context_hash: &hash,
            model_id: self.inner.model_id(),
        };

        match self.storage.get_cached_response(key).await {
            Ok(Some(cached)) => match serde_json::from_str::<CollaboratorResponse>(&cached) {
                Ok(response) => {
                    debug!(task = %request.task, "collaborator cache hit");
                    return Ok(response);
                }
                Err(e) => warn!(task = %request.task, error = %e, "discarding corrupt cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(task = %request.task, error = %e, "collaborator cache read failed"),
        }

        let response = self.inner.call(request).await?;

        match serde_json::to_string(&response) {
            Ok(json) => {
                if let Err(e) = self.storage.set_cached_response(key, &json).await {
                    warn!(task = %request.task, error = %e, "collaborator cache write failed");
                }
            }
            Err(e) => warn!(task = %request.task, error = %e, "response not cacheable"),
        }

        Ok(response)
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

// ---------------------------------------------------------------------------
// Construction from configuration
// ---------------------------------------------------------------------------

/// Collaborators handed to the standard stage plan.
#[derive(Clone)]
pub struct Collaborators {
    /// Used by every stage without a dedicated source.
    pub shared: Arc<dyn Collaborator>,
    /// Dedicated parcel lookup; falls back to `shared` when absent.
    pub structured: Option<Arc<dyn Collaborator>>,
}

impl Collaborators {
    /// Same collaborator for every stage.
    pub fn single(collaborator: Arc<dyn Collaborator>) -> Self {
        Self {
            shared: collaborator,
            structured: None,
        }
    }

    pub fn structured(&self) -> Arc<dyn Collaborator> {
        self.structured
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.shared))
    }

    /// Close every transport.
    pub async fn close(&self) {
        self.shared.close().await;
        if let Some(structured) = &self.structured {
            structured.close().await;
        }
    }
}

/// Build the configured transports, wrapped in the response cache when
/// `cache` is given.
pub fn collaborators_from_config(
    config: &AppConfig,
    cache: Option<Arc<Storage>>,
) -> Result<Collaborators> {
    let c = &config.collaborator;
    let shared: Arc<dyn Collaborator> = match c.kind {
        CollaboratorKind::Bridge => Arc::new(BridgeCollaborator::new(BridgeConfig::from(c))),
        CollaboratorKind::Http => Arc::new(HttpCollaborator::new(HttpConfig::try_from(c)?)?),
    };

    let structured: Option<Arc<dyn Collaborator>> =
        config.structured_source.command.as_ref().map(|program| {
            Arc::new(CommandCollaborator::new(
                program.clone(),
                config.structured_source.args.clone(),
                config.structured_source.label.clone(),
            )) as Arc<dyn Collaborator>
        });

    let wrap = |inner: Arc<dyn Collaborator>| -> Arc<dyn Collaborator> {
        match &cache {
            Some(storage) => Arc::new(CachedCollaborator::new(inner, Arc::clone(storage))),
            None => inner,
        }
    };

    Ok(Collaborators {
        shared: wrap(shared),
        structured: structured.map(wrap),
    })
}
