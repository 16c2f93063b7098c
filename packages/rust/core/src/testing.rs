//! Fakes shared by the unit tests in this crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use appraisal_shared::{
    AppraisalError, CaseIdentity, CaseRecord, CaseRequest, Locality, PropertyClass, Result,
};

use crate::collaborator::{Collaborator, CollaboratorRequest, CollaboratorResponse};
use crate::stage::{Applicability, Stage, StageOutput, StageSpec};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

pub fn identity(classification: PropertyClass) -> CaseIdentity {
    CaseIdentity {
        address: "100 Main St".into(),
        locality: Locality {
            city: "Springfield".into(),
            county: Some("Hampden".into()),
            state: "MA".into(),
            zip: None,
        },
        classification,
        valuation_date: NaiveDate::from_ymd_opt(2026, 6, 30).expect("valid date"),
    }
}

/// Retail subject with no attributes and default options.
pub fn record() -> CaseRecord {
    CaseRecord::new(identity(PropertyClass::Retail), CaseRequest::default())
}

// ---------------------------------------------------------------------------
// ScriptedCollaborator
// ---------------------------------------------------------------------------

enum Script {
    Reply(serde_json::Value),
    Fail(String),
    Hang,
}

/// Collaborator that answers each task from a fixed script.
pub struct ScriptedCollaborator {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<String>>,
    contexts: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedCollaborator {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, task: &str, payload: serde_json::Value) -> Self {
        self.scripts.insert(task.to_string(), Script::Reply(payload));
        self
    }

    pub fn fail(mut self, task: &str, message: &str) -> Self {
        self.scripts
            .insert(task.to_string(), Script::Fail(message.to_string()));
        self
    }

    /// Never answer; used to exercise timeouts.
    pub fn hang(mut self, task: &str) -> Self {
        self.scripts.insert(task.to_string(), Script::Hang);
        self
    }

    /// Tasks called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Context sent with the most recent call for `task`.
    pub fn context_for(&self, task: &str) -> Option<serde_json::Value> {
        let calls = self.calls.lock().expect("calls lock");
        let contexts = self.contexts.lock().expect("contexts lock");
        calls
            .iter()
            .zip(contexts.iter())
            .rev()
            .find(|(t, _)| t.as_str() == task)
            .map(|(_, c)| c.clone())
    }
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    async fn call(&self, request: &CollaboratorRequest) -> Result<CollaboratorResponse> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(request.task.clone());
        self.contexts
            .lock()
            .expect("contexts lock")
            .push(request.context.clone());

        match self.scripts.get(&request.task) {
            Some(Script::Reply(payload)) => Ok(CollaboratorResponse {
                payload: payload.clone(),
                model: "scripted".into(),
            }),
            Some(Script::Fail(message)) => Err(AppraisalError::Collaborator(message.clone())),
            Some(Script::Hang) => std::future::pending().await,
            None => Err(AppraisalError::Collaborator(format!(
                "no script for task '{}'",
                request.task
            ))),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// FnStage
// ---------------------------------------------------------------------------

type StageFn = Box<dyn Fn(&CaseRecord) -> Result<StageOutput> + Send + Sync>;

/// Stage backed by a closure.
pub struct FnStage {
    spec: StageSpec,
    body: StageFn,
    inapplicable: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FnStage {
    pub fn new(
        spec: StageSpec,
        body: impl Fn(&CaseRecord) -> Result<StageOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            spec,
            body: Box::new(body),
            inapplicable: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn inapplicable(mut self, reason: &str) -> Self {
        self.inapplicable = Some(reason.to_string());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Times `execute` was entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FnStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    fn applicability(&self, _record: &CaseRecord) -> Applicability {
        match &self.inapplicable {
            Some(reason) => Applicability::Inapplicable(reason.clone()),
            None => Applicability::Applicable,
        }
    }

    async fn execute(&self, record: &CaseRecord) -> Result<StageOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.body)(record)
    }
}
