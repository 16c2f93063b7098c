//! HTTP collaborator with request throttling.
//!
//! POSTs `{task, context, model}` to a configured endpoint and expects
//! `{payload, model?}` back. Calls are spaced at least `min_interval` apart.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};
use url::Url;

use appraisal_shared::{AppraisalError, CollaboratorConfig, Result};

use crate::collaborator::{Collaborator, CollaboratorRequest, CollaboratorResponse, excerpt};

/// User-Agent header sent with every request.
const USER_AGENT: &str = concat!("appraisal/", env!("CARGO_PKG_VERSION"));

/// Settings for [`HttpCollaborator`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub endpoint: Url,
    pub model: String,
    pub min_interval: Duration,
    /// Sent as a bearer token when set.
    pub api_key: Option<String>,
}

impl TryFrom<&CollaboratorConfig> for HttpConfig {
    type Error = AppraisalError;

    fn try_from(c: &CollaboratorConfig) -> Result<Self> {
        let endpoint = c.endpoint.as_deref().ok_or_else(|| {
            AppraisalError::config("collaborator.endpoint is required for the http transport")
        })?;
        let endpoint = Url::parse(endpoint).map_err(|e| {
            AppraisalError::config(format!("collaborator.endpoint '{endpoint}' is invalid: {e}"))
        })?;
        Ok(Self {
            endpoint,
            model: c.model.clone(),
            min_interval: Duration::from_millis(c.min_interval_ms),
            api_key: std::env::var(&c.api_key_env).ok().filter(|k| !k.is_empty()),
        })
    }
}

#[derive(serde::Serialize)]
struct HttpRequestBody<'a> {
    task: &'a str,
    context: &'a serde_json::Value,
    model: &'a str,
}

#[derive(serde::Deserialize)]
struct HttpResponseBody {
    payload: serde_json::Value,
    #[serde(default)]
    model: Option<String>,
}

/// Waits so that consecutive calls are at least `min_interval` apart.
struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "throttling");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Collaborator reached over HTTP.
pub struct HttpCollaborator {
    config: HttpConfig,
    client: Client,
    throttle: Throttle,
}

impl HttpCollaborator {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppraisalError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            throttle: Throttle::new(config.min_interval),
            config,
            client,
        })
    }
}

#[async_trait]
impl Collaborator for HttpCollaborator {
    #[instrument(skip_all, fields(endpoint = %self.config.endpoint, task = %request.task))]
    async fn call(&self, request: &CollaboratorRequest) -> Result<CollaboratorResponse> {
        self.throttle.wait().await;

        let body = HttpRequestBody {
            task: &request.task,
            context: &request.context,
            model: &self.config.model,
        };
        let mut builder = self.client.post(self.config.endpoint.clone()).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AppraisalError::Network(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppraisalError::Network(format!(
                "HTTP {status}: {}",
                excerpt(&text)
            )));
        }

        let parsed: HttpResponseBody = response
            .json()
            .await
            .map_err(|e| AppraisalError::parse(format!("invalid collaborator response: {e}")))?;

        Ok(CollaboratorResponse {
            payload: parsed.payload,
            model: parsed.model.unwrap_or_else(|| self.config.model.clone()),
        })
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, min_interval: Duration) -> HttpConfig {
        HttpConfig {
            endpoint: Url::parse(&format!("{}/v1/stage", server.uri())).unwrap(),
            model: "test-model".into(),
            min_interval,
            api_key: Some("secret".into()),
        }
    }

    #[tokio::test]
    async fn posts_task_and_parses_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/stage"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"task": "market_analysis", "model": "test-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payload": {"text": "Stable vacancy", "confidence": 0.65}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let collaborator = HttpCollaborator::new(config(&server, Duration::ZERO)).unwrap();
        let response = collaborator
            .call(&CollaboratorRequest::new("market_analysis", json!({"identity": {}})))
            .await
            .expect("call");

        assert_eq!(response.payload["text"], "Stable vacancy");
        assert_eq!(response.model, "test-model");
    }

    #[tokio::test]
    async fn server_error_is_a_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let collaborator = HttpCollaborator::new(config(&server, Duration::ZERO)).unwrap();
        let err = collaborator
            .call(&CollaboratorRequest::new("summary", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AppraisalError::Network(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let collaborator = HttpCollaborator::new(config(&server, Duration::ZERO)).unwrap();
        let err = collaborator
            .call(&CollaboratorRequest::new("summary", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AppraisalError::Parse { .. }));
    }

    #[tokio::test]
    async fn consecutive_calls_are_throttled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"payload": {}})))
            .expect(2)
            .mount(&server)
            .await;

        let interval = Duration::from_millis(200);
        let collaborator = HttpCollaborator::new(config(&server, interval)).unwrap();
        let request = CollaboratorRequest::new("summary", json!({}));

        let start = std::time::Instant::now();
        collaborator.call(&request).await.expect("first");
        collaborator.call(&request).await.expect("second");
        assert!(start.elapsed() >= interval);
    }

    #[test]
    fn config_requires_endpoint() {
        let section = CollaboratorConfig::default();
        assert!(HttpConfig::try_from(&section).is_err());

        let section = CollaboratorConfig {
            endpoint: Some("http://localhost:8700/v1/stage".into()),
            min_interval_ms: 250,
            ..CollaboratorConfig::default()
        };
        let config = HttpConfig::try_from(&section).expect("valid");
        assert_eq!(config.min_interval, Duration::from_millis(250));
    }
}
