//! One-shot subprocess collaborator.
//!
//! Spawns the configured command per call, writes the request JSON to its
//! stdin and parses a single JSON document from its stdout. Used for the
//! parcel extractor, which prints `{error, data, warnings, match_confidence}`.
//!
//! Arguments may carry `{address}`, `{city}`, `{county}`, `{state}` and
//! `{zip}`, filled per call from the request's identity, so an extractor
//! driven by flags (`--site_address {address} --city {city}`) gets the subject
//! without reading stdin. Absent values render as empty strings.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use appraisal_shared::{AppraisalError, Result};

use crate::collaborator::{Collaborator, CollaboratorRequest, CollaboratorResponse, excerpt};

/// Argument placeholders and their path under the request's `identity`.
const PLACEHOLDERS: [(&str, &[&str]); 5] = [
    ("{address}", &["address"]),
    ("{city}", &["locality", "city"]),
    ("{county}", &["locality", "county"]),
    ("{state}", &["locality", "state"]),
    ("{zip}", &["locality", "zip"]),
];

/// Collaborator that runs an external program per request.
pub struct CommandCollaborator {
    program: String,
    args: Vec<String>,
    /// Reported as the response model and used as the cache key.
    label: String,
}

impl CommandCollaborator {
    pub fn new(program: impl Into<String>, args: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            label: label.into(),
        }
    }

    /// Configured arguments with identity placeholders filled in.
    pub fn render_args(&self, context: &serde_json::Value) -> Vec<String> {
        let identity = &context["identity"];
        self.args
            .iter()
            .map(|arg| {
                PLACEHOLDERS.iter().fold(arg.clone(), |arg, (token, path)| {
                    if !arg.contains(token) {
                        return arg;
                    }
                    let value = path.iter().fold(identity, |v, key| &v[*key]);
                    arg.replace(token, value.as_str().unwrap_or_default())
                })
            })
            .collect()
    }
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    #[instrument(skip_all, fields(program = %self.program, task = %request.task))]
    async fn call(&self, request: &CollaboratorRequest) -> Result<CollaboratorResponse> {
        let args = self.render_args(&request.context);
        debug!(?args, "spawning command collaborator");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppraisalError::Collaborator(format!("failed to spawn `{}`: {e}", self.program))
            })?;

        let body = serde_json::to_vec(request)
            .map_err(|e| AppraisalError::parse(format!("failed to serialize request: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await.map_err(|e| {
                AppraisalError::Collaborator(format!("failed to write request: {e}"))
            })?;
            // Dropping stdin closes the pipe so the program sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AppraisalError::Collaborator(format!("`{}` failed: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppraisalError::Collaborator(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let payload: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            let stdout = String::from_utf8_lossy(&output.stdout);
            AppraisalError::parse(format!(
                "`{}` printed invalid JSON: {e} (got: {})",
                self.program,
                excerpt(&stdout)
            ))
        })?;
        debug!(bytes = output.stdout.len(), "command collaborator replied");

        Ok(CollaboratorResponse {
            payload,
            model: self.label.clone(),
        })
    }

    fn model_id(&self) -> &str {
        &self.label
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> CommandCollaborator {
        CommandCollaborator::new("sh", vec!["-c".into(), script.into()], "parcel-db")
    }

    #[tokio::test]
    async fn parses_stdout_json() {
        let collaborator = sh(
            r#"cat > /dev/null; echo '{"error":null,"data":{"propertyId":"F_1"},"warnings":[],"match_confidence":0.75}'"#,
        );
        let response = collaborator
            .call(&CollaboratorRequest::new("structured_lookup", json!({})))
            .await
            .expect("call");
        assert_eq!(response.payload["data"]["propertyId"], "F_1");
        assert_eq!(response.model, "parcel-db");
    }

    #[tokio::test]
    async fn request_is_written_to_stdin() {
        let collaborator = sh("cat");
        let request = CollaboratorRequest::new("structured_lookup", json!({"identity": {"address": "1 Main St"}}));
        let response = collaborator.call(&request).await.expect("call");
        assert_eq!(response.payload["task"], "structured_lookup");
        assert_eq!(response.payload["context"]["identity"]["address"], "1 Main St");
    }

    fn subject() -> serde_json::Value {
        json!({"identity": {
            "address": "100 Main St",
            "locality": {"city": "Springfield", "state": "MA"}
        }})
    }

    #[test]
    fn placeholders_render_from_identity() {
        let collaborator = CommandCollaborator::new(
            "python",
            vec![
                "local_gis_extractor.py".into(),
                "--site_address".into(),
                "{address}".into(),
                "--city".into(),
                "{city}".into(),
                "--state".into(),
                "{state}".into(),
                "--zip_code".into(),
                "{zip}".into(),
                "--label={city}, {state}".into(),
            ],
            "parcel-db",
        );
        assert_eq!(
            collaborator.render_args(&subject()),
            vec![
                "local_gis_extractor.py",
                "--site_address",
                "100 Main St",
                "--city",
                "Springfield",
                "--state",
                "MA",
                "--zip_code",
                "",
                "--label=Springfield, MA",
            ]
        );
    }

    #[tokio::test]
    async fn rendered_arguments_reach_the_program() {
        let collaborator = CommandCollaborator::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; printf '{"address":"%s","city":"%s"}' "$1" "$2""#.into(),
                "extractor".into(),
                "{address}".into(),
                "{city}".into(),
            ],
            "parcel-db",
        );
        let response = collaborator
            .call(&CollaboratorRequest::new("structured_lookup", subject()))
            .await
            .expect("call");
        assert_eq!(response.payload["address"], "100 Main St");
        assert_eq!(response.payload["city"], "Springfield");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let collaborator = sh("cat > /dev/null; echo 'gdb missing' >&2; exit 3");
        let err = collaborator
            .call(&CollaboratorRequest::new("structured_lookup", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gdb missing"));
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error() {
        let collaborator = sh("cat > /dev/null; echo not-json");
        let err = collaborator
            .call(&CollaboratorRequest::new("structured_lookup", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AppraisalError::Parse { .. }));
    }
}
