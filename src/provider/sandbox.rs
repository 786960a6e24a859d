use crate::config::SandboxConfig;
use crate::models::{SandboxRunRequest, SandboxRunResponse};
use crate::{Result, WopaError};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Client for the dynamic-analysis sandbox backend: submit a file
/// reference, poll the run until it settles, return the logs.
#[derive(Clone)]
pub struct SandboxBackend {
    client: reqwest::Client,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: String,
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default)]
    artifacts: Option<serde_json::Value>,
}

impl SandboxBackend {
    pub fn new(client: reqwest::Client, config: &SandboxConfig) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
        }
    }

    /// Submit and poll to completion. The caller wraps this in the outer
    /// sandbox timeout; the poll loop itself never gives up.
    pub async fn run_file(
        &self,
        endpoint: &str,
        request: &SandboxRunRequest,
    ) -> Result<SandboxRunResponse> {
        let base = endpoint.trim_end_matches('/');
        let submitted = self
            .client
            .post(format!("{base}/run"))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json::<SubmitReply>()
            .await
            .map_err(|e| {
                WopaError::ProviderProtocol(format!("sandbox submit reply did not parse: {e}"))
            })?;

        debug!(run_id = %submitted.id, "Sandbox run submitted");

        loop {
            let status = self
                .client
                .get(format!("{base}/status/{}", submitted.id))
                .send()
                .await?
                .error_for_status()?
                .json::<StatusReply>()
                .await
                .map_err(|e| {
                    WopaError::ProviderProtocol(format!("sandbox status reply did not parse: {e}"))
                })?;

            match status.status.as_str() {
                "completed" => {
                    return Ok(SandboxRunResponse {
                        status: "success".to_string(),
                        logs: status.logs,
                        artifacts: status.artifacts,
                    })
                }
                "error" => {
                    return Err(WopaError::ProviderProtocol(format!(
                        "sandbox run {} failed",
                        submitted.id
                    )))
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SandboxBackend {
        let config = SandboxConfig {
            poll_interval_seconds: 0,
            ..SandboxConfig::default()
        };
        SandboxBackend::new(reqwest::Client::new(), &config)
    }

    #[tokio::test]
    async fn polls_until_completed_and_returns_logs() {
        let mut server = mockito::Server::new_async().await;
        let _submit = server
            .mock("POST", "/run")
            .with_status(200)
            .with_body(r#"{"id": "run-7"}"#)
            .create_async()
            .await;
        let _done = server
            .mock("GET", "/status/run-7")
            .with_status(200)
            .with_body(
                r#"{"status": "completed", "logs": ["opened /etc/passwd"], "artifacts": {"pcap": "x"}}"#,
            )
            .create_async()
            .await;

        let request = SandboxRunRequest {
            file_ref: "sample.bin".to_string(),
        };
        let response = backend().run_file(&server.url(), &request).await.unwrap();
        assert_eq!(response.status, "success");
        assert_eq!(response.logs, vec!["opened /etc/passwd".to_string()]);
        assert!(response.artifacts.is_some());
    }

    #[tokio::test]
    async fn failed_run_is_a_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        let _submit = server
            .mock("POST", "/run")
            .with_status(200)
            .with_body(r#"{"id": "run-8"}"#)
            .create_async()
            .await;
        let _failed = server
            .mock("GET", "/status/run-8")
            .with_status(200)
            .with_body(r#"{"status": "error"}"#)
            .create_async()
            .await;

        let request = SandboxRunRequest {
            file_ref: "sample.bin".to_string(),
        };
        let err = backend().run_file(&server.url(), &request).await.unwrap_err();
        assert!(matches!(err, WopaError::ProviderProtocol(_)));
    }

    #[tokio::test]
    async fn submit_5xx_is_retryable_transport() {
        let mut server = mockito::Server::new_async().await;
        let _submit = server
            .mock("POST", "/run")
            .with_status(503)
            .create_async()
            .await;
        let request = SandboxRunRequest {
            file_ref: "sample.bin".to_string(),
        };
        let err = backend().run_file(&server.url(), &request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
