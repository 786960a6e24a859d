use crate::config::EmulatorConfig;
use crate::models::{EmulatorRunRequest, EmulatorRunResponse, Visuals};
use crate::{Result, WopaError};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Client for the Android emulator backend: submit an app run with
/// driving instructions, poll until it settles, return screenshots and
/// the observed event stream.
#[derive(Clone)]
pub struct EmulatorBackend {
    client: reqwest::Client,
    poll_interval: Duration,
    vnc_url_template: String,
    default_vnc_port: u16,
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: String,
    #[serde(default)]
    screenshots: Vec<String>,
    #[serde(default)]
    events: Vec<String>,
}

impl EmulatorBackend {
    pub fn new(client: reqwest::Client, config: &EmulatorConfig) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            vnc_url_template: config.vnc_url_template.clone(),
            default_vnc_port: config.default_vnc_port,
        }
    }

    /// Render the VNC URL for a run on `endpoint` from the configured
    /// template.
    pub fn vnc_url(&self, endpoint: &str) -> String {
        let host = url::Url::parse(endpoint)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| endpoint.to_string());
        self.vnc_url_template
            .replace("{host}", &host)
            .replace("{port}", &self.default_vnc_port.to_string())
    }

    /// Submit and poll to completion; the caller applies the outer
    /// emulator timeout. `session_id` becomes the response task_id the
    /// VNC endpoint resolves later.
    pub async fn run_app(
        &self,
        endpoint: &str,
        session_id: &str,
        request: &EmulatorRunRequest,
    ) -> Result<EmulatorRunResponse> {
        let base = endpoint.trim_end_matches('/');
        let submitted = self
            .client
            .post(format!("{base}/run_app"))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json::<SubmitReply>()
            .await
            .map_err(|e| {
                WopaError::ProviderProtocol(format!("emulator submit reply did not parse: {e}"))
            })?;

        debug!(run_id = %submitted.id, "Emulator run submitted");

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
                    WopaError::ProviderProtocol(format!(
                        "emulator status reply did not parse: {e}"
                    ))
                })?;

            match status.status.as_str() {
                "completed" => {
                    return Ok(EmulatorRunResponse {
                        status: "success".to_string(),
                        task_id: session_id.to_string(),
                        visuals: Visuals {
                            screenshots: status.screenshots,
                        },
                        events: status.events,
                    })
                }
                "error" => {
                    return Err(WopaError::ProviderProtocol(format!(
                        "emulator run {} failed",
                        submitted.id
                    )))
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}
