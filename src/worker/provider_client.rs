use crate::config::Config;
use crate::models::{
    ChatCompleteRequest, ChatCompleteResponse, EmulatorRunRequest, EmulatorRunResponse,
    ImagePayload, ProviderKind, SandboxRunRequest, SandboxRunResponse, VisionCompleteRequest,
};
use crate::{Result, WopaError};
use std::time::Duration;

/// Worker-side client for the Provider tier. One pooled HTTP client,
/// per-endpoint timeouts slightly above the provider's own caps so the
/// provider reports its failures before the worker gives up on it.
#[derive(Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
    llm_timeout: Duration,
    sandbox_timeout: Duration,
    emulator_timeout: Duration,
}

const TIMEOUT_MARGIN_SECS: u64 = 10;

impl ProviderClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.providers_server_url.trim_end_matches('/').to_string(),
            llm_timeout: Duration::from_secs(config.llm.timeout_seconds + TIMEOUT_MARGIN_SECS),
            sandbox_timeout: Duration::from_secs(
                config.sandbox.timeout_seconds + TIMEOUT_MARGIN_SECS,
            ),
            emulator_timeout: Duration::from_secs(
                config.emulator.timeout_seconds + TIMEOUT_MARGIN_SECS,
            ),
        }
    }

    pub async fn chat_complete(&self, prompt: String) -> Result<String> {
        let request = ChatCompleteRequest {
            prompt,
            model: None,
            temperature: None,
            max_tokens: None,
        };
        let response = self
            .client
            .post(format!("{}/llm/chat_complete", self.base_url))
            .timeout(self.llm_timeout)
            .json(&request)
            .send()
            .await?;
        let reply: ChatCompleteResponse = Self::read(response, ProviderKind::LlmChat).await?;
        Ok(reply.response)
    }

    pub async fn vision_complete(
        &self,
        prompt: String,
        images: Vec<ImagePayload>,
    ) -> Result<String> {
        let request = VisionCompleteRequest {
            prompt,
            images,
            model: None,
            temperature: None,
            max_tokens: None,
        };
        let response = self
            .client
            .post(format!("{}/llm/vision_complete", self.base_url))
            .timeout(self.llm_timeout)
            .json(&request)
            .send()
            .await?;
        let reply: ChatCompleteResponse = Self::read(response, ProviderKind::LlmVision).await?;
        Ok(reply.response)
    }

    pub async fn run_file(&self, file_ref: String) -> Result<SandboxRunResponse> {
        let request = SandboxRunRequest { file_ref };
        let response = self
            .client
            .post(format!("{}/sandbox/run_file", self.base_url))
            .timeout(self.sandbox_timeout)
            .json(&request)
            .send()
            .await?;
        Self::read(response, ProviderKind::Sandbox).await
    }

    pub async fn run_app(
        &self,
        app_ref: String,
        instructions: String,
    ) -> Result<EmulatorRunResponse> {
        let request = EmulatorRunRequest {
            app_ref,
            instructions,
        };
        let response = self
            .client
            .post(format!("{}/emulator/run_app", self.base_url))
            .timeout(self.emulator_timeout)
            .json(&request)
            .send()
            .await?;
        Self::read(response, ProviderKind::Emulator).await
    }

    /// Decode a provider response, mapping 503 to unavailability of the
    /// kind and other non-2xx statuses to transport errors.
    async fn read<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        kind: ProviderKind,
    ) -> Result<T> {
        if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(WopaError::ProviderUnavailable { kind });
        }
        let response = response.error_for_status()?;
        response
            .json::<T>()
            .await
            .map_err(|e| WopaError::ProviderProtocol(format!("provider reply did not parse: {e}")))
    }
}
