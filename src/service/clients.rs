use crate::config::Config;
use crate::models::{
    ChatCompleteRequest, ChatCompleteResponse, ProviderKind, WorkerRequest, WorkerResponse,
};
use crate::{Result, WopaError};
use std::time::Duration;

/// Service-side clients for the Worker tier and the aggregator LLM.
/// One pooled HTTP client; per-call timeouts from configuration.
#[derive(Clone)]
pub struct ServiceClients {
    client: reqwest::Client,
    worker_url: String,
    provider_url: String,
    worker_timeout: Duration,
    aggregator_timeout: Duration,
}

impl ServiceClients {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            worker_url: config.worker_server_url.trim_end_matches('/').to_string(),
            provider_url: config
                .providers_server_url
                .trim_end_matches('/')
                .to_string(),
            worker_timeout: config.worker_timeout(),
            aggregator_timeout: config.aggregator_timeout(),
        }
    }

    /// Synchronous dispatch to the Worker tier.
    pub async fn request_worker(&self, request: &WorkerRequest) -> Result<WorkerResponse> {
        let response = self
            .client
            .post(format!("{}/request_worker", self.worker_url))
            .timeout(self.worker_timeout)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        response
            .json::<WorkerResponse>()
            .await
            .map_err(|e| WopaError::ProviderProtocol(format!("worker reply did not parse: {e}")))
    }

    /// One aggregator LLM call; the reply is the raw text the model
    /// produced.
    pub async fn aggregate(&self, prompt: String) -> Result<String> {
        let request = ChatCompleteRequest {
            prompt,
            model: None,
            temperature: None,
            max_tokens: None,
        };
        let response = self
            .client
            .post(format!("{}/llm/chat_complete", self.provider_url))
            .timeout(self.aggregator_timeout)
            .json(&request)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(WopaError::ProviderUnavailable {
                kind: ProviderKind::LlmChat,
            });
        }
        let reply: ChatCompleteResponse = response
            .error_for_status()?
            .json()
            .await
            .map_err(|e| {
                WopaError::ProviderProtocol(format!("aggregator reply did not parse: {e}"))
            })?;
        Ok(reply.response)
    }
}
