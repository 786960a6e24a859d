use crate::config::{LlmConfig, ModelConfig};
use crate::models::{ChatCompleteRequest, VisionCompleteRequest};
use crate::{Result, WopaError};
use serde::Deserialize;
use std::time::Duration;

/// Client for OpenAI-compatible chat-completions backends (the surface
/// local LLM servers expose). Chat and vision share the wire format;
/// vision attaches images as data-URI content parts.
#[derive(Clone)]
pub struct LlmBackend {
    client: reqwest::Client,
    chat_model: ModelConfig,
    vision_model: ModelConfig,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsReply {
    choices: Vec<ReplyChoice>,
}

#[derive(Debug, Deserialize)]
struct ReplyChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: String,
}

impl LlmBackend {
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Self {
        Self {
            client,
            chat_model: config.models.chat_model.clone(),
            vision_model: config.models.vision_model.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub async fn chat(&self, endpoint: &str, request: &ChatCompleteRequest) -> Result<String> {
        let messages = serde_json::json!([
            {"role": "user", "content": request.prompt}
        ]);
        let body = self.build_body(
            &self.chat_model,
            request.model.as_deref(),
            messages,
            request.temperature,
            request.max_tokens,
        );
        self.complete(endpoint, body).await
    }

    pub async fn vision(&self, endpoint: &str, request: &VisionCompleteRequest) -> Result<String> {
        let mut content = vec![serde_json::json!({"type": "text", "text": request.prompt})];
        for image in &request.images {
            content.push(serde_json::json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", image.mime, image.base64)
                }
            }));
        }
        let messages = serde_json::json!([{"role": "user", "content": content}]);
        let body = self.build_body(
            &self.vision_model,
            request.model.as_deref(),
            messages,
            request.temperature,
            request.max_tokens,
        );
        self.complete(endpoint, body).await
    }

    /// Model defaults first, explicit request parameters on top.
    fn build_body(
        &self,
        model: &ModelConfig,
        model_override: Option<&str>,
        messages: serde_json::Value,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
    ) -> serde_json::Value {
        let mut body = model.default_params.clone();
        body.insert(
            "model".to_string(),
            serde_json::json!(model_override.unwrap_or(&model.name)),
        );
        body.insert("messages".to_string(), messages);
        if let Some(t) = temperature {
            body.insert("temperature".to_string(), serde_json::json!(t));
        }
        if let Some(m) = max_tokens {
            body.insert("max_tokens".to_string(), serde_json::json!(m));
        }
        serde_json::Value::Object(body)
    }

    async fn complete(&self, endpoint: &str, body: serde_json::Value) -> Result<String> {
        let reply = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                endpoint.trim_end_matches('/')
            ))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<ChatCompletionsReply>()
            .await
            .map_err(|e| WopaError::ProviderProtocol(format!("LLM reply did not parse: {e}")))?;

        reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| WopaError::ProviderProtocol("LLM reply carried no choices".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmModels;

    fn backend() -> LlmBackend {
        let mut chat_params = serde_json::Map::new();
        chat_params.insert("temperature".to_string(), serde_json::json!(0.2));
        chat_params.insert("top_p".to_string(), serde_json::json!(0.9));
        let config = LlmConfig {
            endpoint: String::new(),
            timeout_seconds: 5,
            probe_timeout_seconds: 5,
            models: LlmModels {
                chat_model: ModelConfig {
                    name: "chat-model".to_string(),
                    default_params: chat_params,
                },
                vision_model: ModelConfig {
                    name: "vision-model".to_string(),
                    default_params: serde_json::Map::new(),
                },
            },
        };
        LlmBackend::new(reqwest::Client::new(), &config)
    }

    #[tokio::test]
    async fn chat_posts_model_defaults_and_overrides() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "chat-model",
                "top_p": 0.9,
                "temperature": 0.7,
            })))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "benign"}}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let request = ChatCompleteRequest {
            prompt: "classify this".to_string(),
            model: None,
            temperature: Some(0.7),
            max_tokens: None,
        };
        let reply = backend().chat(&server.url(), &request).await.unwrap();
        assert_eq!(reply, "benign");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn vision_routes_to_vision_model() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "vision-model",
            })))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "a login screen"}}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let request = VisionCompleteRequest {
            prompt: "describe".to_string(),
            images: vec![crate::models::ImagePayload {
                mime: "image/png".to_string(),
                base64: "aGk=".to_string(),
            }],
            model: None,
            temperature: None,
            max_tokens: None,
        };
        let reply = backend().vision(&server.url(), &request).await.unwrap();
        assert_eq!(reply, "a login screen");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_choices_is_a_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let request = ChatCompleteRequest {
            prompt: "x".to_string(),
            model: None,
            temperature: None,
            max_tokens: None,
        };
        let err = backend().chat(&server.url(), &request).await.unwrap_err();
        assert!(matches!(err, WopaError::ProviderProtocol(_)));
    }

    #[tokio::test]
    async fn backend_5xx_is_a_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .create_async()
            .await;

        let request = ChatCompleteRequest {
            prompt: "x".to_string(),
            model: None,
            temperature: None,
            max_tokens: None,
        };
        let err = backend().chat(&server.url(), &request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
