// src/provider/openai_compat.rs — OpenAI-compatible chat completion invoker
//
// Works against any endpoint exposing the `chat/completions` shape:
// OpenAI, Groq, DeepSeek, Together, OpenRouter, local Ollama, etc.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{CompletionRequest, ModelInvoker, ModelResponse, ProviderUsage};
use crate::infra::errors::RllmError;

/// Per-request timeout for the completion call.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub struct OpenAiCompatInvoker {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatInvoker {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> Map<String, Value> {
        // Provider params first so model/messages cannot be clobbered.
        let mut body = request.params.clone();
        body.insert("model".to_string(), json!(request.model));
        body.insert(
            "messages".to_string(),
            json!([{"role": "user", "content": request.prompt}]),
        );
        body
    }
}

#[async_trait]
impl ModelInvoker for OpenAiCompatInvoker {
    async fn complete(&self, request: &CompletionRequest) -> Result<ModelResponse, RllmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut builder = self
            .client
            .post(&url)
            .header("User-Agent", format!("rllm/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| RllmError::Transport {
            reason: format!("request to {url} failed: {e}"),
            payload: None,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RllmError::Transport {
                reason: format!("provider returned HTTP {status}"),
                payload: Some(Value::String(body)),
            });
        }

        let body: Value = response.json().await.map_err(|e| RllmError::Transport {
            reason: format!("response body is not JSON: {e}"),
            payload: None,
        })?;

        // The one shape we accept: choices[0].message.content as a string.
        let content = match body
            .pointer("/choices/0/message/content")
            .unwrap_or(&Value::Null)
        {
            Value::String(s) => s.clone(),
            other => {
                return Err(RllmError::Transport {
                    reason: "message content is not a string".to_string(),
                    payload: Some(other.clone()),
                });
            }
        };

        let usage = body
            .get("usage")
            .and_then(|u| serde_json::from_value::<ProviderUsage>(u.clone()).ok());

        tracing::debug!(
            model = %request.model,
            content_bytes = content.len(),
            usage_reported = usage.is_some(),
            "completion received",
        );

        Ok(ModelResponse { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_params_cannot_clobber_model() {
        let invoker = OpenAiCompatInvoker::new("http://localhost:11434/v1", None);
        let mut params = Map::new();
        params.insert("temperature".to_string(), json!(0.2));
        params.insert("model".to_string(), json!("sneaky"));
        let body = invoker.request_body(&CompletionRequest {
            model: "llama3".to_string(),
            prompt: "hi".to_string(),
            params,
        });
        assert_eq!(body["model"], json!("llama3"));
        assert_eq!(body["temperature"], json!(0.2));
        assert_eq!(body["messages"][0]["role"], json!("user"));
        assert_eq!(body["messages"][0]["content"], json!("hi"));
    }
}
