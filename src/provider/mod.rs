// src/provider/mod.rs — Model invoker layer

pub mod openai_compat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::infra::errors::RllmError;
use crate::util::estimate_tokens;

/// Outbound model call seam. One request carries the model id, the fully
/// rendered prompt for this attempt, and the descriptor's provider
/// parameters. Anything other than a single string message body in the
/// response is a fatal transport error, surfaced by the implementation.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<ModelResponse, RllmError>;
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    /// Usage counters when the provider reports them; estimated otherwise.
    pub usage: Option<ProviderUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Per-attempt usage: latency plus token counts, provider-reported when
/// available and estimated from text length otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub latency_ms: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageMetrics {
    pub fn from_response(
        prompt: &str,
        content: &str,
        usage: Option<&ProviderUsage>,
        latency_ms: f64,
    ) -> Self {
        match usage {
            None => {
                let prompt_tokens = estimate_tokens(prompt);
                let completion_tokens = estimate_tokens(content);
                Self {
                    latency_ms,
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                }
            }
            Some(u) => {
                let mut total = u.total_tokens;
                if total == 0 {
                    total = u.prompt_tokens + u.completion_tokens;
                }
                Self {
                    latency_ms,
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: total,
                }
            }
        }
    }
}
