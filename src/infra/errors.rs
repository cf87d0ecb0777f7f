// src/infra/errors.rs — Error types for rllm

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// A single JSON Schema violation, extracted from the validator.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaViolation {
    /// JSON pointer into the offending instance.
    pub instance_path: String,
    /// JSON pointer into the schema that rejected it.
    pub schema_path: String,
    /// Human-readable reason from the validator.
    pub reason: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.instance_path.is_empty() {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "at '{}': {}", self.instance_path, self.reason)
        }
    }
}

#[derive(Error, Debug)]
pub enum RllmError {
    // Descriptor loading (the external parser seam)
    #[error("could not load program descriptor {path}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    // Preconditions (not retried)
    #[error("invalid program configuration: {message}")]
    Precondition { message: String, details: Value },

    #[error("template rendering failed: {reason}")]
    Template { reason: String },

    #[error("input schema validation failed: {violation}")]
    InputSchema {
        violation: SchemaViolation,
        schema: Value,
        payload: Value,
    },

    // Model-compliance errors (retried up to budget)
    #[error("output schema validation failed: {violation}")]
    OutputSchema {
        violation: SchemaViolation,
        schema: Value,
        payload: Value,
    },

    #[error("model output is not valid JSON: {reason}")]
    NotJson { reason: String, payload: String },

    #[error("model output must be a JSON object, got {actual}")]
    NotAnObject {
        actual: &'static str,
        payload: Value,
    },

    // Dependency errors (not retried)
    #[error("circular dependency detected in uses chain")]
    CircularDependency { cycle: Vec<PathBuf> },

    // Context budget (precondition, not retried)
    #[error("input exceeds max_context_window: estimated {estimated} > {max}")]
    ContextWindowExceeded {
        estimated: u64,
        max: u64,
        program: String,
    },

    // Script execution (not retried)
    #[error("script block '{block}' failed: {reason}")]
    Script { block: String, reason: String },

    // Provider transport (not retried)
    #[error("malformed provider response: {reason}")]
    Transport {
        reason: String,
        payload: Option<Value>,
    },

    // Attempt loop exhausted
    #[error("model did not satisfy output_schema after {retries} retries")]
    RetryExhausted {
        retries: u32,
        schema: Value,
        last_payload: Option<Value>,
    },

    // Infra
    #[error("stats store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Structured, machine-actionable error shape surfaced to callers,
/// uniform across CLI/MCP layers so an automated caller can self-correct.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error_code: String,
    pub error_type: String,
    pub message: String,
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_ref: Option<String>,
}

impl RllmError {
    /// Whether the attempt loop may consume retry budget on this error.
    /// Only model-compliance failures qualify; everything else is a
    /// structural problem that fails fast.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RllmError::OutputSchema { .. }
                | RllmError::NotJson { .. }
                | RllmError::NotAnObject { .. }
        )
    }

    /// Stable code used in the error envelope and doc references.
    pub fn code(&self) -> &'static str {
        match self {
            RllmError::Descriptor { .. } => "RLLM_001",
            RllmError::Precondition { .. } => "RLLM_002",
            RllmError::Template { .. } => "RLLM_003",
            RllmError::InputSchema { .. } => "RLLM_004",
            RllmError::OutputSchema { .. } => "RLLM_005",
            RllmError::NotJson { .. } => "RLLM_006",
            RllmError::NotAnObject { .. } => "RLLM_007",
            RllmError::CircularDependency { .. } => "RLLM_008",
            RllmError::Script { .. } => "RLLM_009",
            RllmError::Database(_) => "RLLM_010",
            RllmError::Transport { .. } => "RLLM_011",
            RllmError::ContextWindowExceeded { .. } => "RLLM_012",
            RllmError::RetryExhausted { .. } => "RLLM_013",
            RllmError::Other(_) => "RLLM_011",
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            RllmError::Descriptor { .. } => "ParseError",
            RllmError::Precondition { .. } => "MetadataValidationError",
            RllmError::Template { .. } => "TemplateRenderError",
            RllmError::InputSchema { .. } => "InputSchemaError",
            RllmError::OutputSchema { .. }
            | RllmError::NotJson { .. }
            | RllmError::NotAnObject { .. } => "OutputSchemaError",
            RllmError::CircularDependency { .. } => "DependencyResolutionError",
            RllmError::Script { .. } => "ScriptExecutionError",
            RllmError::Database(_) => "StatsStoreError",
            RllmError::Transport { .. } | RllmError::Other(_) => "ExecutionError",
            RllmError::ContextWindowExceeded { .. } => "ContextWindowExceededError",
            RllmError::RetryExhausted { .. } => "RetryExhaustedError",
        }
    }

    /// The raw payload that triggered this error, when one exists.
    /// Also used to carry the last model response into `RetryExhausted`.
    pub fn received_payload(&self) -> Option<Value> {
        match self {
            RllmError::InputSchema { payload, .. }
            | RllmError::OutputSchema { payload, .. }
            | RllmError::NotAnObject { payload, .. } => Some(payload.clone()),
            RllmError::NotJson { payload, .. } => Some(Value::String(payload.clone())),
            RllmError::RetryExhausted { last_payload, .. } => last_payload.clone(),
            _ => None,
        }
    }

    /// Build the serialized error envelope for this error.
    pub fn envelope(&self) -> ErrorEnvelope {
        let code = self.code();
        let (details, expected_schema, recovery_hint) = match self {
            RllmError::Descriptor { path, reason } => (
                json!({"path": path, "reason": reason}),
                None,
                Some("Pass a resolvable program path.".to_string()),
            ),
            RllmError::Precondition { details, .. } => (
                details.clone(),
                None,
                Some("Fix the program metadata or run options.".to_string()),
            ),
            RllmError::Template { reason } => (
                json!({"reason": reason}),
                None,
                Some("Fix the template expression in the prompt or uses mapping.".to_string()),
            ),
            RllmError::InputSchema {
                violation, schema, ..
            } => (
                serde_json::to_value(violation).unwrap_or_default(),
                Some(schema.clone()),
                Some("Send a payload that exactly matches input_schema.".to_string()),
            ),
            RllmError::OutputSchema {
                violation, schema, ..
            } => (
                serde_json::to_value(violation).unwrap_or_default(),
                Some(schema.clone()),
                Some("Return a payload that exactly matches output_schema.".to_string()),
            ),
            RllmError::NotJson { reason, .. } => (
                json!({"json_error": reason}),
                None,
                Some("Respond with only a valid JSON object matching output_schema.".to_string()),
            ),
            RllmError::NotAnObject { actual, .. } => (
                json!({"actual_type": actual}),
                None,
                Some("Respond with a top-level JSON object.".to_string()),
            ),
            RllmError::CircularDependency { cycle } => (
                json!({"cycle": cycle}),
                None,
                Some("Remove circular references in uses entries.".to_string()),
            ),
            RllmError::ContextWindowExceeded {
                estimated,
                max,
                program,
            } => (
                json!({
                    "estimated_tokens": estimated,
                    "max_context_window": max,
                    "program": program,
                }),
                None,
                Some(
                    "Send smaller input or increase max_context_window in program metadata."
                        .to_string(),
                ),
            ),
            RllmError::Script { block, reason } => (
                json!({"block": block, "reason": reason}),
                None,
                Some(
                    "Fix the script block, or enable trusted_scripts if it intentionally \
                     needs broader capabilities."
                        .to_string(),
                ),
            ),
            RllmError::Transport { reason, payload } => (
                json!({"reason": reason, "payload": payload}),
                None,
                Some("Verify provider/model response compatibility.".to_string()),
            ),
            RllmError::RetryExhausted { retries, schema, .. } => (
                json!({"retries": retries}),
                Some(schema.clone()),
                Some("Use a more schema-compliant model or tighten prompt instructions.".to_string()),
            ),
            RllmError::Database(err) => (json!({"reason": err.to_string()}), None, None),
            RllmError::Other(err) => (json!({"reason": err.to_string()}), None, None),
        };

        ErrorEnvelope {
            error_code: code.to_string(),
            error_type: self.error_type().to_string(),
            message: self.to_string(),
            details,
            expected_schema,
            received_payload: self.received_payload(),
            recovery_hint,
            doc_ref: Some(format!("docs/errors.md#{code}")),
        }
    }
}
