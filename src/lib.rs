// src/lib.rs — Library root for rllm
//
// Schema-guarded execution engine for declarative LLM programs: a
// descriptor names the model, the prompt template, JSON Schemas for
// input and output, optional child programs to compose, and optional
// pre/post script blocks. The engine drives the model to a
// schema-compliant output with a bounded retry loop.

pub mod core;
pub mod infra;
pub mod program;
pub mod provider;
pub mod sandbox;
pub mod stats;
pub mod util;

pub use crate::core::engine::{ExecutionEngine, LatencyEstimate};
pub use crate::infra::config::RunOptions;
pub use crate::infra::errors::{ErrorEnvelope, RllmError, SchemaViolation};
pub use crate::program::{DescriptorSource, InMemorySource, ProgramDescriptor, UseSpec};
pub use crate::provider::{
    CompletionRequest, ModelInvoker, ModelResponse, ProviderUsage, UsageMetrics,
};
pub use crate::stats::{MemoryStats, RunAggregate, RunRecord, SqliteStats, StatsSink};
