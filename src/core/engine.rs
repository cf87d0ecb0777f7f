// src/core/engine.rs — The attempt/retry state machine

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use super::deps;
use super::extract::{self, Phase};
use super::prompt::PromptBuilder;
use super::template;
use crate::infra::config::RunOptions;
use crate::infra::errors::RllmError;
use crate::program::{DescriptorSource, ProgramDescriptor};
use crate::provider::{CompletionRequest, ModelInvoker, UsageMetrics};
use crate::sandbox::ScriptSandbox;
use crate::stats::{RunRecord, StatsSink};
use crate::util::estimate_context_tokens;

/// Per-invocation transient state: the node's input, the outputs of its
/// resolved dependencies, and any extra bindings a pre-script added.
/// Created fresh per node and discarded when the invocation returns.
struct ExecutionContext {
    input: Value,
    uses: Map<String, Value>,
    extra: Map<String, Value>,
}

impl ExecutionContext {
    fn new(input: Value, uses: Map<String, Value>) -> Self {
        Self {
            input,
            uses,
            extra: Map::new(),
        }
    }

    /// Scope visible to the prompt template: `input`, `uses`, and every
    /// pre-script binding at the top level.
    fn render_scope(&self) -> Value {
        let mut scope = Map::new();
        scope.insert("input".to_string(), self.input.clone());
        scope.insert("uses".to_string(), Value::Object(self.uses.clone()));
        for (key, value) in &self.extra {
            scope.insert(key.clone(), value.clone());
        }
        Value::Object(scope)
    }

    /// Scope passed to script blocks; the post block additionally sees
    /// the validated model output.
    fn script_scope(&self, output: Option<&Map<String, Value>>) -> Value {
        let mut scope = Map::new();
        scope.insert("input".to_string(), self.input.clone());
        if let Some(output) = output {
            scope.insert("output".to_string(), Value::Object(output.clone()));
        }
        scope.insert("uses".to_string(), Value::Object(self.uses.clone()));
        Value::Object(scope)
    }
}

/// Historical latency estimate for one program and its direct
/// dependencies, derived from recorded stats.
#[derive(Debug, Clone)]
pub struct LatencyEstimate {
    pub program_path: String,
    pub model: Option<String>,
    pub estimated_ms: f64,
    pub root_avg_latency_ms: f64,
    pub deps_avg_latency_ms: f64,
    pub dependency_count: usize,
}

/// Drives one program (and, recursively, its dependency graph) to a
/// schema-compliant output. Holds no mutable state of its own; all
/// collaborators are injected at construction.
pub struct ExecutionEngine {
    source: Arc<dyn DescriptorSource>,
    invoker: Arc<dyn ModelInvoker>,
    stats: Arc<dyn StatsSink>,
    options: RunOptions,
    sandbox: ScriptSandbox,
}

impl ExecutionEngine {
    pub fn new(
        source: Arc<dyn DescriptorSource>,
        invoker: Arc<dyn ModelInvoker>,
        stats: Arc<dyn StatsSink>,
        options: RunOptions,
    ) -> Self {
        let sandbox = ScriptSandbox::new(options.sandbox_options());
        Self {
            source,
            invoker,
            stats,
            options,
            sandbox,
        }
    }

    /// Execute the program at `path` with `input` and return its
    /// validated (and possibly post-script-augmented) output.
    pub async fn run(&self, path: &Path, input: Value) -> Result<Value, RllmError> {
        self.run_path(path, input, &[]).await
    }

    /// Recursive entry point: loads the descriptor (once per edge, never
    /// cached) and executes it with the given call stack.
    pub(crate) fn run_path<'a>(
        &'a self,
        path: &'a Path,
        input: Value,
        stack: &'a [PathBuf],
    ) -> BoxFuture<'a, Result<Value, RllmError>> {
        Box::pin(async move {
            let program = self.source.load(path)?;
            self.run_node(&program, input, stack).await
        })
    }

    async fn run_node(
        &self,
        program: &ProgramDescriptor,
        input: Value,
        stack: &[PathBuf],
    ) -> Result<Value, RllmError> {
        let model = self.effective_model(program)?;
        tracing::debug!(program = %program.name, model = %model, "executing program");

        extract::validate_instance(&input, &program.input_schema, Phase::Input)?;

        let uses = deps::resolve(self, program, &input, stack).await?;
        let mut context = ExecutionContext::new(input, uses);

        if let Some(pre) = &program.pre_script {
            let produced = self.sandbox.execute("pre", pre, &context.script_scope(None))?;
            context.extra.extend(produced);
        }

        let rendered_prompt = template::render(&program.prompt, &context.render_scope())?;
        let builder = PromptBuilder::new(
            &rendered_prompt,
            &program.output_schema,
            &program.recovery_prompt,
        );

        let max_retries = self.options.max_retries.unwrap_or(program.max_retries);
        let mut last_err: Option<RllmError> = None;
        let mut usage = UsageMetrics::default();

        for attempt in 0..=max_retries {
            let attempt_prompt = builder.attempt_prompt(attempt);

            // Precondition, not a compliance failure: an oversized input
            // will not shrink on retry, so fail before the provider call.
            let estimated = estimate_context_tokens(&context.input, &attempt_prompt);
            if estimated > program.max_context_window {
                return Err(RllmError::ContextWindowExceeded {
                    estimated,
                    max: program.max_context_window,
                    program: program.name.clone(),
                });
            }

            tracing::debug!(attempt, max_attempts = max_retries + 1, "invoking model");
            let request = CompletionRequest {
                model: model.clone(),
                prompt: attempt_prompt.clone(),
                params: program.params.clone(),
            };
            let started = Instant::now();
            let response = self.invoker.complete(&request).await?;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            usage = UsageMetrics::from_response(
                &attempt_prompt,
                &response.content,
                response.usage.as_ref(),
                latency_ms,
            );

            match extract::extract_validated(&response.content, &program.output_schema) {
                Ok(mut out) => {
                    if let Some(post) = &program.post_script {
                        let scope = context.script_scope(Some(&out));
                        match self.sandbox.execute("post", post, &scope) {
                            Ok(produced) => {
                                // Script keys win; the merged object is
                                // not re-validated against output_schema.
                                out.extend(produced);
                            }
                            Err(err) => {
                                self.record(program, &model, false, &usage);
                                return Err(err);
                            }
                        }
                    }
                    self.record(program, &model, true, &usage);
                    return Ok(Value::Object(out));
                }
                Err(err) if err.is_retriable() => {
                    tracing::info!(
                        attempt,
                        error = %err,
                        "attempt produced non-compliant output",
                    );
                    last_err = Some(err);
                }
                Err(err) => {
                    self.record(program, &model, false, &usage);
                    return Err(err);
                }
            }
        }

        self.record(program, &model, false, &usage);
        Err(RllmError::RetryExhausted {
            retries: max_retries,
            schema: program.output_schema.clone(),
            last_payload: last_err.as_ref().and_then(RllmError::received_payload),
        })
    }

    fn effective_model(&self, program: &ProgramDescriptor) -> Result<String, RllmError> {
        let model = self
            .options
            .model_override
            .clone()
            .unwrap_or_else(|| program.model.trim().to_string());
        if model.is_empty() {
            return Err(RllmError::Precondition {
                message: "model id is required".to_string(),
                details: json!({"program": program.name, "path": program.path}),
            });
        }
        Ok(model)
    }

    /// One record per node invocation. Stats failures are logged, never
    /// allowed to mask the run's own outcome.
    fn record(&self, program: &ProgramDescriptor, model: &str, success: bool, usage: &UsageMetrics) {
        let record = RunRecord {
            program_path: program.path.display().to_string(),
            program_name: program.name.clone(),
            model: model.to_string(),
            success,
            input_schema_ok: true,
            output_schema_ok: success,
            usage: usage.clone(),
        };
        if let Err(err) = self.stats.record_run(&record) {
            tracing::warn!(error = %err, "failed to record run stats");
        }
    }

    /// Estimate wall-clock latency for one execution of `path` from
    /// recorded history: the root's average plus the averages of its
    /// direct dependencies.
    pub fn estimate_latency(
        &self,
        path: &Path,
        model: Option<&str>,
    ) -> Result<LatencyEstimate, RllmError> {
        let program = self.source.load(path)?;
        let root = self
            .stats
            .aggregate(&program.path.display().to_string(), model)?;

        let mut deps_avg = 0.0;
        for dep in &program.uses {
            let agg = self
                .stats
                .aggregate(&dep.path.display().to_string(), model)?;
            deps_avg += agg.avg_latency_ms;
        }

        Ok(LatencyEstimate {
            program_path: program.path.display().to_string(),
            model: model.map(str::to_string),
            estimated_ms: root.avg_latency_ms + deps_avg,
            root_avg_latency_ms: root.avg_latency_ms,
            deps_avg_latency_ms: deps_avg,
            dependency_count: program.uses.len(),
        })
    }
}
