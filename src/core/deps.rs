// src/core/deps.rs — Dependency resolution over the uses graph

use std::path::PathBuf;

use serde_json::{json, Map, Value};

use super::engine::ExecutionEngine;
use super::template;
use crate::infra::errors::RllmError;
use crate::program::ProgramDescriptor;

/// Resolve every `uses` entry of `program` in declaration order and
/// return the binding-name -> output map.
///
/// The cycle check runs against the explicit call stack before anything
/// else happens for that edge, so a cyclic node never reaches the model.
/// Template values in `with` see the parent's input and the outputs of
/// earlier-declared siblings; literals pass through untouched. Any child
/// failure propagates unmodified and aborts the remaining siblings.
pub(crate) async fn resolve(
    engine: &ExecutionEngine,
    program: &ProgramDescriptor,
    input: &Value,
    stack: &[PathBuf],
) -> Result<Map<String, Value>, RllmError> {
    let mut outputs = Map::new();
    if program.uses.is_empty() {
        return Ok(outputs);
    }

    let mut child_stack: Vec<PathBuf> = stack.to_vec();
    child_stack.push(program.path.clone());

    for dep in &program.uses {
        if stack.contains(&dep.path) || dep.path == program.path {
            let mut cycle = child_stack.clone();
            cycle.push(dep.path.clone());
            tracing::warn!(parent = %program.path.display(), dep = %dep.path.display(), "uses cycle");
            return Err(RllmError::CircularDependency { cycle });
        }

        let mut child_input = Map::new();
        for (key, value) in &dep.with {
            let bound = match value {
                Value::String(tmpl) => {
                    let scope = json!({"input": input, "uses": outputs});
                    Value::String(template::render(tmpl, &scope)?)
                }
                literal => literal.clone(),
            };
            child_input.insert(key.clone(), bound);
        }

        tracing::debug!(
            parent = %program.name,
            dep = %dep.name,
            path = %dep.path.display(),
            "resolving dependency",
        );
        let output = engine
            .run_path(&dep.path, Value::Object(child_input), &child_stack)
            .await?;
        outputs.insert(dep.name.clone(), output);
    }

    Ok(outputs)
}
