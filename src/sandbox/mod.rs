// src/sandbox/mod.rs — Sandboxed script execution (rhai)
//
// Script blocks run in an embedded rhai interpreter with no I/O. The
// script sees a read-only `context` constant and a `result` map it may
// fill; whatever ends up in `result` is returned to the engine. The
// untrusted tier adds interpreter-enforced operation and size ceilings
// in place of an address-space cap, so nothing process-wide is mutated
// and concurrent executions never affect each other.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, Scope};
use serde_json::{Map, Number, Value};

use crate::infra::errors::RllmError;

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Full host capability set. Opt-in only.
    pub trusted: bool,
    /// Wall-clock deadline for one block.
    pub timeout: Duration,
    /// Memory ceiling for the untrusted tier, in megabytes.
    pub memory_limit_mb: u64,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            trusted: false,
            timeout: Duration::from_secs(2),
            memory_limit_mb: 256,
        }
    }
}

/// Executes one script block per call. A fresh interpreter is built for
/// every execution, so no state leaks between blocks or invocations.
pub struct ScriptSandbox {
    options: SandboxOptions,
}

impl ScriptSandbox {
    pub fn new(options: SandboxOptions) -> Self {
        Self { options }
    }

    /// Run `source` with `context` bound read-only and an empty `result`
    /// map in scope. Returns the final `result` mapping; a non-mapping
    /// result, an uncaught error, or a timeout all collapse to one
    /// script-execution error carrying the block name.
    pub fn execute(
        &self,
        block: &str,
        source: &str,
        context: &Value,
    ) -> Result<Map<String, Value>, RllmError> {
        let engine = self.build_engine();

        let mut scope = Scope::new();
        scope.push_constant("context", json_to_dynamic(context));
        scope.push("result", rhai::Map::new());

        let started = Instant::now();
        if let Err(err) = engine.run_with_scope(&mut scope, source) {
            let reason = if started.elapsed() >= self.options.timeout {
                format!("timed out after {}ms", self.options.timeout.as_millis())
            } else {
                err.to_string()
            };
            tracing::warn!(block, %reason, "script block failed");
            return Err(RllmError::Script {
                block: block.to_string(),
                reason,
            });
        }

        let Some(result) = scope.get_value::<rhai::Map>("result") else {
            return Err(RllmError::Script {
                block: block.to_string(),
                reason: "result must be a map".to_string(),
            });
        };

        let mut out = Map::new();
        for (key, value) in result {
            let converted = dynamic_to_json(&value).map_err(|reason| RllmError::Script {
                block: block.to_string(),
                reason: format!("result['{key}']: {reason}"),
            })?;
            out.insert(key.to_string(), converted);
        }
        tracing::debug!(block, keys = out.len(), "script block completed");
        Ok(out)
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();

        // The default resolver loads `import` targets from the
        // filesystem. Blocks get no module loading at all.
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());

        // Timer-driven abort at the interpreter boundary. The progress
        // hook fires between operations; returning a token terminates
        // the script.
        let deadline = Instant::now() + self.options.timeout;
        engine.on_progress(move |_ops| {
            if Instant::now() >= deadline {
                Some(Dynamic::from("deadline"))
            } else {
                None
            }
        });

        // Pure string helpers are available to both tiers.
        engine.register_fn("to_upper", |s: &str| s.to_uppercase());
        engine.register_fn("to_lower", |s: &str| s.to_lowercase());
        engine.register_fn("trim", |s: &str| s.trim().to_string());

        if self.options.trusted {
            // Trusted blocks get host logging and no operation ceiling;
            // the wall-clock deadline still applies.
            engine.register_fn("log", |msg: &str| {
                tracing::info!(target: "rllm_script", "{}", msg);
            });
            engine.register_fn("log_warn", |msg: &str| {
                tracing::warn!(target: "rllm_script", "{}", msg);
            });
            return engine;
        }

        // Untrusted tier: closed capability set plus interpreter-enforced
        // ceilings scaled from the configured memory budget.
        let budget = self.options.memory_limit_mb as usize * 1024 * 1024;
        engine.set_max_expr_depths(64, 32);
        engine.set_max_operations(10_000_000);
        engine.set_max_string_size(budget / 4);
        engine.set_max_array_size(budget / 64);
        engine.set_max_map_size(budget / 64);
        engine
    }
}

/// Convert a serde_json value into a rhai `Dynamic`.
fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => {
            let items: Vec<Dynamic> = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(items)
        }
        Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.clone().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

/// Convert a rhai `Dynamic` back into a serde_json value.
fn dynamic_to_json(value: &Dynamic) -> Result<Value, String> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::Number(i.into()));
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| "non-finite float".to_string());
    }
    if value.is_string() {
        return value
            .clone()
            .into_string()
            .map(Value::String)
            .map_err(|t| format!("unsupported value type {t}"));
    }
    if value.is_array() {
        let arr = value
            .clone()
            .try_cast::<rhai::Array>()
            .ok_or_else(|| "unsupported array value".to_string())?;
        let items = arr
            .iter()
            .map(dynamic_to_json)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::Array(items));
    }
    if value.is_map() {
        let map = value
            .clone()
            .try_cast::<rhai::Map>()
            .ok_or_else(|| "unsupported map value".to_string())?;
        let mut out = Map::new();
        for (k, v) in map {
            out.insert(k.to_string(), dynamic_to_json(&v)?);
        }
        return Ok(Value::Object(out));
    }
    Err(format!("unsupported value type {}", value.type_name()))
}
