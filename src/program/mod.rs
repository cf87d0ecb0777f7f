// src/program/mod.rs — Program descriptors and the parser-facing seam

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::infra::errors::RllmError;

/// One dependency edge: the binding name under which the child's output
/// becomes visible, the resolved child path, and the mapping that builds
/// the child's input. `with` entries are kept in declaration order;
/// string values are templates rendered against `{input, uses}`, any
/// other value passes through as a literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseSpec {
    pub name: String,
    pub path: PathBuf,
    pub with: Vec<(String, Value)>,
}

impl UseSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            with: Vec::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.with.push((key.into(), value));
        self
    }
}

/// Immutable description of one executable program, produced by the
/// external parser. The engine never mutates a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    /// Model identifier, e.g. `ollama/llama3` or `gpt-4.1-mini`.
    pub model: String,
    /// Provider parameters forwarded verbatim on every call.
    pub params: Map<String, Value>,
    pub prompt: String,
    /// Supplementary instruction appended on retry attempts. Empty means
    /// the built-in recovery instruction is used instead.
    pub recovery_prompt: String,
    /// Token budget for one attempt (input payload + rendered prompt).
    pub max_context_window: u64,
    /// Default retry count; `RunOptions::max_retries` overrides it.
    pub max_retries: u32,
    pub uses: Vec<UseSpec>,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
}

impl ProgramDescriptor {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
            output_schema: json!({"type": "object"}),
            model: String::new(),
            params: Map::new(),
            prompt: prompt.into(),
            recovery_prompt: String::new(),
            max_context_window: 128_000,
            max_retries: 2,
            uses: Vec::new(),
            pre_script: None,
            post_script: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_recovery_prompt(mut self, text: impl Into<String>) -> Self {
        self.recovery_prompt = text.into();
        self
    }

    pub fn with_max_context_window(mut self, tokens: u64) -> Self {
        self.max_context_window = tokens;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_use(mut self, spec: UseSpec) -> Self {
        self.uses.push(spec);
        self
    }

    pub fn with_pre_script(mut self, source: impl Into<String>) -> Self {
        self.pre_script = Some(source.into());
        self
    }

    pub fn with_post_script(mut self, source: impl Into<String>) -> Self {
        self.post_script = Some(source.into());
        self
    }
}

/// Parser-facing seam. The engine requests a descriptor for the root
/// invocation and again for every `uses` edge; implementations decide
/// whether to cache, the engine never does.
pub trait DescriptorSource: Send + Sync {
    fn load(&self, path: &Path) -> Result<ProgramDescriptor, RllmError>;
}

/// Registry of pre-built descriptors keyed by path. The standard source
/// for tests and for embedding programs without a parser.
#[derive(Default)]
pub struct InMemorySource {
    programs: Mutex<HashMap<PathBuf, ProgramDescriptor>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, program: ProgramDescriptor) {
        let mut programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        programs.insert(program.path.clone(), program);
    }

    pub fn with_program(self, program: ProgramDescriptor) -> Self {
        self.insert(program);
        self
    }
}

impl DescriptorSource for InMemorySource {
    fn load(&self, path: &Path) -> Result<ProgramDescriptor, RllmError> {
        let programs = self.programs.lock().unwrap_or_else(|e| e.into_inner());
        programs
            .get(path)
            .cloned()
            .ok_or_else(|| RllmError::Descriptor {
                path: path.to_path_buf(),
                reason: "no descriptor registered for this path".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder_defaults() {
        let p = ProgramDescriptor::new("/p.rllm", "p", "Say hi");
        assert_eq!(p.max_retries, 2);
        assert_eq!(p.max_context_window, 128_000);
        assert!(p.uses.is_empty());
        assert!(p.pre_script.is_none());
        assert_eq!(p.input_schema, json!({"type": "object"}));
    }

    #[test]
    fn test_use_spec_preserves_declaration_order() {
        let spec = UseSpec::new("kw", "/kw.rllm")
            .with_input("b", json!("{{input.text}}"))
            .with_input("a", json!(7));
        let keys: Vec<&str> = spec.with.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_in_memory_source_roundtrip() {
        let source = InMemorySource::new()
            .with_program(ProgramDescriptor::new("/p.rllm", "p", "hi").with_model("m"));
        let loaded = source.load(Path::new("/p.rllm")).unwrap();
        assert_eq!(loaded.name, "p");
        assert_eq!(loaded.model, "m");
    }

    #[test]
    fn test_in_memory_source_unknown_path() {
        let source = InMemorySource::new();
        let err = source.load(Path::new("/missing.rllm")).unwrap_err();
        assert_eq!(err.code(), "RLLM_001");
    }
}
