// src/infra/config.rs — Run options (TOML)

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxOptions;

/// Per-engine run options. All fields have defaults so a partial TOML
/// section (or none at all) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// When set, overrides the model id of every descriptor executed.
    #[serde(default)]
    pub model_override: Option<String>,

    /// When set, overrides each descriptor's default retry count.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Give script blocks the full host capability set. Opt-in only.
    #[serde(default)]
    pub trusted_scripts: bool,

    /// Wall-clock deadline for one script block, in milliseconds.
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,

    /// Memory ceiling for untrusted script blocks, in megabytes.
    #[serde(default = "default_script_memory_limit_mb")]
    pub script_memory_limit_mb: u64,
}

fn default_script_timeout_ms() -> u64 {
    2_000
}

fn default_script_memory_limit_mb() -> u64 {
    256
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            model_override: None,
            max_retries: None,
            trusted_scripts: false,
            script_timeout_ms: default_script_timeout_ms(),
            script_memory_limit_mb: default_script_memory_limit_mb(),
        }
    }
}

impl RunOptions {
    /// Load options from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read options file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse options {}", path.display()))
    }

    pub(crate) fn sandbox_options(&self) -> SandboxOptions {
        SandboxOptions {
            trusted: self.trusted_scripts,
            timeout: std::time::Duration::from_millis(self.script_timeout_ms),
            memory_limit_mb: self.script_memory_limit_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = RunOptions::default();
        assert!(opts.model_override.is_none());
        assert!(opts.max_retries.is_none());
        assert!(!opts.trusted_scripts);
        assert_eq!(opts.script_timeout_ms, 2_000);
        assert_eq!(opts.script_memory_limit_mb, 256);
    }

    #[test]
    fn test_partial_toml() {
        let opts: RunOptions =
            toml::from_str("model_override = \"ollama/llama3\"\nmax_retries = 1\n").unwrap();
        assert_eq!(opts.model_override.as_deref(), Some("ollama/llama3"));
        assert_eq!(opts.max_retries, Some(1));
        assert_eq!(opts.script_timeout_ms, 2_000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rllm.toml");
        std::fs::write(&path, "trusted_scripts = true\nscript_timeout_ms = 500\n").unwrap();
        let opts = RunOptions::load(&path).unwrap();
        assert!(opts.trusted_scripts);
        assert_eq!(opts.script_timeout_ms, 500);
    }
}
