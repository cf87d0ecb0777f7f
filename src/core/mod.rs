// src/core/mod.rs — Execution engine internals

pub mod deps;
pub mod engine;
pub mod extract;
pub mod prompt;
pub mod template;
