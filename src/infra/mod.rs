// src/infra/mod.rs — Infrastructure: errors, config, logging

pub mod config;
pub mod errors;
pub mod logger;
