//! Reconnaissance pipeline orchestrator.
//!
//! Runs external recon tools as staged pipelines per target, turns their
//! output into a deduplicated asset inventory and streams every job's console
//! to live subscribers.

pub mod adapters;
pub mod api;
pub mod config;
pub mod console;
pub mod db;
pub mod error;
pub mod jobs;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod pipeline;
pub mod runner;
pub mod security;
pub mod store;

pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
