//! services/worker/src/lib.rs
//!
//! The background generation worker: configuration, the LLM client stack,
//! the generation services, the persistence adapter and the job dispatch
//! layer. The binaries under `src/bin/` wire these together.

pub mod adapters;
pub mod config;
pub mod error;
pub mod generation;
pub mod jobs;
pub mod llm;
