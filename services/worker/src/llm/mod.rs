//! services/worker/src/llm/mod.rs
//!
//! The LLM-facing half of the pipeline: the provider-agnostic HTTP client,
//! the credential cache, and the chunked prompt runner.

pub mod client;
pub mod runner;
pub mod token;

pub use client::LlmClient;
pub use runner::{ChunkOutcome, ChunkedPromptRunner, MessagesFactory};
pub use token::TokenProvider;
