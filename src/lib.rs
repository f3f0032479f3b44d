//! Deep-Memory Server
//!
//! Namespaced long-term memory for conversational agents: transcript
//! ingestion into durable memories, hybrid vector + knowledge-graph
//! retrieval with temporal decay, and durable per-key job queues.

pub mod adapters;
pub mod auth;
pub mod encoding;
pub mod error;
pub mod guardrails;
pub mod importance;
pub mod queue;
pub mod retriever;
pub mod server;
pub mod types;
pub mod updater;

pub use error::{DeepMemError, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
