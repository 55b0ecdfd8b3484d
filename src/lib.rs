//! Referat - conversational meeting intelligence
//!
//! Turns meeting recordings into a searchable knowledge base and lets a user
//! work with it through natural-language chat turns.
//!
//! # Architecture
//!
//! - `tools` - Tool registry, input schemas and handler kinds
//! - `mcp` - Remote tool servers over stdio and SSE
//! - `retrieval` - Builds metadata filters and budgets from a question
//! - `agent` - The per-turn reasoning and tool-calling state machine, and sessions
//! - `workflow` - Per-session state of the video upload workflow
//! - `feedback` - Links user ratings to recorded turns
//! - `transcription`, `metadata`, `chunking`, `embedding`, `vector_store`, `indexer` - Ingestion
//! - `orchestrator` - Wires everything together from settings
//!
//! # Example
//!
//! ```rust,no_run
//! use referat::config::Settings;
//! use referat::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let orchestrator = Orchestrator::new(settings).await?;
//!
//!     let session = orchestrator.session("demo").await;
//!     if let Some(outcome) = session.ask("What did we decide in meeting_ab12cd34?").await {
//!         println!("{}", outcome.answer);
//!     }
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod chunking;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod feedback;
pub mod indexer;
pub mod mcp;
pub mod metadata;
pub mod openai;
pub mod orchestrator;
pub mod retrieval;
pub mod tools;
pub mod transcription;
pub mod vector_store;
pub mod workflow;

pub use error::{ReferatError, Result};
