//! Configuration module for Referat.
//!
//! Handles loading and managing application settings and prompt templates.

mod prompts;
mod settings;

pub use prompts::{AgentPrompts, MetadataPrompts, Prompts};
pub use settings::{
    ChunkingSettings, EmbeddingSettings, FeedbackSettings, GeneralSettings, McpSettings,
    MetadataSettings, ModelSettings, PromptSettings, RemoteServerConfig, RetrievalSettings,
    ServerTransport, Settings, TranscriptionSettings, VectorStoreSettings,
};
