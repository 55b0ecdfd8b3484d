//! Error types for Referat.

use thiserror::Error;

/// Library-level error type for Referat operations.
#[derive(Error, Debug)]
pub enum ReferatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate tool name: {0}")]
    DuplicateToolName(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Could not connect to remote server '{server}': {message}")]
    RemoteConnect { server: String, message: String },

    #[error("Transport error talking to '{server}': {message}")]
    RemoteTransport { server: String, message: String },

    #[error("Remote server '{server}' returned error {code}: {message}")]
    RemoteServer {
        server: String,
        code: i64,
        message: String,
    },

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("{0}")]
    Workflow(String),

    #[error("Reasoning model error: {0}")]
    Model(String),

    #[error("OpenAI API error: {0}")]
    OpenAI(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Metadata extraction failed: {0}")]
    Metadata(String),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Feedback error: {0}")]
    Feedback(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External tool not found: {0}. Please install it and ensure it's in your PATH.")]
    ExecutableNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ReferatError {
    /// Whether the process can keep going after this error.
    ///
    /// Only configuration problems (including tool name collisions) halt startup.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ReferatError::Config(_) | ReferatError::DuplicateToolName(_)
        )
    }
}

/// Result type alias for Referat operations.
pub type Result<T> = std::result::Result<T, ReferatError>;
