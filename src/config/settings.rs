//! Configuration settings for Referat.

use crate::error::{ReferatError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub model: ModelSettings,
    pub metadata: MetadataSettings,
    pub embedding: EmbeddingSettings,
    pub vector_store: VectorStoreSettings,
    pub retrieval: RetrievalSettings,
    pub chunking: ChunkingSettings,
    pub transcription: TranscriptionSettings,
    pub mcp: McpSettings,
    pub feedback: FeedbackSettings,
    pub prompts: PromptSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for storing application data.
    pub data_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.referat".to_string(),
            log_level: "warn".to_string(),
        }
    }
}

/// Reasoning model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Chat model driving the conversation.
    pub name: String,
    pub temperature: f32,
    /// Reasoning steps allowed per turn before answering with what we have.
    pub max_iterations: usize,
    pub request_timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "gpt-4.1-mini".to_string(),
            temperature: 0.2,
            max_iterations: 10,
            request_timeout_secs: 300,
        }
    }
}

/// Metadata extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    pub model: String,
    /// Transcript characters sent to the extractor.
    pub max_chars: usize,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_chars: 15_000,
        }
    }
}

/// Embedding generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Embedding model to use.
    pub model: String,
    /// Embedding dimensions.
    pub dimensions: u32,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
        }
    }
}

/// Vector store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreSettings {
    /// Vector store provider (sqlite, memory).
    pub provider: String,
    /// Path to SQLite database (for sqlite provider).
    pub sqlite_path: String,
    /// Namespace all meeting records live in.
    pub namespace: String,
}

impl Default for VectorStoreSettings {
    fn default() -> Self {
        Self {
            provider: "sqlite".to_string(),
            sqlite_path: "~/.referat/vectors.db".to_string(),
            namespace: "development".to_string(),
        }
    }
}

/// Retrieval planning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Result count for targeted questions.
    pub default_top_k: usize,
    /// Budget multiplier for whole-meeting questions about one meeting.
    pub comprehensive_multiplier: usize,
    /// Records scanned when listing meetings.
    pub list_scan_limit: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            comprehensive_multiplier: 100,
            list_scan_limit: 100,
        }
    }
}

/// Transcript chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub min_chunk_chars: usize,
    pub max_chunk_chars: usize,
    /// Characters carried over from the previous chunk.
    pub overlap_chars: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            min_chunk_chars: 1500,
            max_chunk_chars: 3000,
            overlap_chars: 200,
        }
    }
}

/// External diarizing transcriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionSettings {
    /// Executable that prints diarized segments as JSON for a media path.
    pub command: String,
    /// Extra arguments placed before the media path.
    pub args: Vec<String>,
    /// Model name recorded in chunk metadata.
    pub model: String,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            command: "referat-diarize".to_string(),
            args: Vec::new(),
            model: "whisperx-large-v2".to_string(),
        }
    }
}

/// Remote tool server transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    /// Subprocess speaking line-delimited JSON-RPC on stdin/stdout.
    Stdio,
    /// Event-stream connection over HTTP.
    Sse,
}

impl std::fmt::Display for ServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerTransport::Stdio => write!(f, "stdio"),
            ServerTransport::Sse => write!(f, "sse"),
        }
    }
}

/// A configured remote tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    pub name: String,
    pub transport: ServerTransport,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment passed to the subprocess. Values may reference `${VAR}`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Only connect when this environment variable is set and non-empty.
    #[serde(default)]
    pub requires_env: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RemoteServerConfig {
    /// Whether the enablement predicate holds in the current environment.
    pub fn is_enabled(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.requires_env {
            Some(var) => std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false),
            None => true,
        }
    }

    /// Environment with `${VAR}` references resolved.
    ///
    /// Unresolvable references are left as written.
    pub fn resolved_env(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| {
                let value = shellexpand::env(v)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| v.clone());
                (k.clone(), value)
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ReferatError::Config(
                "remote server entry without a name".to_string(),
            ));
        }
        match self.transport {
            ServerTransport::Stdio => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ReferatError::Config(format!(
                        "server '{}' uses stdio but has no command",
                        self.name
                    )));
                }
            }
            ServerTransport::Sse => {
                let raw = self.url.as_deref().ok_or_else(|| {
                    ReferatError::Config(format!("server '{}' uses sse but has no url", self.name))
                })?;
                let parsed = url::Url::parse(raw).map_err(|e| {
                    ReferatError::Config(format!("server '{}' has invalid url '{}': {}", self.name, raw, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ReferatError::Config(format!(
                        "server '{}' url must be http or https",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Remote tool gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Connect to remote tool servers at all.
    pub enabled: bool,
    /// Bounded wait for each remote tool call.
    pub call_timeout_secs: u64,
    /// Bounded wait for connect + discovery.
    pub connect_timeout_secs: u64,
    pub servers: Vec<RemoteServerConfig>,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            call_timeout_secs: 30,
            connect_timeout_secs: 30,
            servers: vec![
                RemoteServerConfig {
                    name: "notion".to_string(),
                    transport: ServerTransport::Stdio,
                    command: Some("npx".to_string()),
                    args: vec!["-y".to_string(), "@notionhq/notion-mcp-server".to_string()],
                    env: BTreeMap::from([(
                        "OPENAPI_MCP_HEADERS".to_string(),
                        r#"{"Authorization": "Bearer ${NOTION_TOKEN}", "Notion-Version": "2022-06-28"}"#
                            .to_string(),
                    )]),
                    url: None,
                    requires_env: Some("NOTION_TOKEN".to_string()),
                    enabled: true,
                },
                RemoteServerConfig {
                    name: "world_time".to_string(),
                    transport: ServerTransport::Sse,
                    command: None,
                    args: Vec::new(),
                    env: BTreeMap::new(),
                    url: Some("http://localhost:8001/sse".to_string()),
                    requires_env: None,
                    enabled: false,
                },
            ],
        }
    }
}

/// Observability / feedback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackSettings {
    /// Base URL of the tracing backend. Feedback is only logged when unset.
    pub endpoint: Option<String>,
    /// Environment variable holding the backend API key.
    pub api_key_env: String,
    pub project: String,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "LANGSMITH_API_KEY".to_string(),
            project: "meeting-agent".to_string(),
        }
    }
}

/// Prompt customization settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PromptSettings {
    /// Directory holding `agent.toml` / `metadata.toml` overrides.
    pub custom_dir: Option<String>,
}

impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        let settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Settings::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the process must not start with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for server in &self.mcp.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(ReferatError::Config(format!(
                    "remote server '{}' configured twice",
                    server.name
                )));
            }
        }
        if self.chunking.min_chunk_chars > self.chunking.max_chunk_chars {
            return Err(ReferatError::Config(
                "chunking.min_chunk_chars exceeds max_chunk_chars".to_string(),
            ));
        }
        if self.retrieval.default_top_k == 0 {
            return Err(ReferatError::Config(
                "retrieval.default_top_k must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Save settings to the default configuration file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_config_path())
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ReferatError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("referat")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Get the expanded SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        Self::expand_path(&self.vector_store.sqlite_path)
    }

    /// Remote servers whose enablement predicate currently holds.
    pub fn enabled_servers(&self) -> Vec<RemoteServerConfig> {
        if !self.mcp.enabled {
            return Vec::new();
        }
        self.mcp
            .servers
            .iter()
            .filter(|s| s.is_enabled())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio(name: &str, command: Option<&str>) -> RemoteServerConfig {
        RemoteServerConfig {
            name: name.to_string(),
            transport: ServerTransport::Stdio,
            command: command.map(str::to_string),
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            requires_env: None,
            enabled: true,
        }
    }

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.vector_store.namespace, "development");
        assert_eq!(settings.retrieval.default_top_k, 5);
    }

    #[test]
    fn test_stdio_without_command_is_fatal() {
        let mut settings = Settings::default();
        settings.mcp.servers = vec![stdio("broken", None)];
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ReferatError::Config(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_sse_with_bad_url_is_fatal() {
        let mut settings = Settings::default();
        settings.mcp.servers = vec![RemoteServerConfig {
            transport: ServerTransport::Sse,
            url: Some("not a url".to_string()),
            ..stdio("clock", None)
        }];
        assert!(matches!(settings.validate(), Err(ReferatError::Config(_))));
    }

    #[test]
    fn test_duplicate_server_names_rejected() {
        let mut settings = Settings::default();
        settings.mcp.servers = vec![stdio("a", Some("x")), stdio("a", Some("y"))];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_requires_env_predicate() {
        let mut server = stdio("gated", Some("true"));
        server.requires_env = Some("REFERAT_TEST_SURELY_UNSET_VAR".to_string());
        assert!(!server.is_enabled());

        server.requires_env = Some("PATH".to_string());
        assert!(server.is_enabled());

        server.enabled = false;
        assert!(!server.is_enabled());
    }

    #[test]
    fn test_toml_round_trip() {
        let settings = Settings::default();
        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed.mcp.servers.len(), 2);
        assert_eq!(parsed.mcp.servers[1].transport, ServerTransport::Sse);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Settings = toml::from_str(
            r#"
            [model]
            name = "gpt-4o"

            [[mcp.servers]]
            name = "clock"
            transport = "sse"
            url = "http://localhost:9000/sse"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.model.name, "gpt-4o");
        assert_eq!(parsed.model.max_iterations, 10);
        assert_eq!(parsed.mcp.servers.len(), 1);
        assert!(parsed.mcp.servers[0].enabled);
        assert!(parsed.validate().is_ok());
    }
}
