//! Service wiring for Referat.
//!
//! Builds the storage, model and tool stack from settings once, and hands out
//! chat sessions that share it.

use crate::agent::{ChatSession, OpenAIReasoningModel, ReasoningModel, TurnRunner};
use crate::chunking::ChunkingConfig;
use crate::config::{Prompts, Settings};
use crate::embedding::{Embedder, OpenAIEmbedder};
use crate::error::{ReferatError, Result};
use crate::feedback::{FeedbackCorrelator, HttpFeedbackSink, ObservabilitySink, TracingSink};
use crate::indexer::MeetingIndexer;
use crate::mcp::{GatewayTimeouts, RemoteToolGateway};
use crate::metadata::{MetadataExtractor, OpenAIMetadataExtractor};
use crate::openai::create_client;
use crate::retrieval::{RetrievalPlanner, SPEAKERS_FIELD};
use crate::tools::{meeting_tools, video_tools, MeetingToolContext, ToolRegistry, VideoToolContext};
use crate::transcription::{CommandTranscriber, Transcriber};
use crate::vector_store::{Filter, MemoryVectorStore, SqliteVectorStore, VectorStore};
use crate::workflow::WorkflowStore;
use chrono::Local;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Owns every long-lived service and the open chat sessions.
pub struct Orchestrator {
    settings: Settings,
    store: Arc<dyn VectorStore>,
    registry: Arc<ToolRegistry>,
    workflow: WorkflowStore,
    gateway: Option<RemoteToolGateway>,
    sink: Arc<dyn ObservabilitySink>,
    runner: TurnRunner,
    sessions: Mutex<HashMap<String, ChatSession>>,
}

impl Orchestrator {
    /// Build the full stack from settings, using the OpenAI-backed model.
    pub async fn new(settings: Settings) -> Result<Self> {
        let model: Arc<dyn ReasoningModel> = Arc::new(OpenAIReasoningModel::new(&settings.model)?);
        Self::with_model(settings, model).await
    }

    /// Build the full stack around a given reasoning model.
    #[instrument(skip_all)]
    pub async fn with_model(settings: Settings, model: Arc<dyn ReasoningModel>) -> Result<Self> {
        settings.validate()?;
        let prompts = Prompts::load(settings.prompts.custom_dir.as_deref())?;

        let store: Arc<dyn VectorStore> = match settings.vector_store.provider.as_str() {
            "sqlite" => {
                let path = settings.sqlite_path();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                info!("Using SQLite vector store at {}", path.display());
                Arc::new(SqliteVectorStore::new(&path)?)
            }
            "memory" => {
                info!("Using in-memory vector store");
                Arc::new(MemoryVectorStore::new())
            }
            other => {
                return Err(ReferatError::Config(format!(
                    "Unknown vector store provider: {}",
                    other
                )))
            }
        };

        let embedder: Arc<dyn Embedder> = Arc::new(OpenAIEmbedder::new(
            &settings.embedding.model,
            settings.embedding.dimensions as usize,
        )?);
        let transcriber: Arc<dyn Transcriber> = Arc::new(CommandTranscriber::from_settings(&settings.transcription));
        let extractor: Arc<dyn MetadataExtractor> = Arc::new(OpenAIMetadataExtractor::new(
            create_client()?,
            &settings.metadata.model,
            settings.metadata.max_chars,
            prompts.metadata.clone(),
        ));

        let indexer = Arc::new(MeetingIndexer::new(
            store.clone(),
            embedder.clone(),
            &settings.vector_store.namespace,
            ChunkingConfig::from(&settings.chunking),
        ));
        let workflow = WorkflowStore::new();

        let mut registry = ToolRegistry::new();
        registry.register_all(meeting_tools(Arc::new(MeetingToolContext {
            store: store.clone(),
            embedder,
            indexer: indexer.clone(),
            planner: RetrievalPlanner::from_settings(&settings.retrieval),
            list_scan_limit: settings.retrieval.list_scan_limit,
        })))?;
        registry.register_all(video_tools(Arc::new(VideoToolContext {
            workflow: workflow.clone(),
            transcriber,
            extractor,
            indexer,
        })))?;

        let gateway = if settings.mcp.enabled {
            let gateway =
                RemoteToolGateway::connect_all(&settings.enabled_servers(), GatewayTimeouts::from(&settings.mcp)).await;
            if let Err(e) = gateway.register_into(&mut registry) {
                gateway.shutdown().await;
                return Err(e);
            }
            Some(gateway)
        } else {
            None
        };
        info!("Tool registry ready with {} tool(s)", registry.len());

        let sink: Arc<dyn ObservabilitySink> = match HttpFeedbackSink::from_settings(&settings.feedback)? {
            Some(sink) => Arc::new(sink),
            None => {
                debug!("No feedback endpoint configured, feedback is logged only");
                Arc::new(TracingSink)
            }
        };

        let mut vars = HashMap::new();
        vars.insert("today".to_string(), Local::now().format("%Y-%m-%d").to_string());
        let system_prompt = Prompts::render(&prompts.agent.system, &vars);

        let registry = Arc::new(registry);
        let runner = TurnRunner::new(model, registry.clone())
            .with_system_prompt(&system_prompt)
            .with_max_iterations(settings.model.max_iterations);

        Ok(Self {
            settings,
            store,
            registry,
            workflow,
            gateway,
            sink,
            runner,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn workflow(&self) -> &WorkflowStore {
        &self.workflow
    }

    /// Names of the connected remote tool servers.
    pub fn remote_servers(&self) -> Vec<&str> {
        self.gateway.as_ref().map(|g| g.server_names()).unwrap_or_default()
    }

    /// The session called `id`, opened on first use.
    pub async fn session(&self, id: &str) -> ChatSession {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(id) {
            return session.clone();
        }

        let correlator = FeedbackCorrelator::new(id, &self.settings.feedback.project, self.sink.clone());
        let session = ChatSession::new(id, self.runner.clone(), correlator);
        session.set_known_speakers(self.known_speakers().await);
        info!("Opened session {}", id);
        sessions.insert(id.to_string(), session.clone());
        session
    }

    /// A session under a fresh random id.
    pub async fn new_session(&self) -> ChatSession {
        let id = uuid::Uuid::new_v4().to_string();
        self.session(&id).await
    }

    /// Look up an open session without creating it.
    pub async fn existing_session(&self, id: &str) -> Option<ChatSession> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Close a session and drop its workflow state.
    pub async fn end_session(&self, id: &str) {
        if let Some(session) = self.sessions.lock().await.remove(id) {
            session.cancel();
        }
        self.workflow.remove(id);
    }

    /// Every speaker name found in the knowledge base.
    async fn known_speakers(&self) -> Vec<String> {
        let rows = match self
            .store
            .scan(
                &self.settings.vector_store.namespace,
                &Filter::new(),
                self.settings.retrieval.list_scan_limit,
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not read speaker names: {}", e);
                return Vec::new();
            }
        };
        let names: BTreeSet<String> = rows
            .iter()
            .flat_map(|r| r.list_field(SPEAKERS_FIELD).iter().cloned())
            .filter(|name| !name.starts_with("SPEAKER_") && name != "Unknown")
            .collect();
        names.into_iter().collect()
    }

    /// Cancel running turns and close remote connections.
    pub async fn shutdown(&self) {
        for session in self.sessions.lock().await.values() {
            session.cancel();
        }
        if let Some(gateway) = &self.gateway {
            gateway.shutdown().await;
        }
        info!("Shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ChatMessage, ModelReply};
    use crate::tools::ToolSpec;
    use async_trait::async_trait;

    struct QuietModel;

    #[async_trait]
    impl ReasoningModel for QuietModel {
        async fn complete(&self, _messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ModelReply> {
            Ok(ModelReply::Answer("ok".into()))
        }
    }

    fn offline_settings() -> Settings {
        let mut settings = Settings::default();
        settings.vector_store.provider = "memory".into();
        settings.mcp.enabled = false;
        settings
    }

    #[tokio::test]
    async fn test_registers_local_tools_and_caches_sessions() {
        let orchestrator = Orchestrator::with_model(offline_settings(), Arc::new(QuietModel))
            .await
            .unwrap();
        let registry = orchestrator.registry();
        assert_eq!(registry.len(), 12);
        assert!(registry.contains("search_meetings"));
        assert!(registry.contains("upload_transcription"));
        assert!(orchestrator.remote_servers().is_empty());

        let first = orchestrator.session("s1").await;
        let outcome = first.ask("hello").await.unwrap();
        assert_eq!(outcome.answer, "ok");
        let again = orchestrator.session("s1").await;
        assert_eq!(again.history().await.len(), 1);

        orchestrator.workflow().handle("s1").unwrap();
        assert_eq!(orchestrator.workflow().session_count(), 1);
        orchestrator.end_session("s1").await;
        assert!(orchestrator.existing_session("s1").await.is_none());
        assert_eq!(orchestrator.workflow().session_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_store_provider_is_rejected() {
        let mut settings = offline_settings();
        settings.vector_store.provider = "pinecone".into();
        let result = Orchestrator::with_model(settings, Arc::new(QuietModel)).await;
        assert!(matches!(result, Err(ReferatError::Config(_))));
    }
}
