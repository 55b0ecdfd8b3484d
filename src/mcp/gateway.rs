//! Gateway owning every remote tool server connection.

use super::protocol::RemoteTool;
use super::{RemoteConnection, SseConnection, StdioConnection};
use crate::config::{McpSettings, RemoteServerConfig, ServerTransport};
use crate::error::{ReferatError, Result};
use crate::tools::{InputSchema, ToolDescriptor, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Bounded waits applied by the gateway.
#[derive(Debug, Clone, Copy)]
pub struct GatewayTimeouts {
    /// Connect plus discovery, per server.
    pub connect: Duration,
    /// Each remote tool call.
    pub call: Duration,
}

impl From<&McpSettings> for GatewayTimeouts {
    fn from(settings: &McpSettings) -> Self {
        Self {
            connect: Duration::from_secs(settings.connect_timeout_secs),
            call: Duration::from_secs(settings.call_timeout_secs),
        }
    }
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self::from(&McpSettings::default())
    }
}

/// A connected server and the tools it advertised.
struct ConnectedServer {
    connection: Arc<dyn RemoteConnection>,
    tools: Vec<RemoteTool>,
}

/// One connection per configured server, exposing discovered tools.
pub struct RemoteToolGateway {
    servers: Vec<ConnectedServer>,
    timeouts: GatewayTimeouts,
}

impl RemoteToolGateway {
    /// A gateway with no servers.
    pub fn new(timeouts: GatewayTimeouts) -> Self {
        Self {
            servers: Vec::new(),
            timeouts,
        }
    }

    /// Connect to each server in turn. Servers that fail are skipped with a warning.
    #[instrument(skip_all, fields(servers = configs.len()))]
    pub async fn connect_all(configs: &[RemoteServerConfig], timeouts: GatewayTimeouts) -> Self {
        let mut gateway = Self::new(timeouts);
        for config in configs {
            let connection = match Self::connect_one(config, timeouts.connect).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Skipping remote server '{}': {}", config.name, e);
                    continue;
                }
            };
            if let Err(e) = gateway.attach(connection).await {
                warn!("Skipping remote server '{}': {}", config.name, e);
            }
        }
        info!(
            "Remote tool gateway ready: {} server(s), {} tool(s)",
            gateway.servers.len(),
            gateway.tool_count()
        );
        gateway
    }

    async fn connect_one(config: &RemoteServerConfig, timeout: Duration) -> Result<Arc<dyn RemoteConnection>> {
        match config.transport {
            ServerTransport::Stdio => Ok(Arc::new(StdioConnection::connect(config.clone(), timeout).await?)),
            ServerTransport::Sse => Ok(Arc::new(SseConnection::connect(config.clone(), timeout).await?)),
        }
    }

    /// Discover the tools of an open connection and keep it.
    ///
    /// On failure the connection is shut down and not kept.
    pub async fn attach(&mut self, connection: Arc<dyn RemoteConnection>) -> Result<usize> {
        let discovered = match tokio::time::timeout(self.timeouts.connect, connection.discover()).await {
            Ok(result) => result,
            Err(_) => Err(ReferatError::RemoteConnect {
                server: connection.server_name().to_string(),
                message: "tool discovery timed out".to_string(),
            }),
        };
        let tools = match discovered {
            Ok(tools) => tools,
            Err(e) => {
                connection.shutdown().await;
                return Err(e);
            }
        };

        info!(
            "Discovered {} tool(s) on '{}' ({})",
            tools.len(),
            connection.server_name(),
            connection.transport()
        );
        let count = tools.len();
        self.servers.push(ConnectedServer { connection, tools });
        Ok(count)
    }

    /// Registry entries for every discovered tool.
    ///
    /// Tools whose advertised schema is unusable are left out.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors = Vec::new();
        for server in &self.servers {
            for tool in &server.tools {
                let schema = match InputSchema::from_json_schema(&tool.input_schema) {
                    Ok(schema) => schema,
                    Err(e) => {
                        warn!(
                            "Ignoring tool '{}' from '{}': {}",
                            tool.name,
                            server.connection.server_name(),
                            e
                        );
                        continue;
                    }
                };
                descriptors.push(ToolDescriptor::remote(
                    &tool.name,
                    tool.description.as_deref().unwrap_or_default(),
                    schema,
                    server.connection.clone(),
                    self.timeouts.call,
                ));
            }
        }
        descriptors
    }

    /// Add every discovered tool to `registry`.
    ///
    /// A name collision with an existing tool is a configuration error and
    /// leaves the registry unchanged.
    pub fn register_into(&self, registry: &mut ToolRegistry) -> Result<usize> {
        registry.register_all(self.descriptors())
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.connection.server_name()).collect()
    }

    pub fn tool_count(&self) -> usize {
        self.servers.iter().map(|s| s.tools.len()).sum()
    }

    /// Tear down every connection.
    pub async fn shutdown(&self) {
        for server in &self.servers {
            server.connection.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ExecutionMode, ToolCallContext, ToolOutput};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeServer {
        name: String,
        tools: Vec<RemoteTool>,
        delay: Duration,
        closed: AtomicBool,
    }

    impl FakeServer {
        fn new(name: &str, tools: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tools: tools
                    .iter()
                    .map(|t| RemoteTool {
                        name: t.to_string(),
                        description: Some(format!("{} tool", t)),
                        input_schema: json!({"type": "object", "properties": {}}),
                    })
                    .collect(),
                delay,
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RemoteConnection for FakeServer {
        fn server_name(&self) -> &str {
            &self.name
        }

        fn transport(&self) -> ServerTransport {
            ServerTransport::Sse
        }

        async fn discover(&self) -> Result<Vec<RemoteTool>> {
            Ok(self.tools.clone())
        }

        async fn invoke(&self, tool: &str, _args: Value) -> Result<ToolOutput> {
            tokio::time::sleep(self.delay).await;
            Ok(ToolOutput::text(format!("{} done", tool)))
        }

        async fn shutdown(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn timeouts(call_ms: u64) -> GatewayTimeouts {
        GatewayTimeouts {
            connect: Duration::from_secs(1),
            call: Duration::from_millis(call_ms),
        }
    }

    #[tokio::test]
    async fn test_unreachable_servers_are_skipped() {
        let configs = vec![RemoteServerConfig {
            name: "notion".to_string(),
            transport: ServerTransport::Stdio,
            command: Some("referat-no-such-server-binary".to_string()),
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            requires_env: None,
            enabled: true,
        }];
        let gateway = RemoteToolGateway::connect_all(&configs, timeouts(100)).await;
        assert!(gateway.server_names().is_empty());
        assert!(gateway.descriptors().is_empty());
    }

    #[tokio::test]
    async fn test_discovered_tools_are_remote_descriptors() {
        let mut gateway = RemoteToolGateway::new(timeouts(1000));
        gateway
            .attach(FakeServer::new("world_time", &["get_time", "list_zones"], Duration::ZERO))
            .await
            .unwrap();

        let mut registry = ToolRegistry::new();
        assert_eq!(gateway.register_into(&mut registry).unwrap(), 2);
        let tool = registry.resolve("get_time").unwrap();
        assert_eq!(tool.mode(), ExecutionMode::Remote(ServerTransport::Sse));

        let output = tool.invoke(&ToolCallContext::new("s"), json!({})).await.unwrap();
        assert_eq!(output, ToolOutput::text("get_time done"));
    }

    #[tokio::test]
    async fn test_collision_with_local_tool_is_fatal() {
        let mut gateway = RemoteToolGateway::new(timeouts(1000));
        gateway
            .attach(FakeServer::new("notion", &["search_meetings", "notion_search"], Duration::ZERO))
            .await
            .unwrap();

        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::local_sync(
                "search_meetings",
                "local",
                InputSchema::new(),
                |_: &ToolCallContext, _: &Value| Ok(ToolOutput::text("local")),
            ))
            .unwrap();

        let err = gateway.register_into(&mut registry).unwrap_err();
        assert!(matches!(err, ReferatError::DuplicateToolName(name) if name == "search_meetings"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out_and_connection_stays_open() {
        let server = FakeServer::new("slow", &["get_time"], Duration::from_millis(500));
        let mut gateway = RemoteToolGateway::new(timeouts(50));
        gateway.attach(server.clone()).await.unwrap();

        let tool = gateway.descriptors().remove(0);
        let err = tool.invoke(&ToolCallContext::new("s"), json!({})).await.unwrap_err();
        assert!(matches!(err, ReferatError::ToolTimeout { timeout_ms: 50, .. }));
        assert!(err.is_recoverable());
        assert!(!server.closed.load(Ordering::SeqCst));

        gateway.shutdown().await;
        assert!(server.closed.load(Ordering::SeqCst));
    }
}
