//! Remote tool server spoken to over a subprocess's stdin/stdout.
//!
//! Requests are newline-delimited JSON-RPC. One round trip is in flight at a
//! time; the connection lock is held from write until the matching response.

use super::protocol::{
    call_params, initialize_params, list_params, JsonRpcRequest, JsonRpcResponse, RemoteTool,
    ToolCallResult, ToolsListResult,
};
use super::RemoteConnection;
use crate::config::{RemoteServerConfig, ServerTransport};
use crate::error::{ReferatError, Result};
use crate::tools::ToolOutput;
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Calls abandoned in a row before the process is considered hung.
const MAX_ABANDONED_CALLS: u32 = 3;

/// Where the last round trip got to. A caller's timeout drops the round trip
/// future, leaving this at `Writing` or `Awaiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundTrip {
    Idle,
    Writing,
    Awaiting,
}

/// A live subprocess and its pipes.
struct StdioProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    round_trip: RoundTrip,
    abandoned: u32,
}

impl StdioProcess {
    /// Account for a round trip that was dropped before it finished.
    ///
    /// Returns why the process can no longer be used, if it can't.
    fn settle_abandoned(&mut self) -> Option<&'static str> {
        match std::mem::replace(&mut self.round_trip, RoundTrip::Idle) {
            RoundTrip::Idle => None,
            RoundTrip::Writing => Some("a request was cut off mid-write"),
            RoundTrip::Awaiting => {
                self.abandoned += 1;
                (self.abandoned >= MAX_ABANDONED_CALLS).then_some("it stopped answering requests")
            }
        }
    }
}

/// Connection to one stdio tool server.
///
/// A dead process is replaced lazily on the next request.
pub struct StdioConnection {
    config: RemoteServerConfig,
    connect_timeout: Duration,
    process: Mutex<Option<StdioProcess>>,
    next_id: AtomicU64,
}

impl StdioConnection {
    /// Spawn the server and complete the initialize handshake.
    #[instrument(skip_all, fields(server = %config.name))]
    pub async fn connect(config: RemoteServerConfig, connect_timeout: Duration) -> Result<Self> {
        let connection = Self {
            config,
            connect_timeout,
            process: Mutex::new(None),
            next_id: AtomicU64::new(1),
        };
        let process = connection.start().await?;
        *connection.process.lock().await = Some(process);
        info!("Connected to stdio server '{}'", connection.config.name);
        Ok(connection)
    }

    fn connect_error(&self, message: impl Into<String>) -> ReferatError {
        ReferatError::RemoteConnect {
            server: self.config.name.clone(),
            message: message.into(),
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> ReferatError {
        ReferatError::RemoteTransport {
            server: self.config.name.clone(),
            message: message.into(),
        }
    }

    fn spawn(&self) -> Result<StdioProcess> {
        let program = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| self.connect_error("no command configured"))?;

        let mut child = Command::new(program)
            .args(&self.config.args)
            .envs(self.config.resolved_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    self.connect_error(format!("command '{}' not found", program))
                }
                _ => self.connect_error(format!("failed to spawn '{}': {}", program, e)),
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(StdioProcess {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                round_trip: RoundTrip::Idle,
                abandoned: 0,
            }),
            _ => {
                // kill_on_drop reaps the child
                Err(self.connect_error("failed to open subprocess pipes"))
            }
        }
    }

    /// Spawn and handshake within the connect timeout.
    async fn start(&self) -> Result<StdioProcess> {
        let mut process = self.spawn()?;
        let handshake = async {
            self.round_trip(&mut process, "initialize", Some(initialize_params()))
                .await?;
            Self::write_message(&mut process, &JsonRpcRequest::notification("notifications/initialized"))
                .await
                .map_err(|e| self.transport_error(e.to_string()))
        };

        let outcome = tokio::time::timeout(self.connect_timeout, handshake).await;
        match outcome {
            Ok(Ok(())) => Ok(process),
            Ok(Err(e)) => {
                let _ = process.child.kill().await;
                Err(self.connect_error(format!("handshake failed: {}", e)))
            }
            Err(_) => {
                let _ = process.child.kill().await;
                Err(self.connect_error(format!(
                    "handshake timed out after {}s",
                    self.connect_timeout.as_secs()
                )))
            }
        }
    }

    async fn write_message(process: &mut StdioProcess, message: &JsonRpcRequest) -> std::io::Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await
    }

    /// Send one request and read lines until its response arrives.
    ///
    /// Lines that are not JSON, and responses to other ids (stale replies to
    /// timed-out requests, server notifications), are skipped.
    async fn round_trip(
        &self,
        process: &mut StdioProcess,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        process.round_trip = RoundTrip::Writing;
        Self::write_message(process, &JsonRpcRequest::new(id, method, params))
            .await
            .map_err(|e| self.transport_error(format!("write failed: {}", e)))?;
        process.round_trip = RoundTrip::Awaiting;

        let mut line = String::new();
        loop {
            line.clear();
            let read = process
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| self.transport_error(format!("read failed: {}", e)))?;
            if read == 0 {
                return Err(self.transport_error("server closed its output"));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let response: JsonRpcResponse = match serde_json::from_str(trimmed) {
                Ok(response) => response,
                Err(_) => {
                    debug!("Ignoring non-protocol line from '{}': {}", self.config.name, trimmed);
                    continue;
                }
            };
            if response.request_id() != Some(id) {
                continue;
            }
            process.round_trip = RoundTrip::Idle;
            process.abandoned = 0;
            return response.into_result(&self.config.name);
        }
    }

    /// Round trip on the live process, respawning it first if needed.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let mut guard = self.process.lock().await;
        if let Some(reason) = guard.as_mut().and_then(StdioProcess::settle_abandoned) {
            warn!("Restarting stdio server '{}': {}", self.config.name, reason);
            if let Some(mut hung) = guard.take() {
                let _ = hung.child.kill().await;
            }
        }
        if guard.is_none() {
            info!("Reconnecting to stdio server '{}'", self.config.name);
            *guard = Some(self.start().await?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(self.transport_error("no live process"));
        };

        let result = self.round_trip(process, method, params).await;
        if let Err(ReferatError::RemoteTransport { .. }) = &result {
            warn!("Stdio server '{}' is unresponsive; will restart on next call", self.config.name);
            if let Some(mut dead) = guard.take() {
                let _ = dead.child.kill().await;
            }
        }
        result
    }
}

#[async_trait]
impl RemoteConnection for StdioConnection {
    fn server_name(&self) -> &str {
        &self.config.name
    }

    fn transport(&self) -> ServerTransport {
        ServerTransport::Stdio
    }

    async fn discover(&self) -> Result<Vec<RemoteTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page: ToolsListResult =
                serde_json::from_value(self.request("tools/list", list_params(cursor.as_deref())).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn invoke(&self, tool: &str, args: Value) -> Result<ToolOutput> {
        let raw = self.request("tools/call", Some(call_params(tool, args))).await?;
        let result: ToolCallResult = serde_json::from_value(raw)?;
        result.into_output(&self.config.name, tool)
    }

    async fn shutdown(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            if let Err(e) = process.child.kill().await {
                debug!("Stdio server '{}' already exited: {}", self.config.name, e);
            }
            info!("Stopped stdio server '{}'", self.config.name);
        }
    }
}
