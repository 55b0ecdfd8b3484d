//! MCP (Model Context Protocol) client for remote tool servers.
//!
//! Servers are reached either as a subprocess speaking JSON-RPC over stdio or
//! over an HTTP event stream. Both sit behind [`RemoteConnection`], so the
//! rest of the crate calls every remote tool the same way.

mod gateway;
mod protocol;
mod sse;
mod stdio;

pub use gateway::{GatewayTimeouts, RemoteToolGateway};
pub use protocol::{RemoteTool, PROTOCOL_VERSION};
pub use sse::{SseConnection, SseEvent, SseParser};
pub use stdio::StdioConnection;

use crate::config::ServerTransport;
use crate::error::Result;
use crate::tools::ToolOutput;
use async_trait::async_trait;
use serde_json::Value;

/// A live connection to one remote tool server.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Configured server name.
    fn server_name(&self) -> &str;

    fn transport(&self) -> ServerTransport;

    /// List the server's tools.
    async fn discover(&self) -> Result<Vec<RemoteTool>>;

    /// Call a tool by its name on the server.
    async fn invoke(&self, tool: &str, args: Value) -> Result<ToolOutput>;

    /// Release the connection. Later calls may reconnect.
    async fn shutdown(&self);
}
