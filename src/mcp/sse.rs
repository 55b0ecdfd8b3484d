//! Remote tool server reached over an HTTP event stream.
//!
//! The client opens a long-lived `GET` event stream. The server's first
//! `endpoint` event names the URL requests are POSTed to; responses come back
//! as `message` events and are matched to callers by request id, so several
//! requests may be in flight at once.

use super::protocol::{
    call_params, initialize_params, list_params, JsonRpcRequest, JsonRpcResponse, RemoteTool,
    ToolCallResult, ToolsListResult,
};
use super::RemoteConnection;
use crate::config::{RemoteServerConfig, ServerTransport};
use crate::error::{ReferatError, Result};
use crate::tools::ToolOutput;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// One server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental parser for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body; returns every event it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = Self::parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut event = String::from("message");
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => event = value.to_string(),
                "data" => data.push(value),
                _ => {}
            }
        }
        (!data.is_empty()).then(|| SseEvent {
            event,
            data: data.join("\n"),
        })
    }
}

/// Stops the stream reader task when dropped.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Removes a request's waiter when its call ends, however it ends.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

/// A live event stream plus its request endpoint.
struct SseSession {
    post_url: Url,
    pending: Pending,
    alive: Arc<AtomicBool>,
    _reader: ReaderTask,
}

/// Connection to one event-stream tool server.
///
/// A dropped stream is reopened lazily on the next request.
pub struct SseConnection {
    name: String,
    url: Url,
    http: reqwest::Client,
    connect_timeout: Duration,
    session: Mutex<Option<Arc<SseSession>>>,
    next_id: AtomicU64,
}

impl SseConnection {
    /// Open the event stream and complete the initialize handshake.
    #[instrument(skip_all, fields(server = %config.name))]
    pub async fn connect(config: RemoteServerConfig, connect_timeout: Duration) -> Result<Self> {
        let raw = config.url.as_deref().unwrap_or_default();
        let url = Url::parse(raw).map_err(|e| ReferatError::RemoteConnect {
            server: config.name.clone(),
            message: format!("invalid url '{}': {}", raw, e),
        })?;

        let connection = Self {
            name: config.name,
            url,
            http: reqwest::Client::new(),
            connect_timeout,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        };
        let session = connection.open().await?;
        *connection.session.lock().await = Some(session);
        info!("Connected to event-stream server '{}'", connection.name);
        Ok(connection)
    }

    fn connect_error(&self, message: impl Into<String>) -> ReferatError {
        ReferatError::RemoteConnect {
            server: self.name.clone(),
            message: message.into(),
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> ReferatError {
        ReferatError::RemoteTransport {
            server: self.name.clone(),
            message: message.into(),
        }
    }

    /// Open the stream, wait for the endpoint event and handshake.
    async fn open(&self) -> Result<Arc<SseSession>> {
        let outcome = tokio::time::timeout(self.connect_timeout, self.open_inner()).await;
        match outcome {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(self.connect_error(e.to_string())),
            Err(_) => Err(self.connect_error(format!(
                "no handshake within {}s",
                self.connect_timeout.as_secs()
            ))),
        }
    }

    async fn open_inner(&self) -> Result<Arc<SseSession>> {
        let response = self
            .http
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = ReaderTask(tokio::spawn(read_events(
            self.name.clone(),
            response,
            pending.clone(),
            alive.clone(),
            endpoint_tx,
        )));

        let endpoint = endpoint_rx
            .await
            .map_err(|_| self.transport_error("stream closed before announcing an endpoint"))?;
        let post_url = self
            .url
            .join(&endpoint)
            .map_err(|e| self.transport_error(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        debug!("Server '{}' accepts requests at {}", self.name, post_url);

        let session = Arc::new(SseSession {
            post_url,
            pending,
            alive,
            _reader: reader,
        });

        self.call(&session, "initialize", Some(initialize_params())).await?;
        self.post(&session, &JsonRpcRequest::notification("notifications/initialized"))
            .await?;
        Ok(session)
    }

    async fn post(&self, session: &SseSession, message: &JsonRpcRequest) -> Result<()> {
        let response = self
            .http
            .post(session.post_url.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| {
                session.alive.store(false, Ordering::SeqCst);
                self.transport_error(format!("request failed: {}", e))
            })?;
        if !response.status().is_success() {
            return Err(self.transport_error(format!("server answered {}", response.status())));
        }
        Ok(())
    }

    /// One request/response pair over `session`.
    async fn call(&self, session: &SseSession, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        session
            .pending
            .lock()
            .map_err(|_| self.transport_error("pending map poisoned"))?
            .insert(id, tx);
        let _entry = PendingEntry {
            pending: &session.pending,
            id,
        };

        self.post(session, &JsonRpcRequest::new(id, method, params)).await?;
        match rx.await {
            Ok(response) => response.into_result(&self.name),
            Err(_) => Err(self.transport_error("event stream closed while awaiting a response")),
        }
    }

    /// Live session, reopening the stream if it died.
    async fn live_session(&self) -> Result<Arc<SseSession>> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.alive.load(Ordering::SeqCst) {
                return Ok(session.clone());
            }
        }
        info!("Reconnecting to event-stream server '{}'", self.name);
        let session = self.open().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let session = self.live_session().await?;
        self.call(&session, method, params).await
    }
}

/// Pump the event stream: hand out the endpoint, then route responses.
async fn read_events(
    server: String,
    response: reqwest::Response,
    pending: Pending,
    alive: Arc<AtomicBool>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Event stream from '{}' failed: {}", server, e);
                break;
            }
        };
        for event in parser.push(&String::from_utf8_lossy(&bytes)) {
            match event.event.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(event.data.trim().to_string());
                    }
                }
                "message" => match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    Ok(response) => {
                        let waiter = response
                            .request_id()
                            .and_then(|id| pending.lock().ok().and_then(|mut p| p.remove(&id)));
                        if let Some(tx) = waiter {
                            let _ = tx.send(response);
                        }
                    }
                    Err(e) => debug!("Ignoring malformed message from '{}': {}", server, e),
                },
                other => debug!("Ignoring '{}' event from '{}'", other, server),
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with an error
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
    debug!("Event stream from '{}' ended", server);
}

#[async_trait]
impl RemoteConnection for SseConnection {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> ServerTransport {
        ServerTransport::Sse
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
        result.into_output(&self.name, tool)
    }

    async fn shutdown(&self) {
        if self.session.lock().await.take().is_some() {
            info!("Closed event stream to '{}'", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::sse::{Event, Sse};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::Stream;
    use serde_json::json;
    use std::convert::Infallible;
    use tokio::sync::broadcast;

    fn config(url: &str) -> RemoteServerConfig {
        RemoteServerConfig {
            name: "world_time".to_string(),
            transport: ServerTransport::Sse,
            command: None,
            args: Vec::new(),
            env: Default::default(),
            url: Some(url.to_string()),
            requires_env: None,
            enabled: true,
        }
    }

    async fn open_stream(
        State(events): State<broadcast::Sender<String>>,
    ) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
        let rx = events.subscribe();
        let endpoint = futures::stream::once(async {
            Ok::<_, Infallible>(Event::default().event("endpoint").data("/messages"))
        });
        let messages = futures::stream::unfold(rx, |mut rx| async move {
            let data = rx.recv().await.ok()?;
            Some((Ok(Event::default().event("message").data(data)), rx))
        });
        Sse::new(endpoint.chain(messages))
    }

    /// Answers the handshake and discovery; tool calls never get a reply.
    async fn answer(State(events): State<broadcast::Sender<String>>, Json(request): Json<Value>) -> StatusCode {
        let result = match request["method"].as_str() {
            Some("initialize") => json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
            Some("tools/list") => json!({"tools": []}),
            _ => return StatusCode::ACCEPTED,
        };
        let _ = events.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}).to_string());
        StatusCode::ACCEPTED
    }

    async fn silent_server() -> String {
        let (events, _) = broadcast::channel::<String>(16);
        let app = Router::new()
            .route("/sse", get(open_stream))
            .route("/messages", post(answer))
            .with_state(events);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/sse", addr)
    }

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push("event: endpoint\ndata: /messages?session").is_empty());
        let events = parser.push("_id=42\n\n: keep-alive\n\nevent: message\r\ndata: {\"id\":1}\r\n\r\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "endpoint".into(),
                    data: "/messages?session_id=42".into()
                },
                SseEvent {
                    event: "message".into(),
                    data: "{\"id\":1}".into()
                },
            ]
        );
    }

    #[test]
    fn test_default_event_and_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.push("data: line one\ndata: line two\n\n");
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_endpoint_resolution_against_stream_url() {
        let base = Url::parse("http://localhost:8001/sse").unwrap();
        assert_eq!(
            base.join("/messages/?session_id=abc").unwrap().as_str(),
            "http://localhost:8001/messages/?session_id=abc"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connect_error() {
        let result = SseConnection::connect(config("http://127.0.0.1:9/sse"), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ReferatError::RemoteConnect { .. })));
    }

    #[tokio::test]
    async fn test_timed_out_calls_release_their_waiters() {
        let url = silent_server().await;
        let connection = SseConnection::connect(config(&url), Duration::from_secs(5)).await.unwrap();
        assert!(connection.discover().await.unwrap().is_empty());

        for _ in 0..5 {
            let call = connection.invoke("get_time", json!({}));
            assert!(tokio::time::timeout(Duration::from_millis(50), call).await.is_err());
        }
        let session = connection.session.lock().await.clone().unwrap();
        assert!(session.pending.lock().unwrap().is_empty());
        connection.shutdown().await;
    }
}
