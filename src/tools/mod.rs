//! Tools the reasoning model can call.
//!
//! A tool is a named capability with a declared input schema and a handler.
//! Handlers come in three flavours: synchronous local functions, asynchronous
//! local functions, and procedures on a remote tool server. All of them are
//! invoked through [`ToolDescriptor::invoke`].

mod meetings;
mod registry;
mod video;

pub use meetings::{meeting_tools, MeetingToolContext};
pub use registry::ToolRegistry;
pub use video::{video_tools, VideoToolContext};

use crate::config::ServerTransport;
use crate::error::{ReferatError, Result};
use crate::mcp::RemoteConnection;
use crate::retrieval::ConversationHints;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    /// Declared without a usable type; accepts anything.
    Any,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
            ParamType::Any => "any",
        }
    }

    fn from_json_type(raw: Option<&str>) -> Self {
        match raw {
            Some("string") => ParamType::String,
            Some("integer") => ParamType::Integer,
            Some("number") => ParamType::Number,
            Some("boolean") => ParamType::Boolean,
            Some("object") => ParamType::Object,
            Some("array") => ParamType::Array,
            _ => ParamType::Any,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }
}

/// One named parameter of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

/// Ordered parameter list of a tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSchema {
    params: Vec<ParamSpec>,
    /// Schema as advertised by a remote server, passed through unchanged.
    raw: Option<Value>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required parameter.
    pub fn required(mut self, name: &str, param_type: ParamType, description: &str) -> Self {
        self.push(name, param_type, description, true);
        self
    }

    /// Add an optional parameter.
    pub fn optional(mut self, name: &str, param_type: ParamType, description: &str) -> Self {
        self.push(name, param_type, description, false);
        self
    }

    fn push(&mut self, name: &str, param_type: ParamType, description: &str, required: bool) {
        self.params.push(ParamSpec {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required,
        });
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Build from a JSON Schema object as returned by tool discovery.
    ///
    /// Required parameters come first, in the order the schema lists them.
    pub fn from_json_schema(schema: &Value) -> Result<Self> {
        let object = match schema {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            other => {
                return Err(ReferatError::Config(format!(
                    "input schema must be an object, got {}",
                    other
                )))
            }
        };

        let empty = Map::new();
        let properties = match object.get("properties") {
            Some(Value::Object(props)) => props,
            None | Some(Value::Null) => &empty,
            Some(_) => {
                return Err(ReferatError::Config(
                    "input schema 'properties' must be an object".to_string(),
                ))
            }
        };
        let required: Vec<&str> = object
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let describe = |name: &str, is_required: bool| {
            let prop = properties.get(name);
            ParamSpec {
                name: name.to_string(),
                param_type: ParamType::from_json_type(
                    prop.and_then(|p| p.get("type")).and_then(Value::as_str),
                ),
                description: prop
                    .and_then(|p| p.get("description"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                required: is_required,
            }
        };

        let mut params: Vec<ParamSpec> = required.iter().map(|name| describe(name, true)).collect();
        for name in properties.keys() {
            if !required.contains(&name.as_str()) {
                params.push(describe(name, false));
            }
        }

        Ok(Self {
            params,
            raw: Some(schema.clone()),
        })
    }

    /// JSON Schema advertised to the reasoning model.
    pub fn to_json_schema(&self) -> Value {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| {
                let mut prop = json!({ "description": p.description });
                if p.param_type != ParamType::Any {
                    prop["type"] = json!(p.param_type.as_str());
                }
                (p.name.clone(), prop)
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check `args` against the declared parameters.
    ///
    /// Unknown extra arguments are passed through.
    pub fn validate(&self, tool: &str, args: &Value) -> Result<()> {
        let invalid = |message: String| ReferatError::InvalidArguments {
            tool: tool.to_string(),
            message,
        };

        let empty = Map::new();
        let object = match args {
            Value::Object(object) => object,
            Value::Null => &empty,
            other => return Err(invalid(format!("expected an object, got {}", other))),
        };

        for param in &self.params {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(invalid(format!("missing required parameter '{}'", param.name)))
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.param_type.accepts(value) => {
                    return Err(invalid(format!(
                        "parameter '{}' must be {}",
                        param.name,
                        param.param_type.as_str()
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// What a tool returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Structured(Value),
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutput::Text(text.into())
    }

    /// Content of the tool-result message.
    pub fn render(&self) -> String {
        match self {
            ToolOutput::Text(text) => text.clone(),
            ToolOutput::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

/// Per-call context handed to local tools.
#[derive(Debug, Clone, Default)]
pub struct ToolCallContext {
    pub session_id: String,
    pub hints: ConversationHints,
}

impl ToolCallContext {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            hints: ConversationHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: ConversationHints) -> Self {
        self.hints = hints;
        self
    }
}

/// A local tool that completes without awaiting.
pub trait SyncTool: Send + Sync {
    fn call(&self, ctx: &ToolCallContext, args: &Value) -> Result<ToolOutput>;
}

impl<F> SyncTool for F
where
    F: Fn(&ToolCallContext, &Value) -> Result<ToolOutput> + Send + Sync,
{
    fn call(&self, ctx: &ToolCallContext, args: &Value) -> Result<ToolOutput> {
        self(ctx, args)
    }
}

/// A local tool that awaits I/O.
#[async_trait]
pub trait AsyncTool: Send + Sync {
    async fn call(&self, ctx: &ToolCallContext, args: Value) -> Result<ToolOutput>;
}

/// How a tool is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    LocalSync,
    LocalAsync,
    Remote(ServerTransport),
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::LocalSync => write!(f, "local-sync"),
            ExecutionMode::LocalAsync => write!(f, "local-async"),
            ExecutionMode::Remote(transport) => write!(f, "remote-{}", transport),
        }
    }
}

/// Dispatch target of a tool.
#[derive(Clone)]
pub enum ToolHandler {
    LocalSync(Arc<dyn SyncTool>),
    LocalAsync(Arc<dyn AsyncTool>),
    Remote {
        connection: Arc<dyn RemoteConnection>,
        /// Name on the remote server.
        remote_name: String,
        timeout: Duration,
    },
}

/// How a tool touches session workflow state.
///
/// Writers are never scheduled concurrently with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowAccess {
    #[default]
    None,
    Read,
    Write,
}

/// A registered tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: InputSchema,
    pub handler: ToolHandler,
    pub workflow_access: WorkflowAccess,
    /// Shown to the user while the tool runs.
    pub progress_message: Option<String>,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("workflow_access", &self.workflow_access)
            .finish()
    }
}

impl ToolDescriptor {
    pub fn local_sync(name: &str, description: &str, schema: InputSchema, tool: impl SyncTool + 'static) -> Self {
        Self::new(name, description, schema, ToolHandler::LocalSync(Arc::new(tool)))
    }

    pub fn local_async(name: &str, description: &str, schema: InputSchema, tool: Arc<dyn AsyncTool>) -> Self {
        Self::new(name, description, schema, ToolHandler::LocalAsync(tool))
    }

    pub fn remote(
        name: &str,
        description: &str,
        schema: InputSchema,
        connection: Arc<dyn RemoteConnection>,
        timeout: Duration,
    ) -> Self {
        Self::new(
            name,
            description,
            schema,
            ToolHandler::Remote {
                connection,
                remote_name: name.to_string(),
                timeout,
            },
        )
    }

    fn new(name: &str, description: &str, schema: InputSchema, handler: ToolHandler) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            handler,
            workflow_access: WorkflowAccess::None,
            progress_message: None,
        }
    }

    pub fn with_workflow_access(mut self, access: WorkflowAccess) -> Self {
        self.workflow_access = access;
        self
    }

    pub fn with_progress(mut self, message: &str) -> Self {
        self.progress_message = Some(message.to_string());
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        match &self.handler {
            ToolHandler::LocalSync(_) => ExecutionMode::LocalSync,
            ToolHandler::LocalAsync(_) => ExecutionMode::LocalAsync,
            ToolHandler::Remote { connection, .. } => ExecutionMode::Remote(connection.transport()),
        }
    }

    /// Entry advertised to the reasoning model.
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.to_json_schema(),
        }
    }

    /// Validate `args` and run the handler.
    ///
    /// Remote calls are bounded by the handler's timeout.
    #[instrument(skip(self, ctx, args), fields(tool = %self.name, mode = %self.mode()))]
    pub async fn invoke(&self, ctx: &ToolCallContext, args: Value) -> Result<ToolOutput> {
        self.schema.validate(&self.name, &args)?;
        debug!("Invoking tool with args: {}", args);

        match &self.handler {
            ToolHandler::LocalSync(tool) => tool.call(ctx, &args),
            ToolHandler::LocalAsync(tool) => tool.call(ctx, args).await,
            ToolHandler::Remote {
                connection,
                remote_name,
                timeout,
            } => match tokio::time::timeout(*timeout, connection.invoke(remote_name, args)).await {
                Ok(result) => result,
                Err(_) => Err(ReferatError::ToolTimeout {
                    tool: self.name.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
        }
    }
}

/// Catalog entry handed to the reasoning model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// String argument, or `None` when absent or blank.
pub(crate) fn str_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Required string argument.
pub(crate) fn required_str<'a>(tool: &str, args: &'a Value, name: &str) -> Result<&'a str> {
    str_arg(args, name).ok_or_else(|| ReferatError::InvalidArguments {
        tool: tool.to_string(),
        message: format!("'{}' must be a non-empty string", name),
    })
}

/// Positive integer argument.
pub(crate) fn usize_arg(args: &Value, name: &str) -> Option<usize> {
    args.get(name)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0)
}
