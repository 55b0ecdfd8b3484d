//! The reasoning model collaborator.

use super::message::{ChatMessage, RequestedCall, Role};
use crate::config::ModelSettings;
use crate::error::{ReferatError, Result};
use crate::openai::{create_client_with_timeout, OpenAIClient};
use crate::tools::ToolSpec;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs, ChatCompletionTool,
    ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionCall, FunctionObject,
};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

/// What one reasoning step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Answer(String),
    ToolCalls(Vec<RequestedCall>),
}

/// Decides, given the conversation so far and the tool catalog, what to do next.
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ModelReply>;
}

/// Chat-completions model with function calling.
pub struct OpenAIReasoningModel {
    client: OpenAIClient,
    model: String,
    temperature: f32,
}

impl OpenAIReasoningModel {
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        let client = create_client_with_timeout(Duration::from_secs(settings.request_timeout_secs))?;
        Ok(Self::with_client(client, &settings.name, settings.temperature))
    }

    pub fn with_client(client: OpenAIClient, model: &str, temperature: f32) -> Self {
        Self {
            client,
            model: model.to_string(),
            temperature,
        }
    }
}

fn build_error(e: impl std::fmt::Display) -> ReferatError {
    ReferatError::Model(e.to_string())
}

fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
    let converted = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(message.content.clone())
            .build()
            .map_err(build_error)?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(message.content.clone())
            .build()
            .map_err(build_error)?
            .into(),
        Role::Assistant if !message.tool_calls.is_empty() => {
            let calls: Vec<ChatCompletionMessageToolCall> = message
                .tool_calls
                .iter()
                .map(|call| ChatCompletionMessageToolCall {
                    id: call.id.clone(),
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect();
            ChatCompletionRequestAssistantMessageArgs::default()
                .tool_calls(calls)
                .build()
                .map_err(build_error)?
                .into()
        }
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(message.content.clone())
            .build()
            .map_err(build_error)?
            .into(),
        Role::Tool => ChatCompletionRequestToolMessageArgs::default()
            .tool_call_id(message.tool_call_id.clone().unwrap_or_default())
            .content(message.content.clone())
            .build()
            .map_err(build_error)?
            .into(),
    };
    Ok(converted)
}

/// Function-tool entries for the catalog.
pub fn tool_definitions(tools: &[ToolSpec]) -> Vec<ChatCompletionTool> {
    tools
        .iter()
        .map(|tool| ChatCompletionTool {
            r#type: ChatCompletionToolType::Function,
            function: FunctionObject {
                name: tool.name.clone(),
                description: Some(tool.description.clone()),
                parameters: Some(tool.parameters.clone()),
                strict: None,
            },
        })
        .collect()
}

/// Arguments arrive as a JSON string. Unparseable text is passed on as a
/// string so schema validation reports it to the model.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[async_trait]
impl ReasoningModel for OpenAIReasoningModel {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ModelReply> {
        let request_messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .temperature(self.temperature)
            .messages(request_messages);
        if !tools.is_empty() {
            builder.tools(tool_definitions(tools));
        }
        let request = builder.build().map_err(build_error)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ReferatError::OpenAI(format!("Chat API error: {}", e)))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ReferatError::Model("No response from model".to_string()))?;

        match choice.message.tool_calls {
            Some(calls) if !calls.is_empty() => {
                debug!("Model requested {} tool call(s)", calls.len());
                Ok(ModelReply::ToolCalls(
                    calls
                        .into_iter()
                        .map(|call| RequestedCall {
                            id: call.id,
                            arguments: parse_arguments(&call.function.arguments),
                            name: call.function.name,
                        })
                        .collect(),
                ))
            }
            _ => Ok(ModelReply::Answer(choice.message.content.unwrap_or_default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(r#"{"query": "budget"}"#), json!({"query": "budget"}));
        assert_eq!(parse_arguments("  "), Value::Null);
        assert_eq!(parse_arguments("{oops"), json!("{oops"));
    }

    #[test]
    fn test_tool_definitions_carry_schema() {
        let specs = vec![ToolSpec {
            name: "get_time".into(),
            description: "Current time".into(),
            parameters: json!({"type": "object", "properties": {"zone": {"type": "string"}}}),
        }];
        let defs = tool_definitions(&specs);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, "get_time");
        assert_eq!(
            defs[0].function.parameters.as_ref().unwrap()["properties"]["zone"]["type"],
            "string"
        );
    }

    #[test]
    fn test_message_conversion() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::tool_request(vec![RequestedCall {
                id: "c1".into(),
                name: "get_time".into(),
                arguments: json!({}),
            }]),
            ChatMessage::tool_result("c1", "12:00"),
            ChatMessage::assistant("It is noon."),
        ];
        let converted: Vec<ChatCompletionRequestMessage> =
            messages.iter().map(to_request_message).collect::<Result<_>>().unwrap();
        assert!(matches!(converted[2], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(converted[3], ChatCompletionRequestMessage::Tool(_)));
    }
}
