//! Language-model metadata extraction.

use super::{MeetingMetadata, MetadataExtractor, SpeakerMap, NO_SUMMARY, UNTITLED_MEETING};
use crate::config::{MetadataPrompts, Prompts};
use crate::error::{ReferatError, Result};
use crate::openai::OpenAIClient;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// Extracts meeting metadata with an OpenAI chat model.
pub struct OpenAIMetadataExtractor {
    client: OpenAIClient,
    model: String,
    max_chars: usize,
    prompts: MetadataPrompts,
}

impl OpenAIMetadataExtractor {
    pub fn new(client: OpenAIClient, model: &str, max_chars: usize, prompts: MetadataPrompts) -> Self {
        Self {
            client,
            model: model.to_string(),
            max_chars,
            prompts,
        }
    }

    async fn request(&self, transcript: &str) -> Result<String> {
        let excerpt: String = transcript.chars().take(self.max_chars).collect();
        let vars = HashMap::from([("transcript".to_string(), excerpt)]);

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.0)
            .response_format(ResponseFormat::JsonObject)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(self.prompts.system.clone())
                    .build()
                    .map_err(|e| ReferatError::Metadata(e.to_string()))?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(Prompts::render(&self.prompts.user, &vars))
                    .build()
                    .map_err(|e| ReferatError::Metadata(e.to_string()))?
                    .into(),
            ])
            .build()
            .map_err(|e| ReferatError::Metadata(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ReferatError::OpenAI(format!("Metadata extraction API error: {}", e)))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ReferatError::Metadata("Empty extraction response".to_string()))
    }
}

#[async_trait]
impl MetadataExtractor for OpenAIMetadataExtractor {
    /// Never fails on a bad model reply: unparseable output degrades to defaults.
    #[instrument(skip(self, transcript), fields(chars = transcript.len()))]
    async fn extract(&self, transcript: &str) -> Result<MeetingMetadata> {
        let raw = self.request(transcript).await?;
        debug!("Metadata response: {}", raw);

        match parse_extraction_response(&raw) {
            Ok(metadata) => Ok(metadata),
            Err(e) => {
                warn!("Falling back to default metadata: {}", e);
                Ok(MeetingMetadata::default())
            }
        }
    }
}

#[derive(Deserialize)]
struct RawExtraction {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    meeting_date: Option<String>,
    #[serde(default)]
    speaker_mapping: Option<Value>,
}

/// Parse a model reply, tolerating Markdown code fences around the JSON.
pub fn parse_extraction_response(raw: &str) -> Result<MeetingMetadata> {
    let body = strip_code_fences(raw);
    let parsed: RawExtraction = serde_json::from_str(body)
        .map_err(|e| ReferatError::Metadata(format!("Invalid extraction JSON: {}", e)))?;

    let non_empty = |s: Option<String>, fallback: &str| {
        s.map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    };

    let speaker_mapping = match parsed.speaker_mapping {
        Some(Value::Object(entries)) => entries
            .into_iter()
            .filter_map(|(label, name)| match name {
                Value::String(n) if !n.trim().is_empty() => Some((label, n.trim().to_string())),
                _ => None,
            })
            .collect(),
        _ => SpeakerMap::default(),
    };

    Ok(MeetingMetadata {
        title: non_empty(parsed.title, UNTITLED_MEETING),
        summary: non_empty(parsed.summary, NO_SUMMARY),
        meeting_date: parsed
            .meeting_date
            .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok()),
        speaker_mapping,
    })
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let metadata = parse_extraction_response(
            r#"{"title":"Q3 Planning","summary":"Budget agreed.","meeting_date":"2024-03-05",
                "speaker_mapping":{"SPEAKER_00":"Alice","SPEAKER_01":""}}"#,
        )
        .unwrap();
        assert_eq!(metadata.title, "Q3 Planning");
        assert_eq!(metadata.meeting_date, NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(metadata.speaker_mapping.len(), 1);
        assert_eq!(metadata.speaker_mapping.get("SPEAKER_00"), Some("Alice"));
    }

    #[test]
    fn test_parse_fenced_json_with_gaps() {
        let metadata =
            parse_extraction_response("```json\n{\"title\": \"\", \"meeting_date\": \"soon\"}\n```").unwrap();
        assert_eq!(metadata.title, UNTITLED_MEETING);
        assert_eq!(metadata.summary, NO_SUMMARY);
        assert_eq!(metadata.meeting_date, None);
        assert!(metadata.speaker_mapping.is_empty());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_extraction_response("I could not find anything").is_err());
    }
}
