//! Prompt templates for Referat.
//!
//! Prompts can be customized by placing TOML files in the custom prompts directory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Collection of all prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Prompts {
    pub agent: AgentPrompts,
    pub metadata: MetadataPrompts,
}

/// Prompts for the conversational agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPrompts {
    /// System prompt. `{{today}}` is replaced with the current date.
    pub system: String,
}

impl Default for AgentPrompts {
    fn default() -> Self {
        Self {
            system: r#"You are a meeting assistant. Today is {{today}}.

You help the user turn meeting recordings into a searchable knowledge base and answer questions about past meetings.

Workflow for new recordings:
1. Call 'request_video_upload' when the user wants to add a recording.
2. Call 'transcribe_uploaded_video' with the uploaded path.
3. Offer 'request_transcription_edit' / 'update_transcription' and 'update_speaker_names' for corrections.
4. Call 'upload_transcription' once the user is happy, or 'cancel_video_workflow' to abandon it.

Answering questions:
- Use 'search_meetings' for anything about meeting content. Pass the meeting id (meeting_xxxxxxxx) in the query when the user names one.
- Use 'list_recent_meetings' and 'get_meeting_metadata' for overviews.
- Cite meeting titles, dates and speakers when you use search results.
- If a tool reports an error, tell the user plainly and suggest an alternative."#
                .to_string(),
        }
    }
}

/// Prompts for transcript metadata extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataPrompts {
    pub system: String,
    /// `{{transcript}}` is replaced with the (truncated) transcript.
    pub user: String,
}

impl Default for MetadataPrompts {
    fn default() -> Self {
        Self {
            system: "You extract structured metadata from meeting transcripts. Respond with JSON only."
                .to_string(),
            user: r#"Read this meeting transcript and return a JSON object with:
- "title": a short descriptive title
- "summary": two or three sentences covering the main outcomes
- "meeting_date": the date in YYYY-MM-DD if it is mentioned, otherwise null
- "speaker_mapping": an object mapping speaker labels (e.g. "SPEAKER_00") to real names when the transcript reveals them

Transcript:
{{transcript}}"#
                .to_string(),
        }
    }
}

impl Prompts {
    /// Load prompts, overriding defaults with files from `custom_dir` when present.
    pub fn load(custom_dir: Option<&str>) -> crate::error::Result<Self> {
        let mut prompts = Prompts::default();

        if let Some(dir) = custom_dir {
            let custom_path = PathBuf::from(shellexpand::tilde(dir).to_string());

            let agent_path = custom_path.join("agent.toml");
            if agent_path.exists() {
                let content = std::fs::read_to_string(&agent_path)?;
                prompts.agent = toml::from_str(&content)?;
            }

            let metadata_path = custom_path.join("metadata.toml");
            if metadata_path.exists() {
                let content = std::fs::read_to_string(&metadata_path)?;
                prompts.metadata = toml::from_str(&content)?;
            }
        }

        Ok(prompts)
    }

    /// Render a prompt template with the given variables.
    pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
        let mut result = template.to_string();
        for (key, value) in vars {
            result = result.replace(&format!("{{{{{}}}}}", key), value);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prompts() {
        let prompts = Prompts::default();
        assert!(prompts.agent.system.contains("{{today}}"));
        assert!(prompts.metadata.user.contains("{{transcript}}"));
    }

    #[test]
    fn test_render_template() {
        let mut vars = HashMap::new();
        vars.insert("today".to_string(), "2024-03-05".to_string());
        let result = Prompts::render("Today is {{today}}.", &vars);
        assert_eq!(result, "Today is 2024-03-05.");
    }

    #[test]
    fn test_custom_dir_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.toml"), "system = \"custom\"\n").unwrap();
        let prompts = Prompts::load(dir.path().to_str()).unwrap();
        assert_eq!(prompts.agent.system, "custom");
        assert!(!prompts.metadata.system.is_empty());
    }
}
