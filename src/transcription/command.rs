//! Transcriber backed by an external diarization command.
//!
//! The command receives the media path as its last argument and must print a
//! JSON document shaped like [`DiarizedTranscript`] on stdout.

use super::{DiarizedTranscript, Transcriber};
use crate::config::TranscriptionSettings;
use crate::error::{ReferatError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, instrument};

/// Runs a diarizing transcriber as a subprocess.
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
    model: String,
}

impl CommandTranscriber {
    pub fn new(program: &str, args: Vec<String>, model: &str) -> Self {
        Self {
            program: program.to_string(),
            args,
            model: model.to_string(),
        }
    }

    pub fn from_settings(settings: &TranscriptionSettings) -> Self {
        Self::new(&settings.command, settings.args.clone(), &settings.model)
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    #[instrument(skip(self), fields(program = %self.program))]
    async fn transcribe(&self, media_path: &Path) -> Result<DiarizedTranscript> {
        if !media_path.exists() {
            return Err(ReferatError::Transcription(format!(
                "File not found: {}",
                media_path.display()
            )));
        }

        info!("Transcribing {:?}", media_path);

        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(media_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match result {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReferatError::ExecutableNotFound(self.program.clone()));
            }
            Err(e) => {
                return Err(ReferatError::Transcription(format!(
                    "{} execution failed: {}",
                    self.program, e
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReferatError::Transcription(format!(
                "{} failed: {}",
                self.program,
                stderr.trim()
            )));
        }

        let transcript: DiarizedTranscript = serde_json::from_slice(&output.stdout).map_err(|e| {
            ReferatError::Transcription(format!("Unreadable transcriber output: {}", e))
        })?;

        if transcript.segments.is_empty() {
            return Err(ReferatError::Transcription(
                "Transcriber returned no speech segments".to_string(),
            ));
        }

        info!(
            "Transcribed {} segments, {} speakers",
            transcript.segments.len(),
            transcript.speakers().len()
        );
        Ok(transcript)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
