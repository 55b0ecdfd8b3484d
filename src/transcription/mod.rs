//! Transcription for Referat.
//!
//! Speech-to-text and diarization are delegated to an external collaborator
//! that returns speaker-labelled, timestamped segments.

mod command;
mod models;

pub use command::CommandTranscriber;
pub use models::{format_timestamp, format_transcript, parse_transcript, DiarizedTranscript, SpeakerSegment};

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Trait for diarizing transcription services.
///
/// A call is long-running and cannot be cancelled once started.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a media file into speaker-labelled segments.
    async fn transcribe(&self, media_path: &Path) -> Result<DiarizedTranscript>;

    /// Model name recorded alongside stored chunks.
    fn model_name(&self) -> &str;
}
