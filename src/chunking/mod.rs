//! Chunking of meeting transcripts into searchable pieces.
//!
//! Diarized transcripts are grouped by speaker turns within a size window.
//! Transcripts without speaker labels, and free text, fall back to fixed-size
//! splitting on whitespace.

mod speaker;
mod text;

pub use speaker::SpeakerChunker;
pub use text::split_text;

use crate::config::ChunkingSettings;
use crate::transcription::SpeakerSegment;
use serde::{Deserialize, Serialize};

/// Chunk size bounds in characters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub min_chars: usize,
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::from(&ChunkingSettings::default())
    }
}

impl From<&ChunkingSettings> for ChunkingConfig {
    fn from(settings: &ChunkingSettings) -> Self {
        Self {
            min_chars: settings.min_chunk_chars,
            max_chars: settings.max_chunk_chars.max(1),
            overlap_chars: settings.overlap_chars,
        }
    }
}

/// How a chunk was formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// Every segment in the chunk has the same speaker.
    ConversationTurn,
    /// The chunk spans a speaker change.
    MixedSpeakers,
    /// Fixed-size split of text without speaker information.
    FullTranscriptChunk,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::ConversationTurn => "conversation_turn",
            ChunkType::MixedSpeakers => "mixed_speakers",
            ChunkType::FullTranscriptChunk => "full_transcript_chunk",
        }
    }
}

/// A chunk of transcript ready to embed.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptChunk {
    pub text: String,
    /// Speakers in order of first appearance.
    pub speakers: Vec<String>,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    pub segment_count: usize,
    pub chunk_type: ChunkType,
}

impl TranscriptChunk {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Chunk a transcript, choosing speaker grouping when labels exist.
pub fn chunk_segments(segments: &[SpeakerSegment], config: &ChunkingConfig) -> Vec<TranscriptChunk> {
    if segments.iter().any(|s| s.speaker.is_some()) {
        return SpeakerChunker::new(*config).chunk(segments);
    }

    let joined = segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let duration = segments.iter().map(|s| s.end).fold(0.0, f64::max);
    chunk_plain_text(&joined, duration, config)
}

/// Fixed-size chunks of free text, all spanning `[0, duration]`.
pub fn chunk_plain_text(text: &str, duration: f64, config: &ChunkingConfig) -> Vec<TranscriptChunk> {
    split_text(text, config.max_chars, config.overlap_chars)
        .into_iter()
        .map(|piece| TranscriptChunk {
            text: piece,
            speakers: Vec::new(),
            start: 0.0,
            end: duration,
            segment_count: 0,
            chunk_type: ChunkType::FullTranscriptChunk,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlabelled_segments_fall_back_to_text() {
        let segments = vec![
            SpeakerSegment { speaker: None, start: 0.0, end: 3.0, text: "first part".into() },
            SpeakerSegment { speaker: None, start: 3.0, end: 7.0, text: "second part".into() },
        ];
        let chunks = chunk_segments(&segments, &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "first part second part");
        assert_eq!(chunks[0].chunk_type, ChunkType::FullTranscriptChunk);
        assert_eq!(chunks[0].end, 7.0);
    }

    #[test]
    fn test_chunk_type_names() {
        assert_eq!(ChunkType::MixedSpeakers.as_str(), "mixed_speakers");
        assert_eq!(
            serde_json::to_string(&ChunkType::ConversationTurn).unwrap(),
            "\"conversation_turn\""
        );
    }
}
