//! Speaker-aware grouping of diarized segments.

use super::text::overlap_tail;
use super::{ChunkType, ChunkingConfig, TranscriptChunk};
use crate::transcription::SpeakerSegment;

/// Groups consecutive segments into chunks, preferring to cut at speaker changes.
///
/// A chunk is closed once it holds at least `min_chars` and either the next
/// segment would push it past `max_chars` or the next segment has a different
/// speaker. Each chunk after the first opens with the tail of its predecessor.
pub struct SpeakerChunker {
    config: ChunkingConfig,
}

#[derive(Default)]
struct Pending {
    lines: Vec<String>,
    len: usize,
    speakers: Vec<String>,
    segment_count: usize,
    start: Option<f64>,
    end: f64,
    last_speaker: Option<String>,
}

impl Pending {
    fn opened_with(prefix: &str) -> Self {
        let mut pending = Pending::default();
        if !prefix.is_empty() {
            pending.len = prefix.chars().count();
            pending.lines.push(prefix.to_string());
        }
        pending
    }

    fn push(&mut self, segment: &SpeakerSegment, line: String) {
        // +1 for the joining newline
        self.len += line.chars().count() + usize::from(!self.lines.is_empty());
        self.lines.push(line);
        if let Some(speaker) = &segment.speaker {
            if !self.speakers.contains(speaker) {
                self.speakers.push(speaker.clone());
            }
        }
        self.segment_count += 1;
        self.start.get_or_insert(segment.start);
        self.end = self.end.max(segment.end);
        self.last_speaker = segment.speaker.clone();
    }

    fn finish(self) -> TranscriptChunk {
        let chunk_type = if self.speakers.len() > 1 {
            ChunkType::MixedSpeakers
        } else {
            ChunkType::ConversationTurn
        };
        TranscriptChunk {
            text: self.lines.join("\n"),
            speakers: self.speakers,
            start: self.start.unwrap_or(0.0),
            end: self.end,
            segment_count: self.segment_count,
            chunk_type,
        }
    }
}

impl SpeakerChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, segments: &[SpeakerSegment]) -> Vec<TranscriptChunk> {
        let mut chunks: Vec<TranscriptChunk> = Vec::new();
        let mut pending = Pending::default();

        for segment in segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            let speaker = segment.speaker.as_deref().unwrap_or("UNKNOWN");
            let line = format!("{}: {}", speaker, text);

            if pending.segment_count > 0 && pending.len >= self.config.min_chars {
                let would_overflow = pending.len + line.chars().count() + 1 > self.config.max_chars;
                let speaker_changed = pending.last_speaker != segment.speaker;
                if would_overflow || speaker_changed {
                    let done = std::mem::take(&mut pending).finish();
                    let prefix = overlap_tail(&done.text, self.config.overlap_chars).to_string();
                    chunks.push(done);
                    pending = Pending::opened_with(&prefix);
                }
            }

            pending.push(segment, line);
        }

        if pending.segment_count > 0 {
            chunks.push(pending.finish());
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(speaker: &str, start: f64, text: &str) -> SpeakerSegment {
        SpeakerSegment {
            speaker: Some(speaker.to_string()),
            start,
            end: start + 5.0,
            text: text.to_string(),
        }
    }

    fn config(min: usize, max: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            min_chars: min,
            max_chars: max,
            overlap_chars: overlap,
        }
    }

    #[test]
    fn test_small_segments_merge_until_min() {
        let segments = vec![
            seg("SPEAKER_00", 0.0, "hi"),
            seg("SPEAKER_01", 5.0, "hello"),
            seg("SPEAKER_00", 10.0, "ok"),
        ];
        let chunks = SpeakerChunker::new(config(1000, 2000, 0)).chunk(&segments);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::MixedSpeakers);
        assert_eq!(chunks[0].speakers, vec!["SPEAKER_00", "SPEAKER_01"]);
        assert_eq!(chunks[0].segment_count, 3);
        assert_eq!(chunks[0].start, 0.0);
        assert_eq!(chunks[0].end, 15.0);
    }

    #[test]
    fn test_speaker_change_closes_chunk_past_min() {
        let long = "word ".repeat(10);
        let segments = vec![
            seg("SPEAKER_00", 0.0, &long),
            seg("SPEAKER_00", 5.0, &long),
            seg("SPEAKER_01", 10.0, &long),
        ];
        let chunks = SpeakerChunker::new(config(40, 1000, 0)).chunk(&segments);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_type, ChunkType::ConversationTurn);
        assert_eq!(chunks[0].speakers, vec!["SPEAKER_00"]);
        assert_eq!(chunks[1].speakers, vec!["SPEAKER_01"]);
        assert_eq!(chunks[1].start, 10.0);
    }

    #[test]
    fn test_overflow_closes_chunk_and_carries_overlap() {
        let text = "alpha beta gamma delta epsilon";
        let segments: Vec<_> = (0..6).map(|i| seg("SPEAKER_00", i as f64 * 5.0, text)).collect();
        let chunks = SpeakerChunker::new(config(50, 100, 12)).chunk(&segments);
        assert!(chunks.len() > 1);
        assert!(chunks[1].text.starts_with("epsilon"));
        let total_segments: usize = chunks.iter().map(|c| c.segment_count).sum();
        assert_eq!(total_segments, 6);
    }

    #[test]
    fn test_empty_segments_are_skipped() {
        let segments = vec![seg("SPEAKER_00", 0.0, "   ")];
        assert!(SpeakerChunker::new(config(1, 10, 0)).chunk(&segments).is_empty());
    }
}
