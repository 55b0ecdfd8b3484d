//! Data models for diarized transcripts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One stretch of speech attributed to a single speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerSegment {
    /// Diarization label (e.g. `SPEAKER_00`) or a mapped name.
    #[serde(default)]
    pub speaker: Option<String>,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    pub text: String,
}

/// Output of the transcription collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiarizedTranscript {
    pub segments: Vec<SpeakerSegment>,
    #[serde(default)]
    pub language: Option<String>,
}

impl DiarizedTranscript {
    /// Total duration in seconds.
    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|s| s.end).fold(0.0, f64::max)
    }

    /// Distinct speakers, sorted.
    pub fn speakers(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|s| s.speaker.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether diarization produced any speaker labels.
    pub fn has_speakers(&self) -> bool {
        self.segments.iter().any(|s| s.speaker.is_some())
    }
}

/// Format seconds as `MM:SS`, or `HH:MM:SS` past an hour.
pub fn format_timestamp(seconds: f64) -> String {
    let total_seconds = seconds.max(0.0) as u32;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

fn parse_timestamp(raw: &str) -> Option<f64> {
    let parts: Vec<u32> = raw.split(':').map(|p| p.parse().ok()).collect::<Option<_>>()?;
    match parts.as_slice() {
        [m, s] => Some(f64::from(m * 60 + s)),
        [h, m, s] => Some(f64::from(h * 3600 + m * 60 + s)),
        _ => None,
    }
}

/// Render segments as editable lines: `[MM:SS - MM:SS] SPEAKER: text`.
pub fn format_transcript(segments: &[SpeakerSegment]) -> String {
    segments
        .iter()
        .map(|s| {
            let speaker = s.speaker.as_deref().unwrap_or("UNKNOWN");
            format!(
                "[{} - {}] {}: {}",
                format_timestamp(s.start),
                format_timestamp(s.end),
                speaker,
                s.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse text produced by [`format_transcript`], possibly after user edits.
///
/// Returns `None` when any non-empty line does not follow the format, in which
/// case callers treat the text as plain prose.
pub fn parse_transcript(text: &str) -> Option<Vec<SpeakerSegment>> {
    let line_regex = Regex::new(r"^\[(\d{1,2}(?::\d{2}){1,2}) - (\d{1,2}(?::\d{2}){1,2})\] ([^:]+): (.*)$")
        .expect("Invalid regex");

    let mut segments = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let caps = line_regex.captures(line)?;
        let speaker = caps[3].trim().to_string();
        segments.push(SpeakerSegment {
            speaker: (speaker != "UNKNOWN").then_some(speaker),
            start: parse_timestamp(&caps[1])?,
            end: parse_timestamp(&caps[2])?,
            text: caps[4].trim().to_string(),
        });
    }

    (!segments.is_empty()).then_some(segments)
}
