//! Meeting metadata: extracted fields, speaker maps, and the extraction collaborator.

mod extractor;

pub use extractor::{parse_extraction_response, OpenAIMetadataExtractor};

use crate::error::{ReferatError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UNTITLED_MEETING: &str = "Untitled Meeting";
pub const NO_SUMMARY: &str = "No summary available.";

/// Mapping from diarization label to a real name.
///
/// Stored in vector metadata as a single JSON string because metadata values
/// must be primitives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeakerMap(BTreeMap<String, String>);

impl SpeakerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: &str, name: &str) {
        self.0.insert(label.to_string(), name.to_string());
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(String::as_str)
    }

    /// Merge `other` on top of this map.
    pub fn merge(&mut self, other: &SpeakerMap) {
        for (label, name) in &other.0 {
            self.0.insert(label.clone(), name.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Name for a label, falling back to the label itself.
    pub fn resolve<'a>(&'a self, label: &'a str) -> &'a str {
        self.get(label).unwrap_or(label)
    }

    /// Serialize to the metadata string form (`"{}"` when empty).
    pub fn to_metadata_string(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the metadata string form.
    pub fn from_metadata_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| ReferatError::Metadata(format!("Invalid speaker mapping: {}", e)))
    }

    /// Replace every mapped label in `text` with its name.
    ///
    /// Longer labels are replaced first so `SPEAKER_1` never clobbers `SPEAKER_10`.
    pub fn apply(&self, text: &str) -> String {
        let mut labels: Vec<(&String, &String)> = self.0.iter().collect();
        labels.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut result = text.to_string();
        for (label, name) in labels {
            if !label.is_empty() {
                result = result.replace(label.as_str(), name);
            }
        }
        result
    }
}

impl FromIterator<(String, String)> for SpeakerMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Structured fields describing one meeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingMetadata {
    pub title: String,
    pub summary: String,
    pub meeting_date: Option<NaiveDate>,
    pub speaker_mapping: SpeakerMap,
}

impl Default for MeetingMetadata {
    fn default() -> Self {
        Self {
            title: UNTITLED_MEETING.to_string(),
            summary: NO_SUMMARY.to_string(),
            meeting_date: None,
            speaker_mapping: SpeakerMap::default(),
        }
    }
}

/// Extracts [`MeetingMetadata`] from raw transcript text.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract(&self, transcript: &str) -> Result<MeetingMetadata>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_map_round_trip() {
        let mut map = SpeakerMap::new();
        map.insert("SPEAKER_00", "Alice");
        map.insert("SPEAKER_01", "Bob \"the builder\"");
        let raw = map.to_metadata_string();
        assert_eq!(SpeakerMap::from_metadata_str(&raw).unwrap(), map);
    }

    #[test]
    fn test_empty_speaker_map_round_trip() {
        let map = SpeakerMap::new();
        let raw = map.to_metadata_string();
        assert_eq!(raw, "{}");
        assert_eq!(SpeakerMap::from_metadata_str(&raw).unwrap(), map);
    }

    #[test]
    fn test_invalid_speaker_map_string() {
        assert!(SpeakerMap::from_metadata_str("[1,2]").is_err());
    }

    #[test]
    fn test_apply_prefers_longer_labels() {
        let map: SpeakerMap = [
            ("SPEAKER_1".to_string(), "Ann".to_string()),
            ("SPEAKER_10".to_string(), "Ben".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(map.apply("SPEAKER_10: hi SPEAKER_1"), "Ben: hi Ann");
        assert_eq!(map.resolve("SPEAKER_2"), "SPEAKER_2");
    }
}
