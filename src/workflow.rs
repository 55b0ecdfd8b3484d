//! Per-session scratch state for the multi-turn video workflow.
//!
//! Upload, transcription, edits and the final commit happen across separate
//! turns. Tools keep intermediate results here, keyed by session id so
//! concurrent sessions never see each other's uploads.

use crate::error::{ReferatError, Result};
use crate::metadata::{MeetingMetadata, SpeakerMap};
use crate::transcription::SpeakerSegment;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Everything a session has accumulated for the video it is processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowState {
    pub uploaded_asset: Option<PathBuf>,
    /// Display transcript, possibly edited by the user.
    pub transcript_text: Option<String>,
    pub segments: Vec<SpeakerSegment>,
    pub language: Option<String>,
    pub duration: Option<f64>,
    pub metadata: Option<MeetingMetadata>,
    /// Label to name overrides supplied by the user.
    pub speaker_names: SpeakerMap,
    pub timing_info: Option<String>,
    pub show_upload: bool,
    pub show_editor: bool,
    pub transcription_in_progress: bool,
}

impl WorkflowState {
    /// True when every field holds its initial value.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn has_transcript(&self) -> bool {
        self.transcript_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    /// Speaker names from extraction with user overrides applied on top.
    pub fn effective_speaker_map(&self) -> SpeakerMap {
        let mut map = self
            .metadata
            .as_ref()
            .map(|m| m.speaker_mapping.clone())
            .unwrap_or_default();
        map.merge(&self.speaker_names);
        map
    }
}

/// Handle on one session's state.
///
/// Each method takes the lock briefly; nothing holds it across an await.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    session_id: String,
    state: Arc<Mutex<WorkflowState>>,
}

impl WorkflowHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, WorkflowState>> {
        self.state
            .lock()
            .map_err(|_| ReferatError::Workflow("Workflow state is unavailable; please start over.".to_string()))
    }

    /// Record a new upload; earlier results are discarded.
    pub fn set_uploaded_asset(&self, path: PathBuf) -> Result<()> {
        let mut state = self.lock()?;
        *state = WorkflowState {
            uploaded_asset: Some(path),
            ..WorkflowState::default()
        };
        Ok(())
    }

    /// Store a fresh transcript. Previously extracted metadata no longer applies.
    pub fn set_transcript(
        &self,
        text: String,
        segments: Vec<SpeakerSegment>,
        language: Option<String>,
        duration: Option<f64>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        state.transcript_text = Some(text);
        state.segments = segments;
        state.language = language;
        state.duration = duration;
        state.metadata = None;
        state.transcription_in_progress = false;
        state.show_upload = false;
        Ok(())
    }

    pub fn set_extracted_metadata(&self, metadata: MeetingMetadata) -> Result<()> {
        self.lock()?.metadata = Some(metadata);
        Ok(())
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Result<WorkflowState> {
        Ok(self.lock()?.clone())
    }

    /// Restore every field to its initial value.
    pub fn reset(&self) -> Result<()> {
        *self.lock()? = WorkflowState::default();
        debug!("Reset workflow state for session {}", self.session_id);
        Ok(())
    }

    /// Apply `f` under the lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut WorkflowState) -> T) -> Result<T> {
        Ok(f(&mut *self.lock()?))
    }
}

/// All sessions' workflow state.
#[derive(Debug, Clone, Default)]
pub struct WorkflowStore {
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<WorkflowState>>>>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `session_id`, created empty on first use.
    pub fn handle(&self, session_id: &str) -> Result<WorkflowHandle> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| ReferatError::Workflow("Workflow store is unavailable.".to_string()))?;
        let state = sessions.entry(session_id.to_string()).or_default().clone();
        Ok(WorkflowHandle {
            session_id: session_id.to_string(),
            state,
        })
    }

    /// Drop a session's state entirely.
    pub fn remove(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(session_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(speaker: &str, text: &str) -> SpeakerSegment {
        SpeakerSegment {
            speaker: Some(speaker.to_string()),
            start: 0.0,
            end: 4.0,
            text: text.to_string(),
        }
    }

    fn populated(handle: &WorkflowHandle) {
        handle.set_uploaded_asset(PathBuf::from("/tmp/standup.mp4")).unwrap();
        handle
            .set_transcript(
                "[00:00 - 00:04] SPEAKER_00: hello".into(),
                vec![segment("SPEAKER_00", "hello")],
                Some("en".into()),
                Some(4.0),
            )
            .unwrap();
        handle.set_extracted_metadata(MeetingMetadata::default()).unwrap();
        handle
            .update(|s| {
                s.speaker_names.insert("SPEAKER_00", "Alice");
                s.show_editor = true;
                s.timing_info = Some("took 3s".into());
            })
            .unwrap();
    }

    #[test]
    fn test_reset_clears_every_field_and_is_idempotent() {
        let store = WorkflowStore::new();
        let handle = store.handle("s1").unwrap();
        populated(&handle);
        assert!(!handle.snapshot().unwrap().is_empty());

        handle.reset().unwrap();
        let once = handle.snapshot().unwrap();
        handle.reset().unwrap();
        let twice = handle.snapshot().unwrap();

        assert!(once.is_empty());
        assert_eq!(once, twice);
        assert_eq!(twice, WorkflowState::default());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = WorkflowStore::new();
        let alice = store.handle("alice").unwrap();
        let bob = store.handle("bob").unwrap();
        populated(&alice);

        assert!(bob.snapshot().unwrap().is_empty());
        assert!(store.handle("alice").unwrap().snapshot().unwrap().has_transcript());
        assert_eq!(store.session_count(), 2);
    }

    #[test]
    fn test_new_transcript_invalidates_metadata() {
        let handle = WorkflowStore::new().handle("s").unwrap();
        populated(&handle);
        handle
            .set_transcript("edited".into(), Vec::new(), None, None)
            .unwrap();
        let state = handle.snapshot().unwrap();
        assert!(state.metadata.is_none());
        assert_eq!(state.speaker_names.get("SPEAKER_00"), Some("Alice"));
    }

    #[test]
    fn test_user_names_override_extracted_ones() {
        let handle = WorkflowStore::new().handle("s").unwrap();
        let mut extracted = MeetingMetadata::default();
        extracted.speaker_mapping.insert("SPEAKER_00", "Al");
        extracted.speaker_mapping.insert("SPEAKER_01", "Bob");
        handle.set_extracted_metadata(extracted).unwrap();
        handle.update(|s| s.speaker_names.insert("SPEAKER_00", "Alice")).unwrap();

        let map = handle.snapshot().unwrap().effective_speaker_map();
        assert_eq!(map.get("SPEAKER_00"), Some("Alice"));
        assert_eq!(map.get("SPEAKER_01"), Some("Bob"));
    }
}
