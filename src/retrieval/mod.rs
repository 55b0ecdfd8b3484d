//! Retrieval planning: turning a question into a scoped vector search.

mod planner;

pub use planner::RetrievalPlanner;

use crate::vector_store::Filter;
use chrono::{NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Metadata field holding a meeting's identifier (bare hex form).
pub const MEETING_ID_FIELD: &str = "meeting_id";
/// Metadata field with the meeting date as unix seconds (midnight UTC).
pub const MEETING_TIMESTAMP_FIELD: &str = "meeting_timestamp";
/// Metadata field with the speakers in a chunk.
pub const SPEAKERS_FIELD: &str = "speakers";
/// Metadata field with a chunk's start offset in seconds.
pub const START_TIME_FIELD: &str = "start_time";

/// Unix seconds at midnight UTC of `date`.
pub fn date_to_timestamp(date: NaiveDate) -> f64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp() as f64)
        .unwrap_or_default()
}

/// Identifier of an indexed meeting: eight lowercase hex digits.
///
/// Displayed as `meeting_<hex>`; stored in metadata as the bare hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeetingId(String);

impl MeetingId {
    /// A fresh random identifier.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(hex[..8].to_string())
    }

    /// Accepts `meeting_ab12cd34`, `doc_ab12cd34` or `ab12cd34`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let hex = trimmed
            .strip_prefix("meeting_")
            .or_else(|| trimmed.strip_prefix("doc_"))
            .unwrap_or(trimmed)
            .to_ascii_lowercase();
        (hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(Self(hex))
    }

    /// The bare hex token, as stored in metadata.
    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "meeting_{}", self.0)
    }
}

/// Meeting id as it appears in free text; the hex digits are captured.
pub const MEETING_ID_PATTERN: &str = r"(?i)\bmeeting_([0-9a-f]{8})\b";

static MEETING_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(MEETING_ID_PATTERN).expect("Invalid regex"));

/// The last meeting id mentioned in `text`.
pub fn last_mentioned_meeting(text: &str) -> Option<MeetingId> {
    MEETING_ID_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| MeetingId::parse(&caps[1]))
}

/// Context from the conversation that can sharpen a plan.
#[derive(Debug, Clone, Default)]
pub struct ConversationHints {
    /// Anchor for relative dates ("yesterday"). Relative phrases are ignored without it.
    pub today: Option<NaiveDate>,
    /// Names the user may refer to; mentioning one scopes by speaker.
    pub known_speakers: Vec<String>,
    /// Meeting that "this meeting" refers to.
    pub active_meeting: Option<MeetingId>,
}

/// Result-count budget plus filter for one vector query.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalPlan {
    pub top_k: usize,
    pub filter: Filter,
    /// The query asked for whole-meeting coverage.
    pub comprehensive: bool,
}

impl RetrievalPlan {
    /// Unscoped plan with the given budget.
    pub fn unscoped(top_k: usize) -> Self {
        Self {
            top_k,
            filter: Filter::new(),
            comprehensive: false,
        }
    }

    /// Meeting the plan is scoped to, if any.
    pub fn meeting_id(&self) -> Option<MeetingId> {
        match self.filter.condition_on(MEETING_ID_FIELD) {
            Some(crate::vector_store::Condition::Eq(value)) => value.as_str().and_then(MeetingId::parse),
            _ => None,
        }
    }
}
