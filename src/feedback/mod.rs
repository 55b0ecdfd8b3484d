//! User feedback on completed turns, forwarded to an observability backend.
//!
//! Each completed turn gets a deterministic correlation token. Feedback that
//! arrives later is keyed by turn index, resolved to its token and handed to
//! an [`ObservabilitySink`]. When the backend does not know the token, the
//! sink is asked to find the run by session and turn instead.

mod correlator;
mod sinks;

pub use correlator::{turn_token, FeedbackCorrelator};
pub use sinks::{HttpFeedbackSink, TracingSink};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Thumbs up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Positive,
    Negative,
}

impl Rating {
    /// Normalized score sent to the backend.
    pub fn score(&self) -> f64 {
        match self {
            Rating::Positive => 1.0,
            Rating::Negative => 0.0,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "up" | "positive" | "good" | "yes" | "+1" | "1" => Some(Rating::Positive),
            "down" | "negative" | "bad" | "no" | "-1" | "0" => Some(Rating::Negative),
            _ => None,
        }
    }
}

/// A satisfaction signal with an optional comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSignal {
    pub rating: Rating,
    #[serde(default)]
    pub comment: Option<String>,
}

impl FeedbackSignal {
    pub fn new(rating: Rating, comment: Option<String>) -> Self {
        Self {
            rating,
            comment: comment.filter(|c| !c.trim().is_empty()),
        }
    }
}

/// Metadata used to look a run up when its token is unknown to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunCorrelation {
    pub session_id: String,
    pub turn_index: usize,
    pub token: String,
    pub project: String,
}

/// How feedback reached the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackDelivery {
    /// The token was a known run id.
    Direct { run_id: String },
    /// Found by correlating session and turn.
    Correlated { run_id: String },
    /// No run found; submitted under the synthetic token.
    BestEffort { token: String },
}

/// The observability collaborator.
#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    /// Whether `token` is a run id the backend knows.
    async fn has_run(&self, token: &str) -> Result<bool>;

    /// Search for a run matching the correlation metadata.
    async fn find_run(&self, correlation: &RunCorrelation) -> Result<Option<String>>;

    async fn submit(&self, run_id: &str, feedback: &FeedbackSignal) -> Result<()>;
}
