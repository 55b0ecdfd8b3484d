//! Turn index to correlation token bookkeeping for one session.

use super::{FeedbackDelivery, FeedbackSignal, ObservabilitySink, RunCorrelation};
use crate::error::{ReferatError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

/// Token for turn `turn_index` of `session_id`, e.g. `abc-turn-0003`.
pub fn turn_token(session_id: &str, turn_index: usize) -> String {
    format!("{}-turn-{:04}", session_id, turn_index)
}

/// Links completed turns of one session to feedback.
pub struct FeedbackCorrelator {
    session_id: String,
    project: String,
    sink: Arc<dyn ObservabilitySink>,
    tokens: Mutex<BTreeMap<usize, String>>,
}

impl FeedbackCorrelator {
    pub fn new(session_id: &str, project: &str, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            session_id: session_id.to_string(),
            project: project.to_string(),
            sink,
            tokens: Mutex::new(BTreeMap::new()),
        }
    }

    fn tokens(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<usize, String>>> {
        self.tokens
            .lock()
            .map_err(|_| ReferatError::Feedback("correlation table is unavailable".to_string()))
    }

    /// Store and return the token for a completed turn.
    pub fn record_turn(&self, turn_index: usize) -> Result<String> {
        let token = turn_token(&self.session_id, turn_index);
        self.tokens()?.insert(turn_index, token.clone());
        debug!("Recorded turn {} as {}", turn_index, token);
        Ok(token)
    }

    pub fn resolve(&self, turn_index: usize) -> Result<String> {
        self.tokens()?.get(&turn_index).cloned().ok_or_else(|| {
            ReferatError::NotFound(format!(
                "turn {} of session '{}' has no recorded answer",
                turn_index, self.session_id
            ))
        })
    }

    /// Number of recorded turns.
    pub fn len(&self) -> usize {
        self.tokens().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `turn_index` and forward the signal.
    pub async fn feedback_for_turn(&self, turn_index: usize, signal: &FeedbackSignal) -> Result<FeedbackDelivery> {
        let token = self.resolve(turn_index)?;
        self.attach_feedback(turn_index, &token, signal).await
    }

    /// Forward the signal for `token`.
    ///
    /// Tries the token as a run id first, then a lookup by session and turn.
    /// When neither finds a run the signal is still submitted under the token.
    #[instrument(skip(self, signal), fields(session = %self.session_id))]
    pub async fn attach_feedback(
        &self,
        turn_index: usize,
        token: &str,
        signal: &FeedbackSignal,
    ) -> Result<FeedbackDelivery> {
        let known = self.sink.has_run(token).await.unwrap_or_else(|e| {
            warn!("Run lookup for {} failed: {}", token, e);
            false
        });
        if known {
            self.sink.submit(token, signal).await?;
            info!("Feedback attached to run {}", token);
            return Ok(FeedbackDelivery::Direct {
                run_id: token.to_string(),
            });
        }

        let correlation = RunCorrelation {
            session_id: self.session_id.clone(),
            turn_index,
            token: token.to_string(),
            project: self.project.clone(),
        };
        let found = self.sink.find_run(&correlation).await.unwrap_or_else(|e| {
            warn!("Run search for {} failed: {}", token, e);
            None
        });
        if let Some(run_id) = found {
            self.sink.submit(&run_id, signal).await?;
            info!("Feedback for {} attached to correlated run {}", token, run_id);
            return Ok(FeedbackDelivery::Correlated { run_id });
        }

        self.sink.submit(token, signal).await?;
        info!("Feedback for {} submitted without a matching run", token);
        Ok(FeedbackDelivery::BestEffort {
            token: token.to_string(),
        })
    }
}
