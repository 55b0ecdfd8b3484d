//! A conversation: history, one turn at a time, and feedback bookkeeping.

use super::message::{Exchange, Role};
use super::runner::{
    CancelFlag, RecordedTurn, TurnFragment, TurnOutcome, TurnRequest, TurnRunner, TurnStatus, TurnStream,
};
use crate::error::Result;
use crate::feedback::{FeedbackCorrelator, FeedbackDelivery, FeedbackSignal};
use crate::retrieval::{last_mentioned_meeting, ConversationHints, MeetingId};
use chrono::Local;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

struct SessionInner {
    id: String,
    runner: TurnRunner,
    correlator: FeedbackCorrelator,
    history: tokio::sync::Mutex<Vec<Exchange>>,
    /// Held for the whole of a turn.
    turn_lock: tokio::sync::Mutex<()>,
    active_turn: Mutex<Option<CancelFlag>>,
    known_speakers: Mutex<Vec<String>>,
    active_meeting: Mutex<Option<MeetingId>>,
    completed_turns: AtomicUsize,
}

impl SessionInner {
    fn hints(&self) -> ConversationHints {
        ConversationHints {
            today: Some(Local::now().date_naive()),
            known_speakers: self.known_speakers.lock().map(|s| s.clone()).unwrap_or_default(),
            active_meeting: self.active_meeting.lock().ok().and_then(|m| m.clone()),
        }
    }

    /// Bookkeeping for a turn that produced an answer.
    async fn complete_turn(&self, message: String, outcome: &mut TurnOutcome) {
        self.history.lock().await.push(Exchange {
            user: message,
            assistant: outcome.answer.clone(),
        });

        // Latest meeting mentioned anywhere in the turn, tool results included
        let mentioned = outcome
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .filter_map(|m| last_mentioned_meeting(&m.content))
            .last();
        if let Some(id) = mentioned {
            if let Ok(mut active) = self.active_meeting.lock() {
                debug!("Active meeting is now {}", id);
                *active = Some(id);
            }
        }

        let index = self.completed_turns.fetch_add(1, Ordering::SeqCst);
        match self.correlator.record_turn(index) {
            Ok(token) => outcome.recorded = Some(RecordedTurn { index, token }),
            Err(e) => warn!("Could not record turn {}: {}", index, e),
        }
    }
}

/// One user's conversation with the assistant.
///
/// Cloning gives another handle on the same session.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(id: &str, runner: TurnRunner, correlator: FeedbackCorrelator) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.to_string(),
                runner,
                correlator,
                history: tokio::sync::Mutex::new(Vec::new()),
                turn_lock: tokio::sync::Mutex::new(()),
                active_turn: Mutex::new(None),
                known_speakers: Mutex::new(Vec::new()),
                active_meeting: Mutex::new(None),
                completed_turns: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Start a turn for `message`.
    ///
    /// A turn still running in this session is cancelled first; the new turn
    /// begins once it has stopped.
    pub fn send(&self, message: &str) -> TurnStream {
        let cancel = CancelFlag::new();
        if let Ok(mut active) = self.inner.active_turn.lock() {
            if let Some(previous) = active.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        let (tx, stream) = TurnStream::channel();
        let inner = self.inner.clone();
        let message = message.to_string();
        tokio::spawn(async move {
            let _turn = inner.turn_lock.lock().await;
            let request = TurnRequest {
                session_id: inner.id.clone(),
                history: inner.history.lock().await.clone(),
                message: message.clone(),
                hints: inner.hints(),
            };

            let mut outcome = inner.runner.run(request, &cancel, &tx).await;
            if matches!(outcome.status, TurnStatus::Answered | TurnStatus::Degraded) {
                inner.complete_turn(message, &mut outcome).await;
            }
            let _ = tx.send(TurnFragment::Completed(outcome)).await;
        });
        stream
    }

    /// Run a turn to completion.
    pub async fn ask(&self, message: &str) -> Option<TurnOutcome> {
        self.send(message).outcome().await
    }

    /// Cancel the running turn, if any.
    pub fn cancel(&self) {
        if let Ok(active) = self.inner.active_turn.lock() {
            if let Some(flag) = active.as_ref() {
                flag.cancel();
            }
        }
    }

    /// Forget the conversation so far. Recorded turns stay resolvable.
    pub async fn clear(&self) {
        self.inner.history.lock().await.clear();
        if let Ok(mut active) = self.inner.active_meeting.lock() {
            *active = None;
        }
    }

    pub async fn history(&self) -> Vec<Exchange> {
        self.inner.history.lock().await.clone()
    }

    /// Names the planner should treat as speakers when they appear in a question.
    pub fn set_known_speakers(&self, speakers: Vec<String>) {
        if let Ok(mut known) = self.inner.known_speakers.lock() {
            *known = speakers;
        }
    }

    /// Index of the most recent recorded turn.
    pub fn last_turn_index(&self) -> Option<usize> {
        self.inner.completed_turns.load(Ordering::SeqCst).checked_sub(1)
    }

    pub fn correlator(&self) -> &FeedbackCorrelator {
        &self.inner.correlator
    }

    /// Rate the answer of turn `turn_index`.
    pub async fn feedback(&self, turn_index: usize, signal: &FeedbackSignal) -> Result<FeedbackDelivery> {
        self.inner.correlator.feedback_for_turn(turn_index, signal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::ChatMessage;
    use crate::agent::model::{ModelReply, ReasoningModel};
    use crate::error::ReferatError;
    use crate::feedback::{Rating, TracingSink};
    use crate::tools::{ToolRegistry, ToolSpec};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Answers with the last user message, slowly when asked to.
    struct EchoModel;

    #[async_trait]
    impl ReasoningModel for EchoModel {
        async fn complete(&self, messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ModelReply> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if last.contains("slow") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if last.contains("fail") {
                return Err(ReferatError::Model("unavailable".into()));
            }
            Ok(ModelReply::Answer(format!("echo: {} ({} messages)", last, messages.len())))
        }
    }

    fn session(id: &str) -> ChatSession {
        let runner = TurnRunner::new(Arc::new(EchoModel), Arc::new(ToolRegistry::new()));
        ChatSession::new(id, runner, FeedbackCorrelator::new(id, "test", Arc::new(TracingSink)))
    }

    #[tokio::test]
    async fn test_turns_record_history_and_tokens() {
        let session = session("s1");
        let first = session.ask("hello").await.unwrap();
        assert_eq!(first.answer, "echo: hello (1 messages)");
        assert_eq!(
            first.recorded,
            Some(RecordedTurn {
                index: 0,
                token: "s1-turn-0000".into()
            })
        );

        let second = session.ask("again").await.unwrap();
        assert_eq!(second.answer, "echo: again (3 messages)");
        assert_eq!(session.last_turn_index(), Some(1));
        assert_eq!(session.correlator().resolve(1).unwrap(), "s1-turn-0001");

        let delivery = session
            .feedback(1, &FeedbackSignal::new(Rating::Positive, None))
            .await
            .unwrap();
        assert_eq!(
            delivery,
            FeedbackDelivery::BestEffort {
                token: "s1-turn-0001".into()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_turn_is_not_recorded() {
        let session = session("s2");
        let outcome = session.ask("please fail").await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed);
        assert!(outcome.recorded.is_none());
        assert!(session.history().await.is_empty());
        assert!(session.feedback(0, &FeedbackSignal::new(Rating::Negative, None)).await.is_err());

        let next = session.ask("hi").await.unwrap();
        assert_eq!(next.status, TurnStatus::Answered);
        assert_eq!(next.recorded.unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_new_message_cancels_running_turn() {
        let session = session("s3");
        let slow = session.send("slow question");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = session.send("quick one");

        let slow = slow.outcome().await.unwrap();
        let fast = fast.outcome().await.unwrap();
        assert_eq!(fast.status, TurnStatus::Answered);
        assert_eq!(session.history().await.len(), 1);
        assert_eq!(session.history().await[0].user, "quick one");
        assert_eq!(slow.status, TurnStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_active_meeting_is_tracked() {
        let session = session("s4");
        session.ask("what happened in meeting_ab12cd34?").await.unwrap();
        assert_eq!(
            session.inner.hints().active_meeting.map(|m| m.hex().to_string()),
            Some("ab12cd34".to_string())
        );
        session.clear().await;
        assert!(session.inner.hints().active_meeting.is_none());
    }
}
