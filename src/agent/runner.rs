//! The per-turn reasoning and tool-calling loop.
//!
//! A turn walks `Prepare -> Reason -> (RouteToTools -> Reason)* -> Terminate`.
//! Fragments (progress lines, the answer, errors) are sent over a channel as
//! the turn advances. Cancellation is checked between steps; in-flight tool
//! calls finish but their results are dropped.

use super::message::{prepare_messages, ChatMessage, Exchange, RequestedCall};
use super::model::{ModelReply, ReasoningModel};
use crate::error::ReferatError;
use crate::retrieval::ConversationHints;
use crate::tools::{ToolCallContext, ToolRegistry, WorkflowAccess};
use futures::future::join_all;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Capacity of the fragment channel between a turn and its consumer.
const FRAGMENT_BUFFER: usize = 32;

/// Shared flag a caller sets to cancel a running turn.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// The model produced a final answer.
    Answered,
    /// The loop limit was hit; a fallback answer was given.
    Degraded,
    /// The reasoning model failed; an error message was shown.
    Failed,
    Cancelled,
}

/// Reference to a turn recorded for feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedTurn {
    pub index: usize,
    pub token: String,
}

/// Final state of a turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Text shown to the user (answer, fallback or error).
    pub answer: String,
    /// Full message sequence as sent to the model, plus the final answer.
    pub messages: Vec<ChatMessage>,
    /// Reasoning steps taken.
    pub iterations: usize,
    /// Set once the session has recorded the turn.
    pub recorded: Option<RecordedTurn>,
}

/// One item of a turn's output sequence.
#[derive(Debug, Clone)]
pub enum TurnFragment {
    Progress(String),
    Answer(String),
    Error(String),
    /// Always the last fragment.
    Completed(TurnOutcome),
}

/// Fragments of one turn, in order. Ends after [`TurnFragment::Completed`].
pub struct TurnStream {
    rx: mpsc::Receiver<TurnFragment>,
}

impl TurnStream {
    pub(crate) fn channel() -> (mpsc::Sender<TurnFragment>, Self) {
        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        (tx, Self { rx })
    }

    pub async fn next_fragment(&mut self) -> Option<TurnFragment> {
        self.rx.recv().await
    }

    /// Drain the stream and return the outcome.
    pub async fn outcome(mut self) -> Option<TurnOutcome> {
        while let Some(fragment) = self.rx.recv().await {
            if let TurnFragment::Completed(outcome) = fragment {
                return Some(outcome);
            }
        }
        None
    }
}

impl Stream for TurnStream {
    type Item = TurnFragment;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Input of one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub history: Vec<Exchange>,
    pub message: String,
    pub hints: ConversationHints,
}

enum Phase {
    Prepare,
    Reason,
    RouteToTools(Vec<RequestedCall>),
    Terminate(TurnStatus, String),
}

/// Runs turns against a model and a tool registry.
#[derive(Clone)]
pub struct TurnRunner {
    model: Arc<dyn ReasoningModel>,
    registry: Arc<ToolRegistry>,
    system_prompt: String,
    max_iterations: usize,
}

impl TurnRunner {
    pub fn new(model: Arc<dyn ReasoningModel>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            model,
            registry,
            system_prompt: String::new(),
            max_iterations: 10,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run a turn on a background task and stream its fragments.
    pub fn start(&self, request: TurnRequest, cancel: CancelFlag) -> TurnStream {
        let (tx, stream) = TurnStream::channel();
        let runner = self.clone();
        tokio::spawn(async move {
            let outcome = runner.run(request, &cancel, &tx).await;
            let _ = tx.send(TurnFragment::Completed(outcome)).await;
        });
        stream
    }

    /// Drive the state machine to completion, sending fragments on `tx`.
    ///
    /// Does not send [`TurnFragment::Completed`]; the caller does that once
    /// it has finished with the outcome.
    #[instrument(skip_all, fields(session = %request.session_id))]
    pub async fn run(
        &self,
        request: TurnRequest,
        cancel: &CancelFlag,
        tx: &mpsc::Sender<TurnFragment>,
    ) -> TurnOutcome {
        let ctx = ToolCallContext::new(&request.session_id).with_hints(request.hints.clone());
        let specs = self.registry.specs();
        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut iterations = 0;
        let mut phase = Phase::Prepare;

        let (status, answer) = loop {
            if cancel.is_cancelled() {
                info!("Turn cancelled after {} reasoning step(s)", iterations);
                break (TurnStatus::Cancelled, String::new());
            }

            phase = match phase {
                Phase::Prepare => {
                    messages = prepare_messages(&self.system_prompt, &request.history, &request.message);
                    Phase::Reason
                }
                Phase::Reason => {
                    iterations += 1;
                    if iterations > self.max_iterations {
                        warn!("Turn exceeded {} reasoning steps", self.max_iterations);
                        Phase::Terminate(
                            TurnStatus::Degraded,
                            format!(
                                "I wasn't able to finish this request within {} steps. \
                                 Please rephrase or narrow the question.",
                                self.max_iterations
                            ),
                        )
                    } else {
                        debug!("Reasoning step {}", iterations);
                        match self.model.complete(&messages, &specs).await {
                            Ok(ModelReply::ToolCalls(calls)) if !calls.is_empty() => {
                                messages.push(ChatMessage::tool_request(calls.clone()));
                                Phase::RouteToTools(calls)
                            }
                            Ok(ModelReply::ToolCalls(_)) => Phase::Terminate(TurnStatus::Answered, String::new()),
                            Ok(ModelReply::Answer(text)) => Phase::Terminate(TurnStatus::Answered, text),
                            Err(e) => {
                                warn!("Reasoning step failed: {}", e);
                                Phase::Terminate(TurnStatus::Failed, model_failure_message(&e))
                            }
                        }
                    }
                }
                Phase::RouteToTools(calls) => {
                    for call in &calls {
                        if let Some(message) = self.progress_message(&call.name) {
                            let _ = tx.send(TurnFragment::Progress(message)).await;
                        }
                    }
                    let results = self.execute_batch(&calls, &ctx).await;
                    if cancel.is_cancelled() {
                        debug!("Discarding {} tool result(s) of a cancelled turn", results.len());
                        Phase::Terminate(TurnStatus::Cancelled, String::new())
                    } else {
                        for (call, result) in calls.iter().zip(results) {
                            messages.push(ChatMessage::tool_result(&call.id, result));
                        }
                        Phase::Reason
                    }
                }
                Phase::Terminate(status, answer) => break (status, answer),
            };
        };

        match status {
            TurnStatus::Answered | TurnStatus::Degraded => {
                messages.push(ChatMessage::assistant(&answer));
                let _ = tx.send(TurnFragment::Answer(answer.clone())).await;
            }
            TurnStatus::Failed => {
                let _ = tx.send(TurnFragment::Error(answer.clone())).await;
            }
            TurnStatus::Cancelled => {}
        }

        TurnOutcome {
            status,
            answer,
            messages,
            iterations: iterations.min(self.max_iterations),
            recorded: None,
        }
    }

    fn progress_message(&self, tool: &str) -> Option<String> {
        self.registry
            .resolve(tool)
            .ok()
            .and_then(|t| t.progress_message.clone())
    }

    /// Execute one batch of calls and return results in request order.
    ///
    /// Tools that write workflow state run one after another; all other
    /// calls run concurrently alongside them. Every call gets its own timeout.
    async fn execute_batch(&self, calls: &[RequestedCall], ctx: &ToolCallContext) -> Vec<String> {
        let (writers, others): (Vec<usize>, Vec<usize>) = (0..calls.len()).partition(|&i| {
            self.registry
                .resolve(&calls[i].name)
                .map(|t| t.workflow_access == WorkflowAccess::Write)
                .unwrap_or(false)
        });

        let concurrent = join_all(
            others
                .iter()
                .map(|&i| async move { (i, self.execute_call(&calls[i], ctx).await) }),
        );
        let sequential = async {
            let mut done = Vec::with_capacity(writers.len());
            for &i in &writers {
                done.push((i, self.execute_call(&calls[i], ctx).await));
            }
            done
        };

        let (mut results, serialized) = tokio::join!(concurrent, sequential);
        results.extend(serialized);
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, result)| result).collect()
    }

    async fn execute_call(&self, call: &RequestedCall, ctx: &ToolCallContext) -> String {
        info!("Calling tool: {}", call);
        let result = match self.registry.resolve(&call.name) {
            Ok(tool) => tool.invoke(ctx, call.arguments.clone()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(output) => output.render(),
            Err(e) => {
                warn!("Tool {} failed: {}", call.name, e);
                format!("Tool error: {}", e)
            }
        }
    }
}

fn model_failure_message(error: &ReferatError) -> String {
    format!(
        "Sorry, I couldn't complete that request because the assistant is unavailable ({}). Please try again.",
        error
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::Role;
    use crate::error::Result;
    use crate::tools::{AsyncTool, InputSchema, ParamType, ToolDescriptor, ToolOutput, ToolSpec};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted replies and records what it was sent.
    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<ModelReply>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<ModelReply>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReasoningModel for ScriptedModel {
        async fn complete(&self, messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<ModelReply> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ModelReply::Answer("done".into())))
        }
    }

    struct SleepyEcho;

    #[async_trait]
    impl AsyncTool for SleepyEcho {
        async fn call(&self, _ctx: &ToolCallContext, args: Value) -> Result<ToolOutput> {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ToolOutput::text(format!("slept {}", ms)))
        }
    }

    fn call(id: &str, name: &str, args: Value) -> RequestedCall {
        RequestedCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDescriptor::local_async(
                    "sleep",
                    "Sleeps",
                    InputSchema::new().required("ms", ParamType::Integer, "Milliseconds"),
                    Arc::new(SleepyEcho),
                )
                .with_progress("Sleeping..."),
            )
            .unwrap();
        registry
            .register(ToolDescriptor::local_sync(
                "fail",
                "Always fails",
                InputSchema::new(),
                |_: &ToolCallContext, _: &Value| Err(ReferatError::ToolExecution("upstream down".into())),
            ))
            .unwrap();
        Arc::new(registry)
    }

    fn request(message: &str) -> TurnRequest {
        TurnRequest {
            session_id: "s".into(),
            history: Vec::new(),
            message: message.into(),
            hints: ConversationHints::default(),
        }
    }

    async fn run(runner: &TurnRunner, message: &str) -> (TurnOutcome, Vec<TurnFragment>) {
        let mut stream = runner.start(request(message), CancelFlag::new());
        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next_fragment().await {
            if let TurnFragment::Completed(outcome) = fragment {
                return (outcome, fragments);
            }
            fragments.push(fragment);
        }
        panic!("turn ended without completion");
    }

    #[tokio::test]
    async fn test_results_keep_request_order() {
        let model = ScriptedModel::new(vec![Ok(ModelReply::ToolCalls(vec![
            call("a", "sleep", json!({"ms": 60})),
            call("b", "sleep", json!({"ms": 0})),
            call("c", "sleep", json!({"ms": 30})),
        ]))]);
        let runner = TurnRunner::new(model.clone(), registry());
        let (outcome, fragments) = run(&runner, "go").await;

        assert_eq!(outcome.status, TurnStatus::Answered);
        let results: Vec<(&str, &str)> = outcome
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| (m.tool_call_id.as_deref().unwrap(), m.content.as_str()))
            .collect();
        assert_eq!(results, vec![("a", "slept 60"), ("b", "slept 0"), ("c", "slept 30")]);

        let progress = fragments
            .iter()
            .filter(|f| matches!(f, TurnFragment::Progress(_)))
            .count();
        assert_eq!(progress, 3);
        assert!(matches!(fragments.last(), Some(TurnFragment::Answer(a)) if a == "done"));
    }

    #[tokio::test]
    async fn test_message_order_within_turn() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::ToolCalls(vec![call("a", "sleep", json!({"ms": 0}))])),
            Ok(ModelReply::Answer("finished".into())),
        ]);
        let runner = TurnRunner::new(model, registry()).with_system_prompt("sys");
        let (outcome, _) = run(&runner, "hello").await;

        let roles: Vec<Role> = outcome.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn test_tool_failure_does_not_abort_turn() {
        let model = ScriptedModel::new(vec![
            Ok(ModelReply::ToolCalls(vec![
                call("x", "fail", json!({})),
                call("y", "nonexistent", json!({})),
                call("z", "sleep", json!({"ms": "soon"})),
            ])),
            Ok(ModelReply::Answer("Sorry, that did not work.".into())),
        ]);
        let runner = TurnRunner::new(model.clone(), registry());
        let (outcome, _) = run(&runner, "try").await;

        assert_eq!(outcome.status, TurnStatus::Answered);
        let second_step = &model.seen.lock().unwrap()[1];
        let tool_results: Vec<&str> = second_step
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(tool_results.len(), 3);
        assert!(tool_results.iter().all(|r| r.starts_with("Tool error:")));
        assert!(tool_results[1].contains("Unknown tool: nonexistent"));
    }

    #[tokio::test]
    async fn test_model_failure_surfaces_error() {
        let model = ScriptedModel::new(vec![Err(ReferatError::OpenAI("503".into()))]);
        let runner = TurnRunner::new(model, registry());
        let (outcome, fragments) = run(&runner, "hi").await;

        assert_eq!(outcome.status, TurnStatus::Failed);
        assert!(matches!(&fragments[0], TurnFragment::Error(e) if e.contains("503")));
    }

    #[tokio::test]
    async fn test_iteration_limit_degrades() {
        let looping: Vec<Result<ModelReply>> = (0..5)
            .map(|i| Ok(ModelReply::ToolCalls(vec![call(&i.to_string(), "sleep", json!({"ms": 0}))])))
            .collect();
        let runner = TurnRunner::new(ScriptedModel::new(looping), registry()).with_max_iterations(2);
        let (outcome, fragments) = run(&runner, "loop").await;

        assert_eq!(outcome.status, TurnStatus::Degraded);
        assert_eq!(outcome.iterations, 2);
        assert!(matches!(fragments.last(), Some(TurnFragment::Answer(a)) if a.contains("within 2 steps")));
    }

    #[tokio::test]
    async fn test_cancelled_turn_discards_results() {
        let model = ScriptedModel::new(vec![Ok(ModelReply::ToolCalls(vec![call(
            "a",
            "sleep",
            json!({"ms": 100}),
        )]))]);
        let runner = TurnRunner::new(model.clone(), registry());
        let cancel = CancelFlag::new();
        let stream = runner.start(request("slow"), cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = stream.outcome().await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Cancelled);
        assert!(outcome.messages.iter().all(|m| m.role != Role::Tool));
        assert_eq!(model.seen.lock().unwrap().len(), 1);
    }
}
