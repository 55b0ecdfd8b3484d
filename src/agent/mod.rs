//! Conversation state machine and chat sessions.
//!
//! Each user message starts a turn: the reasoning model sees the history and
//! the tool catalog, may request tool calls, sees their results and finally
//! answers. Sessions run one turn at a time and remember completed turns for
//! feedback.

mod message;
mod model;
mod runner;
mod session;

pub use message::{prepare_messages, ChatMessage, Exchange, RequestedCall, Role};
pub use model::{tool_definitions, ModelReply, OpenAIReasoningModel, ReasoningModel};
pub use runner::{
    CancelFlag, RecordedTurn, TurnFragment, TurnOutcome, TurnRequest, TurnRunner, TurnStatus, TurnStream,
};
pub use session::ChatSession;
