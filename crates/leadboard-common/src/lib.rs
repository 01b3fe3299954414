//! Shared domain types for the leadboard CRM.
//!
//! Everything in here crosses the HTTP boundary: the server serializes these
//! types and the client deserializes them, so field names and the stage labels
//! are part of the wire contract.

pub mod chat;
pub mod lead;

pub use chat::{
    ChatAccepted, ChatRequest, ChatResult, Conversation, ConversationDraft, ERROR_REPLY, FunctionOutcome,
    FunctionResult, LoginRequest, LoginResponse, Message, MessageRole, ResultStatus, TaskState,
    TaskStatus, UserInfo,
};
pub use lead::{KanbanBoard, Lead, LeadPatch, NewLead, Stage, StatusChange};

/// Returned when a string is not one of the known labels of an enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {kind}: '{value}'")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}
