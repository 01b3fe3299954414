use serde::{Deserialize, Serialize};

use leadboard_common::{ChatResult, TaskState, TaskStatus, UserInfo};

/// A CRM user. The password hash never leaves the server.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub is_admin: bool,
    pub created_at: String,
}

impl User {
    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            is_admin: self.is_admin,
        }
    }
}

/// Input for `CrmDb::create_user`.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: i64,
    pub created_at: String,
    pub expires_at: String,
}

/// One replayed turn of assistant context, kept per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: String,
    pub content: String,
}

impl ContextEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Input for `CrmDb::create_task`.
#[derive(Debug, Clone)]
pub struct NewChatTask {
    pub id: String,
    pub user_id: i64,
    pub conversation_id: i64,
    pub session_token: String,
    pub message: String,
}

/// A persisted chat task row.
#[derive(Debug, Clone)]
pub struct ChatTask {
    pub id: String,
    pub user_id: i64,
    pub conversation_id: Option<i64>,
    pub session_token: String,
    pub message: String,
    pub state: TaskState,
    pub status_message: Option<String>,
    pub result: Option<ChatResult>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

pub const PENDING_STATUS: &str = "Task is waiting to be processed...";
pub const PROCESSING_STATUS: &str = "Processing your message...";
pub const FAILED_STATUS: &str = "Task failed";

impl ChatTask {
    /// The polling view of this task.
    pub fn to_status(&self) -> TaskStatus {
        match self.state {
            TaskState::Pending => TaskStatus {
                state: self.state,
                status: Some(PENDING_STATUS.to_string()),
                result: None,
                error: None,
            },
            TaskState::Processing => TaskStatus {
                state: self.state,
                status: Some(
                    self.status_message
                        .clone()
                        .unwrap_or_else(|| PROCESSING_STATUS.to_string()),
                ),
                result: None,
                error: None,
            },
            TaskState::Success => TaskStatus {
                state: self.state,
                status: None,
                result: self.result.clone(),
                error: None,
            },
            TaskState::Failure => TaskStatus {
                state: self.state,
                status: Some(FAILED_STATUS.to_string()),
                result: None,
                error: Some(
                    self.error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string()),
                ),
            },
        }
    }
}
