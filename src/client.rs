//! HTTP client for the CRM API, including the submit-then-poll chat flow.
//!
//! `CrmClient` keeps a cookie store, so a successful `login` authenticates
//! every later call. The session token from the login response is also sent
//! as a Bearer token for servers reached through proxies that strip cookies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use leadboard_common::{
    ChatAccepted, ChatRequest, ChatResult, Conversation, ConversationDraft, ERROR_REPLY,
    KanbanBoard, Lead, LeadPatch, LoginRequest, LoginResponse, Message, NewLead, Stage,
    StatusChange, TaskState, TaskStatus, UserInfo,
};

use crate::errors::ClientError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const CONNECTION_ERROR: &str =
    "Connection error. Please check your internet connection and try again.";
pub const SEND_ERROR: &str = "Failed to send message. Please try again.";
pub const TIMEOUT_ERROR: &str =
    "The assistant is taking too long to respond. Please try again.";

/// How a submitted chat message ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Reply {
        result: ChatResult,
        /// A lead-changing function succeeded; refresh the board.
        leads_changed: bool,
        /// The assistant wants the user to confirm a deletion.
        confirmation_requested: bool,
    },
    /// A user-facing error message.
    Failed(String),
}

impl ChatOutcome {
    /// Text to show the user.
    pub fn message(&self) -> &str {
        match self {
            ChatOutcome::Reply { result, .. } => &result.ai_message,
            ChatOutcome::Failed(msg) => msg,
        }
    }

    fn from_result(result: ChatResult) -> Self {
        ChatOutcome::Reply {
            leads_changed: result.modified_leads(),
            confirmation_requested: result.requests_confirmation(),
            result,
        }
    }
}

pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
    poll_interval: Duration,
    deadline: Option<Duration>,
}

impl CrmClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Transport {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self {
            http,
            base_url,
            token: RwLock::new(None),
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: Some(DEFAULT_DEADLINE),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overall limit for `wait_for_task`. `None` polls until a terminal state.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        let token = self.token.read().ok().and_then(|t| t.clone());
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder, path: &str) -> Result<Response, ClientError> {
        let response = builder.send().await.map_err(|source| ClientError::Transport {
            url: self.url(path),
            source,
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        tracing::debug!(path, status = status.as_u16(), %message, "Request rejected");
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder, path: &str) -> Result<T, ClientError> {
        let response = self.execute(builder, path).await?;
        response.json().await.map_err(|source| ClientError::Decode {
            url: self.url(path),
            source,
        })
    }

    // ── Auth ──────────────────────────────────────────────────────────

    pub async fn login(&self, email: &str, password: &str) -> Result<UserInfo, ClientError> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let path = "/auth/login/";
        let resp: LoginResponse = self
            .json(self.request(reqwest::Method::POST, path).json(&body), path)
            .await?;
        if let Ok(mut token) = self.token.write() {
            *token = resp.token;
        }
        Ok(resp.user)
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        let path = "/auth/logout/";
        self.execute(self.request(reqwest::Method::POST, path), path).await?;
        if let Ok(mut token) = self.token.write() {
            *token = None;
        }
        Ok(())
    }

    pub async fn current_user(&self) -> Result<UserInfo, ClientError> {
        #[derive(serde::Deserialize)]
        struct Envelope {
            user: UserInfo,
        }
        let path = "/auth/user/";
        let envelope: Envelope = self.json(self.request(reqwest::Method::GET, path), path).await?;
        Ok(envelope.user)
    }

    // ── Leads ─────────────────────────────────────────────────────────

    pub async fn list_leads(&self) -> Result<KanbanBoard, ClientError> {
        let path = "/leads/";
        self.json(self.request(reqwest::Method::GET, path), path).await
    }

    pub async fn get_lead(&self, id: i64) -> Result<Lead, ClientError> {
        let path = format!("/leads/{}/", id);
        self.json(self.request(reqwest::Method::GET, &path), &path).await
    }

    pub async fn create_lead(&self, lead: &NewLead) -> Result<Lead, ClientError> {
        let path = "/leads/";
        self.json(self.request(reqwest::Method::POST, path).json(lead), path)
            .await
    }

    pub async fn update_lead(&self, id: i64, patch: &LeadPatch) -> Result<Lead, ClientError> {
        let path = format!("/leads/{}/", id);
        self.json(self.request(reqwest::Method::PUT, &path).json(patch), &path)
            .await
    }

    /// Drop a card into `stage` at position `card_order`.
    pub async fn move_lead(&self, id: i64, stage: Stage, card_order: i64) -> Result<Lead, ClientError> {
        let path = format!("/leads/{}/status/", id);
        let body = StatusChange {
            status: Some(stage),
            card_order,
        };
        self.json(self.request(reqwest::Method::PUT, &path).json(&body), &path)
            .await
    }

    pub async fn delete_lead(&self, id: i64) -> Result<(), ClientError> {
        let path = format!("/leads/{}/", id);
        self.execute(self.request(reqwest::Method::DELETE, &path), &path)
            .await?;
        Ok(())
    }

    // ── Conversations ─────────────────────────────────────────────────

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        let path = "/conversations/";
        self.json(self.request(reqwest::Method::GET, path), path).await
    }

    pub async fn create_conversation(&self, title: Option<&str>) -> Result<Conversation, ClientError> {
        let path = "/conversations/";
        let body = ConversationDraft {
            title: title.map(str::to_string),
        };
        self.json(self.request(reqwest::Method::POST, path).json(&body), path)
            .await
    }

    pub async fn rename_conversation(&self, id: i64, title: &str) -> Result<Conversation, ClientError> {
        let path = format!("/conversations/{}/", id);
        let body = ConversationDraft {
            title: Some(title.to_string()),
        };
        self.json(self.request(reqwest::Method::PUT, &path).json(&body), &path)
            .await
    }

    pub async fn delete_conversation(&self, id: i64) -> Result<(), ClientError> {
        let path = format!("/conversations/{}/", id);
        self.execute(self.request(reqwest::Method::DELETE, &path), &path)
            .await?;
        Ok(())
    }

    pub async fn conversation_messages(&self, id: i64) -> Result<Vec<Message>, ClientError> {
        let path = format!("/conversations/{}/messages/", id);
        self.json(self.request(reqwest::Method::GET, &path), &path).await
    }

    // ── Chat ──────────────────────────────────────────────────────────

    pub async fn send_chat(&self, message: &str, conversation_id: Option<i64>) -> Result<ChatAccepted, ClientError> {
        let path = "/chat/";
        let body = ChatRequest {
            message: message.to_string(),
            conversation_id,
        };
        self.json(self.request(reqwest::Method::POST, path).json(&body), path)
            .await
    }

    pub async fn chat_status(&self, task_id: &str) -> Result<TaskStatus, ClientError> {
        let path = format!("/chat/status/{}/", task_id);
        self.json(self.request(reqwest::Method::GET, &path), &path).await
    }

    pub async fn clear_chat(&self) -> Result<(), ClientError> {
        let path = "/chat/clear/";
        self.execute(self.request(reqwest::Method::POST, path), path).await?;
        Ok(())
    }

    /// Poll a task every `poll_interval` until it reaches a terminal state,
    /// the deadline passes, or a request fails. Never retries.
    pub async fn wait_for_task(&self, task_id: &str) -> ChatOutcome {
        let started = Instant::now();
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let status = match self.chat_status(task_id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "Polling chat task failed");
                    return ChatOutcome::Failed(CONNECTION_ERROR.to_string());
                }
            };

            match status.state {
                TaskState::Success => {
                    return match status.result {
                        Some(result) => ChatOutcome::from_result(result),
                        None => ChatOutcome::Failed(ERROR_REPLY.to_string()),
                    };
                }
                TaskState::Failure => {
                    tracing::warn!(task_id, error = ?status.error, "Chat task failed");
                    return ChatOutcome::Failed(ERROR_REPLY.to_string());
                }
                TaskState::Pending | TaskState::Processing => {}
            }

            if self.deadline.is_some_and(|limit| started.elapsed() >= limit) {
                tracing::warn!(task_id, "Gave up waiting for chat task");
                return ChatOutcome::Failed(TIMEOUT_ERROR.to_string());
            }
        }
    }
}

/// A chat conversation driven from the client side. Only one message may be
/// in flight at a time.
pub struct ChatSession<'a> {
    client: &'a CrmClient,
    conversation_id: Mutex<Option<i64>>,
    busy: AtomicBool,
}

/// Clears the busy flag when a send finishes or is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<'a> ChatSession<'a> {
    /// Continue `conversation_id`, or start a new conversation on first send.
    pub fn new(client: &'a CrmClient, conversation_id: Option<i64>) -> Self {
        Self {
            client,
            conversation_id: Mutex::new(conversation_id),
            busy: AtomicBool::new(false),
        }
    }

    pub fn conversation_id(&self) -> Option<i64> {
        self.conversation_id.lock().ok().and_then(|id| *id)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Submit a message and wait for the assistant. Transport and server
    /// failures come back as `ChatOutcome::Failed` with a user-facing text.
    pub async fn send(&self, message: &str) -> Result<ChatOutcome, ClientError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Busy);
        }
        let _in_flight = InFlight(&self.busy);

        let accepted = match self.client.send_chat(message, self.conversation_id()).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Sending chat message failed");
                return Ok(ChatOutcome::Failed(SEND_ERROR.to_string()));
            }
        };
        if let Ok(mut id) = self.conversation_id.lock() {
            *id = Some(accepted.conversation_id);
        }
        Ok(self.client.wait_for_task(&accepted.task_id).await)
    }

    /// Forget the assistant's context for this login session.
    pub async fn clear(&self) -> Result<(), ClientError> {
        self.client.clear_chat().await
    }
}
