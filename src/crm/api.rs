use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        FromRequestParts, Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use leadboard_common::{
    ChatAccepted, ChatRequest, ConversationDraft, KanbanBoard, LeadPatch, MessageRole, NewLead,
    StatusChange,
};

use super::auth::{self, AuthSession};
use super::chat::{UNTITLED_CHAT, generate_title};
use super::db::DbHandle;
use super::models::NewChatTask;
use super::tasks::TaskQueue;
use super::ws::{self, BoardEvent, UserEvent, publish};
use crate::errors::CrmError;

/// Title for conversations created without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: broadcast::Sender<UserEvent>,
    pub tasks: TaskQueue,
    pub session_ttl_hours: i64,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({"error": msg})),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({"error": msg})),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, serde_json::json!({"error": msg})),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({"error": msg}))
            }
            ApiError::Internal(details) => {
                tracing::error!(error = %details, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({"error": "Internal server error", "details": details}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<CrmError> for ApiError {
    fn from(err: CrmError) -> Self {
        match err {
            CrmError::LeadNotFound { .. }
            | CrmError::ConversationNotFound { .. }
            | CrmError::TaskNotFound { .. }
            | CrmError::UserNotFound { .. } => ApiError::NotFound(err.to_string()),
            CrmError::BadRequest(msg) => ApiError::BadRequest(msg),
            CrmError::InvalidLabel(_) | CrmError::DuplicateUser { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            CrmError::InvalidCredentials | CrmError::Unauthenticated => {
                ApiError::Unauthorized(err.to_string())
            }
            CrmError::QueueClosed => ApiError::Unavailable(err.to_string()),
            CrmError::Other(e) => ApiError::Internal(format!("{:#}", e)),
            CrmError::Model(_) | CrmError::LockPoisoned => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CrmError>() {
            Ok(crm) => crm.into(),
            Err(other) => ApiError::Internal(format!("{:#}", other)),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Numeric `{id}` path segment. Malformed ids answer with the JSON error body.
#[derive(Debug, Clone, Copy)]
pub struct IdPath(pub i64);

impl<S: Send + Sync> FromRequestParts<S> for IdPath {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<i64>::from_request_parts(parts, state).await?;
        Ok(IdPath(id))
    }
}

/// Parse an optional JSON body; an empty body yields `T::default()`.
fn json_or_default<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/test/", get(test_api))
        .route("/health", get(health_check))
        .route("/auth/login/", post(auth::login))
        .route("/auth/logout/", post(auth::logout))
        .route("/auth/user/", get(auth::current_user))
        .route("/leads/", get(list_leads).post(create_lead))
        .route(
            "/leads/{id}/",
            get(get_lead).put(update_lead).delete(delete_lead),
        )
        .route("/leads/{id}/status/", put(update_lead_status))
        .route(
            "/conversations/",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/create/", post(create_conversation))
        .route(
            "/conversations/{id}/",
            get(get_conversation)
                .put(update_conversation)
                .delete(delete_conversation),
        )
        .route("/conversations/{id}/messages/", get(conversation_messages))
        .route("/chat/", post(chat_message))
        .route("/chat/status/{task_id}/", get(chat_status))
        .route("/chat/clear/", post(clear_chat))
        .route("/ws", get(ws::ws_handler))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn test_api() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "leadboard API is working!",
        "status": "success"
    }))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn list_leads(
    State(state): State<SharedState>,
    auth: AuthSession,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user_id;
    let leads = state.db.call(move |db| db.list_leads(user_id)).await?;
    Ok(Json(KanbanBoard::group(leads)))
}

async fn create_lead(
    State(state): State<SharedState>,
    auth: AuthSession,
    payload: Result<Json<NewLead>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new_lead) = payload?;
    let user_id = auth.user_id;
    let lead = state
        .db
        .call(move |db| db.create_lead(user_id, &new_lead))
        .await?;
    tracing::info!(user_id, lead_id = lead.id, "Lead created");
    publish(&state.events, user_id, BoardEvent::LeadCreated { lead: lead.clone() });
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn get_lead(
    State(state): State<SharedState>,
    auth: AuthSession,
    IdPath(id): IdPath,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user_id;
    let lead = state
        .db
        .call(move |db| db.get_lead(user_id, id))
        .await?
        .ok_or(CrmError::LeadNotFound { id })?;
    Ok(Json(lead))
}

async fn update_lead(
    State(state): State<SharedState>,
    auth: AuthSession,
    IdPath(id): IdPath,
    payload: Result<Json<LeadPatch>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(patch) = payload?;
    let user_id = auth.user_id;
    let lead = state
        .db
        .call(move |db| db.update_lead(user_id, id, &patch))
        .await?
        .ok_or(CrmError::LeadNotFound { id })?;
    publish(&state.events, user_id, BoardEvent::LeadUpdated { lead: lead.clone() });
    Ok(Json(lead))
}

async fn delete_lead(
    State(state): State<SharedState>,
    auth: AuthSession,
    IdPath(id): IdPath,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user_id;
    let deleted = state.db.call(move |db| db.delete_lead(user_id, id)).await?;
    if !deleted {
        return Err(CrmError::LeadNotFound { id }.into());
    }
    tracing::info!(user_id, lead_id = id, "Lead deleted");
    publish(&state.events, user_id, BoardEvent::LeadDeleted { lead_id: id });
    Ok(StatusCode::NO_CONTENT)
}

/// Drag and drop: move a card to a stage at a position.
async fn update_lead_status(
    State(state): State<SharedState>,
    auth: AuthSession,
    IdPath(id): IdPath,
    payload: Result<Json<StatusChange>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(change) = payload?;
    let Some(stage) = change.status else {
        return Err(ApiError::BadRequest("Status is required".into()));
    };
    let card_order = change.card_order;
    let user_id = auth.user_id;
    let (from_status, lead) = state
        .db
        .call(move |db| {
            let Some(current) = db.get_lead(user_id, id)? else {
                return Ok(None);
            };
            Ok(db
                .move_lead(user_id, id, stage, card_order)?
                .map(|lead| (current.status, lead)))
        })
        .await?
        .ok_or(CrmError::LeadNotFound { id })?;
    publish(
        &state.events,
        user_id,
        BoardEvent::LeadMoved {
            lead_id: id,
            from_status,
            to_status: lead.status,
            card_order: lead.card_order,
        },
    );
    Ok(Json(lead))
}

async fn list_conversations(
    State(state): State<SharedState>,
    auth: AuthSession,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user_id;
    let conversations = state
        .db
        .call(move |db| db.list_conversations(user_id))
        .await?;
    Ok(Json(conversations))
}

async fn create_conversation(
    State(state): State<SharedState>,
    auth: AuthSession,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let draft: ConversationDraft = json_or_default(&body)?;
    let title = draft
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string());
    let user_id = auth.user_id;
    let conversation = state
        .db
        .call(move |db| db.create_conversation(user_id, &title))
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<SharedState>,
    auth: AuthSession,
    IdPath(id): IdPath,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user_id;
    let conversation = state
        .db
        .call(move |db| db.get_conversation(user_id, id))
        .await?
        .ok_or(CrmError::ConversationNotFound { id })?;
    Ok(Json(conversation))
}

async fn update_conversation(
    State(state): State<SharedState>,
    auth: AuthSession,
    IdPath(id): IdPath,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let draft: ConversationDraft = json_or_default(&body)?;
    let Some(title) = draft
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
    else {
        return Err(ApiError::BadRequest("Title is required".into()));
    };
    let user_id = auth.user_id;
    let conversation = state
        .db
        .call(move |db| db.rename_conversation(user_id, id, &title))
        .await?
        .ok_or(CrmError::ConversationNotFound { id })?;
    Ok(Json(conversation))
}

async fn delete_conversation(
    State(state): State<SharedState>,
    auth: AuthSession,
    IdPath(id): IdPath,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user_id;
    let deleted = state
        .db
        .call(move |db| db.delete_conversation(user_id, id))
        .await?;
    if !deleted {
        return Err(CrmError::ConversationNotFound { id }.into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn conversation_messages(
    State(state): State<SharedState>,
    auth: AuthSession,
    IdPath(id): IdPath,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user_id;
    let messages = state
        .db
        .call(move |db| {
            if db.get_conversation(user_id, id)?.is_none() {
                return Ok(None);
            }
            db.list_messages(id).map(Some)
        })
        .await?
        .ok_or(CrmError::ConversationNotFound { id })?;
    Ok(Json(messages))
}

/// Accept a chat message: store it, persist a PENDING task, and queue it.
async fn chat_message(
    State(state): State<SharedState>,
    auth: AuthSession,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err(ApiError::BadRequest("Message is required".into()));
    }

    let user_id = auth.user_id;
    let task_id = uuid::Uuid::new_v4().to_string();
    let task = NewChatTask {
        id: task_id.clone(),
        user_id,
        conversation_id: 0,
        session_token: auth.token.clone(),
        message: message.clone(),
    };
    let requested = req.conversation_id;
    let conversation_id = state
        .db
        .call(move |db| {
            let conversation_id = match requested {
                Some(id) => {
                    let conversation = db
                        .get_conversation(user_id, id)?
                        .ok_or(CrmError::ConversationNotFound { id })?;
                    if conversation.title == UNTITLED_CHAT {
                        db.rename_conversation(user_id, id, &generate_title(&message))?;
                    }
                    id
                }
                None => db.create_conversation(user_id, &generate_title(&message))?.id,
            };
            db.add_message(conversation_id, MessageRole::User, &message, None)?;
            db.create_task(&NewChatTask {
                conversation_id,
                ..task
            })?;
            Ok(conversation_id)
        })
        .await?;

    if let Err(e) = state.tasks.enqueue(task_id.clone()) {
        let id = task_id.clone();
        let reason = e.to_string();
        state.db.call(move |db| db.fail_task(&id, &reason)).await?;
        return Err(e.into());
    }
    tracing::info!(user_id, conversation_id, task_id = %task_id, "Chat message queued");

    Ok(Json(ChatAccepted {
        task_id,
        conversation_id,
        status: "processing".to_string(),
        message: "Message received, processing...".to_string(),
    }))
}

async fn chat_status(
    State(state): State<SharedState>,
    auth: AuthSession,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = auth.user_id;
    let id = task_id.clone();
    let task = state
        .db
        .call(move |db| db.get_task(user_id, &id))
        .await?
        .ok_or(CrmError::TaskNotFound { id: task_id })?;
    Ok(Json(task.to_status()))
}

async fn clear_chat(
    State(state): State<SharedState>,
    auth: AuthSession,
) -> Result<impl IntoResponse, ApiError> {
    let token = auth.token;
    state.db.call(move |db| db.clear_chat_context(&token)).await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Conversation context cleared"
    })))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use leadboard_common::{Conversation, Lead, Message, Stage, TaskState, TaskStatus};

    use crate::crm::auth::hash_password;
    use crate::crm::chat::ChatService;
    use crate::crm::db::CrmDb;
    use crate::crm::llm::ModelReply;
    use crate::crm::llm::testing::ScriptedModel;
    use crate::crm::models::NewUser;

    pub(crate) struct TestApp {
        pub state: SharedState,
        pub token: String,
        pub user_id: i64,
    }

    impl TestApp {
        pub fn router(&self) -> Router {
            api_router().with_state(self.state.clone())
        }
    }

    /// App with one user ("ada@example.com" / "secret") and a live session.
    pub(crate) fn test_app(replies: Vec<Result<ModelReply, String>>) -> TestApp {
        let db = CrmDb::new_in_memory().unwrap();
        let user = db
            .create_user(&NewUser {
                email: "ada@example.com".into(),
                password_hash: hash_password("secret", 4).unwrap(),
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                is_admin: false,
            })
            .unwrap();
        db.create_session("test-token", user.id, 1).unwrap();
        let db = DbHandle::new(db);
        let (events, _) = broadcast::channel(64);
        let chat = Arc::new(ChatService::new(
            db.clone(),
            Arc::new(ScriptedModel::new(replies)),
            events.clone(),
            10,
        ));
        let (tasks, _) = TaskQueue::start(db.clone(), chat, events.clone(), 2, 16);
        TestApp {
            state: Arc::new(AppState {
                db,
                events,
                tasks,
                session_ttl_hours: 1,
            }),
            token: "test-token".into(),
            user_id: user.id,
        }
    }

    fn second_session(app: &TestApp) -> String {
        let db = app.state.db.lock_sync().unwrap();
        let bob = db
            .create_user(&NewUser {
                email: "bob@example.com".into(),
                password_hash: "x".into(),
                ..NewUser::default()
            })
            .unwrap();
        db.create_session("bob-token", bob.id, 1).unwrap();
        "bob-token".into()
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &TestApp, req: Request<Body>) -> Response {
        app.router().oneshot(req).await.unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &TestApp, body: serde_json::Value) -> Lead {
        let resp = send(app, request("POST", "/leads/", Some(&app.token), Some(body))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp.into_body()).await
    }

    async fn poll_until_done(app: &TestApp, task_id: &str) -> TaskStatus {
        for _ in 0..200 {
            let uri = format!("/chat/status/{}/", task_id);
            let resp = send(app, request("GET", &uri, Some(&app.token), None)).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let status: TaskStatus = body_json(resp.into_body()).await;
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task never finished");
    }

    #[tokio::test]
    async fn test_health_and_test_endpoints_are_public() {
        let app = test_app(vec![]);
        let resp = send(&app, request("GET", "/health", None, None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        let resp = send(&app, request("GET", "/test/", None, None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["status"], "success");
    }

    #[tokio::test]
    async fn test_protected_routes_require_session() {
        let app = test_app(vec![]);
        for (method, uri) in [
            ("GET", "/leads/"),
            ("GET", "/conversations/"),
            ("POST", "/chat/clear/"),
            ("GET", "/chat/status/abc/"),
        ] {
            let resp = send(&app, request(method, uri, None, None)).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{} {}", method, uri);
            let json: serde_json::Value = body_json(resp.into_body()).await;
            assert_eq!(json["error"], "Authentication required");
        }
        let resp = send(&app, request("GET", "/leads/", Some("bogus"), None)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_sets_cookie_and_cookie_authenticates() {
        let app = test_app(vec![]);
        let resp = send(
            &app,
            request(
                "POST",
                "/auth/login/",
                None,
                Some(serde_json::json!({"email": "ada@example.com", "password": "secret"})),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("leadboard_session="));
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["user"]["first_name"], "Ada");
        assert!(json["user"].get("password_hash").is_none());

        let pair = cookie.split(';').next().unwrap().to_string();
        let req = Request::builder()
            .uri("/auth/user/")
            .header(header::COOKIE, pair.clone())
            .body(Body::empty())
            .unwrap();
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["user"]["email"], "ada@example.com");

        let req = Request::builder()
            .method("POST")
            .uri("/auth/logout/")
            .header(header::COOKIE, pair.clone())
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::OK);

        let req = Request::builder()
            .uri("/auth/user/")
            .header(header::COOKIE, pair)
            .body(Body::empty())
            .unwrap();
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["error"], "Not authenticated");
    }

    #[tokio::test]
    async fn test_login_rejections() {
        let app = test_app(vec![]);
        let missing = send(
            &app,
            request("POST", "/auth/login/", None, Some(serde_json::json!({"email": "ada@example.com"}))),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(missing.into_body()).await;
        assert_eq!(json["error"], "Email and password are required");

        for body in [
            serde_json::json!({"email": "ada@example.com", "password": "wrong"}),
            serde_json::json!({"email": "nobody@example.com", "password": "secret"}),
        ] {
            let resp = send(&app, request("POST", "/auth/login/", None, Some(body))).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            let json: serde_json::Value = body_json(resp.into_body()).await;
            assert_eq!(json["error"], "Invalid credentials");
        }
    }

    #[tokio::test]
    async fn test_board_groups_leads_by_stage() {
        let app = test_app(vec![]);
        create(&app, serde_json::json!({"name": "Acme", "value": "1000"})).await;
        create(&app, serde_json::json!({"name": "Globex", "status": "Proposal sent"})).await;

        let resp = send(&app, request("GET", "/leads/", Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let board: serde_json::Value = body_json(resp.into_body()).await;
        for label in Stage::ALL {
            assert!(board[label.as_str()].is_array(), "missing column {}", label);
        }
        assert_eq!(board["Interest"][0]["name"], "Acme");
        assert_eq!(board["Interest"][0]["value"], 1000.0);
        assert_eq!(board["Proposal sent"][0]["name"], "Globex");
        assert_eq!(board["Closed win"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_create_lead_validation() {
        let app = test_app(vec![]);
        let resp = send(
            &app,
            request("POST", "/leads/", Some(&app.token), Some(serde_json::json!({"name": "  "}))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            request(
                "POST",
                "/leads/",
                Some(&app.token),
                Some(serde_json::json!({"name": "X", "status": "Won"})),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_lead_detail_update_and_delete() {
        let app = test_app(vec![]);
        let mut events = app.state.events.subscribe();
        let lead = create(&app, serde_json::json!({"name": "Wile", "company": "Acme"})).await;
        let uri = format!("/leads/{}/", lead.id);

        let resp = send(&app, request("GET", &uri, Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            &app,
            request("PUT", &uri, Some(&app.token), Some(serde_json::json!({"notes": "Anvils"}))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let updated: Lead = body_json(resp.into_body()).await;
        assert_eq!(updated.notes.as_deref(), Some("Anvils"));
        assert_eq!(updated.company.as_deref(), Some("Acme"));

        let resp = send(&app, request("DELETE", &uri, Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(&app, request("GET", &uri, Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["error"], "Lead not found");

        let resp = send(&app, request("DELETE", &uri, Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let kinds: Vec<BoardEvent> = (0..3).map(|_| events.try_recv().unwrap().event).collect();
        assert!(matches!(kinds[0], BoardEvent::LeadCreated { .. }));
        assert!(matches!(kinds[1], BoardEvent::LeadUpdated { .. }));
        assert_eq!(kinds[2], BoardEvent::LeadDeleted { lead_id: lead.id });
    }

    #[tokio::test]
    async fn test_status_endpoint_moves_card() {
        let app = test_app(vec![]);
        let mut events = app.state.events.subscribe();
        let lead = create(&app, serde_json::json!({"name": "Mover"})).await;
        let uri = format!("/leads/{}/status/", lead.id);

        let resp = send(&app, request("PUT", &uri, Some(&app.token), Some(serde_json::json!({})))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["error"], "Status is required");

        let resp = send(
            &app,
            request("PUT", &uri, Some(&app.token), Some(serde_json::json!({"status": "Meeting booked"}))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let moved: Lead = body_json(resp.into_body()).await;
        assert_eq!(moved.status, Stage::MeetingBooked);
        assert_eq!(moved.card_order, 1);

        let _created = events.try_recv().unwrap();
        assert_eq!(
            events.try_recv().unwrap().event,
            BoardEvent::LeadMoved {
                lead_id: lead.id,
                from_status: Stage::Interest,
                to_status: Stage::MeetingBooked,
                card_order: 1
            }
        );

        let resp = send(
            &app,
            request("PUT", "/leads/999/status/", Some(&app.token), Some(serde_json::json!({"status": "Interest"}))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_leads_are_private_to_owner() {
        let app = test_app(vec![]);
        let lead = create(&app, serde_json::json!({"name": "Private"})).await;
        let bob = second_session(&app);

        let resp = send(&app, request("GET", &format!("/leads/{}/", lead.id), Some(&bob), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&app, request("GET", "/leads/", Some(&bob), None)).await;
        let board: KanbanBoard = body_json(resp.into_body()).await;
        assert!(board.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_crud() {
        let app = test_app(vec![]);
        let resp = send(&app, request("POST", "/conversations/create/", Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let conv: Conversation = body_json(resp.into_body()).await;
        assert_eq!(conv.title, DEFAULT_CONVERSATION_TITLE);

        let resp = send(
            &app,
            request("POST", "/conversations/", Some(&app.token), Some(serde_json::json!({"title": "Q3"}))),
        )
        .await;
        let q3: Conversation = body_json(resp.into_body()).await;
        assert_eq!(q3.title, "Q3");

        let uri = format!("/conversations/{}/", conv.id);
        let resp = send(
            &app,
            request("PUT", &uri, Some(&app.token), Some(serde_json::json!({"title": "Renamed"}))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let renamed: Conversation = body_json(resp.into_body()).await;
        assert_eq!(renamed.title, "Renamed");

        let resp = send(&app, request("PUT", &uri, Some(&app.token), Some(serde_json::json!({})))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(&app, request("GET", "/conversations/", Some(&app.token), None)).await;
        let list: Vec<Conversation> = body_json(resp.into_body()).await;
        assert_eq!(list.len(), 2);

        let bob = second_session(&app);
        let resp = send(&app, request("GET", &format!("{}messages/", uri), Some(&bob), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["error"], "Conversation not found");

        let resp = send(&app, request("DELETE", &uri, Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = send(&app, request("GET", &uri, Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chat_requires_message() {
        let app = test_app(vec![]);
        let resp = send(
            &app,
            request("POST", "/chat/", Some(&app.token), Some(serde_json::json!({"message": "   "}))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["error"], "Message is required");
    }

    #[tokio::test]
    async fn test_chat_round_trip_through_queue() {
        let app = test_app(vec![
            Ok(ModelReply::call("create_lead", serde_json::json!({"name": "Road Runner"}))),
            Ok(ModelReply::text("Done, Road Runner is on the board.")),
        ]);
        let resp = send(
            &app,
            request(
                "POST",
                "/chat/",
                Some(&app.token),
                Some(serde_json::json!({"message": "Add a lead called Road Runner"})),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let accepted: ChatAccepted = body_json(resp.into_body()).await;
        assert_eq!(accepted.status, "processing");
        assert_eq!(accepted.message, "Message received, processing...");

        let status = poll_until_done(&app, &accepted.task_id).await;
        assert_eq!(status.state, TaskState::Success);
        let result = status.result.unwrap();
        assert_eq!(result.ai_message, "Done, Road Runner is on the board.");
        assert!(result.modified_leads());

        let uri = format!("/conversations/{}/", accepted.conversation_id);
        let resp = send(&app, request("GET", &uri, Some(&app.token), None)).await;
        let conv: Conversation = body_json(resp.into_body()).await;
        assert_eq!(conv.title, "Add a lead called Road Runner");

        let resp = send(&app, request("GET", &format!("{}messages/", uri), Some(&app.token), None)).await;
        let messages: Vec<Message> = body_json(resp.into_body()).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].function_results.as_ref().unwrap()[0].function, "create_lead");

        let resp = send(&app, request("GET", "/leads/", Some(&app.token), None)).await;
        let board: KanbanBoard = body_json(resp.into_body()).await;
        assert_eq!(board.interest[0].name, "Road Runner");
    }

    #[tokio::test]
    async fn test_chat_renames_untitled_conversation() {
        let app = test_app(vec![]);
        let conv = app
            .state
            .db
            .lock_sync()
            .unwrap()
            .create_conversation(app.user_id, UNTITLED_CHAT)
            .unwrap();
        let resp = send(
            &app,
            request(
                "POST",
                "/chat/",
                Some(&app.token),
                Some(serde_json::json!({"message": "Pipeline summary", "conversation_id": conv.id})),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let accepted: ChatAccepted = body_json(resp.into_body()).await;
        assert_eq!(accepted.conversation_id, conv.id);
        poll_until_done(&app, &accepted.task_id).await;

        let id = conv.id;
        let user_id = app.user_id;
        let renamed = app
            .state
            .db
            .call(move |db| db.get_conversation(user_id, id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.title, "Pipeline summary");
    }

    #[tokio::test]
    async fn test_chat_with_foreign_conversation_is_not_found() {
        let app = test_app(vec![]);
        let bob = second_session(&app);
        let resp = send(
            &app,
            request("POST", "/conversations/", Some(&bob), Some(serde_json::json!({"title": "Bob"}))),
        )
        .await;
        let bobs: Conversation = body_json(resp.into_body()).await;

        let resp = send(
            &app,
            request(
                "POST",
                "/chat/",
                Some(&app.token),
                Some(serde_json::json!({"message": "hi", "conversation_id": bobs.id})),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_status_is_private_and_unknown_is_404() {
        let app = test_app(vec![]);
        let resp = send(
            &app,
            request("POST", "/chat/", Some(&app.token), Some(serde_json::json!({"message": "hi"}))),
        )
        .await;
        let accepted: ChatAccepted = body_json(resp.into_body()).await;

        let bob = second_session(&app);
        let uri = format!("/chat/status/{}/", accepted.task_id);
        let resp = send(&app, request("GET", &uri, Some(&bob), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&app, request("GET", "/chat/status/does-not-exist/", Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["error"], "Task not found");
    }

    #[tokio::test]
    async fn test_clear_chat_empties_context() {
        let app = test_app(vec![]);
        app.state
            .db
            .lock_sync()
            .unwrap()
            .push_chat_context(
                &app.token,
                &[crate::crm::models::ContextEntry::user("remember me")],
                10,
            )
            .unwrap();

        let resp = send(&app, request("POST", "/chat/clear/", Some(&app.token), None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(json["message"], "Conversation context cleared");

        let token = app.token.clone();
        let context = app.state.db.call(move |db| db.get_chat_context(&token)).await.unwrap();
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_non_numeric_id_is_json_bad_request() {
        let app = test_app(vec![]);
        for (method, uri) in [
            ("GET", "/leads/abc/"),
            ("DELETE", "/leads/abc/"),
            ("GET", "/conversations/abc/"),
            ("GET", "/conversations/abc/messages/"),
        ] {
            let resp = send(&app, request(method, uri, Some(&app.token), None)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{} {}", method, uri);
            let json: serde_json::Value = body_json(resp.into_body()).await;
            assert!(json["error"].as_str().unwrap().contains("abc"), "{} {}", method, uri);
        }
    }

    #[test]
    fn test_api_error_mapping() {
        let not_found: ApiError = anyhow::Error::from(CrmError::LeadNotFound { id: 1 }).into();
        assert!(matches!(not_found, ApiError::NotFound(ref m) if m == "Lead not found"));

        let missing_user: ApiError = CrmError::UserNotFound { id: 9 }.into();
        assert!(matches!(missing_user, ApiError::NotFound(ref m) if m == "User not found"));

        let rejected: ApiError = anyhow::Error::from(CrmError::InvalidCredentials).into();
        assert!(matches!(rejected, ApiError::Unauthorized(ref m) if m == "Invalid credentials"));

        let closed: ApiError = CrmError::QueueClosed.into();
        assert!(matches!(closed, ApiError::Unavailable(_)));

        let internal: ApiError = anyhow::anyhow!("disk on fire").into();
        let resp = internal.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
