//! Password hashing, server-side sessions, and the authenticated-request
//! extractor.
//!
//! Sessions are opaque UUID tokens stored in the `sessions` table. Browsers
//! carry the token in the `leadboard_session` cookie; other clients may send
//! `Authorization: Bearer <token>` instead.

use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{FromRequestParts, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, header, request::Parts},
    response::{IntoResponse, Response},
};
use headers::{Authorization, Cookie, HeaderMapExt, authorization::Bearer};

use leadboard_common::{LoginRequest, LoginResponse};

use super::api::{ApiError, SharedState};
use super::models::Session;
use crate::errors::CrmError;

pub const SESSION_COOKIE: &str = "leadboard_session";

pub fn hash_password(password: &str, cost: u32) -> Result<String> {
    bcrypt::hash(password, cost).context("Failed to hash password")
}

/// Check `password` against a bcrypt hash. A malformed hash never verifies.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Session token from the request: a Bearer token wins over the cookie.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() {
        return Some(bearer.token().to_string());
    }
    headers
        .typed_get::<Cookie>()
        .and_then(|cookie| cookie.get(SESSION_COOKIE).map(str::to_string))
        .filter(|token| !token.is_empty())
}

/// Resolve the request's token to a live session, if any.
pub async fn resolve_session(state: &SharedState, headers: &HeaderMap) -> Result<Option<Session>> {
    let Some(token) = session_token(headers) else {
        return Ok(None);
    };
    state.db.call(move |db| db.get_session(&token)).await
}

fn session_cookie(token: &str, max_age_secs: i64) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, max_age_secs
    ))
    .context("Invalid session cookie value")
}

// ── Extractor ────────────────────────────────────────────────────────

/// The caller's live session. Handlers taking this reject unauthenticated
/// requests with 401 before running.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user_id: i64,
}

impl FromRequestParts<SharedState> for AuthSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        match resolve_session(state, &parts.headers).await? {
            Some(session) => Ok(AuthSession {
                token: session.token,
                user_id: session.user_id,
            }),
            None => Err(CrmError::Unauthenticated.into()),
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

pub async fn login(
    State(state): State<SharedState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let email = req.email.trim().to_string();
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest("Email and password are required".into()));
    }

    let user = state
        .db
        .call(move |db| db.get_user_by_email(&email))
        .await?
        .ok_or(CrmError::InvalidCredentials)?;

    let password = req.password;
    let hash = user.password_hash.clone();
    let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| ApiError::Internal(format!("Password check panicked: {}", e)))?;
    if !verified {
        tracing::info!(user_id = user.id, "Rejected login with wrong password");
        return Err(CrmError::InvalidCredentials.into());
    }

    let token = uuid::Uuid::new_v4().to_string();
    let ttl = state.session_ttl_hours;
    let user_id = user.id;
    let session_token = token.clone();
    state
        .db
        .call(move |db| db.create_session(&session_token, user_id, ttl))
        .await?;
    tracing::info!(user_id, "User logged in");

    let cookie = session_cookie(&token, ttl * 3600)?;
    let body = LoginResponse {
        success: true,
        user: user.info(),
        token: Some(token),
    };
    Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

pub async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> Result<Response, ApiError> {
    if let Some(token) = session_token(&headers) {
        state.db.call(move |db| db.delete_session(&token)).await?;
    }
    let expired = session_cookie("", 0)?;
    let body = serde_json::json!({"success": true, "message": "Logged out successfully"});
    Ok(([(header::SET_COOKIE, expired)], Json(body)).into_response())
}

pub async fn current_user(State(state): State<SharedState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let Some(session) = resolve_session(&state, &headers).await? else {
        return Err(ApiError::Unauthorized("Not authenticated".into()));
    };
    let user_id = session.user_id;
    let user = state
        .db
        .call(move |db| db.get_user(user_id))
        .await?
        .ok_or(CrmError::UserNotFound { id: user_id })?;
    Ok(Json(serde_json::json!({"user": user.info()})).into_response())
}
