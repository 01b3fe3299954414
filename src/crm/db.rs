use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use leadboard_common::{
    ChatResult, Conversation, FunctionResult, Lead, LeadPatch, Message, MessageRole, NewLead,
    Stage, TaskState,
};

use super::models::*;
use crate::errors::CrmError;

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| CrmError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CrmDb>> {
        self.inner
            .lock()
            .map_err(|_| CrmError::LockPoisoned.into())
    }
}

const LEAD_COLUMNS: &str = "id, user_id, name, company, email, phone, value, notes, status, source, card_order, created_at, updated_at";

const TASK_COLUMNS: &str = "id, user_id, conversation_id, session_token, message, state, status_message, result, error, created_at, started_at, completed_at";

/// Board order for SQL sorting; must match `Stage::ALL`.
const STAGE_ORDER_SQL: &str = "CASE status
    WHEN 'Interest' THEN 0
    WHEN 'Meeting booked' THEN 1
    WHEN 'Proposal sent' THEN 2
    WHEN 'Closed win' THEN 3
    WHEN 'Closed lost' THEN 4
    ELSE 5 END";

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    password_hash TEXT NOT NULL,
                    first_name TEXT NOT NULL DEFAULT '',
                    last_name TEXT NOT NULL DEFAULT '',
                    is_admin INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    chat_context TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS leads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    company TEXT,
                    email TEXT,
                    phone TEXT,
                    value REAL,
                    notes TEXT,
                    status TEXT NOT NULL DEFAULT 'Interest',
                    source TEXT,
                    card_order INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS conversations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    function_results TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS chat_tasks (
                    id TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    conversation_id INTEGER REFERENCES conversations(id) ON DELETE SET NULL,
                    session_token TEXT NOT NULL,
                    message TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'PENDING',
                    status_message TEXT,
                    result TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                CREATE INDEX IF NOT EXISTS idx_leads_user_status ON leads(user_id, status);
                CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);
                CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
                CREATE INDEX IF NOT EXISTS idx_chat_tasks_state ON chat_tasks(state);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, user: &NewUser) -> Result<User> {
        let inserted = self.conn.execute(
            "INSERT INTO users (email, password_hash, first_name, last_name, is_admin) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.email.trim(),
                user.password_hash,
                user.first_name,
                user.last_name,
                user.is_admin
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(CrmError::DuplicateUser {
                    email: user.email.trim().to_string(),
                }
                .into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert user")),
        }
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, password_hash, first_name, last_name, is_admin, created_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, password_hash, first_name, last_name, is_admin, created_at FROM users WHERE email = ?1",
                params![email.trim()],
                user_from_row,
            )
            .optional()
            .context("Failed to query user by email")
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(&self, token: &str, user_id: i64, ttl_hours: i64) -> Result<Session> {
        self.conn
            .execute(
                "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, datetime('now', ?3))",
                params![token, user_id, format!("{:+} hours", ttl_hours)],
            )
            .context("Failed to insert session")?;
        self.conn
            .query_row(
                "SELECT token, user_id, created_at, expires_at FROM sessions WHERE token = ?1",
                params![token],
                session_from_row,
            )
            .context("Session not found after insert")
    }

    /// Look up a live session. Expired sessions are treated as absent.
    pub fn get_session(&self, token: &str) -> Result<Option<Session>> {
        self.conn
            .query_row(
                "SELECT token, user_id, created_at, expires_at FROM sessions
                 WHERE token = ?1 AND expires_at > datetime('now')",
                params![token],
                session_from_row,
            )
            .optional()
            .context("Failed to query session")
    }

    pub fn delete_session(&self, token: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .context("Failed to delete session")?;
        Ok(count > 0)
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM sessions WHERE expires_at <= datetime('now')",
                [],
            )
            .context("Failed to purge expired sessions")
    }

    pub fn get_chat_context(&self, token: &str) -> Result<Vec<ContextEntry>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT chat_context FROM sessions WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query chat context")?;
        match raw {
            Some(json) => serde_json::from_str(&json).context("Failed to parse chat context JSON"),
            None => Ok(Vec::new()),
        }
    }

    /// Append entries to the session's context, keeping only the newest `keep`.
    pub fn push_chat_context(&self, token: &str, entries: &[ContextEntry], keep: usize) -> Result<()> {
        let mut context = self.get_chat_context(token)?;
        context.extend_from_slice(entries);
        if context.len() > keep {
            context.drain(..context.len() - keep);
        }
        let json = serde_json::to_string(&context).context("Failed to serialize chat context")?;
        self.conn
            .execute(
                "UPDATE sessions SET chat_context = ?1 WHERE token = ?2",
                params![json, token],
            )
            .context("Failed to update chat context")?;
        Ok(())
    }

    pub fn clear_chat_context(&self, token: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET chat_context = '[]' WHERE token = ?1",
                params![token],
            )
            .context("Failed to clear chat context")?;
        Ok(())
    }

    // ── Leads ─────────────────────────────────────────────────────────

    /// All of a user's leads in board order, then card order within a stage.
    pub fn list_leads(&self, user_id: i64) -> Result<Vec<Lead>> {
        let sql = format!(
            "SELECT {} FROM leads WHERE user_id = ?1 ORDER BY {}, card_order, id",
            LEAD_COLUMNS, STAGE_ORDER_SQL
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_leads")?;
        let rows = stmt
            .query_map(params![user_id], LeadRow::from_row)
            .context("Failed to query leads")?;
        let mut leads = Vec::new();
        for row in rows {
            let r = row.context("Failed to read lead row")?;
            leads.push(r.into_lead()?);
        }
        Ok(leads)
    }

    pub fn get_lead(&self, user_id: i64, id: i64) -> Result<Option<Lead>> {
        let sql = format!(
            "SELECT {} FROM leads WHERE id = ?1 AND user_id = ?2",
            LEAD_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id, user_id], LeadRow::from_row)
            .optional()
            .context("Failed to query lead")?;
        row.map(LeadRow::into_lead).transpose()
    }

    /// Card order that places a lead last in `stage`.
    pub fn next_card_order(&self, user_id: i64, stage: Stage) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM leads WHERE user_id = ?1 AND status = ?2",
                params![user_id, stage.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count leads in stage")?;
        Ok(count + 1)
    }

    pub fn create_lead(&self, user_id: i64, lead: &NewLead) -> Result<Lead> {
        let name = lead.name.trim();
        if name.is_empty() {
            return Err(CrmError::BadRequest("Lead name is required".into()).into());
        }
        let status = lead.status.unwrap_or_default();
        let card_order = self.next_card_order(user_id, status)?;
        self.conn
            .execute(
                "INSERT INTO leads (user_id, name, company, email, phone, value, notes, status, source, card_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    user_id,
                    name,
                    lead.company,
                    lead.email,
                    lead.phone,
                    lead.value,
                    lead.notes,
                    status.as_str(),
                    lead.source,
                    card_order
                ],
            )
            .context("Failed to insert lead")?;
        let id = self.conn.last_insert_rowid();
        self.get_lead(user_id, id)?
            .context("Lead not found after insert")
    }

    /// Apply a partial update atomically. Returns `None` when the lead does
    /// not exist or belongs to another user. A stage change without an
    /// explicit card order puts the card last in its new column.
    pub fn update_lead(&self, user_id: i64, id: i64, patch: &LeadPatch) -> Result<Option<Lead>> {
        let Some(current) = self.get_lead(user_id, id)? else {
            return Ok(None);
        };
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(CrmError::BadRequest("Lead name cannot be empty".into()).into());
        }

        let mut sets: Vec<(&'static str, Value)> = Vec::new();
        if let Some(v) = &patch.name {
            sets.push(("name", Value::Text(v.trim().to_string())));
        }
        if let Some(v) = &patch.company {
            sets.push(("company", Value::Text(v.clone())));
        }
        if let Some(v) = &patch.email {
            sets.push(("email", Value::Text(v.clone())));
        }
        if let Some(v) = &patch.phone {
            sets.push(("phone", Value::Text(v.clone())));
        }
        if let Some(v) = patch.value {
            sets.push(("value", Value::Real(v)));
        }
        if let Some(v) = &patch.notes {
            sets.push(("notes", Value::Text(v.clone())));
        }
        if let Some(v) = &patch.source {
            sets.push(("source", Value::Text(v.clone())));
        }
        if let Some(stage) = patch.status {
            sets.push(("status", Value::Text(stage.as_str().to_string())));
        }
        let card_order = match (patch.card_order, patch.status) {
            (Some(order), _) => Some(order),
            (None, Some(stage)) if stage != current.status => {
                Some(self.next_card_order(user_id, stage)?)
            }
            _ => None,
        };
        if let Some(order) = card_order {
            sets.push(("card_order", Value::Integer(order)));
        }

        if sets.is_empty() {
            return Ok(Some(current));
        }

        let assignments: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ?{}", column, i + 1))
            .collect();
        let sql = format!(
            "UPDATE leads SET {}, updated_at = datetime('now') WHERE id = ?{} AND user_id = ?{}",
            assignments.join(", "),
            sets.len() + 1,
            sets.len() + 2
        );
        let mut values: Vec<Value> = sets.into_iter().map(|(_, v)| v).collect();
        values.push(Value::Integer(id));
        values.push(Value::Integer(user_id));

        // Single statement, so the update is atomic without a transaction.
        self.conn
            .execute(&sql, params_from_iter(values.iter()))
            .context("Failed to update lead")?;
        self.get_lead(user_id, id)
    }

    /// Move a card to `stage` at `card_order` (drag and drop).
    pub fn move_lead(&self, user_id: i64, id: i64, stage: Stage, card_order: i64) -> Result<Option<Lead>> {
        let count = self
            .conn
            .execute(
                "UPDATE leads SET status = ?1, card_order = ?2, updated_at = datetime('now') WHERE id = ?3 AND user_id = ?4",
                params![stage.as_str(), card_order, id, user_id],
            )
            .context("Failed to move lead")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_lead(user_id, id)
    }

    pub fn delete_lead(&self, user_id: i64, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM leads WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete lead")?;
        Ok(count > 0)
    }

    // ── Conversations ─────────────────────────────────────────────────

    pub fn create_conversation(&self, user_id: i64, title: &str) -> Result<Conversation> {
        self.conn
            .execute(
                "INSERT INTO conversations (user_id, title) VALUES (?1, ?2)",
                params![user_id, title],
            )
            .context("Failed to insert conversation")?;
        let id = self.conn.last_insert_rowid();
        self.get_conversation(user_id, id)?
            .context("Conversation not found after insert")
    }

    /// Most recently active first.
    pub fn list_conversations(&self, user_id: i64) -> Result<Vec<Conversation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, title, created_at, updated_at FROM conversations
                 WHERE user_id = ?1 ORDER BY updated_at DESC, id DESC",
            )
            .context("Failed to prepare list_conversations")?;
        let rows = stmt
            .query_map(params![user_id], conversation_from_row)
            .context("Failed to query conversations")?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row.context("Failed to read conversation row")?);
        }
        Ok(conversations)
    }

    pub fn get_conversation(&self, user_id: i64, id: i64) -> Result<Option<Conversation>> {
        self.conn
            .query_row(
                "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                conversation_from_row,
            )
            .optional()
            .context("Failed to query conversation")
    }

    pub fn rename_conversation(&self, user_id: i64, id: i64, title: &str) -> Result<Option<Conversation>> {
        let count = self
            .conn
            .execute(
                "UPDATE conversations SET title = ?1, updated_at = datetime('now') WHERE id = ?2 AND user_id = ?3",
                params![title, id, user_id],
            )
            .context("Failed to rename conversation")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_conversation(user_id, id)
    }

    pub fn delete_conversation(&self, user_id: i64, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete conversation")?;
        Ok(count > 0)
    }

    pub fn touch_conversation(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to touch conversation")?;
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn add_message(
        &self,
        conversation_id: i64,
        role: MessageRole,
        content: &str,
        function_results: Option<&[FunctionResult]>,
    ) -> Result<Message> {
        let results_json = function_results
            .filter(|r| !r.is_empty())
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize function results")?;
        self.conn
            .execute(
                "INSERT INTO messages (conversation_id, role, content, function_results) VALUES (?1, ?2, ?3, ?4)",
                params![conversation_id, role.as_str(), content, results_json],
            )
            .context("Failed to insert message")?;
        let id = self.conn.last_insert_rowid();
        self.touch_conversation(conversation_id)?;
        let row = self
            .conn
            .query_row(
                "SELECT id, conversation_id, role, content, function_results, created_at FROM messages WHERE id = ?1",
                params![id],
                MessageRow::from_row,
            )
            .context("Message not found after insert")?;
        row.into_message()
    }

    /// Messages of a conversation, oldest first.
    pub fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, conversation_id, role, content, function_results, created_at FROM messages
                 WHERE conversation_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![conversation_id], MessageRow::from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let r = row.context("Failed to read message row")?;
            messages.push(r.into_message()?);
        }
        Ok(messages)
    }

    // ── Chat tasks ────────────────────────────────────────────────────

    pub fn create_task(&self, task: &NewChatTask) -> Result<ChatTask> {
        self.conn
            .execute(
                "INSERT INTO chat_tasks (id, user_id, conversation_id, session_token, message) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task.id,
                    task.user_id,
                    task.conversation_id,
                    task.session_token,
                    task.message
                ],
            )
            .context("Failed to insert chat task")?;
        self.get_task_by_id(&task.id)?
            .context("Chat task not found after insert")
    }

    /// A task as seen by its owner; other users' tasks are absent.
    pub fn get_task(&self, user_id: i64, id: &str) -> Result<Option<ChatTask>> {
        Ok(self
            .get_task_by_id(id)?
            .filter(|task| task.user_id == user_id))
    }

    pub fn get_task_by_id(&self, id: &str) -> Result<Option<ChatTask>> {
        let sql = format!("SELECT {} FROM chat_tasks WHERE id = ?1", TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()
            .context("Failed to query chat task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// PENDING → PROCESSING. Returns false if the task was not pending.
    pub fn mark_task_processing(&self, id: &str, status_message: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE chat_tasks SET state = 'PROCESSING', status_message = ?1, started_at = datetime('now')
                 WHERE id = ?2 AND state = 'PENDING'",
                params![status_message, id],
            )
            .context("Failed to mark chat task processing")?;
        Ok(count > 0)
    }

    /// PROCESSING → SUCCESS. Returns false if the task was not processing.
    pub fn complete_task(&self, id: &str, result: &ChatResult) -> Result<bool> {
        let json = serde_json::to_string(result).context("Failed to serialize chat result")?;
        let count = self
            .conn
            .execute(
                "UPDATE chat_tasks SET state = 'SUCCESS', result = ?1, completed_at = datetime('now')
                 WHERE id = ?2 AND state = 'PROCESSING'",
                params![json, id],
            )
            .context("Failed to complete chat task")?;
        Ok(count > 0)
    }

    /// PENDING or PROCESSING → FAILURE. Returns false if already terminal.
    pub fn fail_task(&self, id: &str, error: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE chat_tasks SET state = 'FAILURE', error = ?1, completed_at = datetime('now')
                 WHERE id = ?2 AND state IN ('PENDING', 'PROCESSING')",
                params![error, id],
            )
            .context("Failed to fail chat task")?;
        Ok(count > 0)
    }

    /// Fail every unfinished task. Used at startup, when nothing can still be
    /// working on them.
    pub fn fail_orphaned_tasks(&self, reason: &str) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE chat_tasks SET state = 'FAILURE', error = ?1, completed_at = datetime('now')
                 WHERE state IN ('PENDING', 'PROCESSING')",
                params![reason],
            )
            .context("Failed to fail orphaned chat tasks")
    }

    /// Delete finished tasks completed more than `older_than_hours` ago.
    pub fn prune_tasks(&self, older_than_hours: i64) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM chat_tasks WHERE state IN ('SUCCESS', 'FAILURE')
                 AND completed_at <= datetime('now', ?1)",
                params![format!("{:+} hours", -older_than_hours)],
            )
            .context("Failed to prune chat tasks")
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        is_admin: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        token: row.get(0)?,
        user_id: row.get(1)?,
        created_at: row.get(2)?,
        expires_at: row.get(3)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// Intermediate row struct for leads before the status string is parsed.
struct LeadRow {
    id: i64,
    user_id: i64,
    name: String,
    company: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    value: Option<f64>,
    notes: Option<String>,
    status: String,
    source: Option<String>,
    card_order: i64,
    created_at: String,
    updated_at: String,
}

impl LeadRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            company: row.get(3)?,
            email: row.get(4)?,
            phone: row.get(5)?,
            value: row.get(6)?,
            notes: row.get(7)?,
            status: row.get(8)?,
            source: row.get(9)?,
            card_order: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_lead(self) -> Result<Lead> {
        let status = Stage::from_str(&self.status).context("Failed to parse lead status")?;
        Ok(Lead {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            company: self.company,
            email: self.email,
            phone: self.phone,
            value: self.value,
            notes: self.notes,
            status,
            source: self.source,
            card_order: self.card_order,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct MessageRow {
    id: i64,
    conversation_id: i64,
    role: String,
    content: String,
    function_results: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            function_results: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let role = MessageRole::from_str(&self.role).context("Failed to parse message role")?;
        let function_results = self
            .function_results
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse message function results")?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            role,
            content: self.content,
            function_results,
            created_at: self.created_at,
        })
    }
}

struct TaskRow {
    id: String,
    user_id: i64,
    conversation_id: Option<i64>,
    session_token: String,
    message: String,
    state: String,
    status_message: Option<String>,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            conversation_id: row.get(2)?,
            session_token: row.get(3)?,
            message: row.get(4)?,
            state: row.get(5)?,
            status_message: row.get(6)?,
            result: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn into_task(self) -> Result<ChatTask> {
        let state = TaskState::from_str(&self.state).context("Failed to parse task state")?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse task result JSON")?;
        Ok(ChatTask {
            id: self.id,
            user_id: self.user_id,
            conversation_id: self.conversation_id,
            session_token: self.session_token,
            message: self.message,
            state,
            status_message: self.status_message,
            result,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
