//! CRM server: kanban lead board, sessions, and the chat assistant.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, CORS, ServerConfig)    │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │  auth.rs (AuthSession extractor)       │
//!                       │         │                                        │
//!                       │         │ POST /chat/ → TaskQueue::enqueue()      │
//!                       │         v                                        │
//!                       │  tasks.rs  (dispatcher, worker semaphore)        │
//!                       │         │                                        │
//!                       │         │ ChatService::process_message()         │
//!                       │         v                                        │
//!                       │  chat.rs  (prompt, lead functions)               │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  llm.rs   (ChatModel trait, OpenAiModel)         │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Server-only rows: `User`, `Session`, `ChatTask`             |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `ws`     | `BoardEvent` enum, per-user broadcast, socket loop          |
//!
//! ## Chat request flow
//!
//! 1. `POST /chat/` stores the user message and a PENDING `chat_tasks` row,
//!    then queues the task id.
//! 2. A worker marks it PROCESSING and runs the assistant, which may call
//!    one lead function before answering.
//! 3. The result is written to the task row (SUCCESS or FAILURE) and a
//!    `TaskFinished` event goes to the user's sockets.
//! 4. The client polls `GET /chat/status/{task_id}/` until the state is
//!    terminal.

pub mod api;
pub mod auth;
pub mod chat;
pub mod db;
pub mod llm;
pub mod models;
pub mod server;
pub mod tasks;
pub mod ws;
