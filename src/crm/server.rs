use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderValue, Method, header},
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::chat::ChatService;
use super::db::{CrmDb, DbHandle};
use super::llm::{ChatModel, model_from_config};
use super::tasks::{ORPHANED_TASK_ERROR, REAP_INTERVAL, TaskQueue, spawn_reaper};
use super::ws::UserEvent;
use crate::config::CrmConfig;

/// Configuration for the CRM server.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub crm: CrmConfig,
    /// Accept cross-origin requests from any origin and, unless `host` is
    /// set, listen on every interface.
    pub dev_mode: bool,
    /// Host given on the command line. Wins over dev mode and the config file.
    pub host: Option<String>,
}

impl ServerConfig {
    /// Interface the listener binds to.
    pub fn bind_host(&self) -> &str {
        match &self.host {
            Some(host) => host,
            None if self.dev_mode => "0.0.0.0",
            None => &self.crm.server.host,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// CORS for browser clients. Session cookies need credentials, so origins are
/// an explicit allow-list outside dev mode.
pub fn cors_layer(allowed_origins: &[String], dev_mode: bool) -> Result<CorsLayer> {
    if dev_mode {
        return Ok(CorsLayer::very_permissive());
    }
    let origins = allowed_origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o).with_context(|| format!("Invalid allowed origin: {}", o))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]))
}

/// Open (creating if needed) the database and fail tasks a previous process
/// left unfinished.
pub fn open_database(path: &Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = CrmDb::new(path).context("Failed to initialize CRM database")?;
    let orphaned = db.fail_orphaned_tasks(ORPHANED_TASK_ERROR)?;
    if orphaned > 0 {
        tracing::warn!(orphaned, "Failed chat tasks left over from a previous run");
    }
    Ok(DbHandle::new(db))
}

/// Wire the shared state around `model` and start the task queue. The
/// returned handle is the queue's dispatcher.
pub fn build_state(
    db: DbHandle,
    model: Arc<dyn ChatModel>,
    config: &CrmConfig,
) -> (SharedState, JoinHandle<()>) {
    let (events, _rx) = broadcast::channel::<UserEvent>(256);
    let chat = Arc::new(ChatService::new(
        db.clone(),
        model,
        events.clone(),
        config.assistant.context_messages,
    ));
    let (tasks, dispatcher) = TaskQueue::start(
        db.clone(),
        chat,
        events.clone(),
        config.tasks.workers,
        config.tasks.queue_capacity,
    );
    let state = Arc::new(AppState {
        db,
        events,
        tasks,
        session_ttl_hours: config.server.session_ttl_hours,
    });
    (state, dispatcher)
}

/// Start the CRM server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let problems = config.crm.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    let db = open_database(&config.crm.server.db_path)?;
    let model = model_from_config(&config.crm.assistant)?;
    tracing::info!(model = model.name(), "Assistant model ready");

    let (state, dispatcher) = build_state(db.clone(), model, &config.crm);
    let reaper = spawn_reaper(db, config.crm.tasks.result_ttl_hours, REAP_INTERVAL);

    let app = build_router(state)
        .layer(cors_layer(&config.crm.server.allowed_origins, config.dev_mode)?)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.bind_host(), config.crm.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("leadboard running at http://{}", local_addr);
    tracing::info!(%local_addr, dev_mode = config.dev_mode, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper.abort();
    dispatcher.abort();
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
