//! In-process chat task queue.
//!
//! `POST /chat/` persists a PENDING task row and hands its id to the queue.
//! A dispatcher drains the bounded channel and runs each job on its own tokio
//! task, at most `workers` at once. All state lives in the `chat_tasks`
//! table, so status polling only ever reads the database.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;

use leadboard_common::TaskState;

use super::chat::{ChatService, ChatTurn};
use super::db::DbHandle;
use super::models::{ChatTask, PROCESSING_STATUS};
use super::ws::{BoardEvent, UserEvent, publish};
use crate::errors::CrmError;

/// Error recorded on tasks that were in flight when the server stopped.
pub const ORPHANED_TASK_ERROR: &str = "Server restarted before the task finished";

/// How often the reaper prunes finished tasks and expired sessions.
pub const REAP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct ChatJob {
    pub task_id: String,
}

/// Handle for submitting chat jobs.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<ChatJob>,
}

impl TaskQueue {
    /// Spawn the dispatcher. The returned handle finishes once every
    /// `TaskQueue` clone has been dropped and the channel drains.
    pub fn start(
        db: DbHandle,
        chat: Arc<ChatService>,
        events: broadcast::Sender<UserEvent>,
        workers: usize,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let handle = tokio::spawn(dispatch(rx, semaphore, db, chat, events));
        (Self { tx }, handle)
    }

    /// Queue a persisted task for processing.
    pub fn enqueue(&self, task_id: impl Into<String>) -> Result<(), CrmError> {
        let job = ChatJob {
            task_id: task_id.into(),
        };
        self.tx.try_send(job).map_err(|e| {
            tracing::warn!(task_id = %e.into_inner().task_id, "Chat queue rejected task");
            CrmError::QueueClosed
        })
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<ChatJob>,
    semaphore: Arc<Semaphore>,
    db: DbHandle,
    chat: Arc<ChatService>,
    events: broadcast::Sender<UserEvent>,
) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let db = db.clone();
        let chat = chat.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let _permit = permit; // Hold until complete
            let task_id = job.task_id.clone();
            let worker = tokio::spawn(run_job(db.clone(), chat, events, job.task_id));
            if let Err(e) = worker.await {
                tracing::error!(task_id = %task_id, error = %e, "Chat task worker panicked");
                let reason = format!("Task worker crashed: {}", e);
                let id = task_id.clone();
                if let Err(e) = db.call(move |db| db.fail_task(&id, &reason)).await {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to mark crashed task");
                }
            }
        });
    }
    tracing::debug!("Chat task dispatcher stopped");
}

/// Process one task: PENDING → PROCESSING → SUCCESS, or FAILURE when
/// storage breaks underneath it.
pub async fn run_job(
    db: DbHandle,
    chat: Arc<ChatService>,
    events: broadcast::Sender<UserEvent>,
    task_id: String,
) {
    let task = match claim(&db, &task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            tracing::debug!(task_id = %task_id, "Chat task no longer pending; skipping");
            return;
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Failed to claim chat task");
            let reason = format!("{:#}", e);
            let id = task_id.clone();
            if let Err(e) = db.call(move |db| db.fail_task(&id, &reason)).await {
                tracing::error!(task_id = %task_id, error = %e, "Failed to mark unclaimable task");
            }
            return;
        }
    };

    let turn = ChatTurn {
        user_id: task.user_id,
        session_token: task.session_token.clone(),
        conversation_id: task.conversation_id,
        message: task.message.clone(),
    };
    tracing::info!(
        task_id = %task_id,
        user_id = task.user_id,
        model = chat.model_name(),
        "Processing chat task"
    );

    let id = task_id.clone();
    let finished = match chat.process_message(&turn).await {
        Ok(result) => db
            .call(move |db| db.complete_task(&id, &result))
            .await
            .map(|_| TaskState::Success),
        Err(e) => {
            tracing::warn!(task_id = %task_id, error = %e, "Chat task failed");
            let reason = format!("{:#}", e);
            db.call(move |db| db.fail_task(&id, &reason))
                .await
                .map(|_| TaskState::Failure)
        }
    };

    match finished {
        Ok(state) => {
            tracing::info!(task_id = %task_id, state = %state, "Chat task finished");
            publish(
                &events,
                task.user_id,
                BoardEvent::TaskFinished {
                    task_id,
                    state,
                },
            );
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Failed to record chat task outcome");
        }
    }
}

async fn claim(db: &DbHandle, task_id: &str) -> Result<Option<ChatTask>> {
    let id = task_id.to_string();
    db.call(move |db| {
        if !db.mark_task_processing(&id, PROCESSING_STATUS)? {
            return Ok(None);
        }
        db.get_task_by_id(&id)
    })
    .await
}

/// Spawn the periodic cleanup of finished tasks and expired sessions.
pub fn spawn_reaper(db: DbHandle, result_ttl_hours: i64, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = reap_once(&db, result_ttl_hours).await {
                tracing::warn!(error = %e, "Reaper pass failed");
            }
        }
    })
}

/// One cleanup pass. Returns (tasks pruned, sessions purged).
pub async fn reap_once(db: &DbHandle, result_ttl_hours: i64) -> Result<(usize, usize)> {
    let (tasks, sessions) = db
        .call(move |db| Ok((db.prune_tasks(result_ttl_hours)?, db.purge_expired_sessions()?)))
        .await?;
    if tasks > 0 || sessions > 0 {
        tracing::info!(tasks, sessions, "Pruned finished chat tasks and expired sessions");
    }
    Ok((tasks, sessions))
}
