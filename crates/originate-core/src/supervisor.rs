//! Supervised task tracking
//!
//! Every worker the engine spawns for one race (confirmation collectors, the
//! ringback pump) is registered here and is cancelled and joined when the race
//! ends, so no worker outlives the legs it touches.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a tracked task
#[derive(Debug)]
struct TaskHandle {
    id: usize,
    name: String,
    handle: JoinHandle<()>,
    started_at: Instant,
}

pub struct TaskSupervisor {
    scope: String,
    next_task_id: AtomicUsize,
    tasks: Mutex<Vec<TaskHandle>>,
    cancel_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl TaskSupervisor {
    pub fn new(scope: impl Into<String>, shutdown_timeout: Duration) -> Self {
        Self {
            scope: scope.into(),
            next_task_id: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            cancel_token: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Supervisor whose tasks are also cancelled when `parent` is.
    pub fn child_of(parent: &CancellationToken, scope: impl Into<String>, shutdown_timeout: Duration) -> Self {
        Self {
            scope: scope.into(),
            next_task_id: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
            cancel_token: parent.child_token(),
            shutdown_timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Spawn a tracked task. The task receives the supervisor's token and is
    /// dropped at its next await point once the token fires.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F) -> usize
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_name = name.into();
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let token = self.cancel_token.clone();
        let future = task(token.clone());
        let scope = self.scope.clone();
        let name_clone = task_name.clone();

        let handle = tokio::spawn(async move {
            debug!("Task started: {} [{}] in {}", name_clone, task_id, scope);
            tokio::select! {
                _ = future => {
                    debug!("Task completed: {} [{}] in {}", name_clone, task_id, scope);
                }
                _ = token.cancelled() => {
                    debug!("Task cancelled: {} [{}] in {}", name_clone, task_id, scope);
                }
            }
        });

        self.tasks.lock().push(TaskHandle {
            id: task_id,
            name: task_name,
            handle,
            started_at: Instant::now(),
        });
        task_id
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.handle.is_finished()).count()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Cancel every task and wait for them, aborting stragglers after the
    /// shutdown timeout.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let tasks: Vec<TaskHandle> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        let aborts: Vec<_> = tasks
            .iter()
            .map(|t| (t.id, t.name.clone(), t.started_at, t.handle.abort_handle()))
            .collect();
        let joined = tokio::time::timeout(
            self.shutdown_timeout,
            futures::future::join_all(tasks.into_iter().map(|t| t.handle)),
        )
        .await;

        if joined.is_err() {
            for (id, name, started_at, abort) in aborts {
                if !abort.is_finished() {
                    warn!(
                        "Force aborting task: {} [{}] in {} after {:?}",
                        name,
                        id,
                        self.scope,
                        started_at.elapsed()
                    );
                    abort.abort();
                }
            }
        }
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
