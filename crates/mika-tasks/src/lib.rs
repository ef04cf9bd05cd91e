//! Supervised background task pool.
//!
//! Every background job (memory extraction, topic summary, dream run) goes
//! through the supervisor: tasks are registered under a dedupe key
//! (`mem:<session>`, `topic:<session>`, ...) so a running task for the same
//! key is never restarted, failures are logged without reaching the reply
//! path, and shutdown waits a bounded grace period before aborting.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TaskSupervisor {
    tasks: Arc<DashMap<String, JoinHandle<()>>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Spawn `fut` under `key` unless a task with that key is still running.
    /// Returns whether the task was actually spawned.
    pub fn spawn<F>(&self, name: &str, key: &str, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        // Reap a finished handle first so the key becomes free again.
        if let Some(entry) = self.tasks.get(key) {
            if !entry.value().is_finished() {
                debug!(name, key, "task already running, spawn skipped");
                return false;
            }
        }
        self.tasks.remove(key);

        let tasks = Arc::clone(&self.tasks);
        let key_owned = key.to_string();
        let name_owned = name.to_string();
        let handle = tokio::spawn(async move {
            fut.await;
            tasks.remove(&key_owned);
            debug!(name = %name_owned, key = %key_owned, "background task finished");
        });
        self.tasks.insert(key.to_string(), handle);
        debug!(name, key, "background task spawned");
        true
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tasks
            .get(key)
            .map(|entry| !entry.value().is_finished())
            .unwrap_or(false)
    }

    /// Await outstanding tasks up to `grace`, then abort stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        info!(outstanding = self.running_count(), "task supervisor shutting down");

        loop {
            if self.running_count() == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let keys: Vec<String> = self
                    .tasks
                    .iter()
                    .filter(|e| !e.value().is_finished())
                    .map(|e| e.key().clone())
                    .collect();
                for key in keys {
                    if let Some((_, handle)) = self.tasks.remove(&key) {
                        warn!(key = %key, "aborting background task past shutdown grace");
                        handle.abort();
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.tasks.clear();
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
