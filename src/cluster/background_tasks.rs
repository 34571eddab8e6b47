//! Named background tasks with a shared shutdown signal.
//!
//! Every long-running loop a broker owns (heartbeat, controller, reconciler,
//! retention, metrics refresh) is spawned through a [`BackgroundTaskRegistry`]
//! so it can be health-checked and stopped as a group.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// The task returned before shutdown was requested.
    Finished,
}

struct TaskInfo {
    handle: JoinHandle<()>,
    spawned_at: Instant,
}

struct Inner {
    tasks: HashMap<&'static str, TaskInfo>,
    shutting_down: bool,
}

/// Registry of named tasks. Shareable behind an `Arc`; every method takes `&self`.
pub struct BackgroundTaskRegistry {
    inner: Mutex<Inner>,
    shutdown_tx: watch::Sender<bool>,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                shutting_down: false,
            }),
            shutdown_tx,
        }
    }

    /// A receiver that flips to `true` when shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a named task. It is dropped at its next await point once
    /// shutdown is signalled. A task with the same name is aborted first.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            tracing::warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }
        if let Some(old) = inner.tasks.remove(name) {
            old.handle.abort();
            tracing::debug!(task = name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => tracing::debug!(task = name, "Task completed"),
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    tracing::debug!(task = name, "Task received shutdown signal");
                }
            }
        });

        tracing::info!(task = name, "Spawned background task");
        inner.tasks.insert(
            name,
            TaskInfo {
                handle,
                spawned_at: Instant::now(),
            },
        );
    }

    /// Spawn a short-lived task that is not tracked by name. Any number may
    /// run at once and all of them are dropped when shutdown is signalled.
    pub fn spawn_transient<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            tracing::debug!(task = name, "Ignoring transient spawn during shutdown");
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = task => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    tracing::debug!(task = name, "Transient task cancelled by shutdown");
                }
            }
        });
    }

    /// Run `task` every `interval`. Ticks missed while a run is slow are
    /// skipped rather than bunched up.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, interval: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                task().await;
            }
        });
    }

    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        let inner = self.inner.lock();
        let mut statuses: Vec<_> = inner
            .tasks
            .iter()
            .map(|(name, info)| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect();
        statuses.sort_by_key(|(name, _)| *name);
        statuses
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn task_uptime(&self, name: &str) -> Option<Duration> {
        self.inner
            .lock()
            .tasks
            .get(name)
            .map(|info| info.spawned_at.elapsed())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Signal every task and wait up to `timeout` for them to exit. Tasks
    /// still running at the deadline are aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        let tasks: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            inner.tasks.drain().collect()
        };

        tracing::info!(task_count = tasks.len(), "Initiating background task shutdown");
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, info) in tasks {
            let abort = info.handle.abort_handle();
            match tokio::time::timeout_at(deadline, info.handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task shutdown complete"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task panicked"),
                Err(_) => {
                    tracing::warn!(task = name, "Task did not respond to shutdown, aborting");
                    abort.abort();
                }
            }
        }

        tracing::info!("All background tasks shutdown complete");
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for (_, info) in self.inner.get_mut().tasks.drain() {
            info.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_spawn_and_health_check() {
        let registry = BackgroundTaskRegistry::new();
        registry.spawn("forever", std::future::pending());
        registry.spawn("done", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        let health = registry.health_check();
        assert_eq!(
            health,
            vec![("done", TaskStatus::Finished), ("forever", TaskStatus::Running)]
        );
        assert!(registry.task_uptime("forever").is_some());
    }

    #[tokio::test]
    async fn test_respawn_replaces_task() {
        let registry = BackgroundTaskRegistry::new();
        registry.spawn("a", std::future::pending());
        registry.spawn("a", std::future::pending());
        assert_eq!(registry.task_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_until_shutdown() {
        let registry = BackgroundTaskRegistry::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        registry.spawn_periodic("tick", Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(55)).await;
        registry.shutdown(Duration::from_secs(1)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 5, "expected at least 5 ticks, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(registry.is_shutting_down());
        assert_eq!(registry.task_count(), 0);
    }

    struct SetOnDrop(Arc<AtomicU64>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_transient_tasks_untracked_but_stopped_by_shutdown() {
        let registry = BackgroundTaskRegistry::new();
        let dropped = Arc::new(AtomicU64::new(0));
        for _ in 0..3 {
            let guard = SetOnDrop(Arc::clone(&dropped));
            registry.spawn_transient("relay", async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            });
        }
        assert_eq!(registry.task_count(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        registry.shutdown(Duration::from_millis(100)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_spawn_ignored_after_shutdown() {
        let registry = BackgroundTaskRegistry::new();
        let mut signal = registry.shutdown_signal();
        registry.shutdown(Duration::from_millis(100)).await;
        assert!(*signal.borrow_and_update());
        registry.spawn("late", std::future::pending());
        assert_eq!(registry.task_count(), 0);
    }
}
