//! Named periodic jobs of the agent.
//!
//! The agent runs three loops: clock synchronization, partition refresh and
//! metrics publication. Each is registered here under a static name so it
//! can be health-checked and stopped together with the others.
//!
//! Ticks that fall due while the previous run of the same job is still in
//! flight are skipped rather than queued, so a slow job never runs twice
//! back to back to catch up.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Status of a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// The job's future returned on its own. Periodic jobs never do.
    Finished,
}

struct TaskInfo {
    handle: JoinHandle<()>,
    spawned_at: Instant,
}

/// Owns the agent's background jobs and their shutdown signal.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<&'static str, TaskInfo>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named task. A running task with the same name is aborted
    /// and replaced.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            tracing::warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }

        if let Some(previous) = self.tasks.remove(name) {
            previous.handle.abort();
            tracing::debug!(task = name, "Replaced running task");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = name, "Task finished");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = name, "Task stopped by shutdown");
                }
            }
        });

        tracing::info!(task = name, "Spawned background task");
        self.tasks.insert(
            name,
            TaskInfo {
                handle,
                spawned_at: Instant::now(),
            },
        );
    }

    /// Run `job` immediately and then every `period`.
    ///
    /// The job receives the tick number, starting at zero.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn_periodic_with_delay(name, Duration::ZERO, period, job);
    }

    /// Run `job` once `initial_delay` has elapsed and then every `period`.
    pub fn spawn_periodic_with_delay<F, Fut>(
        &mut self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        mut job: F,
    ) where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut timer = tokio::time::interval_at(start, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut tick = 0u64;
            loop {
                timer.tick().await;
                job(tick).await;
                tick = tick.wrapping_add(1);
            }
        });
    }

    /// `(name, status)` for every registered task.
    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks
            .iter()
            .map(|(name, info)| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect()
    }

    pub fn all_healthy(&self) -> bool {
        self.tasks.values().all(|info| !info.handle.is_finished())
    }

    /// Names of tasks that are no longer running.
    pub fn finished_tasks(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|(_, info)| info.handle.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|info| !info.handle.is_finished())
            .count()
    }

    pub fn task_uptime(&self, name: &str) -> Option<Duration> {
        self.tasks.get(name).map(|info| info.spawned_at.elapsed())
    }

    /// Signal every task and wait up to five seconds for them to stop.
    pub async fn shutdown_all(&mut self) {
        self.shutdown_all_with_timeout(Duration::from_secs(5)).await;
    }

    /// Signal every task and wait up to `timeout` in total; stragglers are
    /// aborted.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        tracing::info!(task_count = self.tasks.len(), "Stopping background tasks");
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, info) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(task = name, "Aborting task, shutdown deadline passed");
                info.handle.abort();
                continue;
            }

            let abort = info.handle.abort_handle();
            match tokio::time::timeout(remaining, info.handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    tracing::warn!(task = name, "Task ignored shutdown, aborting");
                    abort.abort();
                }
            }
        }

        tracing::info!("Background tasks stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for (_, info) in self.tasks.drain() {
                info.handle.abort();
            }
        }
    }
}
