use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Pipeline;
use super::error::TalkError;

mod tasks;

pub(crate) use tasks::{ConnectivityProbe, OutboundQueueFlush};

/// Trait for implementing scheduled background tasks.
///
/// Tasks are executed on startup and periodically thereafter based on their configured interval.
/// Implementations should be idempotent and handle transient failures gracefully.
#[async_trait]
pub trait Task: Send + Sync {
    /// Returns the unique name of this task for logging and identification.
    fn name(&self) -> &'static str;

    /// Returns the interval between task executions.
    fn interval(&self) -> Duration;

    async fn execute(&self, pipeline: &Pipeline) -> Result<(), TalkError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Handles to the running task loops. Dropping it stops them after their current run;
/// [`Scheduler::shutdown`] also waits for them to finish.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn start(
        config: &SchedulerConfig,
        pipeline: Pipeline,
        tasks: Vec<Arc<dyn Task>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        if !config.enabled {
            tracing::info!(target: "talk::scheduler::start", "Scheduler disabled");
            return Self {
                shutdown,
                handles: Vec::new(),
            };
        }

        let handles = tasks
            .into_iter()
            .map(|task| {
                let pipeline = pipeline.clone();
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(run_task(task, pipeline, shutdown_rx))
            })
            .collect();

        Self { shutdown, handles }
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every loop to stop and waits for them to finish their current run.
    pub async fn shutdown(self) {
        // No receivers just means every loop already exited
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(
                    target: "talk::scheduler::shutdown",
                    "Scheduled task ended abnormally: {}",
                    e
                );
            }
        }
    }
}

async fn run_task(task: Arc<dyn Task>, pipeline: Pipeline, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(task.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(
        target: "talk::scheduler::run_task",
        "Starting task {} every {:?}",
        task.name(),
        task.interval()
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = task.execute(&pipeline).await {
                    tracing::warn!(
                        target: "talk::scheduler::run_task",
                        "Task {} failed: {}",
                        task.name(),
                        e
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!(
                        target: "talk::scheduler::run_task",
                        "Stopping task {}",
                        task.name()
                    );
                    break;
                }
            }
        }
    }
}
