use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::handlers::HandlerRegistry;
use super::types::{Dispatcher, TaskOutcome};
use crate::config::DispatchConfig;
use crate::error::{Error, TaskError};
use crate::queue::WorkQueue;
use crate::tasks::{Task, TaskStore, TaskUpdate};

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn TaskStore>,
        handlers: Arc<HandlerRegistry>,
        config: DispatchConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Dispatcher {
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            queue,
            store,
            handlers,
            config,
            shutdown,
        }
    }

    /// Processing units currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.config.max_concurrent_tasks - self.permits.available_permits()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Asks `run` to stop claiming. In-flight units still finish.
    pub fn stop(&self) {
        if self.shutdown.send_replace(true) {
            warn!("Dispatcher is already stopping");
        } else {
            info!("Dispatcher stop requested");
        }
    }

    /// Claim loop. Returns after `stop` once every in-flight unit has finished.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut units = JoinSet::new();
        info!(
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "Dispatcher started"
        );

        while !*shutdown.borrow_and_update() {
            while let Some(finished) = units.try_join_next() {
                if let Err(e) = finished {
                    error!(error = %e, "Processing unit aborted");
                }
            }

            let delay = match self.permits.clone().try_acquire_owned() {
                Err(_) => self.config.saturated_delay,
                Ok(permit) => match self.queue.dequeue(self.config.claim_timeout).await {
                    Ok(Some(task)) => {
                        units.spawn(process_task(
                            self.queue.clone(),
                            self.store.clone(),
                            self.handlers.clone(),
                            task,
                            permit,
                        ));
                        continue;
                    }
                    Ok(None) => self.config.idle_delay,
                    Err(e) => {
                        error!(error = %e, "Error in dispatch loop");
                        self.config.error_backoff
                    }
                },
            };

            pause(&mut shutdown, delay).await;
        }

        info!(in_flight = units.len(), "Dispatcher stopping");
        while let Some(finished) = units.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Processing unit aborted");
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}

/// One claimed task, start to finish. Never returns an error: every outcome is
/// written to the task record and the queue entry is always acknowledged.
async fn process_task(
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    task: Task,
    _permit: OwnedSemaphorePermit,
) {
    info!(task_id = %task.id, task_type = %task.task_type, "Processing task");
    if let Err(e) = store
        .update(&task.id, TaskUpdate::processing(Utc::now()))
        .await
    {
        error!(task_id = %task.id, error = %e, "Failed to mark task processing");
    }

    let started = Instant::now();
    let result = run_handler(&handlers, &task).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let update = match result {
        Ok(TaskOutcome {
            deployment: Some(deployment),
            ..
        }) => {
            info!(task_id = %task.id, elapsed_ms, "Task deployed");
            TaskUpdate::running(deployment, elapsed_ms)
        }
        Ok(TaskOutcome { output_file, .. }) => {
            info!(task_id = %task.id, elapsed_ms, "Task completed");
            TaskUpdate::completed(output_file, elapsed_ms)
        }
        Err(e) => {
            error!(task_id = %task.id, error = ?e, "Task failed");
            TaskUpdate::failed(e.to_string())
        }
    };

    if let Err(e) = store.update(&task.id, update).await {
        error!(task_id = %task.id, error = %e, "Failed to persist task result");
    }
    if let Err(e) = queue.acknowledge(&task.id).await {
        error!(task_id = %task.id, error = %e, "Failed to acknowledge task");
    }
}

async fn run_handler(handlers: &HandlerRegistry, task: &Task) -> Result<TaskOutcome, Error> {
    let handler = handlers
        .get(task.task_type)
        .ok_or(TaskError::NoHandler(task.task_type))?;

    match AssertUnwindSafe(handler.handle(task)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(TaskError::Panicked {
            id: task.id.clone(),
        }
        .into()),
    }
}
