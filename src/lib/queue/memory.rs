//! Single-process queue.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{QueueStats, WorkQueue};
use crate::error::QueueError;
use crate::tasks::Task;

struct Entry {
    task_id: String,
    payload: String,
}

#[derive(Default)]
struct Lists {
    pending: VecDeque<Entry>,
    processing: Vec<Entry>,
}

/// Both lists sit behind one lock, so a claim is a single critical section.
#[derive(Default)]
pub struct InMemoryQueue {
    lists: Mutex<Lists>,
    available: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_claim(&self) -> Result<Option<Task>, QueueError> {
        let mut lists = self.lists.lock().await;
        let Some(entry) = lists.pending.pop_front() else {
            return Ok(None);
        };
        // Claimed before decoding: an unreadable payload stays visible in
        // processing instead of vanishing or blocking the head.
        let decoded = serde_json::from_str(&entry.payload);
        lists.processing.push(entry);
        Ok(Some(decoded?))
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        self.lists.lock().await.pending.push_back(Entry {
            task_id: task.id.clone(),
            payload,
        });
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_claim().await? {
                return Ok(Some(task));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&self, task_id: &str) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().await;
        if let Some(idx) = lists.processing.iter().position(|e| e.task_id == task_id) {
            lists.processing.remove(idx);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let lists = self.lists.lock().await;
        Ok(QueueStats {
            pending: lists.pending.len() as u64,
            processing: lists.processing.len() as u64,
        })
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().await;
        lists.pending.clear();
        lists.processing.clear();
        Ok(())
    }
}
