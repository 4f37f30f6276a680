//! Work queue backends.
//!
//! A queue holds two lists: `pending` (claim order) and `processing` (claimed,
//! not yet acknowledged). A task id lives in at most one of them at a time.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::QueueError;
use crate::tasks::Task;

pub mod libsql;
pub mod memory;

pub use self::libsql::LibSqlQueue;
pub use memory::InMemoryQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends a snapshot of `task` to the tail of the pending list.
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError>;

    /// Atomically moves the head of pending to the tail of processing, waiting
    /// up to `timeout` for one to show up. `None` on timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>, QueueError>;

    /// Removes the first processing entry for `task_id`. No-op if absent.
    async fn acknowledge(&self, task_id: &str) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Drops every entry from both lists.
    async fn clear(&self) -> Result<(), QueueError>;
}
