//! Durable queue on the `work_queue` table.
//!
//! Both lists share one table; `list` tells them apart. A claim is a single
//! `UPDATE ... RETURNING` statement, so concurrent callers (in this process or
//! another one on the same database file) never receive the same row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, params};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{QueueStats, WorkQueue};
use crate::db::Db;
use crate::error::QueueError;
use crate::tasks::Task;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const CLAIM_SQL: &str = "UPDATE work_queue
    SET list = 'processing',
        position = (SELECT COALESCE(MAX(position), 0) + 1 FROM work_queue WHERE list = 'processing'),
        claimed_at = ?1
    WHERE id = (SELECT id FROM work_queue WHERE list = 'pending' ORDER BY position, id LIMIT 1)
    RETURNING payload";

pub struct LibSqlQueue {
    conn: Connection,
    poll_interval: Duration,
    // Wakes local waiters early; other processes are picked up by polling.
    available: Notify,
}

impl LibSqlQueue {
    pub fn new(db: &Db) -> Self {
        Self {
            conn: db.connection(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            available: Notify::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn try_claim(&self) -> Result<Option<Task>, QueueError> {
        let mut rows = self
            .conn
            .query(CLAIM_SQL, params![Utc::now().to_rfc3339()])
            .await
            .map_err(|e| QueueError::Backend(format!("claim: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(QueueError::Backend(format!("claim: {e}"))),
        };
        let payload: String = row
            .get(0)
            .map_err(|e| QueueError::Backend(format!("claim row parse: {e}")))?;
        Ok(Some(serde_json::from_str(&payload)?))
    }

    async fn count(&self, list: &str) -> Result<u64, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM work_queue WHERE list = ?1",
                params![list],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(QueueError::Backend(format!("stats: {e}"))),
        }
    }
}

#[async_trait]
impl WorkQueue for LibSqlQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        self.conn
            .execute(
                "INSERT INTO work_queue (list, position, task_id, payload, enqueued_at)
                 VALUES ('pending',
                         (SELECT COALESCE(MAX(position), 0) + 1 FROM work_queue WHERE list = 'pending'),
                         ?1, ?2, ?3)",
                params![task.id.as_str(), payload, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("enqueue: {e}")))?;

        debug!(task_id = %task.id, "Task enqueued");
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
                debug!(task_id = %task.id, "Task claimed");
                return Ok(Some(task));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = deadline.min(now + self.poll_interval);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, task_id: &str) -> Result<(), QueueError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM work_queue WHERE id = (
                    SELECT id FROM work_queue
                    WHERE list = 'processing' AND task_id = ?1
                    ORDER BY position LIMIT 1)",
                params![task_id],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("acknowledge: {e}")))?;

        if removed == 0 {
            debug!(task_id = %task_id, "Acknowledge found no processing entry");
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            pending: self.count("pending").await?,
            processing: self.count("processing").await?,
        })
    }

    async fn clear(&self) -> Result<(), QueueError> {
        self.conn
            .execute("DELETE FROM work_queue", ())
            .await
            .map_err(|e| QueueError::Backend(format!("clear: {e}")))?;
        Ok(())
    }
}
