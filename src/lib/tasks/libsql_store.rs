use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, params};
use tokio::sync::Mutex;
use tracing::debug;

use super::store::TaskStore;
use super::types::{Task, TaskUpdate};
use crate::db::Db;
use crate::error::StoreError;

/// Task records kept as JSON documents in the `tasks` table.
///
/// Updates are read-modify-write; the mutex serializes them within this process.
pub struct LibSqlTaskStore {
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlTaskStore {
    pub fn new(db: &Db) -> Self {
        Self {
            conn: db.connection(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT document FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Backend(format!("find_one: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let document: String = row
                    .get(0)
                    .map_err(|e| StoreError::Backend(format!("find_one row parse: {e}")))?;
                Ok(Some(serde_json::from_str(&document)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Backend(format!("find_one: {e}"))),
        }
    }
}

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.load(&task.id).await?.is_some() {
            return Err(StoreError::Duplicate {
                id: task.id.clone(),
            });
        }

        let document = serde_json::to_string(task)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO tasks (id, task_type, status, document, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task.id.as_str(),
                    task.task_type.as_str(),
                    task.status.as_str(),
                    document,
                    task.created_at.to_rfc3339(),
                    now
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("insert: {e}")))?;

        debug!(task_id = %task.id, task_type = %task.task_type, "Task record inserted");
        Ok(())
    }

    async fn find_one(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.load(id).await
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut task = self
            .load(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        task.apply(update)?;

        let document = serde_json::to_string(&task)?;
        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, document = ?2, updated_at = ?3 WHERE id = ?4",
                params![task.status.as_str(), document, Utc::now().to_rfc3339(), id],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("update: {e}")))?;

        debug!(task_id = %id, status = %task.status, "Task record updated");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::{DeploymentInfo, State, TaskType};
    use serde_json::{Map, json};

    #[tokio::test]
    async fn persists_deployment_lifecycle() {
        let db = Db::open_memory().await.unwrap();
        let store = LibSqlTaskStore::new(&db);

        let mut params = Map::new();
        params.insert("repoUrl".into(), json!("https://github.com/acme/app"));
        let task = Task::new(TaskType::GithubDeploy, params);
        store.insert(&task).await.unwrap();

        store
            .update(&task.id, TaskUpdate::processing(Utc::now()))
            .await
            .unwrap();
        let info = DeploymentInfo {
            repo_url: "https://github.com/acme/app".into(),
            port: Some(3001),
            is_running: true,
            ..Default::default()
        };
        store
            .update(&task.id, TaskUpdate::running(info, 1200))
            .await
            .unwrap();

        let stored = store.find_one(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, State::Running);
        assert_eq!(stored.deployment_info.unwrap().port, Some(3001));
        assert_eq!(stored.processing_time_ms, Some(1200));
    }

    #[tokio::test]
    async fn invalid_transition_leaves_record_untouched() {
        let db = Db::open_memory().await.unwrap();
        let store = LibSqlTaskStore::new(&db);
        let task = Task::new(TaskType::PdfExtract, Map::new());
        store.insert(&task).await.unwrap();

        let err = store
            .update(&task.id, TaskUpdate::completed(None, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let stored = store.find_one(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, State::Pending);
        assert!(store.find_one("missing").await.unwrap().is_none());
    }
}
