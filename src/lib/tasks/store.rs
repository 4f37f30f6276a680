use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::types::{State, Task, TaskUpdate};
use crate::error::StoreError;

/// Persistent task records. `update` enforces the lifecycle state machine.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<(), StoreError>;

    async fn find_one(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Applies `update` to the stored record and returns the new version.
    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError>;
}

#[derive(Default)]
struct Records {
    tasks: HashMap<String, Task>,
    history: HashMap<String, Vec<State>>,
}

/// In-process store. Records every status a task passed through.
#[derive(Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<Records>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses the task has held, oldest first.
    pub async fn status_history(&self, id: &str) -> Vec<State> {
        self.inner
            .lock()
            .await
            .history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let mut records = self.inner.lock().await;
        if records.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate {
                id: task.id.clone(),
            });
        }
        records.history.insert(task.id.clone(), vec![task.status]);
        records.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn find_one(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.lock().await.tasks.get(id).cloned())
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task, StoreError> {
        let mut records = self.inner.lock().await;
        let status = update.status;
        let task = records
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        task.apply(update)?;
        let updated = task.clone();

        if let Some(status) = status {
            records.history.entry(id.to_string()).or_default().push(status);
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::TaskType;
    use chrono::Utc;
    use serde_json::Map;

    #[tokio::test]
    async fn update_tracks_history_and_rejects_bad_moves() {
        let store = InMemoryTaskStore::new();
        let task = Task::new(TaskType::ImageConvert, Map::new());
        store.insert(&task).await.unwrap();

        store
            .update(&task.id, TaskUpdate::processing(Utc::now()))
            .await
            .unwrap();
        store
            .update(&task.id, TaskUpdate::completed(None, 5))
            .await
            .unwrap();
        let err = store
            .update(&task.id, TaskUpdate::failed("late"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(
            store.status_history(&task.id).await,
            vec![State::Pending, State::Processing, State::Completed]
        );
    }

    #[tokio::test]
    async fn duplicate_insert_and_missing_update_fail() {
        let store = InMemoryTaskStore::new();
        let task = Task::new(TaskType::CsvAnalyze, Map::new());
        store.insert(&task).await.unwrap();

        assert!(matches!(
            store.insert(&task).await,
            Err(StoreError::Duplicate { .. })
        ));
        assert!(matches!(
            store.update("nope", TaskUpdate::failed("x")).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
