use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::turn::TurnState;

/// Durable per-thread conversation state, so a conversation keeps its model,
/// persona and history across turns.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Save the latest state of a thread.
    async fn checkpoint(&self, thread_id: &str, state: &TurnState) -> Result<(), StoreError>;

    /// Load the most recent checkpoint for a thread.
    async fn load(&self, thread_id: &str) -> Result<Option<ThreadCheckpoint>, StoreError>;

    /// Remove a thread. Unknown ids are `StoreError::NotFound`.
    async fn delete(&self, thread_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadCheckpoint {
    pub thread_id: String,
    pub state: TurnState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteFailure {
    pub thread_id: String,
    pub error: String,
}

/// Outcome of a batch delete, one entry per requested id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchDeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

/// Delete every id independently; one failure never stops the rest.
pub async fn delete_threads(store: &dyn ThreadStore, thread_ids: &[String]) -> BatchDeleteReport {
    let mut report = BatchDeleteReport::default();
    for id in thread_ids {
        match store.delete(id).await {
            Ok(()) => report.deleted.push(id.clone()),
            Err(e) => {
                warn!(thread_id = %id, error = %e, "thread delete failed");
                report.failed.push(DeleteFailure {
                    thread_id: id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "thread batch delete"
    );
    report
}

// --- NoThreadStore ---

/// No persistence. Every turn starts from what the caller supplies.
pub struct NoThreadStore;

#[async_trait]
impl ThreadStore for NoThreadStore {
    async fn checkpoint(&self, _: &str, _: &TurnState) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Option<ThreadCheckpoint>, StoreError> {
        Ok(None)
    }

    async fn delete(&self, thread_id: &str) -> Result<(), StoreError> {
        Err(StoreError::NotFound(thread_id.to_string()))
    }
}

// --- FileThreadStore ---

/// Saves thread state to disk as JSON, one file per thread.
pub struct FileThreadStore {
    dir: PathBuf,
}

impl FileThreadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, thread_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !thread_id.is_empty()
            && thread_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(thread_id.to_string()));
        }
        Ok(self.dir.join(format!("{thread_id}.json")))
    }
}

#[async_trait]
impl ThreadStore for FileThreadStore {
    async fn checkpoint(&self, thread_id: &str, state: &TurnState) -> Result<(), StoreError> {
        let path = self.path(thread_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let now = Utc::now();
        let created_at = self
            .load(thread_id)
            .await?
            .map_or(now, |existing| existing.created_at);
        let checkpoint = ThreadCheckpoint {
            thread_id: thread_id.to_string(),
            state: state.clone(),
            created_at,
            updated_at: now,
        };
        let json = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| StoreError::Parse(e.to_string()))?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ThreadCheckpoint>, StoreError> {
        let path = self.path(thread_id)?;
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let checkpoint: ThreadCheckpoint =
                    serde_json::from_str(&json).map_err(|e| StoreError::Parse(e.to_string()))?;
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, thread_id: &str) -> Result<(), StoreError> {
        let path = self.path(thread_id)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(thread_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn state() -> TurnState {
        TurnState {
            messages: vec![Message::user("hello")],
            llm: Some("gpt-4.1-mini".into()),
            ..TurnState::default()
        }
    }

    #[tokio::test]
    async fn checkpoint_round_trip_keeps_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileThreadStore::new(dir.path().join("threads"));

        assert!(store.load("t1").await.unwrap().is_none());
        store.checkpoint("t1", &state()).await.unwrap();
        let first = store.load("t1").await.unwrap().unwrap();

        let mut next = state();
        next.messages.push(Message::assistant("hi"));
        store.checkpoint("t1", &next).await.unwrap();
        let second = store.load("t1").await.unwrap().unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.state.messages.len(), 2);
        assert_eq!(second.state.llm.as_deref(), Some("gpt-4.1-mini"));
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileThreadStore::new(dir.path());
        let err = store.checkpoint("../escape", &state()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn batch_delete_reports_each_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileThreadStore::new(dir.path());
        store.checkpoint("a", &state()).await.unwrap();
        store.checkpoint("b", &state()).await.unwrap();

        let ids = vec!["a".to_string(), "missing".to_string(), "b".to_string(), "x/y".to_string()];
        let report = delete_threads(&store, &ids).await;

        assert_eq!(report.deleted, vec!["a".to_string(), "b".to_string()]);
        let failed: Vec<&str> = report.failed.iter().map(|f| f.thread_id.as_str()).collect();
        assert_eq!(failed, vec!["missing", "x/y"]);
        assert!(report.failed[0].error.contains("not found"));
        assert!(store.load("a").await.unwrap().is_none());
    }
}
