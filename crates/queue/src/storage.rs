//! Durable job storage.
//!
//! A job record exists from submission until the job succeeds or fails
//! permanently. Removing a record while its job is queued cancels the job:
//! the router drops the next failure of a job whose record is gone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{AppError, AppResult, JobId};
use courier_core::encoding::base64_bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Persisted form of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub factory_key: String,
    pub id: JobId,
    pub failure_count: u32,
    /// Output of [`Job::serialize`](crate::Job::serialize).
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl JobRecord {
    #[must_use]
    pub fn new(
        id: JobId,
        factory_key: impl Into<String>,
        failure_count: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            factory_key: factory_key.into(),
            id,
            failure_count,
            payload,
        }
    }
}

/// Job persistence collaborator.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Insert or overwrite a record.
    async fn persist(&self, record: &JobRecord) -> AppResult<()>;

    /// All records of one job type, in no particular order.
    async fn pending(&self, factory_key: &str) -> AppResult<Vec<JobRecord>>;

    async fn load(&self, id: JobId) -> AppResult<Option<JobRecord>>;

    async fn mark_succeeded(&self, id: JobId) -> AppResult<()>;

    async fn mark_failed_permanently(&self, id: JobId) -> AppResult<()>;

    /// Remove a job so that it is never run again.
    async fn cancel(&self, id: JobId) -> AppResult<()>;

    async fn is_canceled(&self, id: JobId) -> AppResult<bool> {
        Ok(self.load(id).await?.is_none())
    }
}

/// Type alias for shared job storage.
pub type JobStorageService = Arc<dyn JobStorage>;

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<JobId, JobRecord>,
    succeeded: Vec<JobId>,
    failed: Vec<JobId>,
}

/// Job storage held in memory.
///
/// Keeps the ids of finished jobs so callers can inspect outcomes.
#[derive(Debug, Default)]
pub struct InMemoryJobStorage {
    state: RwLock<MemoryState>,
}

impl InMemoryJobStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    /// Ids passed to `mark_succeeded`, in call order.
    pub async fn succeeded(&self) -> Vec<JobId> {
        self.state.read().await.succeeded.clone()
    }

    /// Ids passed to `mark_failed_permanently`, in call order.
    pub async fn failed_permanently(&self) -> Vec<JobId> {
        self.state.read().await.failed.clone()
    }

    /// Every stored record ordered by id.
    pub async fn records(&self) -> Vec<JobRecord> {
        self.state.read().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn persist(&self, record: &JobRecord) -> AppResult<()> {
        self.state
            .write()
            .await
            .records
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn pending(&self, factory_key: &str) -> AppResult<Vec<JobRecord>> {
        Ok(self
            .state
            .read()
            .await
            .records
            .values()
            .filter(|r| r.factory_key == factory_key)
            .cloned()
            .collect())
    }

    async fn load(&self, id: JobId) -> AppResult<Option<JobRecord>> {
        Ok(self.state.read().await.records.get(&id).cloned())
    }

    async fn mark_succeeded(&self, id: JobId) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.records.remove(&id);
        state.succeeded.push(id);
        Ok(())
    }

    async fn mark_failed_permanently(&self, id: JobId) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.records.remove(&id);
        state.failed.push(id);
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> AppResult<()> {
        self.state.write().await.records.remove(&id);
        Ok(())
    }
}

/// Job storage with one JSON file per job.
///
/// Files are written to a temporary name and renamed into place, so a crash
/// mid-write leaves either the old record or the new one.
#[derive(Debug, Clone)]
pub struct FileJobStorage {
    dir: PathBuf,
}

impl FileJobStorage {
    /// Open (and create if needed) a job directory.
    pub async fn open(dir: impl AsRef<Path>) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened job storage");
        Ok(Self { dir })
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn remove(&self, id: JobId) -> AppResult<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_record(&self, path: &Path) -> AppResult<JobRecord> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl JobStorage for FileJobStorage {
    async fn persist(&self, record: &JobRecord) -> AppResult<()> {
        let path = self.path_for(record.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(record)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn pending(&self, factory_key: &str) -> AppResult<Vec<JobRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.read_record(&path).await {
                Ok(record) if record.factory_key == factory_key => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    // Unreadable records can never be resumed.
                    warn!(path = %path.display(), error = %e, "Removing unreadable job record");
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }
        Ok(records)
    }

    async fn load(&self, id: JobId) -> AppResult<Option<JobRecord>> {
        match self.read_record(&self.path_for(id)).await {
            Ok(record) => Ok(Some(record)),
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn mark_succeeded(&self, id: JobId) -> AppResult<()> {
        self.remove(id).await
    }

    async fn mark_failed_permanently(&self, id: JobId) -> AppResult<()> {
        self.remove(id).await
    }

    async fn cancel(&self, id: JobId) -> AppResult<()> {
        self.remove(id).await
    }
}
