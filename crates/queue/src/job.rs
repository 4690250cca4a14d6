//! The job contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{AppError, AppResult, JobId};
use thiserror::Error;

use crate::queue::JobQueue;

/// Execution lane a job is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Serial lane for inbound messages.
    Receive,
    /// Parallel lane for outbound network work.
    Send,
    /// Parallel lane for media downloads.
    Media,
    /// Serial lane per community or group, keyed by
    /// [`CommunityAddress::lane_key`](courier_core::CommunityAddress::lane_key).
    Community(String),
}

impl Lane {
    /// Name used in logs and events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Receive => "rx",
            Self::Send => "tx",
            Self::Media => "media",
            Self::Community(_) => "community",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Community(key) => write!(f, "community:{key}"),
            other => f.write_str(other.name()),
        }
    }
}

/// How a job execution failed.
///
/// The router inspects only the variant, never the message.
#[derive(Debug, Error)]
pub enum JobError {
    /// Counted against the job's failure budget and retried after a backoff.
    #[error("{0}")]
    Retryable(String),

    /// Fails the job for good, regardless of its failure budget.
    #[error("{0}")]
    Permanent(String),

    /// The job is blocked on another job, which will resubmit it. Not counted.
    #[error("awaiting {0}")]
    AwaitingDependency(String),

    /// Some items of a batch failed. `replacement` carries only those items.
    #[error("{failed} of {total} items failed")]
    PartialBatch {
        failed: usize,
        total: usize,
        replacement: Option<Arc<dyn Job>>,
    },
}

impl From<AppError> for JobError {
    fn from(err: AppError) -> Self {
        if err.is_transient() {
            Self::Retryable(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

/// What a job sees while it executes.
#[derive(Clone)]
pub struct JobContext {
    pub id: JobId,
    pub failure_count: u32,
    /// Queue the job runs on, for submitting follow-up jobs.
    pub queue: JobQueue,
}

/// A persistent, retryable unit of work.
#[async_trait]
pub trait Job: Send + Sync + fmt::Debug {
    /// Key used to persist the job and find its factory on resume.
    fn factory_key(&self) -> &'static str;

    /// Failures after which the job is given up.
    fn max_failure_count(&self) -> u32;

    fn lane(&self) -> Lane;

    /// Encode the job's payload for storage.
    fn serialize(&self) -> AppResult<Vec<u8>>;

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// A job together with the bookkeeping the router keeps for it.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: JobId,
    pub failure_count: u32,
    pub job: Arc<dyn Job>,
}

impl QueuedJob {
    #[must_use]
    pub const fn new(id: JobId, failure_count: u32, job: Arc<dyn Job>) -> Self {
        Self {
            id,
            failure_count,
            job,
        }
    }

    #[must_use]
    pub fn factory_key(&self) -> &'static str {
        self.job.factory_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_display() {
        assert_eq!(Lane::Receive.to_string(), "rx");
        assert_eq!(Lane::Send.to_string(), "tx");
        assert_eq!(
            Lane::Community("https://chat.example.org.lobby".into()).to_string(),
            "community:https://chat.example.org.lobby"
        );
    }

    #[test]
    fn test_app_error_conversion() {
        assert!(matches!(
            JobError::from(AppError::Storage("busy".into())),
            JobError::Retryable(_)
        ));
        assert!(matches!(
            JobError::from(AppError::Serialization("bad".into())),
            JobError::Permanent(_)
        ));
    }
}
