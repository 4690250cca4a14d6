//! Persistent job queue for courier.
//!
//! - **Jobs**: the [`Job`] contract, [`JobRegistry`] and the concrete job types
//! - **Router**: [`JobQueue`] persists, routes, retries and resumes jobs
//! - **Lanes**: serial and parallel execution lanes, plus one serial lane per community
//! - **Storage**: in-memory and file-backed [`JobStorage`]
//! - **Receive**: batched processing of inbound messages

pub mod job;
pub mod jobs;
pub mod lanes;
pub mod queue;
pub mod receive;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod storage;

pub use job::{Job, JobContext, JobError, Lane, QueuedJob};
pub use jobs::*;
pub use lanes::{KeyedLanes, LaneMode, LaneRunner};
pub use queue::{JobEvent, JobEventKind, JobQueue};
pub use receive::{BatchOutcome, ReceiveContext, process_batch};
pub use registry::{JobFactory, JobRegistry};
pub use retry::RetryConfig;
pub use scheduler::DelayScheduler;
pub use storage::{FileJobStorage, InMemoryJobStorage, JobRecord, JobStorage, JobStorageService};
