//! Common utilities and shared types for courier.
//!
//! This crate provides foundational components used across all courier crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: Ordered job identifiers via [`JobIdGenerator`]
//! - **Metrics**: Queue and ingestion counters via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use courier_common::{Config, JobIdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let ids = JobIdGenerator::new();
//!     let id = ids.next_id();
//!     println!("Generated ID: {id} (jobs dir {})", config.storage.jobs_dir);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod metrics;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use id::{JobId, JobIdGenerator};
pub use metrics::{Metrics, MetricsSnapshot, get_metrics};
