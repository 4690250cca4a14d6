//! Batch receive job.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;
use courier_core::{CommunityAddress, MessageReceiveParameters};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{community_or_receive, decode, encode};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::receive::{ReceiveContext, process_batch};
use crate::registry::JobFactory;

/// Largest number of payloads put into one job by [`BatchReceiveJob::chunked`].
pub const BATCH_DEFAULT_SIZE: usize = 512;

/// Persisted fields of a [`BatchReceiveJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReceivePayload {
    pub messages: Vec<MessageReceiveParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_community: Option<CommunityAddress>,
    /// Older records name the community as `server.room`.
    #[serde(default, rename = "open_group_id", skip_serializing)]
    pub legacy_community_id: Option<String>,
}

impl BatchReceivePayload {
    fn community(&self) -> Option<CommunityAddress> {
        self.from_community.clone().or_else(|| {
            self.legacy_community_id
                .as_deref()
                .and_then(CommunityAddress::from_legacy_id)
        })
    }
}

/// Parses and applies a batch of inbound messages.
pub struct BatchReceiveJob {
    messages: Vec<MessageReceiveParameters>,
    from_community: Option<CommunityAddress>,
    ctx: Arc<ReceiveContext>,
}

impl BatchReceiveJob {
    pub const FACTORY_KEY: &'static str = "BatchMessageReceiveJob";

    #[must_use]
    pub const fn new(
        messages: Vec<MessageReceiveParameters>,
        from_community: Option<CommunityAddress>,
        ctx: Arc<ReceiveContext>,
    ) -> Self {
        Self {
            messages,
            from_community,
            ctx,
        }
    }

    /// Split `messages` into jobs of at most `batch_size` payloads each.
    #[must_use]
    pub fn chunked(
        messages: Vec<MessageReceiveParameters>,
        from_community: Option<&CommunityAddress>,
        ctx: &Arc<ReceiveContext>,
        batch_size: usize,
    ) -> Vec<Self> {
        messages
            .chunks(batch_size.max(1))
            .map(|chunk| Self::new(chunk.to_vec(), from_community.cloned(), ctx.clone()))
            .collect()
    }

    #[must_use]
    pub fn messages(&self) -> &[MessageReceiveParameters] {
        &self.messages
    }

    #[must_use]
    pub const fn from_community(&self) -> Option<&CommunityAddress> {
        self.from_community.as_ref()
    }

    /// The same job narrowed to `messages`.
    fn with_messages(&self, messages: Vec<MessageReceiveParameters>) -> Self {
        Self::new(messages, self.from_community.clone(), self.ctx.clone())
    }
}

impl fmt::Debug for BatchReceiveJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchReceiveJob")
            .field("messages", &self.messages.len())
            .field("from_community", &self.from_community)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for BatchReceiveJob {
    fn factory_key(&self) -> &'static str {
        Self::FACTORY_KEY
    }

    fn max_failure_count(&self) -> u32 {
        1
    }

    fn lane(&self) -> Lane {
        community_or_receive(self.from_community.as_ref())
    }

    fn serialize(&self) -> AppResult<Vec<u8>> {
        encode(&BatchReceivePayload {
            messages: self.messages.clone(),
            from_community: self.from_community.clone(),
            legacy_community_id: None,
        })
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let outcome = process_batch(
            &self.ctx,
            &self.messages,
            self.from_community.as_ref(),
            ctx.id,
        )
        .await;

        if outcome.is_success() {
            return Ok(());
        }
        info!(
            job_id = %ctx.id,
            failed = outcome.failures.len(),
            total = outcome.total,
            "Resubmitting failed messages"
        );
        let failed = outcome.failures.len();
        Err(JobError::PartialBatch {
            failed,
            total: outcome.total,
            replacement: Some(Arc::new(self.with_messages(outcome.failures))),
        })
    }
}

/// Rebuilds [`BatchReceiveJob`]s from storage.
pub struct BatchReceiveFactory {
    ctx: Arc<ReceiveContext>,
}

impl BatchReceiveFactory {
    #[must_use]
    pub const fn new(ctx: Arc<ReceiveContext>) -> Self {
        Self { ctx }
    }
}

impl JobFactory for BatchReceiveFactory {
    fn factory_key(&self) -> &'static str {
        BatchReceiveJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        let payload: BatchReceivePayload = decode(payload)?;
        let community = payload.community();
        Ok(Arc::new(BatchReceiveJob::new(
            payload.messages,
            community,
            self.ctx.clone(),
        )))
    }
}
