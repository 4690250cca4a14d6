//! Attachment download job.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::message_send::OutboxContext;
use super::{decode, encode, transport_failure};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::registry::JobFactory;

/// Persisted fields of an [`AttachmentDownloadJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDownloadPayload {
    pub attachment_id: i64,
}

/// Downloads the body of a received attachment.
pub struct AttachmentDownloadJob {
    payload: AttachmentDownloadPayload,
    ctx: Arc<OutboxContext>,
}

impl AttachmentDownloadJob {
    pub const FACTORY_KEY: &'static str = "AttachmentDownloadJob";

    #[must_use]
    pub const fn new(attachment_id: i64, ctx: Arc<OutboxContext>) -> Self {
        Self {
            payload: AttachmentDownloadPayload { attachment_id },
            ctx,
        }
    }
}

impl fmt::Debug for AttachmentDownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentDownloadJob")
            .field("attachment_id", &self.payload.attachment_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for AttachmentDownloadJob {
    fn factory_key(&self) -> &'static str {
        Self::FACTORY_KEY
    }

    fn max_failure_count(&self) -> u32 {
        2
    }

    fn lane(&self) -> Lane {
        Lane::Media
    }

    fn serialize(&self) -> AppResult<Vec<u8>> {
        encode(&self.payload)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let id = self.payload.attachment_id;
        let Some(attachment) = self.ctx.outbox.attachment(id).await? else {
            return Err(JobError::Permanent(format!("attachment {id} not found")));
        };
        if attachment.is_downloaded() {
            debug!(job_id = %ctx.id, attachment_id = id, "Attachment already downloaded");
            return Ok(());
        }
        if !attachment.is_uploaded() {
            return Err(JobError::Permanent(format!("attachment {id} has no url")));
        }

        let data = self
            .ctx
            .transfer
            .download(&attachment)
            .await
            .map_err(|e| transport_failure(&e))?;
        debug!(job_id = %ctx.id, attachment_id = id, bytes = data.len(), "Attachment downloaded");
        self.ctx.outbox.store_download(id, data).await?;
        Ok(())
    }
}

/// Rebuilds [`AttachmentDownloadJob`]s from storage.
pub struct AttachmentDownloadFactory {
    ctx: Arc<OutboxContext>,
}

impl AttachmentDownloadFactory {
    #[must_use]
    pub const fn new(ctx: Arc<OutboxContext>) -> Self {
        Self { ctx }
    }
}

impl JobFactory for AttachmentDownloadFactory {
    fn factory_key(&self) -> &'static str {
        AttachmentDownloadJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        let payload: AttachmentDownloadPayload = decode(payload)?;
        Ok(Arc::new(AttachmentDownloadJob {
            payload,
            ctx: self.ctx.clone(),
        }))
    }
}
