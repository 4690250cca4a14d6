//! Attachment upload job.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{AppResult, JobId};
use courier_core::{Destination, MessageId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::message_send::OutboxContext;
use super::{decode, encode, transport_failure};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::registry::JobFactory;

/// Persisted fields of an [`AttachmentUploadJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUploadPayload {
    pub attachment_id: i64,
    pub destination: Destination,
    /// Outgoing message the attachment belongs to.
    #[serde(default)]
    pub message_id: Option<MessageId>,
    /// Send job waiting for this upload.
    pub message_send_job_id: JobId,
}

/// Uploads one attachment and wakes the send job waiting on it.
pub struct AttachmentUploadJob {
    payload: AttachmentUploadPayload,
    ctx: Arc<OutboxContext>,
}

impl AttachmentUploadJob {
    pub const FACTORY_KEY: &'static str = "AttachmentUploadJob";

    #[must_use]
    pub const fn new(
        attachment_id: i64,
        destination: Destination,
        message_id: Option<MessageId>,
        message_send_job_id: JobId,
        ctx: Arc<OutboxContext>,
    ) -> Self {
        Self {
            payload: AttachmentUploadPayload {
                attachment_id,
                destination,
                message_id,
                message_send_job_id,
            },
            ctx,
        }
    }

    /// Fail the waiting message and its send job along with this upload.
    async fn fail_message(&self, ctx: &JobContext, reason: &str) -> AppResult<()> {
        if let Some(id) = self.payload.message_id {
            self.ctx.outbox.mark_failed(id, reason).await?;
        }
        ctx.queue
            .storage()
            .mark_failed_permanently(self.payload.message_send_job_id)
            .await
    }
}

impl fmt::Debug for AttachmentUploadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentUploadJob")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for AttachmentUploadJob {
    fn factory_key(&self) -> &'static str {
        Self::FACTORY_KEY
    }

    fn max_failure_count(&self) -> u32 {
        20
    }

    fn lane(&self) -> Lane {
        Lane::Send
    }

    fn serialize(&self) -> AppResult<Vec<u8>> {
        encode(&self.payload)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let id = self.payload.attachment_id;
        let Some(attachment) = self.ctx.outbox.attachment(id).await? else {
            let reason = format!("attachment {id} not found");
            self.fail_message(ctx, &reason).await?;
            return Err(JobError::Permanent(reason));
        };

        if attachment.is_uploaded() {
            debug!(job_id = %ctx.id, attachment_id = id, "Attachment already uploaded");
        } else {
            if attachment.data.is_none() {
                let reason = format!("attachment {id} has no local data");
                self.fail_message(ctx, &reason).await?;
                return Err(JobError::Permanent(reason));
            }
            match self
                .ctx
                .transfer
                .upload(&attachment, &self.payload.destination)
                .await
            {
                Ok(url) => {
                    self.ctx.outbox.set_uploaded(id, &url).await?;
                    info!(job_id = %ctx.id, attachment_id = id, "Attachment uploaded");
                }
                Err(e) => {
                    let outcome = transport_failure(&e);
                    if matches!(outcome, JobError::Permanent(_)) {
                        self.fail_message(ctx, &e.to_string()).await?;
                    }
                    return Err(outcome);
                }
            }
        }

        let send_job = self.payload.message_send_job_id;
        match ctx.queue.resume_pending_send(send_job).await {
            Ok(true) => debug!(job_id = %ctx.id, send_job = %send_job, "Resumed send job"),
            Ok(false) => debug!(job_id = %ctx.id, send_job = %send_job, "Send job already queued"),
            Err(e) => warn!(job_id = %ctx.id, send_job = %send_job, error = %e, "Could not resume send job"),
        }
        Ok(())
    }
}

/// Rebuilds [`AttachmentUploadJob`]s from storage.
pub struct AttachmentUploadFactory {
    ctx: Arc<OutboxContext>,
}

impl AttachmentUploadFactory {
    #[must_use]
    pub const fn new(ctx: Arc<OutboxContext>) -> Self {
        Self { ctx }
    }
}

impl JobFactory for AttachmentUploadFactory {
    fn factory_key(&self) -> &'static str {
        AttachmentUploadJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        let payload: AttachmentUploadPayload = decode(payload)?;
        Ok(Arc::new(AttachmentUploadJob {
            payload,
            ctx: self.ctx.clone(),
        }))
    }
}
