//! Outbound message job.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_common::AppResult;
use courier_core::{
    AttachmentTransferService, Destination, MessageTransportService, OutboxService,
    OutgoingMessage, TransportError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::attachment_upload::{AttachmentUploadJob, AttachmentUploadPayload};
use super::{decode, encode};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::registry::JobFactory;

/// Longest a single send may take before it counts as a failure.
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

/// Collaborators shared by the send, upload and download jobs.
#[derive(Clone)]
pub struct OutboxContext {
    pub outbox: OutboxService,
    pub transport: MessageTransportService,
    pub transfer: AttachmentTransferService,
}

impl OutboxContext {
    #[must_use]
    pub fn new(
        outbox: OutboxService,
        transport: MessageTransportService,
        transfer: AttachmentTransferService,
    ) -> Self {
        Self {
            outbox,
            transport,
            transfer,
        }
    }
}

/// Persisted fields of a [`MessageSendJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSendPayload {
    pub message: OutgoingMessage,
    pub destination: Destination,
}

/// Sends one message, uploading its attachments first.
pub struct MessageSendJob {
    payload: MessageSendPayload,
    ctx: Arc<OutboxContext>,
}

impl MessageSendJob {
    pub const FACTORY_KEY: &'static str = "MessageSendJob";

    #[must_use]
    pub const fn new(
        message: OutgoingMessage,
        destination: Destination,
        ctx: Arc<OutboxContext>,
    ) -> Self {
        Self {
            payload: MessageSendPayload {
                message,
                destination,
            },
            ctx,
        }
    }

    /// Submit upload jobs for attachments that are not on the file server yet.
    ///
    /// Returns how many attachments are still missing.
    async fn queue_uploads(&self, ctx: &JobContext) -> Result<usize, JobError> {
        let message = &self.payload.message;
        let mut missing = Vec::new();
        for id in &message.attachment_ids {
            match self.ctx.outbox.attachment(*id).await? {
                Some(attachment) if !attachment.is_uploaded() => missing.push(*id),
                Some(_) => {}
                None => warn!(attachment_id = id, "Attachment of outgoing message is gone"),
            }
        }
        if missing.is_empty() {
            return Ok(0);
        }

        // Uploads queued by an earlier attempt are still on their way.
        let pending: HashSet<i64> = ctx
            .queue
            .storage()
            .pending(AttachmentUploadJob::FACTORY_KEY)
            .await?
            .iter()
            .filter_map(|record| decode::<AttachmentUploadPayload>(&record.payload).ok())
            .map(|upload| upload.attachment_id)
            .collect();

        for id in missing.iter().filter(|id| !pending.contains(id)) {
            let upload = AttachmentUploadJob::new(
                *id,
                self.payload.destination.clone(),
                message.id,
                ctx.id,
                self.ctx.clone(),
            );
            ctx.queue.submit(upload).await?;
        }
        Ok(missing.len())
    }

    /// Whether a failed send should be dropped because the message no
    /// longer needs sending.
    async fn is_abandoned(&self) -> AppResult<bool> {
        let Some(id) = self.payload.message.id else {
            return Ok(false);
        };
        Ok(self.ctx.outbox.is_deleted(id).await? || !self.ctx.outbox.is_outgoing(id).await?)
    }

    async fn handle_send_error(&self, err: TransportError) -> Result<(), JobError> {
        let id = self.payload.message.id;
        if err.should_retry() {
            if self.is_abandoned().await? {
                debug!(message_id = ?id, "Message deleted while sending, dropping job");
                return Ok(());
            }
            return Err(JobError::Retryable(err.to_string()));
        }
        if let Some(id) = id {
            self.ctx.outbox.mark_failed(id, &err.to_string()).await?;
        }
        if err.is_rate_limited() {
            warn!(message_id = ?id, "Rate limited while sending message");
        }
        Err(JobError::Permanent(err.to_string()))
    }
}

impl fmt::Debug for MessageSendJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSendJob")
            .field("message_id", &self.payload.message.id)
            .field("destination", &self.payload.destination)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for MessageSendJob {
    fn factory_key(&self) -> &'static str {
        Self::FACTORY_KEY
    }

    fn max_failure_count(&self) -> u32 {
        10
    }

    fn lane(&self) -> Lane {
        Lane::Send
    }

    fn serialize(&self) -> AppResult<Vec<u8>> {
        encode(&self.payload)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let message = &self.payload.message;
        let outbox = &self.ctx.outbox;

        if let Some(id) = message.id {
            if outbox.is_deleted(id).await? {
                debug!(job_id = %ctx.id, message_id = %id, "Message deleted before send");
                return Ok(());
            }
            outbox.mark_sending(id).await?;
        }

        let is_outgoing = match message.id {
            Some(id) => outbox.is_outgoing(id).await?,
            None => false,
        };
        if !is_outgoing && !message.is_reaction {
            debug!(job_id = %ctx.id, "Message is no longer outgoing");
            return Ok(());
        }

        let missing = self.queue_uploads(ctx).await?;
        if missing > 0 {
            info!(job_id = %ctx.id, attachments = missing, "Waiting for attachment uploads");
            return Err(JobError::AwaitingDependency(format!(
                "{missing} attachment upload(s)"
            )));
        }

        let sent = tokio::time::timeout(
            SEND_TIMEOUT,
            self.ctx.transport.send(message, &self.payload.destination),
        )
        .await
        .unwrap_or_else(|_| Err(TransportError::transient("send timed out")));

        match sent {
            Ok(()) => {
                if let Some(id) = message.id {
                    outbox.mark_sent(id).await?;
                }
                debug!(job_id = %ctx.id, "Message sent");
                Ok(())
            }
            Err(e) => self.handle_send_error(e).await,
        }
    }
}

/// Rebuilds [`MessageSendJob`]s from storage.
pub struct MessageSendFactory {
    ctx: Arc<OutboxContext>,
}

impl MessageSendFactory {
    #[must_use]
    pub const fn new(ctx: Arc<OutboxContext>) -> Self {
        Self { ctx }
    }
}

impl JobFactory for MessageSendFactory {
    fn factory_key(&self) -> &'static str {
        MessageSendJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        let payload: MessageSendPayload = decode(payload)?;
        Ok(Arc::new(MessageSendJob {
            payload,
            ctx: self.ctx.clone(),
        }))
    }
}
