//! Network and outbox contracts used by outbound jobs.
//!
//! Every network call reports failures as [`TransportError`] so that jobs
//! can tell rate limiting and permanent rejection apart from flaky links.

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{CommunityAddress, MessageId};
use crate::messages::{Destination, OutgoingMessage};

/// HTTP status used by servers to signal rate limiting.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// A failed network call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    /// HTTP status, when the failure came from a server response.
    pub status: Option<u16>,
    /// Whether the same request may succeed later.
    pub retryable: bool,
    pub message: String,
}

impl TransportError {
    /// A failure worth retrying (timeouts, dropped connections).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            status: None,
            retryable: true,
            message: message.into(),
        }
    }

    /// A server response with the given status.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            retryable: status >= 500,
            message: message.into(),
        }
    }

    /// A request the server will never accept.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: None,
            retryable: false,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self.status, Some(STATUS_TOO_MANY_REQUESTS))
    }

    /// Whether the job that made the call should be retried.
    ///
    /// Rate limiting is treated as permanent.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.retryable && !self.is_rate_limited()
    }
}

/// A locally stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: i64,
    pub content_type: String,
    /// Remote location once uploaded, or the source for downloads.
    #[serde(default)]
    pub url: Option<String>,
    /// Local body, present once uploaded from or downloaded to this device.
    #[serde(default)]
    pub data: Option<Vec<u8>>,
}

impl Attachment {
    #[must_use]
    pub fn is_uploaded(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.is_empty())
    }

    #[must_use]
    pub const fn is_downloaded(&self) -> bool {
        self.data.is_some()
    }
}

/// Sends encoded messages.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(
        &self,
        message: &OutgoingMessage,
        destination: &Destination,
    ) -> Result<(), TransportError>;
}

/// Local state of outgoing messages and their attachments.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Whether the user deleted the message before it was sent.
    async fn is_deleted(&self, id: MessageId) -> AppResult<bool>;

    /// Whether the message is still an outgoing row.
    async fn is_outgoing(&self, id: MessageId) -> AppResult<bool>;

    async fn mark_sending(&self, id: MessageId) -> AppResult<()>;

    async fn mark_sent(&self, id: MessageId) -> AppResult<()>;

    async fn mark_failed(&self, id: MessageId, error: &str) -> AppResult<()>;

    async fn attachment(&self, id: i64) -> AppResult<Option<Attachment>>;

    /// Record where an attachment was uploaded.
    async fn set_uploaded(&self, id: i64, url: &str) -> AppResult<()>;

    /// Store a downloaded attachment body.
    async fn store_download(&self, id: i64, data: Vec<u8>) -> AppResult<()>;
}

/// Moves attachment bodies to and from the file server.
#[async_trait]
pub trait AttachmentTransfer: Send + Sync {
    /// Upload and return the remote url.
    async fn upload(
        &self,
        attachment: &Attachment,
        destination: &Destination,
    ) -> Result<String, TransportError>;

    async fn download(&self, attachment: &Attachment) -> Result<Vec<u8>, TransportError>;
}

/// Community server endpoints used by background jobs.
#[async_trait]
pub trait CommunityApi: Send + Sync {
    async fn download_room_image(
        &self,
        community: &CommunityAddress,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Closed group administration.
#[async_trait]
pub trait GroupInviter: Send + Sync {
    /// Whether the local user holds the admin key of the group.
    async fn is_admin(&self, group_id: &str) -> AppResult<bool>;

    /// Send an invite to one member.
    async fn invite(&self, group_id: &str, member: &str) -> Result<(), TransportError>;

    /// Record the outcome of an invite round on the group's member list.
    async fn record_invites(
        &self,
        group_id: &str,
        sent: &[String],
        failed: &[String],
    ) -> AppResult<()>;
}

/// A notification forwarded to the push server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    /// Swarm the notification is for.
    pub recipient: String,
    /// Opaque encoded payload.
    pub data: String,
    /// Time to live in milliseconds.
    pub ttl_ms: u64,
}

/// Push notification server.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, payload: &PushPayload) -> Result<(), TransportError>;
}

pub type MessageTransportService = Arc<dyn MessageTransport>;
pub type OutboxService = Arc<dyn Outbox>;
pub type AttachmentTransferService = Arc<dyn AttachmentTransfer>;
pub type CommunityApiService = Arc<dyn CommunityApi>;
pub type GroupInviterService = Arc<dyn GroupInviter>;
pub type PushNotifierService = Arc<dyn PushNotifier>;
