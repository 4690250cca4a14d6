//! Message parsing contract.
//!
//! Turns an opaque inbound payload into a typed [`Message`] and its
//! [`Envelope`]. Decryption and signature checks live behind this trait.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{AppError, AppResult};
use thiserror::Error;

use crate::messages::{Envelope, Message};

/// Classification of a receive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiveErrorKind {
    /// The payload was already processed.
    Duplicate,
    /// The payload was sent by the local user and carries no sync target.
    SelfSend,
    /// The payload can never be processed; drop it.
    NonRetryable,
    /// Processing may succeed on a later attempt.
    Retryable,
}

impl fmt::Display for ReceiveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Duplicate => "duplicate",
            Self::SelfSend => "self_send",
            Self::NonRetryable => "non_retryable",
            Self::Retryable => "retryable",
        };
        f.write_str(name)
    }
}

/// Error raised while parsing or handling one inbound payload.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ReceiveError {
    pub kind: ReceiveErrorKind,
    pub message: String,
}

impl ReceiveError {
    #[must_use]
    pub fn new(kind: ReceiveErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ReceiveErrorKind::Duplicate, message)
    }

    #[must_use]
    pub fn self_send(message: impl Into<String>) -> Self {
        Self::new(ReceiveErrorKind::SelfSend, message)
    }

    #[must_use]
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ReceiveErrorKind::NonRetryable, message)
    }

    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ReceiveErrorKind::Retryable, message)
    }

    /// Whether the payload should be carried into a replacement job.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, ReceiveErrorKind::Retryable)
    }
}

/// Collaborator failures during receive are always worth another attempt.
impl From<AppError> for ReceiveError {
    fn from(err: AppError) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Inputs to a single parse call.
#[derive(Debug, Clone, Copy)]
pub struct ParseRequest<'a> {
    /// Raw payload bytes.
    pub data: &'a [u8],
    /// Server id when the payload came from a community.
    pub community_message_server_id: Option<i64>,
    /// Public key of the community server the batch was polled from.
    pub community_public_key: Option<&'a str>,
    /// Closed groups the local user is currently a member of.
    pub active_group_ids: &'a HashSet<String>,
    /// Closed group the batch was polled from.
    pub group_session_id: Option<&'a str>,
}

/// Message parsing collaborator.
#[async_trait]
pub trait MessageParser: Send + Sync {
    /// Decode one payload.
    async fn parse(&self, request: ParseRequest<'_>) -> Result<(Message, Envelope), ReceiveError>;
}

/// Duplicate detection used by parsers.
///
/// Replaying a payload that was already stored must be inert.
#[async_trait]
pub trait DuplicateCheck: Send + Sync {
    /// Whether a message from `sender` sent at `sent_timestamp` is already stored.
    async fn is_duplicate(&self, sender: &str, sent_timestamp: u64) -> AppResult<bool>;
}

/// Type alias for a shared parser.
pub type MessageParserService = Arc<dyn MessageParser>;
