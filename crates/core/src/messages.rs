//! Inbound and outbound message types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::{CommunityAddress, MessageId};
use crate::encoding::base64_bytes;

/// Wire envelope that carried a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Account that produced the envelope.
    pub source: String,
    /// Envelope timestamp in milliseconds.
    pub timestamp: u64,
    /// Timestamp assigned by the storage server, if any.
    #[serde(default)]
    pub server_timestamp: Option<u64>,
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Sender account id (possibly blinded in communities).
    pub sender: String,
    /// For messages the local user sent from another device, the
    /// conversation partner the message was addressed to.
    #[serde(default)]
    pub sync_target: Option<String>,
    /// Sender-side timestamp in milliseconds.
    #[serde(default)]
    pub sent_timestamp: Option<u64>,
    /// Closed group the message belongs to.
    #[serde(default)]
    pub group_public_key: Option<String>,
    /// Server-assigned id when received from a community.
    #[serde(default)]
    pub community_server_message_id: Option<i64>,
    /// Storage-server hash of the payload.
    #[serde(default)]
    pub server_hash: Option<String>,
    /// Message content.
    pub kind: MessageKind,
}

impl Message {
    /// Conversation partner of a 1:1 message.
    ///
    /// Sync messages (sent by the local user from another device) belong to
    /// the conversation with their target, everything else to the sender.
    #[must_use]
    pub fn sender_or_sync(&self, local_account_id: Option<&str>) -> &str {
        match (&self.sync_target, local_account_id) {
            (Some(target), Some(local)) if self.sender == local => target,
            _ => &self.sender,
        }
    }

    /// Whether receiving this message may create a new conversation.
    #[must_use]
    pub const fn is_conversation_initiating(&self) -> bool {
        matches!(self.kind, MessageKind::Visible(_))
    }

    /// Short name of the message kind for logs.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self.kind {
            MessageKind::Visible(_) => "visible",
            MessageKind::Unsend(_) => "unsend_request",
            MessageKind::ReadReceipt { .. } => "read_receipt",
            MessageKind::TypingIndicator { .. } => "typing_indicator",
            MessageKind::ExpirationTimerUpdate { .. } => "expiration_timer_update",
            MessageKind::Call { .. } => "call",
            MessageKind::MessageRequestResponse { .. } => "message_request_response",
            MessageKind::DataExtractionNotification { .. } => "data_extraction_notification",
        }
    }
}

/// Content of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MessageKind {
    /// User-visible message, including reactions.
    Visible(VisibleMessage),
    /// Request to delete a previously sent message.
    Unsend(UnsendRequest),
    /// Read receipts for the given sent timestamps.
    ReadReceipt { timestamps: Vec<u64> },
    /// Typing started or stopped.
    TypingIndicator { started: bool },
    /// Disappearing-message timer change.
    ExpirationTimerUpdate { duration_secs: u32 },
    /// Call signaling.
    Call { call_id: String, signal: String },
    /// Approval of a message request.
    MessageRequestResponse { approved: bool },
    /// Screenshot or media-save notice.
    DataExtractionNotification { screenshot: bool },
}

/// A user-visible message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleMessage {
    /// Body text.
    #[serde(default)]
    pub text: Option<String>,
    /// Whether the body mentions the local user.
    #[serde(default)]
    pub has_mention: bool,
    /// Present when the message is an emoji reaction to another message.
    #[serde(default)]
    pub reaction: Option<Reaction>,
}

/// An emoji reaction carried by a visible message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Emoji.
    pub emoji: String,
    /// Sent timestamp of the message reacted to.
    pub target_timestamp: u64,
    /// Author of the message reacted to.
    pub target_author: String,
    /// `false` when the reaction is being removed.
    pub add: bool,
}

/// Request to delete a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsendRequest {
    /// Sent timestamp of the message to delete.
    pub timestamp: u64,
    /// Author of the message to delete.
    pub author: String,
}

/// Aggregate reaction state for one emoji on a community message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityReaction {
    /// Total reactions with this emoji.
    pub count: u64,
    /// Most recent reactors, as reported by the server.
    #[serde(default)]
    pub reactors: Vec<String>,
    /// Whether the local user is among the reactors.
    #[serde(default)]
    pub you: bool,
    /// Sort position of the emoji.
    #[serde(default)]
    pub index: u32,
}

/// A reaction row ready to be stored against a local message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    /// Local message reacted to.
    pub message_id: MessageId,
    /// Reactor.
    pub author: String,
    /// Emoji.
    pub emoji: String,
    /// Community server id of the message reacted to.
    pub server_id: String,
    /// Total count, carried only on the first record of an emoji.
    pub count: u64,
    /// Sort position of the emoji.
    pub sort_id: u32,
}

/// One raw inbound payload plus the metadata it arrived with.
///
/// Immutable input to the batch receive processor. Items that fail are
/// carried unchanged into a replacement job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceiveParameters {
    /// Raw payload bytes.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Storage-server hash of the payload.
    #[serde(default)]
    pub server_hash: Option<String>,
    /// Community server id of the message.
    #[serde(default)]
    pub community_message_server_id: Option<i64>,
    /// Reactions the community server reported for the message.
    #[serde(default)]
    pub reactions: Option<BTreeMap<String, CommunityReaction>>,
    /// Closed group the payload was polled from.
    #[serde(default)]
    pub closed_group: Option<String>,
}

impl MessageReceiveParameters {
    /// Parameters for a payload with no extra metadata.
    #[must_use]
    pub const fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            server_hash: None,
            community_message_server_id: None,
            reactions: None,
            closed_group: None,
        }
    }

    /// Set the storage-server hash.
    #[must_use]
    pub fn with_server_hash(mut self, hash: impl Into<String>) -> Self {
        self.server_hash = Some(hash.into());
        self
    }

    /// Set the community server id and the reactions reported with it.
    #[must_use]
    pub fn with_community_message(
        mut self,
        server_id: i64,
        reactions: Option<BTreeMap<String, CommunityReaction>>,
    ) -> Self {
        self.community_message_server_id = Some(server_id);
        self.reactions = reactions;
        self
    }

    /// Set the closed group the payload was polled from.
    #[must_use]
    pub fn with_closed_group(mut self, group: impl Into<String>) -> Self {
        self.closed_group = Some(group.into());
        self
    }
}

/// Output of the parser for one batch item.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Original item.
    pub parameters: MessageReceiveParameters,
    /// Decoded message.
    pub message: Message,
    /// Wire envelope.
    pub envelope: Envelope,
}

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Destination {
    /// One-to-one recipient.
    Contact(String),
    /// Closed group.
    ClosedGroup(String),
    /// Community room.
    Community(CommunityAddress),
}

/// An outbound message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Local row of the message, if it is stored.
    #[serde(default)]
    pub id: Option<MessageId>,
    /// Encoded message body.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Sent timestamp in milliseconds.
    pub sent_timestamp: u64,
    /// Attachments that must be uploaded before sending.
    #[serde(default)]
    pub attachment_ids: Vec<i64>,
    /// Whether the message is a reaction (not a stored outgoing row).
    #[serde(default)]
    pub is_reaction: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn message(sender: &str, sync_target: Option<&str>, kind: MessageKind) -> Message {
        Message {
            sender: sender.to_string(),
            sync_target: sync_target.map(str::to_string),
            sent_timestamp: Some(1),
            group_public_key: None,
            community_server_message_id: None,
            server_hash: None,
            kind,
        }
    }

    #[test]
    fn test_sender_or_sync() {
        let visible = MessageKind::Visible(VisibleMessage::default());

        let incoming = message("05bob", None, visible.clone());
        assert_eq!(incoming.sender_or_sync(Some("05me")), "05bob");

        let synced = message("05me", Some("05bob"), visible.clone());
        assert_eq!(synced.sender_or_sync(Some("05me")), "05bob");

        // A sync target from someone else is ignored.
        let spoofed = message("05eve", Some("05bob"), visible);
        assert_eq!(spoofed.sender_or_sync(Some("05me")), "05eve");
    }

    #[test]
    fn test_only_visible_messages_initiate_conversations() {
        assert!(message("a", None, MessageKind::Visible(VisibleMessage::default()))
            .is_conversation_initiating());
        assert!(!message("a", None, MessageKind::TypingIndicator { started: true })
            .is_conversation_initiating());
        assert!(!message(
            "a",
            None,
            MessageKind::Unsend(UnsendRequest {
                timestamp: 1,
                author: "a".into()
            })
        )
        .is_conversation_initiating());
        assert!(!message("a", None, MessageKind::ReadReceipt { timestamps: vec![1] })
            .is_conversation_initiating());
    }

    #[test]
    fn test_message_kind_wire_shape() {
        let json = r#"{"sender":"05bob","sentTimestamp":10,"kind":{"type":"typingIndicator","started":true}}"#;
        let parsed: Message = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.kind, MessageKind::TypingIndicator { started: true });
        assert_eq!(parsed.kind_name(), "typing_indicator");
        assert!(parsed.group_public_key.is_none());
    }
}
