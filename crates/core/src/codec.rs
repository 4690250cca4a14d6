//! JSON wire parser.
//!
//! Payloads are JSON objects of the form `{"envelope": {..}, "message": {..}}`.
//! Decryption is out of scope here; the parser enforces the receive rules
//! that do not depend on it: self-send and duplicate detection, and
//! rejection of messages for groups the user is not in.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::trace;

use crate::messages::{Envelope, Message};
use crate::services::{
    AccountStateService, DuplicateCheck, MessageParser, ParseRequest, ReceiveError,
};

#[derive(Debug, Deserialize)]
struct WirePayload {
    envelope: Envelope,
    message: Message,
}

/// [`MessageParser`] for JSON encoded payloads.
pub struct JsonEnvelopeParser {
    account: AccountStateService,
    duplicates: Arc<dyn DuplicateCheck>,
}

impl JsonEnvelopeParser {
    #[must_use]
    pub fn new(account: AccountStateService, duplicates: Arc<dyn DuplicateCheck>) -> Self {
        Self {
            account,
            duplicates,
        }
    }
}

#[async_trait]
impl MessageParser for JsonEnvelopeParser {
    async fn parse(&self, request: ParseRequest<'_>) -> Result<(Message, Envelope), ReceiveError> {
        if request.data.is_empty() {
            return Err(ReceiveError::non_retryable("empty payload"));
        }

        let WirePayload {
            envelope,
            mut message,
        } = serde_json::from_slice(request.data)
            .map_err(|e| ReceiveError::non_retryable(format!("invalid payload: {e}")))?;

        if message.sender.is_empty() {
            return Err(ReceiveError::non_retryable("missing sender"));
        }
        if message.sent_timestamp.is_none() {
            message.sent_timestamp = Some(envelope.timestamp);
        }
        if request.community_message_server_id.is_some() {
            message.community_server_message_id = request.community_message_server_id;
        }

        if let Some(session) = request.group_session_id {
            message
                .group_public_key
                .get_or_insert_with(|| session.to_string());
        }
        if let Some(group) = message.group_public_key.as_deref() {
            let known = request.active_group_ids.contains(group)
                || request.group_session_id == Some(group);
            if !known {
                return Err(ReceiveError::non_retryable(format!(
                    "message for unknown group {group}"
                )));
            }
        }

        // Own messages echo back from communities and are processed there.
        let from_community = request.community_message_server_id.is_some()
            || request.community_public_key.is_some();
        let local = self.account.local_account_id().await?;
        if !from_community
            && local.as_deref() == Some(message.sender.as_str())
            && message.sync_target.is_none()
        {
            return Err(ReceiveError::self_send(format!(
                "sent by local user at {}",
                envelope.timestamp
            )));
        }

        let sent_timestamp = message.sent_timestamp.unwrap_or(envelope.timestamp);
        if self
            .duplicates
            .is_duplicate(&message.sender, sent_timestamp)
            .await?
        {
            return Err(ReceiveError::duplicate(format!(
                "{} at {sent_timestamp}",
                message.sender
            )));
        }

        trace!(sender = %message.sender, kind = message.kind_name(), "Parsed payload");
        Ok((message, envelope))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::address::Address;
    use crate::memory::{MemoryStore, StaticAccountState};
    use crate::services::ReceiveErrorKind;

    fn payload(sender: &str, ts: u64, extra: &str) -> Vec<u8> {
        format!(
            r#"{{"envelope":{{"source":"{sender}","timestamp":{ts}}},"message":{{"sender":"{sender}","sentTimestamp":{ts}{extra},"kind":{{"type":"visible","text":"hi"}}}}}}"#
        )
        .into_bytes()
    }

    fn parser(store: Arc<MemoryStore>) -> JsonEnvelopeParser {
        let account = StaticAccountState::new("05me").with_active_group("03group");
        JsonEnvelopeParser::new(Arc::new(account), store)
    }

    fn request<'a>(data: &'a [u8], groups: &'a HashSet<String>) -> ParseRequest<'a> {
        ParseRequest {
            data,
            community_message_server_id: None,
            community_public_key: None,
            active_group_ids: groups,
            group_session_id: None,
        }
    }

    #[tokio::test]
    async fn test_parses_visible_message() {
        let parser = parser(Arc::new(MemoryStore::new()));
        let groups = HashSet::new();
        let data = payload("05bob", 100, "");

        let (message, envelope) = parser.parse(request(&data, &groups)).await.unwrap();
        assert_eq!(message.sender, "05bob");
        assert_eq!(envelope.timestamp, 100);
        assert!(message.is_conversation_initiating());
    }

    #[tokio::test]
    async fn test_garbage_is_not_retryable() {
        let parser = parser(Arc::new(MemoryStore::new()));
        let groups = HashSet::new();

        let err = parser.parse(request(b"{not json", &groups)).await.unwrap_err();
        assert_eq!(err.kind, ReceiveErrorKind::NonRetryable);
        let err = parser.parse(request(b"", &groups)).await.unwrap_err();
        assert_eq!(err.kind, ReceiveErrorKind::NonRetryable);
    }

    #[tokio::test]
    async fn test_self_send_without_sync_target() {
        let parser = parser(Arc::new(MemoryStore::new()));
        let groups = HashSet::new();

        let own = payload("05me", 100, "");
        let err = parser.parse(request(&own, &groups)).await.unwrap_err();
        assert_eq!(err.kind, ReceiveErrorKind::SelfSend);

        let sync = payload("05me", 100, r#","syncTarget":"05bob""#);
        assert!(parser.parse(request(&sync, &groups)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stored_message_is_duplicate() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_message(&Address::Contact("05bob".into()), "05bob", 100, None)
            .await;
        let parser = parser(store);
        let groups = HashSet::new();

        let data = payload("05bob", 100, "");
        let err = parser.parse(request(&data, &groups)).await.unwrap_err();
        assert_eq!(err.kind, ReceiveErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn test_unknown_group_is_rejected() {
        let parser = parser(Arc::new(MemoryStore::new()));
        let groups: HashSet<String> = ["03group".to_string()].into();

        let known = payload("05bob", 1, r#","groupPublicKey":"03group""#);
        assert!(parser.parse(request(&known, &groups)).await.is_ok());

        let unknown = payload("05bob", 2, r#","groupPublicKey":"03other""#);
        let err = parser.parse(request(&unknown, &groups)).await.unwrap_err();
        assert_eq!(err.kind, ReceiveErrorKind::NonRetryable);

        let mut polled = request(&unknown, &groups);
        polled.group_session_id = Some("03other");
        assert!(parser.parse(polled).await.is_ok());
    }

    #[tokio::test]
    async fn test_own_message_from_community_is_not_self_send() {
        let parser = parser(Arc::new(MemoryStore::new()));
        let groups = HashSet::new();
        let own = payload("05me", 100, "");

        let mut polled = request(&own, &groups);
        polled.community_public_key = Some("a1b2c3");
        let (message, _) = parser.parse(polled).await.unwrap();
        assert_eq!(message.sender, "05me");
        assert_eq!(message.community_server_message_id, None);
    }
}
