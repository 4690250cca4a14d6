//! Conversation (thread) store contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;

use crate::address::{Address, CommunityAddress, ConversationId, MessageId};
use crate::messages::ReactionRecord;

/// Storage of conversations and the state the receive path updates on them.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Look up the conversation for `address`, creating it when missing.
    async fn resolve_or_create(&self, address: &Address) -> AppResult<ConversationId>;

    /// Look up the conversation for `address` without creating one.
    async fn resolve_existing(&self, address: &Address) -> AppResult<Option<ConversationId>>;

    /// Read watermark of a conversation in milliseconds, `0` if never read.
    async fn last_seen(&self, conversation: ConversationId) -> AppResult<u64>;

    /// Mark everything up to `timestamp` as read.
    async fn mark_read(
        &self,
        conversation: ConversationId,
        timestamp: u64,
        force: bool,
    ) -> AppResult<()>;

    /// Recompute the conversation summary (snippet, unread counts).
    async fn refresh_summary(&self, conversation: ConversationId) -> AppResult<()>;

    /// Local message stored for a community server id.
    async fn message_id_for_server_id(
        &self,
        conversation: ConversationId,
        server_id: i64,
    ) -> AppResult<Option<MessageId>>;

    /// Store reaction records in one batch.
    async fn upsert_reactions(
        &self,
        reactions: BTreeMap<MessageId, Vec<ReactionRecord>>,
        replace_all: bool,
        notify_unread: bool,
    ) -> AppResult<()>;

    /// Delete all but the newest `keep` messages. Returns how many were removed.
    async fn trim(&self, conversation: ConversationId, keep: usize) -> AppResult<usize>;

    /// Delete local messages by community server id. Returns how many were removed.
    async fn delete_by_server_ids(
        &self,
        conversation: ConversationId,
        server_ids: &[i64],
    ) -> AppResult<usize>;

    /// Store the room image of a community conversation.
    async fn set_community_avatar(
        &self,
        community: &CommunityAddress,
        image: Vec<u8>,
    ) -> AppResult<()>;
}

/// Type alias for a shared conversation store.
pub type ConversationStoreService = Arc<dyn ConversationStore>;
