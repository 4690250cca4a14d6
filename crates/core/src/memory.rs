//! In-process collaborator implementations.
//!
//! [`MemoryStore`] keeps conversations, messages and reactions in one map so
//! that receive handling, trimming and deletion all see the same rows. It is
//! what the daemon runs against when no database is configured, and what the
//! receive tests assert on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use courier_common::AppResult;
use courier_common::config::IdentityConfig;
use tokio::sync::RwLock;
use tracing::debug;

use crate::address::{Address, CommunityAddress, ConversationId, MessageId};
use crate::messages::{Envelope, Message, ReactionRecord, UnsendRequest, VisibleMessage};
use crate::services::{
    AccountState, ControlContext, ConversationStore, DuplicateCheck, MessageNotifier,
    ReceiveError, ReceivedMessageHandler, VisibleContext,
};

/// A message row held by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: String,
    pub sent_timestamp: u64,
    pub server_id: Option<i64>,
    pub text: Option<String>,
    pub has_mention: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    next_conversation: i64,
    next_message: i64,
    conversations: HashMap<Address, ConversationId>,
    last_seen: HashMap<ConversationId, u64>,
    messages: BTreeMap<MessageId, StoredMessage>,
    reactions: BTreeMap<MessageId, Vec<ReactionRecord>>,
    unread_reactions: HashSet<ConversationId>,
    read_marks: Vec<(ConversationId, u64)>,
    summary_refreshes: Vec<ConversationId>,
    avatars: HashMap<CommunityAddress, Vec<u8>>,
    control_log: Vec<(Option<ConversationId>, &'static str)>,
}

impl StoreState {
    fn conversation_for(&mut self, address: &Address) -> ConversationId {
        if let Some(id) = self.conversations.get(address) {
            return *id;
        }
        self.next_conversation += 1;
        let id = ConversationId(self.next_conversation);
        self.conversations.insert(address.clone(), id);
        id
    }

    fn find_message(&self, author: &str, sent_timestamp: u64) -> Option<&StoredMessage> {
        self.messages
            .values()
            .find(|m| m.sender == author && m.sent_timestamp == sent_timestamp)
    }
}

/// In-memory conversation, message and reaction store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message row directly, creating its conversation if needed.
    pub async fn insert_message(
        &self,
        address: &Address,
        sender: &str,
        sent_timestamp: u64,
        server_id: Option<i64>,
    ) -> MessageId {
        let mut state = self.state.write().await;
        let conversation_id = state.conversation_for(address);
        state.next_message += 1;
        let id = MessageId(state.next_message);
        state.messages.insert(
            id,
            StoredMessage {
                id,
                conversation_id,
                sender: sender.to_string(),
                sent_timestamp,
                server_id,
                text: None,
                has_mention: false,
            },
        );
        id
    }

    /// Overwrite the read watermark of a conversation.
    pub async fn set_last_seen(&self, conversation: ConversationId, timestamp: u64) {
        self.state
            .write()
            .await
            .last_seen
            .insert(conversation, timestamp);
    }

    /// Flag a conversation as having reactions the user has not seen.
    pub async fn set_unread_reactions(&self, conversation: ConversationId) {
        self.state
            .write()
            .await
            .unread_reactions
            .insert(conversation);
    }

    pub async fn conversation_id(&self, address: &Address) -> Option<ConversationId> {
        self.state.read().await.conversations.get(address).copied()
    }

    pub async fn conversation_count(&self) -> usize {
        self.state.read().await.conversations.len()
    }

    /// Messages of a conversation in insertion order.
    pub async fn messages(&self, conversation: ConversationId) -> Vec<StoredMessage> {
        self.state
            .read()
            .await
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation)
            .cloned()
            .collect()
    }

    pub async fn reactions(&self, message: MessageId) -> Vec<ReactionRecord> {
        self.state
            .read()
            .await
            .reactions
            .get(&message)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn has_unread_reactions(&self, conversation: ConversationId) -> bool {
        self.state
            .read()
            .await
            .unread_reactions
            .contains(&conversation)
    }

    /// Every `mark_read` call in order.
    pub async fn read_marks(&self) -> Vec<(ConversationId, u64)> {
        self.state.read().await.read_marks.clone()
    }

    pub async fn summary_refreshes(&self) -> Vec<ConversationId> {
        self.state.read().await.summary_refreshes.clone()
    }

    /// Control messages handled, with the conversation they were applied to.
    pub async fn control_log(&self) -> Vec<(Option<ConversationId>, &'static str)> {
        self.state.read().await.control_log.clone()
    }

    pub async fn community_avatar(&self, community: &CommunityAddress) -> Option<Vec<u8>> {
        self.state.read().await.avatars.get(community).cloned()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn resolve_or_create(&self, address: &Address) -> AppResult<ConversationId> {
        Ok(self.state.write().await.conversation_for(address))
    }

    async fn resolve_existing(&self, address: &Address) -> AppResult<Option<ConversationId>> {
        Ok(self.state.read().await.conversations.get(address).copied())
    }

    async fn last_seen(&self, conversation: ConversationId) -> AppResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .last_seen
            .get(&conversation)
            .copied()
            .unwrap_or(0))
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        timestamp: u64,
        force: bool,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        let current = state.last_seen.get(&conversation).copied().unwrap_or(0);
        if force || timestamp > current {
            state.last_seen.insert(conversation, timestamp);
        }
        state.unread_reactions.remove(&conversation);
        state.read_marks.push((conversation, timestamp));
        Ok(())
    }

    async fn refresh_summary(&self, conversation: ConversationId) -> AppResult<()> {
        self.state
            .write()
            .await
            .summary_refreshes
            .push(conversation);
        Ok(())
    }

    async fn message_id_for_server_id(
        &self,
        conversation: ConversationId,
        server_id: i64,
    ) -> AppResult<Option<MessageId>> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .values()
            .find(|m| m.conversation_id == conversation && m.server_id == Some(server_id))
            .map(|m| m.id))
    }

    async fn upsert_reactions(
        &self,
        reactions: BTreeMap<MessageId, Vec<ReactionRecord>>,
        replace_all: bool,
        notify_unread: bool,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        for (message, records) in reactions {
            let conversation = state.messages.get(&message).map(|m| m.conversation_id);
            let entry = state.reactions.entry(message).or_default();
            if replace_all {
                entry.clear();
            }
            entry.extend(records);
            if let (true, Some(conversation)) = (notify_unread, conversation) {
                state.unread_reactions.insert(conversation);
            }
        }
        Ok(())
    }

    async fn trim(&self, conversation: ConversationId, keep: usize) -> AppResult<usize> {
        let mut state = self.state.write().await;
        let mut rows: Vec<(u64, MessageId)> = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation)
            .map(|m| (m.sent_timestamp, m.id))
            .collect();
        if rows.len() <= keep {
            return Ok(0);
        }
        rows.sort_unstable();
        let excess = rows.len() - keep;
        for (_, id) in rows.into_iter().take(excess) {
            state.messages.remove(&id);
            state.reactions.remove(&id);
        }
        Ok(excess)
    }

    async fn delete_by_server_ids(
        &self,
        conversation: ConversationId,
        server_ids: &[i64],
    ) -> AppResult<usize> {
        let mut state = self.state.write().await;
        let doomed: Vec<MessageId> = state
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation
                    && m.server_id.is_some_and(|id| server_ids.contains(&id))
            })
            .map(|m| m.id)
            .collect();
        for id in &doomed {
            state.messages.remove(id);
            state.reactions.remove(id);
        }
        Ok(doomed.len())
    }

    async fn set_community_avatar(
        &self,
        community: &CommunityAddress,
        image: Vec<u8>,
    ) -> AppResult<()> {
        self.state
            .write()
            .await
            .avatars
            .insert(community.clone(), image);
        Ok(())
    }
}

#[async_trait]
impl DuplicateCheck for MemoryStore {
    async fn is_duplicate(&self, sender: &str, sent_timestamp: u64) -> AppResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .find_message(sender, sent_timestamp)
            .is_some())
    }
}

#[async_trait]
impl ReceivedMessageHandler for MemoryStore {
    async fn handle_visible(
        &self,
        message: &Message,
        visible: &VisibleMessage,
        envelope: &Envelope,
        context: VisibleContext<'_>,
    ) -> Result<Option<MessageId>, ReceiveError> {
        let sent_timestamp = message.sent_timestamp.unwrap_or(envelope.timestamp);
        let mut state = self.state.write().await;

        if let Some(reaction) = &visible.reaction {
            let target = state
                .find_message(&reaction.target_author, reaction.target_timestamp)
                .map(|m| (m.id, m.server_id));
            let Some((target, server_id)) = target else {
                debug!(emoji = %reaction.emoji, "Reaction target not found");
                return Ok(None);
            };
            let records = state.reactions.entry(target).or_default();
            records.retain(|r| !(r.author == message.sender && r.emoji == reaction.emoji));
            if reaction.add {
                records.push(ReactionRecord {
                    message_id: target,
                    author: message.sender.clone(),
                    emoji: reaction.emoji.clone(),
                    server_id: server_id.map(|id| id.to_string()).unwrap_or_default(),
                    count: 1,
                    sort_id: 0,
                });
                state.unread_reactions.insert(context.conversation_id);
            }
            return Ok(None);
        }

        // Copies of one payload can arrive within the same batch.
        if state.find_message(&message.sender, sent_timestamp).is_some() {
            return Err(ReceiveError::duplicate(format!(
                "{} at {sent_timestamp} already stored",
                message.sender
            )));
        }

        state.next_message += 1;
        let id = MessageId(state.next_message);
        state.messages.insert(
            id,
            StoredMessage {
                id,
                conversation_id: context.conversation_id,
                sender: message.sender.clone(),
                sent_timestamp,
                server_id: message.community_server_message_id,
                text: visible.text.clone(),
                has_mention: visible.has_mention,
            },
        );
        if context.run_thread_update {
            state.summary_refreshes.push(context.conversation_id);
        }
        Ok(Some(id))
    }

    async fn handle_unsend(
        &self,
        _message: &Message,
        request: &UnsendRequest,
    ) -> Result<Option<MessageId>, ReceiveError> {
        let mut state = self.state.write().await;
        let Some(id) = state
            .find_message(&request.author, request.timestamp)
            .map(|m| m.id)
        else {
            return Ok(None);
        };
        state.messages.remove(&id);
        state.reactions.remove(&id);
        Ok(Some(id))
    }

    async fn handle_control(
        &self,
        message: &Message,
        _envelope: &Envelope,
        context: ControlContext<'_>,
    ) -> Result<(), ReceiveError> {
        self.state
            .write()
            .await
            .control_log
            .push((context.conversation_id, message.kind_name()));
        Ok(())
    }
}

/// Account state fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticAccountState {
    account_id: Option<String>,
    blinded_ids: Vec<String>,
    community_keys: HashMap<String, String>,
    active_groups: HashSet<String>,
    hidden_contacts: HashMap<String, u64>,
}

impl StaticAccountState {
    #[must_use]
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            ..Self::default()
        }
    }

    /// Build from the `[identity]` config section.
    #[must_use]
    pub fn from_config(identity: &IdentityConfig) -> Self {
        Self {
            account_id: Some(identity.account_id.clone()).filter(|id| !id.is_empty()),
            blinded_ids: identity.blinded_ids.clone(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_blinded_id(mut self, id: impl Into<String>) -> Self {
        self.blinded_ids.push(id.into());
        self
    }

    #[must_use]
    pub fn with_community_key(mut self, server_url: impl Into<String>, key: impl Into<String>) -> Self {
        self.community_keys.insert(server_url.into(), key.into());
        self
    }

    #[must_use]
    pub fn with_active_group(mut self, group_id: impl Into<String>) -> Self {
        self.active_groups.insert(group_id.into());
        self
    }

    /// Mark a contact hidden by a config written at `since`.
    #[must_use]
    pub fn with_hidden_contact(mut self, account_id: impl Into<String>, since: u64) -> Self {
        self.hidden_contacts.insert(account_id.into(), since);
        self
    }
}

#[async_trait]
impl AccountState for StaticAccountState {
    async fn local_account_id(&self) -> AppResult<Option<String>> {
        Ok(self.account_id.clone())
    }

    async fn blinded_ids(&self, _community: Option<&CommunityAddress>) -> AppResult<Vec<String>> {
        Ok(self.blinded_ids.clone())
    }

    async fn community_public_key(&self, server_url: &str) -> AppResult<Option<String>> {
        Ok(self.community_keys.get(server_url).cloned())
    }

    async fn active_group_ids(&self) -> AppResult<HashSet<String>> {
        Ok(self.active_groups.clone())
    }

    async fn hidden_contact_since(&self, account_id: &str) -> AppResult<Option<u64>> {
        Ok(self.hidden_contacts.get(account_id).copied())
    }
}

/// Notifier that records which conversations it was asked to refresh.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    updates: Mutex<Vec<ConversationId>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn updates(&self) -> Vec<ConversationId> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageNotifier for RecordingNotifier {
    async fn update_notification(&self, conversation: ConversationId) -> AppResult<()> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conversation);
        Ok(())
    }
}
