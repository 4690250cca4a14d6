//! Per-message handling contract used by the batch receive processor.

use std::sync::Arc;

use async_trait::async_trait;

use crate::address::{CommunityAddress, ConversationId, MessageId};
use crate::messages::{Envelope, Message, UnsendRequest, VisibleMessage};
use crate::services::parser::ReceiveError;

/// Context for persisting a visible message.
#[derive(Debug, Clone, Copy)]
pub struct VisibleContext<'a> {
    pub conversation_id: ConversationId,
    pub from_community: Option<&'a CommunityAddress>,
    /// Update the conversation summary after storing. The batch processor
    /// turns this off and refreshes once per conversation.
    pub run_thread_update: bool,
    /// Apply profile changes carried by the message.
    pub run_profile_update: bool,
}

/// Context for a control message.
#[derive(Debug, Clone, Copy)]
pub struct ControlContext<'a> {
    /// `None` for messages that have no conversation.
    pub conversation_id: Option<ConversationId>,
    /// Closed group the payload was polled from.
    pub group_id: Option<&'a str>,
    pub from_community: Option<&'a CommunityAddress>,
}

/// Applies decoded messages to local state.
#[async_trait]
pub trait ReceivedMessageHandler: Send + Sync {
    /// Persist a visible message. Returns the stored message id, if any.
    async fn handle_visible(
        &self,
        message: &Message,
        visible: &VisibleMessage,
        envelope: &Envelope,
        context: VisibleContext<'_>,
    ) -> Result<Option<MessageId>, ReceiveError>;

    /// Apply an unsend request. Returns the id of the message it deleted.
    async fn handle_unsend(
        &self,
        message: &Message,
        request: &UnsendRequest,
    ) -> Result<Option<MessageId>, ReceiveError>;

    /// Apply any other control message.
    async fn handle_control(
        &self,
        message: &Message,
        envelope: &Envelope,
        context: ControlContext<'_>,
    ) -> Result<(), ReceiveError>;
}

/// Type alias for a shared message handler.
pub type ReceivedMessageHandlerService = Arc<dyn ReceivedMessageHandler>;
