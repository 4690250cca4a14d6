//! Notification refresh contract.

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;

use crate::address::ConversationId;

/// Refreshes user-facing notifications after a conversation changed.
///
/// Calls are idempotent; the receive path calls this even when nothing
/// new arrived for the conversation.
#[async_trait]
pub trait MessageNotifier: Send + Sync {
    async fn update_notification(&self, conversation: ConversationId) -> AppResult<()>;
}

/// No-op notifier for headless operation.
pub struct NoOpNotifier;

#[async_trait]
impl MessageNotifier for NoOpNotifier {
    async fn update_notification(&self, _conversation: ConversationId) -> AppResult<()> {
        Ok(())
    }
}

/// Type alias for a shared notifier.
pub type MessageNotifierService = Arc<dyn MessageNotifier>;
