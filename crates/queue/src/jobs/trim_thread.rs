//! Conversation trimming job.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;
use courier_core::{CommunityAddress, ConversationId, ConversationStoreService};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{community_or_receive, decode, encode};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::registry::JobFactory;

/// Messages kept when a conversation is trimmed.
pub const THREAD_LENGTH_TRIGGER_SIZE: usize = 2000;

/// Persisted fields of a [`TrimThreadJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimThreadPayload {
    pub conversation_id: ConversationId,
    /// Set for community conversations, so the trim is ordered with that
    /// room's other jobs.
    #[serde(default)]
    pub from_community: Option<CommunityAddress>,
}

/// Deletes the oldest messages of a conversation.
pub struct TrimThreadJob {
    payload: TrimThreadPayload,
    conversations: ConversationStoreService,
}

impl TrimThreadJob {
    pub const FACTORY_KEY: &'static str = "TrimThreadJob";

    #[must_use]
    pub const fn new(
        conversation_id: ConversationId,
        from_community: Option<CommunityAddress>,
        conversations: ConversationStoreService,
    ) -> Self {
        Self {
            payload: TrimThreadPayload {
                conversation_id,
                from_community,
            },
            conversations,
        }
    }
}

impl fmt::Debug for TrimThreadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrimThreadJob")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for TrimThreadJob {
    fn factory_key(&self) -> &'static str {
        Self::FACTORY_KEY
    }

    fn max_failure_count(&self) -> u32 {
        1
    }

    fn lane(&self) -> Lane {
        community_or_receive(self.payload.from_community.as_ref())
    }

    fn serialize(&self) -> AppResult<Vec<u8>> {
        encode(&self.payload)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let conversation = self.payload.conversation_id;
        let removed = self
            .conversations
            .trim(conversation, THREAD_LENGTH_TRIGGER_SIZE)
            .await?;
        if removed > 0 {
            info!(job_id = %ctx.id, conversation = %conversation, removed, "Trimmed conversation");
        }
        Ok(())
    }
}

/// Rebuilds [`TrimThreadJob`]s from storage.
pub struct TrimThreadFactory {
    conversations: ConversationStoreService,
}

impl TrimThreadFactory {
    #[must_use]
    pub const fn new(conversations: ConversationStoreService) -> Self {
        Self { conversations }
    }
}

impl JobFactory for TrimThreadFactory {
    fn factory_key(&self) -> &'static str {
        TrimThreadJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        let payload: TrimThreadPayload = decode(payload)?;
        Ok(Arc::new(TrimThreadJob {
            payload,
            conversations: self.conversations.clone(),
        }))
    }
}
