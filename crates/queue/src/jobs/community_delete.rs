//! Deletion of community messages removed on the server.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;
use courier_core::{CommunityAddress, ConversationId, ConversationStoreService};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{decode, encode};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::registry::JobFactory;

/// Persisted fields of a [`CommunityDeleteJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityDeletePayload {
    pub community: CommunityAddress,
    pub conversation_id: ConversationId,
    pub server_ids: Vec<i64>,
}

/// Deletes local copies of community messages by server id.
pub struct CommunityDeleteJob {
    payload: CommunityDeletePayload,
    conversations: ConversationStoreService,
}

impl CommunityDeleteJob {
    pub const FACTORY_KEY: &'static str = "OpenGroupDeleteJob";

    #[must_use]
    pub const fn new(
        community: CommunityAddress,
        conversation_id: ConversationId,
        server_ids: Vec<i64>,
        conversations: ConversationStoreService,
    ) -> Self {
        Self {
            payload: CommunityDeletePayload {
                community,
                conversation_id,
                server_ids,
            },
            conversations,
        }
    }
}

impl fmt::Debug for CommunityDeleteJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunityDeleteJob")
            .field("community", &self.payload.community)
            .field("server_ids", &self.payload.server_ids.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for CommunityDeleteJob {
    fn factory_key(&self) -> &'static str {
        Self::FACTORY_KEY
    }

    fn max_failure_count(&self) -> u32 {
        1
    }

    fn lane(&self) -> Lane {
        Lane::Community(self.payload.community.lane_key())
    }

    fn serialize(&self) -> AppResult<Vec<u8>> {
        encode(&self.payload)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let deleted = self
            .conversations
            .delete_by_server_ids(self.payload.conversation_id, &self.payload.server_ids)
            .await?;
        debug!(
            job_id = %ctx.id,
            community = %self.payload.community,
            requested = self.payload.server_ids.len(),
            deleted,
            "Deleted community messages"
        );
        Ok(())
    }
}

/// Rebuilds [`CommunityDeleteJob`]s from storage.
pub struct CommunityDeleteFactory {
    conversations: ConversationStoreService,
}

impl CommunityDeleteFactory {
    #[must_use]
    pub const fn new(conversations: ConversationStoreService) -> Self {
        Self { conversations }
    }
}

impl JobFactory for CommunityDeleteFactory {
    fn factory_key(&self) -> &'static str {
        CommunityDeleteJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        let payload: CommunityDeletePayload = decode(payload)?;
        Ok(Arc::new(CommunityDeleteJob {
            payload,
            conversations: self.conversations.clone(),
        }))
    }
}
