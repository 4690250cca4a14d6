//! Community room image download.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;
use courier_core::{CommunityAddress, CommunityApiService, ConversationStoreService};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{decode, encode, transport_failure};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::registry::JobFactory;

/// Persisted fields of a [`GroupAvatarDownloadJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAvatarPayload {
    pub community: CommunityAddress,
}

/// Downloads a room image and stores it on the conversation.
pub struct GroupAvatarDownloadJob {
    payload: GroupAvatarPayload,
    api: CommunityApiService,
    conversations: ConversationStoreService,
}

impl GroupAvatarDownloadJob {
    pub const FACTORY_KEY: &'static str = "GroupAvatarDownloadJob";

    #[must_use]
    pub const fn new(
        community: CommunityAddress,
        api: CommunityApiService,
        conversations: ConversationStoreService,
    ) -> Self {
        Self {
            payload: GroupAvatarPayload { community },
            api,
            conversations,
        }
    }
}

impl fmt::Debug for GroupAvatarDownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupAvatarDownloadJob")
            .field("community", &self.payload.community)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for GroupAvatarDownloadJob {
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
        let community = &self.payload.community;
        let image = self
            .api
            .download_room_image(community)
            .await
            .map_err(|e| transport_failure(&e))?;
        debug!(job_id = %ctx.id, community = %community, bytes = image.len(), "Downloaded room image");
        self.conversations
            .set_community_avatar(community, image)
            .await?;
        Ok(())
    }
}

/// Rebuilds [`GroupAvatarDownloadJob`]s from storage.
pub struct GroupAvatarDownloadFactory {
    api: CommunityApiService,
    conversations: ConversationStoreService,
}

impl GroupAvatarDownloadFactory {
    #[must_use]
    pub const fn new(api: CommunityApiService, conversations: ConversationStoreService) -> Self {
        Self { api, conversations }
    }
}

impl JobFactory for GroupAvatarDownloadFactory {
    fn factory_key(&self) -> &'static str {
        GroupAvatarDownloadJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        let payload: GroupAvatarPayload = decode(payload)?;
        Ok(Arc::new(GroupAvatarDownloadJob {
            payload,
            api: self.api.clone(),
            conversations: self.conversations.clone(),
        }))
    }
}
