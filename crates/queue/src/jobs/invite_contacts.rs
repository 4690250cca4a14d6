//! Closed group invitations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;
use courier_core::GroupInviterService;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{decode, encode};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::registry::JobFactory;

/// Persisted fields of an [`InviteContactsJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteContactsPayload {
    pub group_id: String,
    pub members: Vec<String>,
}

/// Invites members to a closed group the local user administers.
pub struct InviteContactsJob {
    payload: InviteContactsPayload,
    inviter: GroupInviterService,
}

impl InviteContactsJob {
    pub const FACTORY_KEY: &'static str = "InviteContactsJob";

    #[must_use]
    pub const fn new(group_id: String, members: Vec<String>, inviter: GroupInviterService) -> Self {
        Self {
            payload: InviteContactsPayload { group_id, members },
            inviter,
        }
    }
}

impl fmt::Debug for InviteContactsJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteContactsJob")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for InviteContactsJob {
    fn factory_key(&self) -> &'static str {
        Self::FACTORY_KEY
    }

    fn max_failure_count(&self) -> u32 {
        1
    }

    fn lane(&self) -> Lane {
        Lane::Send
    }

    fn serialize(&self) -> AppResult<Vec<u8>> {
        encode(&self.payload)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let group = &self.payload.group_id;
        if !self.inviter.is_admin(group).await? {
            return Err(JobError::Permanent(format!("not an admin of {group}")));
        }

        let results = join_all(
            self.payload
                .members
                .iter()
                .map(|member| self.inviter.invite(group, member)),
        )
        .await;

        let mut sent = Vec::new();
        let mut failed = Vec::new();
        for (member, result) in self.payload.members.iter().zip(results) {
            match result {
                Ok(()) => sent.push(member.clone()),
                Err(e) => {
                    warn!(job_id = %ctx.id, group = %group, member = %member, error = %e, "Invite failed");
                    failed.push(member.clone());
                }
            }
        }

        self.inviter.record_invites(group, &sent, &failed).await?;
        info!(
            job_id = %ctx.id,
            group = %group,
            sent = sent.len(),
            failed = failed.len(),
            "Sent group invites"
        );
        Ok(())
    }
}

/// Rebuilds [`InviteContactsJob`]s from storage.
pub struct InviteContactsFactory {
    inviter: GroupInviterService,
}

impl InviteContactsFactory {
    #[must_use]
    pub const fn new(inviter: GroupInviterService) -> Self {
        Self { inviter }
    }
}

impl JobFactory for InviteContactsFactory {
    fn factory_key(&self) -> &'static str {
        InviteContactsJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        let payload: InviteContactsPayload = decode(payload)?;
        Ok(Arc::new(InviteContactsJob {
            payload,
            inviter: self.inviter.clone(),
        }))
    }
}
