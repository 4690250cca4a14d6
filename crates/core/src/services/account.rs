//! Local account state consulted while receiving.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;

use crate::address::CommunityAddress;

/// Who the local user is and which contacts and groups they have.
#[async_trait]
pub trait AccountState: Send + Sync {
    /// Account id of the local user, `None` before onboarding.
    async fn local_account_id(&self) -> AppResult<Option<String>>;

    /// Blinded ids the local user is known by in `community`.
    async fn blinded_ids(&self, community: Option<&CommunityAddress>) -> AppResult<Vec<String>>;

    /// Public key of a community server.
    async fn community_public_key(&self, server_url: &str) -> AppResult<Option<String>>;

    /// Closed groups the local user is currently a member of.
    async fn active_group_ids(&self) -> AppResult<HashSet<String>>;

    /// For a contact the user has hidden, the timestamp of the contacts
    /// config that hid it.
    async fn hidden_contact_since(&self, account_id: &str) -> AppResult<Option<u64>>;
}

/// Type alias for shared account state.
pub type AccountStateService = Arc<dyn AccountState>;
