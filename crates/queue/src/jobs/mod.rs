//! Job definitions.
//!
//! Each job keeps its persisted fields in a serde payload struct and its
//! collaborators next to it. The matching factory captures the same
//! collaborators and rebuilds the job from a stored payload.

#![allow(missing_docs)]

mod attachment_download;
mod attachment_upload;
mod batch_receive;
mod community_delete;
mod group_avatar;
mod invite_contacts;
mod message_send;
mod notify_push;
mod trim_thread;

use courier_common::AppResult;
use courier_core::{CommunityAddress, TransportError};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::job::{JobError, Lane};

pub use attachment_download::{
    AttachmentDownloadFactory, AttachmentDownloadJob, AttachmentDownloadPayload,
};
pub use attachment_upload::{AttachmentUploadFactory, AttachmentUploadJob, AttachmentUploadPayload};
pub use batch_receive::{BATCH_DEFAULT_SIZE, BatchReceiveFactory, BatchReceiveJob, BatchReceivePayload};
pub use community_delete::{CommunityDeleteFactory, CommunityDeleteJob, CommunityDeletePayload};
pub use group_avatar::{GroupAvatarDownloadFactory, GroupAvatarDownloadJob, GroupAvatarPayload};
pub use invite_contacts::{InviteContactsFactory, InviteContactsJob, InviteContactsPayload};
pub use message_send::{MessageSendFactory, MessageSendJob, MessageSendPayload, OutboxContext};
pub use notify_push::{NotifyPushFactory, NotifyPushServerJob};
pub use trim_thread::{THREAD_LENGTH_TRIGGER_SIZE, TrimThreadFactory, TrimThreadJob, TrimThreadPayload};

fn encode<T: Serialize>(payload: &T) -> AppResult<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> AppResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Lane for work tied to a community room, or the receive lane otherwise.
fn community_or_receive(community: Option<&CommunityAddress>) -> Lane {
    community.map_or(Lane::Receive, |c| Lane::Community(c.lane_key()))
}

/// Map a network failure to a job outcome.
fn transport_failure(err: &TransportError) -> JobError {
    if err.should_retry() {
        JobError::Retryable(err.to_string())
    } else {
        JobError::Permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_permanent() {
        assert!(matches!(
            transport_failure(&TransportError::http(429, "slow down")),
            JobError::Permanent(_)
        ));
        assert!(matches!(
            transport_failure(&TransportError::http(503, "busy")),
            JobError::Retryable(_)
        ));
        assert!(matches!(
            transport_failure(&TransportError::transient("timeout")),
            JobError::Retryable(_)
        ));
    }

    #[test]
    fn test_community_lane_key() {
        let community = CommunityAddress::new("https://chat.example.org", "lobby");
        assert_eq!(
            community_or_receive(Some(&community)),
            Lane::Community("https://chat.example.org.lobby".into())
        );
        assert_eq!(community_or_receive(None), Lane::Receive);
    }
}
