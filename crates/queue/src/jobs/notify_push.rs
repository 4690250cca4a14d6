//! Push server notification job.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::AppResult;
use courier_core::{PushNotifierService, PushPayload};
use tracing::debug;

use super::{decode, encode, transport_failure};
use crate::job::{Job, JobContext, JobError, Lane};
use crate::registry::JobFactory;

/// Forwards a notification to the push server.
pub struct NotifyPushServerJob {
    payload: PushPayload,
    notifier: PushNotifierService,
}

impl NotifyPushServerJob {
    pub const FACTORY_KEY: &'static str = "NotifyPNServerJob";

    #[must_use]
    pub const fn new(payload: PushPayload, notifier: PushNotifierService) -> Self {
        Self { payload, notifier }
    }
}

impl fmt::Debug for NotifyPushServerJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyPushServerJob")
            .field("recipient", &self.payload.recipient)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for NotifyPushServerJob {
    fn factory_key(&self) -> &'static str {
        Self::FACTORY_KEY
    }

    fn max_failure_count(&self) -> u32 {
        20
    }

    fn lane(&self) -> Lane {
        Lane::Send
    }

    fn serialize(&self) -> AppResult<Vec<u8>> {
        encode(&self.payload)
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.notifier
            .notify(&self.payload)
            .await
            .map_err(|e| transport_failure(&e))?;
        debug!(job_id = %ctx.id, recipient = %self.payload.recipient, "Push notification sent");
        Ok(())
    }
}

/// Rebuilds [`NotifyPushServerJob`]s from storage.
pub struct NotifyPushFactory {
    notifier: PushNotifierService,
}

impl NotifyPushFactory {
    #[must_use]
    pub const fn new(notifier: PushNotifierService) -> Self {
        Self { notifier }
    }
}

impl JobFactory for NotifyPushFactory {
    fn factory_key(&self) -> &'static str {
        NotifyPushServerJob::FACTORY_KEY
    }

    fn create(&self, payload: &[u8]) -> AppResult<Arc<dyn Job>> {
        Ok(Arc::new(NotifyPushServerJob::new(
            decode(payload)?,
            self.notifier.clone(),
        )))
    }
}
