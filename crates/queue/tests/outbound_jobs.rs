//! Outbound and maintenance jobs against fake network collaborators.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_common::{AppResult, JobId};
use courier_core::memory::{MemoryStore, StaticAccountState};
use courier_core::{
    Address, Attachment, AttachmentTransfer, CommunityAddress, CommunityApi, ConversationStore,
    Destination, GroupInviter, JsonEnvelopeParser, MessageId, MessageTransport, Outbox, OutgoingMessage,
    PushNotifier, PushPayload, TransportError,
};
use courier_queue::{
    AttachmentDownloadJob, AttachmentUploadFactory, AttachmentUploadJob, BatchReceiveJob,
    CommunityDeleteJob, GroupAvatarDownloadJob, InMemoryJobStorage, InviteContactsJob, Job,
    JobContext, JobError, JobEventKind, JobQueue, JobRegistry, Lane, MessageSendFactory,
    MessageSendJob, NotifyPushServerJob, OutboxContext, ReceiveContext, RetryConfig,
    THREAD_LENGTH_TRIGGER_SIZE, TrimThreadJob,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Sending,
    Sent,
    Failed(String),
}

#[derive(Default)]
struct FakeOutbox {
    deleted: Mutex<HashSet<MessageId>>,
    outgoing: Mutex<HashSet<MessageId>>,
    status: Mutex<HashMap<MessageId, Status>>,
    attachments: Mutex<HashMap<i64, Attachment>>,
}

impl FakeOutbox {
    fn with_message(self, id: MessageId) -> Self {
        self.outgoing.lock().unwrap().insert(id);
        self
    }

    fn with_attachment(self, attachment: Attachment) -> Self {
        self.attachments
            .lock()
            .unwrap()
            .insert(attachment.id, attachment);
        self
    }

    fn status(&self, id: MessageId) -> Option<Status> {
        self.status.lock().unwrap().get(&id).cloned()
    }

    fn stored_attachment(&self, id: i64) -> Attachment {
        self.attachments.lock().unwrap()[&id].clone()
    }
}

#[async_trait]
impl Outbox for FakeOutbox {
    async fn is_deleted(&self, id: MessageId) -> AppResult<bool> {
        Ok(self.deleted.lock().unwrap().contains(&id))
    }

    async fn is_outgoing(&self, id: MessageId) -> AppResult<bool> {
        Ok(self.outgoing.lock().unwrap().contains(&id))
    }

    async fn mark_sending(&self, id: MessageId) -> AppResult<()> {
        self.status.lock().unwrap().insert(id, Status::Sending);
        Ok(())
    }

    async fn mark_sent(&self, id: MessageId) -> AppResult<()> {
        self.status.lock().unwrap().insert(id, Status::Sent);
        Ok(())
    }

    async fn mark_failed(&self, id: MessageId, error: &str) -> AppResult<()> {
        self.status
            .lock()
            .unwrap()
            .insert(id, Status::Failed(error.to_string()));
        Ok(())
    }

    async fn attachment(&self, id: i64) -> AppResult<Option<Attachment>> {
        Ok(self.attachments.lock().unwrap().get(&id).cloned())
    }

    async fn set_uploaded(&self, id: i64, url: &str) -> AppResult<()> {
        if let Some(attachment) = self.attachments.lock().unwrap().get_mut(&id) {
            attachment.url = Some(url.to_string());
        }
        Ok(())
    }

    async fn store_download(&self, id: i64, data: Vec<u8>) -> AppResult<()> {
        if let Some(attachment) = self.attachments.lock().unwrap().get_mut(&id) {
            attachment.data = Some(data);
        }
        Ok(())
    }
}

/// Replays scripted results, then succeeds.
#[derive(Default)]
struct FakeTransport {
    script: Mutex<VecDeque<TransportError>>,
    sent: Mutex<Vec<u64>>,
}

impl FakeTransport {
    fn failing_with(errors: impl IntoIterator<Item = TransportError>) -> Self {
        Self {
            script: Mutex::new(errors.into_iter().collect()),
            sent: Mutex::default(),
        }
    }

    fn sent(&self) -> Vec<u64> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for FakeTransport {
    async fn send(
        &self,
        message: &OutgoingMessage,
        _destination: &Destination,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(message.sent_timestamp);
        Ok(())
    }
}

#[derive(Default)]
struct FakeTransfer {
    uploads: Mutex<Vec<i64>>,
    downloads: Mutex<Vec<i64>>,
}

#[async_trait]
impl AttachmentTransfer for FakeTransfer {
    async fn upload(
        &self,
        attachment: &Attachment,
        _destination: &Destination,
    ) -> Result<String, TransportError> {
        self.uploads.lock().unwrap().push(attachment.id);
        Ok(format!("https://files.example.org/{}", attachment.id))
    }

    async fn download(&self, attachment: &Attachment) -> Result<Vec<u8>, TransportError> {
        self.downloads.lock().unwrap().push(attachment.id);
        Ok(b"image bytes".to_vec())
    }
}

struct Fixture {
    outbox: Arc<FakeOutbox>,
    transport: Arc<FakeTransport>,
    transfer: Arc<FakeTransfer>,
    ctx: Arc<OutboxContext>,
}

impl Fixture {
    fn new(outbox: FakeOutbox, transport: FakeTransport) -> Self {
        let outbox = Arc::new(outbox);
        let transport = Arc::new(transport);
        let transfer = Arc::new(FakeTransfer::default());
        let ctx = Arc::new(OutboxContext::new(
            outbox.clone(),
            transport.clone(),
            transfer.clone(),
        ));
        Self {
            outbox,
            transport,
            transfer,
            ctx,
        }
    }

    fn send_job(&self, id: MessageId, attachment_ids: Vec<i64>) -> MessageSendJob {
        MessageSendJob::new(
            OutgoingMessage {
                id: Some(id),
                body: b"hello".to_vec(),
                sent_timestamp: 1_700_000_000_000,
                attachment_ids,
                is_reaction: false,
            },
            Destination::Contact("05bob".into()),
            self.ctx.clone(),
        )
    }
}

fn attachment(id: i64, url: Option<&str>, data: Option<&[u8]>) -> Attachment {
    Attachment {
        id,
        content_type: "image/jpeg".into(),
        url: url.map(str::to_string),
        data: data.map(<[u8]>::to_vec),
    }
}

fn job_context(queue: JobQueue) -> JobContext {
    JobContext {
        id: JobId::new(1, 0),
        failure_count: 0,
        queue,
    }
}

fn idle_queue() -> JobQueue {
    JobQueue::new(
        Arc::new(InMemoryJobStorage::new()),
        JobRegistry::new(),
        RetryConfig::default(),
    )
}

#[tokio::test]
async fn test_send_waits_for_attachment_upload() {
    let message = MessageId(1);
    let fixture = Fixture::new(
        FakeOutbox::default()
            .with_message(message)
            .with_attachment(attachment(7, None, Some(&b"jpeg"[..]))),
        FakeTransport::default(),
    );
    let registry = JobRegistry::new()
        .with(MessageSendFactory::new(fixture.ctx.clone()))
        .with(AttachmentUploadFactory::new(fixture.ctx.clone()));
    let storage = Arc::new(InMemoryJobStorage::new());
    let queue = JobQueue::new(storage.clone(), registry, RetryConfig::default());
    let mut events = queue.subscribe();
    queue.start().unwrap();

    let send = queue.submit(fixture.send_job(message, vec![7])).await.unwrap();

    let mut upload = None;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("job events")
            .unwrap();
        match (&event.kind, event.factory_key) {
            (JobEventKind::Submitted, AttachmentUploadJob::FACTORY_KEY) => upload = Some(event.id),
            (JobEventKind::Succeeded, _) if event.id == send => break,
            (JobEventKind::PermanentlyFailed { .. } | JobEventKind::Retrying { .. }, _) => {
                panic!("unexpected event {event:?}")
            }
            _ => {}
        }
    }

    assert!(upload.is_some());
    assert_eq!(*fixture.transfer.uploads.lock().unwrap(), vec![7]);
    assert_eq!(fixture.transport.sent().len(), 1);
    assert_eq!(fixture.outbox.status(message), Some(Status::Sent));
    assert_eq!(
        fixture.outbox.stored_attachment(7).url.as_deref(),
        Some("https://files.example.org/7")
    );
    assert_eq!(storage.succeeded().await.len(), 2);
}

#[tokio::test]
async fn test_pending_upload_is_not_submitted_twice() {
    let message = MessageId(1);
    let fixture = Fixture::new(
        FakeOutbox::default()
            .with_message(message)
            .with_attachment(attachment(7, None, Some(&b"jpeg"[..]))),
        FakeTransport::default(),
    );
    let storage = Arc::new(InMemoryJobStorage::new());
    let queue = JobQueue::new(storage.clone(), JobRegistry::new(), RetryConfig::default());
    let job = fixture.send_job(message, vec![7]);

    // Not started: submitted uploads stay in storage without running.
    for _ in 0..2 {
        let outcome = job.execute(&job_context(queue.clone())).await;
        assert!(matches!(outcome, Err(JobError::AwaitingDependency(_))));
    }
    let uploads: Vec<_> = storage
        .records()
        .await
        .into_iter()
        .filter(|r| r.factory_key == AttachmentUploadJob::FACTORY_KEY)
        .collect();
    assert_eq!(uploads.len(), 1);
    assert!(fixture.transport.sent().is_empty());
}

#[tokio::test]
async fn test_rate_limited_send_fails_message() {
    let message = MessageId(3);
    let fixture = Fixture::new(
        FakeOutbox::default().with_message(message),
        FakeTransport::failing_with([TransportError::http(429, "too many requests")]),
    );

    let outcome = fixture
        .send_job(message, Vec::new())
        .execute(&job_context(idle_queue()))
        .await;

    assert!(matches!(outcome, Err(JobError::Permanent(_))));
    assert_eq!(
        fixture.outbox.status(message),
        Some(Status::Failed("too many requests".into()))
    );
}

#[tokio::test]
async fn test_transient_send_error_is_retried() {
    let message = MessageId(4);
    let fixture = Fixture::new(
        FakeOutbox::default().with_message(message),
        FakeTransport::failing_with([TransportError::transient("connection reset")]),
    );
    let job = fixture.send_job(message, Vec::new());

    let outcome = job.execute(&job_context(idle_queue())).await;
    assert!(matches!(outcome, Err(JobError::Retryable(_))));
    assert_eq!(fixture.outbox.status(message), Some(Status::Sending));

    // Deleted while the retry was pending: the job ends without sending.
    fixture.outbox.deleted.lock().unwrap().insert(message);
    job.execute(&job_context(idle_queue())).await.unwrap();
    assert!(fixture.transport.sent().is_empty());
}

#[tokio::test]
async fn test_deleted_message_is_not_sent() {
    let message = MessageId(5);
    let fixture = Fixture::new(
        FakeOutbox::default().with_message(message),
        FakeTransport::default(),
    );
    fixture.outbox.deleted.lock().unwrap().insert(message);

    fixture
        .send_job(message, Vec::new())
        .execute(&job_context(idle_queue()))
        .await
        .unwrap();

    assert!(fixture.transport.sent().is_empty());
    assert_eq!(fixture.outbox.status(message), None);
}

#[tokio::test]
async fn test_upload_without_data_fails_send() {
    let message = MessageId(6);
    let fixture = Fixture::new(
        FakeOutbox::default()
            .with_message(message)
            .with_attachment(attachment(9, None, None)),
        FakeTransport::default(),
    );
    let storage = Arc::new(InMemoryJobStorage::new());
    let queue = JobQueue::new(storage.clone(), JobRegistry::new(), RetryConfig::default());
    let send_job = JobId::new(1, 0);

    let upload = AttachmentUploadJob::new(
        9,
        Destination::Contact("05bob".into()),
        Some(message),
        send_job,
        fixture.ctx.clone(),
    );
    let outcome = upload.execute(&job_context(queue)).await;

    assert!(matches!(outcome, Err(JobError::Permanent(_))));
    assert!(matches!(fixture.outbox.status(message), Some(Status::Failed(_))));
    assert_eq!(storage.failed_permanently().await, vec![send_job]);
    assert!(fixture.transfer.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_download_stores_body_once() {
    let fixture = Fixture::new(
        FakeOutbox::default().with_attachment(attachment(
            11,
            Some("https://files.example.org/11"),
            None,
        )),
        FakeTransport::default(),
    );
    let job = AttachmentDownloadJob::new(11, fixture.ctx.clone());

    job.execute(&job_context(idle_queue())).await.unwrap();
    job.execute(&job_context(idle_queue())).await.unwrap();

    assert_eq!(*fixture.transfer.downloads.lock().unwrap(), vec![11]);
    assert_eq!(
        fixture.outbox.stored_attachment(11).data.as_deref(),
        Some(&b"image bytes"[..])
    );

    let missing = AttachmentDownloadJob::new(12, fixture.ctx.clone());
    assert!(matches!(
        missing.execute(&job_context(idle_queue())).await,
        Err(JobError::Permanent(_))
    ));
}

#[derive(Default)]
struct FakeInviter {
    admin: bool,
    unreachable: HashSet<String>,
    recorded: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

#[async_trait]
impl GroupInviter for FakeInviter {
    async fn is_admin(&self, _group_id: &str) -> AppResult<bool> {
        Ok(self.admin)
    }

    async fn invite(&self, _group_id: &str, member: &str) -> Result<(), TransportError> {
        if self.unreachable.contains(member) {
            return Err(TransportError::transient("swarm unreachable"));
        }
        Ok(())
    }

    async fn record_invites(
        &self,
        _group_id: &str,
        sent: &[String],
        failed: &[String],
    ) -> AppResult<()> {
        self.recorded
            .lock()
            .unwrap()
            .push((sent.to_vec(), failed.to_vec()));
        Ok(())
    }
}

#[tokio::test]
async fn test_invites_record_partial_failures() {
    let inviter = Arc::new(FakeInviter {
        admin: true,
        unreachable: HashSet::from(["05carol".to_string()]),
        ..FakeInviter::default()
    });
    let job = InviteContactsJob::new(
        "03group".into(),
        vec!["05alice".into(), "05carol".into(), "05dave".into()],
        inviter.clone(),
    );

    job.execute(&job_context(idle_queue())).await.unwrap();

    let recorded = inviter.recorded.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec![(
            vec!["05alice".to_string(), "05dave".to_string()],
            vec!["05carol".to_string()]
        )]
    );
}

#[tokio::test]
async fn test_invites_require_admin() {
    let inviter = Arc::new(FakeInviter::default());
    let job = InviteContactsJob::new("03group".into(), vec!["05alice".into()], inviter.clone());

    let outcome = job.execute(&job_context(idle_queue())).await;

    assert!(matches!(outcome, Err(JobError::Permanent(_))));
    assert!(inviter.recorded.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_trim_keeps_newest_messages() {
    let store = Arc::new(MemoryStore::new());
    let address = Address::Contact("05a".into());
    for ts in 0..(THREAD_LENGTH_TRIGGER_SIZE as u64 + 5) {
        store.insert_message(&address, "05a", ts, None).await;
    }
    let conversation = store.conversation_id(&address).await.unwrap();

    TrimThreadJob::new(conversation, None, store.clone())
        .execute(&job_context(idle_queue()))
        .await
        .unwrap();

    let remaining = store.messages(conversation).await;
    assert_eq!(remaining.len(), THREAD_LENGTH_TRIGGER_SIZE);
    assert!(remaining.iter().all(|m| m.sent_timestamp >= 5));
}

#[tokio::test]
async fn test_community_delete_by_server_id() {
    let store = Arc::new(MemoryStore::new());
    let community = CommunityAddress::new("https://chat.example.org", "lobby");
    let address = Address::Community(community.clone());
    for (ts, server_id) in [(1, 100), (2, 101), (3, 102)] {
        store
            .insert_message(&address, "15alice", ts, Some(server_id))
            .await;
    }
    let conversation = store.conversation_id(&address).await.unwrap();

    let job = CommunityDeleteJob::new(community, conversation, vec![100, 102, 999], store.clone());
    job.execute(&job_context(idle_queue())).await.unwrap();

    let remaining: Vec<Option<i64>> = store
        .messages(conversation)
        .await
        .iter()
        .map(|m| m.server_id)
        .collect();
    assert_eq!(remaining, vec![Some(101)]);
}

struct FakeCommunityApi;

#[async_trait]
impl CommunityApi for FakeCommunityApi {
    async fn download_room_image(
        &self,
        community: &CommunityAddress,
    ) -> Result<Vec<u8>, TransportError> {
        if community.room == "gone" {
            return Err(TransportError::http(404, "room not found"));
        }
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

#[tokio::test]
async fn test_room_image_is_stored() {
    let store = Arc::new(MemoryStore::new());
    let lobby = CommunityAddress::new("https://chat.example.org", "lobby");

    GroupAvatarDownloadJob::new(lobby.clone(), Arc::new(FakeCommunityApi), store.clone())
        .execute(&job_context(idle_queue()))
        .await
        .unwrap();
    assert_eq!(
        store.community_avatar(&lobby).await,
        Some(vec![0x89, b'P', b'N', b'G'])
    );

    let gone = CommunityAddress::new("https://chat.example.org", "gone");
    let outcome = GroupAvatarDownloadJob::new(gone.clone(), Arc::new(FakeCommunityApi), store.clone())
        .execute(&job_context(idle_queue()))
        .await;
    assert!(matches!(outcome, Err(JobError::Permanent(_))));
    assert_eq!(store.community_avatar(&gone).await, None);
}

#[tokio::test]
async fn test_community_jobs_share_one_lane() {
    let store = Arc::new(MemoryStore::new());
    let account = Arc::new(StaticAccountState::new("05me"));
    let parser = Arc::new(JsonEnvelopeParser::new(account.clone(), store.clone()));
    let ctx = Arc::new(ReceiveContext::new(parser, store.clone(), store.clone(), account));
    let lobby = CommunityAddress::new("https://chat.example.org", "lobby");
    let conversation = store
        .resolve_or_create(&Address::Community(lobby.clone()))
        .await
        .unwrap();

    let jobs: Vec<Box<dyn Job>> = vec![
        Box::new(BatchReceiveJob::new(Vec::new(), Some(lobby.clone()), ctx.clone())),
        Box::new(CommunityDeleteJob::new(lobby.clone(), conversation, vec![1], store.clone())),
        Box::new(TrimThreadJob::new(conversation, Some(lobby.clone()), store.clone())),
        Box::new(GroupAvatarDownloadJob::new(lobby.clone(), Arc::new(FakeCommunityApi), store.clone())),
    ];
    let expected = Lane::Community(lobby.lane_key());
    for job in &jobs {
        assert_eq!(job.lane(), expected, "{}", job.factory_key());
    }

    // Without a community, receive work stays on the receive lane.
    assert_eq!(BatchReceiveJob::new(Vec::new(), None, ctx).lane(), Lane::Receive);
    assert_eq!(TrimThreadJob::new(conversation, None, store.clone()).lane(), Lane::Receive);
}

struct FlakyPush;

#[async_trait]
impl PushNotifier for FlakyPush {
    async fn notify(&self, payload: &PushPayload) -> Result<(), TransportError> {
        if payload.ttl_ms == 0 {
            return Err(TransportError::http(400, "ttl must be positive"));
        }
        Err(TransportError::http(503, "push server busy"))
    }
}

#[tokio::test]
async fn test_push_errors_map_to_outcomes() {
    let payload = |ttl_ms| PushPayload {
        recipient: "05bob".into(),
        data: "ZW5jb2RlZA==".into(),
        ttl_ms,
    };

    let busy = NotifyPushServerJob::new(payload(86_400_000), Arc::new(FlakyPush));
    assert!(matches!(
        busy.execute(&job_context(idle_queue())).await,
        Err(JobError::Retryable(_))
    ));

    let invalid = NotifyPushServerJob::new(payload(0), Arc::new(FlakyPush));
    assert!(matches!(
        invalid.execute(&job_context(idle_queue())).await,
        Err(JobError::Permanent(_))
    ));
}
