//! Batched processing of inbound messages.
//!
//! A batch is parsed sequentially, grouped by conversation and then applied
//! with one task per conversation. Messages inside a conversation are handled
//! strictly in order. Items that failed for a retryable reason are returned
//! so the caller can resubmit just those.

mod reactions;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use courier_common::{AppError, AppResult, JobId, get_metrics};
use courier_core::{
    AccountStateService, Address, CommunityAddress, ControlContext, ConversationId,
    ConversationStoreService, Message, MessageId, MessageKind, MessageNotifierService,
    MessageParserService, MessageReceiveParameters, NoOpNotifier, ParseRequest, ParsedMessage,
    ReactionRecord, ReceiveError, ReceiveErrorKind, ReceivedMessageHandlerService,
    VisibleContext,
};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

pub use reactions::{ReactorIdentity, build_reaction_records, collect_reactions};

/// Collaborators used while processing a batch.
#[derive(Clone)]
pub struct ReceiveContext {
    pub parser: MessageParserService,
    pub conversations: ConversationStoreService,
    pub handler: ReceivedMessageHandlerService,
    pub account: AccountStateService,
    pub notifier: MessageNotifierService,
}

impl ReceiveContext {
    #[must_use]
    pub fn new(
        parser: MessageParserService,
        conversations: ConversationStoreService,
        handler: ReceivedMessageHandlerService,
        account: AccountStateService,
    ) -> Self {
        Self {
            parser,
            conversations,
            handler,
            account,
            notifier: Arc::new(NoOpNotifier),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: MessageNotifierService) -> Self {
        self.notifier = notifier;
        self
    }
}

/// Result of processing one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Items in the batch.
    pub total: usize,
    /// Items skipped for good: duplicates, self-sends, hidden or unprocessable.
    pub dropped: usize,
    /// Items that failed for a retryable reason, in batch order per conversation.
    pub failures: Vec<MessageReceiveParameters>,
    /// Stored messages from other users.
    pub unread: usize,
    /// Stored messages from other users that mention the local user.
    pub mentions: usize,
}

impl BatchOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Process every item of a batch.
///
/// `from_community` is set when the whole batch was polled from one
/// community room.
pub async fn process_batch(
    ctx: &ReceiveContext,
    messages: &[MessageReceiveParameters],
    from_community: Option<&CommunityAddress>,
    job_id: JobId,
) -> BatchOutcome {
    let mut outcome = BatchOutcome {
        total: messages.len(),
        ..BatchOutcome::default()
    };
    if messages.is_empty() {
        return outcome;
    }
    info!(job_id = %job_id, count = messages.len(), "Processing inbound batch");

    let identity = match BatchIdentity::load(ctx, from_community).await {
        Ok(identity) => identity,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Could not load account state for batch");
            outcome.failures = messages.to_vec();
            get_metrics().record_batch(outcome.total, 0, outcome.failures.len());
            return outcome;
        }
    };

    let run = BatchRun {
        ctx,
        identity,
        from_community,
        job_id,
    };

    let mut state = ConversationState::default();
    let (grouped, sentinel) = run.parse_all(messages, &mut state).await;

    let results = join_all(
        grouped
            .into_iter()
            .map(|(conversation, items)| run.process_conversation(conversation, items)),
    )
    .await;
    for result in results {
        state.absorb(result);
    }

    if !sentinel.is_empty() {
        debug!(job_id = %job_id, count = sentinel.len(), "Processing messages without a conversation");
        for parsed in sentinel {
            if let Err(e) = run.handle_message(None, &parsed, &mut state).await {
                run.triage(&e, &parsed.parameters, &mut state);
            }
        }
    }

    outcome.dropped = state.dropped;
    outcome.failures = state.failures;
    outcome.unread = state.unread;
    outcome.mentions = state.mentions;
    get_metrics().record_batch(outcome.total, outcome.dropped, outcome.failures.len());

    if outcome.is_success() {
        info!(job_id = %job_id, count = outcome.total, dropped = outcome.dropped, "Completed inbound batch");
    } else {
        warn!(
            job_id = %job_id,
            failed = outcome.failures.len(),
            succeeded = outcome.total - outcome.failures.len(),
            "Inbound batch had failures"
        );
    }
    outcome
}

/// Account state read once per batch.
struct BatchIdentity {
    account_id: Option<String>,
    blinded_ids: Vec<String>,
    community_key: Option<String>,
    active_groups: HashSet<String>,
}

impl BatchIdentity {
    async fn load(ctx: &ReceiveContext, community: Option<&CommunityAddress>) -> AppResult<Self> {
        let account_id = ctx.account.local_account_id().await?;
        let blinded_ids = ctx.account.blinded_ids(community).await?;
        let community_key = match community {
            Some(c) => ctx.account.community_public_key(&c.server_url).await?,
            None => None,
        };
        let active_groups = ctx.account.active_group_ids().await?;
        Ok(Self {
            account_id,
            blinded_ids,
            community_key,
            active_groups,
        })
    }

    fn is_self(&self, sender: &str) -> bool {
        self.account_id.as_deref() == Some(sender) || self.blinded_ids.iter().any(|b| b == sender)
    }

    fn reactor(&self) -> ReactorIdentity<'_> {
        ReactorIdentity {
            account_id: self.account_id.as_deref(),
            blinded_ids: &self.blinded_ids,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredFlags {
    own: bool,
    mention: bool,
}

/// Bookkeeping for one conversation, or for the whole batch once merged.
#[derive(Default)]
struct ConversationState {
    own_last_seen: u64,
    stored: Vec<(MessageId, StoredFlags)>,
    reactions: BTreeMap<MessageId, Vec<ReactionRecord>>,
    failures: Vec<MessageReceiveParameters>,
    dropped: usize,
    unread: usize,
    mentions: usize,
}

impl ConversationState {
    fn absorb(&mut self, other: Self) {
        self.failures.extend(other.failures);
        self.dropped += other.dropped;
        self.unread += other.unread;
        self.mentions += other.mentions;
    }

    fn count_stored(&mut self) {
        for (_, flags) in self.stored.drain(..) {
            if !flags.own {
                self.unread += 1;
                if flags.mention {
                    self.mentions += 1;
                }
            }
        }
    }
}

type Grouped = Vec<(ConversationId, Vec<ParsedMessage>)>;

struct BatchRun<'a> {
    ctx: &'a ReceiveContext,
    identity: BatchIdentity,
    from_community: Option<&'a CommunityAddress>,
    job_id: JobId,
}

impl BatchRun<'_> {
    /// Parse every item and group the results by conversation.
    ///
    /// Groups keep first-seen order; messages inside a group keep batch order.
    async fn parse_all(
        &self,
        messages: &[MessageReceiveParameters],
        state: &mut ConversationState,
    ) -> (Grouped, Vec<ParsedMessage>) {
        let mut grouped: Grouped = Vec::new();
        let mut index: HashMap<ConversationId, usize> = HashMap::new();
        let mut sentinel = Vec::new();

        for params in messages {
            match self.parse_one(params).await {
                Ok(Some((Some(conversation), parsed))) => {
                    let slot = *index.entry(conversation).or_insert_with(|| {
                        grouped.push((conversation, Vec::new()));
                        grouped.len() - 1
                    });
                    grouped[slot].1.push(parsed);
                }
                Ok(Some((None, parsed))) => sentinel.push(parsed),
                Ok(None) => state.dropped += 1,
                Err(e) => self.triage(&e, params, state),
            }
        }
        (grouped, sentinel)
    }

    /// Parse one item and resolve its conversation. `None` if it is hidden.
    async fn parse_one(
        &self,
        params: &MessageReceiveParameters,
    ) -> Result<Option<(Option<ConversationId>, ParsedMessage)>, ReceiveError> {
        let request = ParseRequest {
            data: &params.data,
            community_message_server_id: params.community_message_server_id,
            community_public_key: self.identity.community_key.as_deref(),
            active_group_ids: &self.identity.active_groups,
            group_session_id: params.closed_group.as_deref(),
        };
        let (mut message, envelope) = self.ctx.parser.parse(request).await?;
        message.server_hash.clone_from(&params.server_hash);

        if self.is_hidden(&message).await? {
            debug!(
                job_id = %self.job_id,
                sender = %message.sender,
                "Dropping message from hidden contact"
            );
            return Ok(None);
        }

        let address = self.thread_address(&message);
        let conversation = if message.is_conversation_initiating() {
            Some(self.ctx.conversations.resolve_or_create(&address).await?)
        } else {
            self.ctx.conversations.resolve_existing(&address).await?
        };

        Ok(Some((
            conversation,
            ParsedMessage {
                parameters: params.clone(),
                message,
                envelope,
            },
        )))
    }

    /// A 1:1 message older than the moment its sender was hidden.
    async fn is_hidden(&self, message: &Message) -> AppResult<bool> {
        if message.group_public_key.is_some() || message.community_server_message_id.is_some() {
            return Ok(false);
        }
        let Some(sent) = message.sent_timestamp else {
            return Ok(false);
        };
        let contact = message.sender_or_sync(self.identity.account_id.as_deref());
        Ok(self
            .ctx
            .account
            .hidden_contact_since(contact)
            .await?
            .is_some_and(|since| sent < since))
    }

    fn thread_address(&self, message: &Message) -> Address {
        if let Some(community) = self.from_community {
            Address::Community(community.clone())
        } else if let Some(group) = &message.group_public_key {
            Address::Group(group.clone())
        } else {
            Address::Contact(
                message
                    .sender_or_sync(self.identity.account_id.as_deref())
                    .to_string(),
            )
        }
    }

    async fn process_conversation(
        &self,
        conversation: ConversationId,
        items: Vec<ParsedMessage>,
    ) -> ConversationState {
        let mut state = ConversationState::default();
        debug!(job_id = %self.job_id, conversation = %conversation, count = items.len(), "Processing conversation");

        for parsed in &items {
            if let Err(e) = self.handle_message(Some(conversation), parsed, &mut state).await {
                self.triage(&e, &parsed.parameters, &mut state);
            }
        }

        self.finish_conversation(conversation, &mut state).await;
        state.count_stored();
        state
    }

    async fn handle_message(
        &self,
        conversation: Option<ConversationId>,
        parsed: &ParsedMessage,
        state: &mut ConversationState,
    ) -> Result<(), ReceiveError> {
        let message = &parsed.message;
        match &message.kind {
            MessageKind::Visible(visible) => {
                let Some(conversation_id) = conversation else {
                    return Err(ReceiveError::non_retryable(
                        "visible message without a conversation",
                    ));
                };
                let stored = self
                    .ctx
                    .handler
                    .handle_visible(
                        message,
                        visible,
                        &parsed.envelope,
                        VisibleContext {
                            conversation_id,
                            from_community: self.from_community,
                            run_thread_update: false,
                            run_profile_update: true,
                        },
                    )
                    .await?;

                let own = self.identity.is_self(&message.sender);
                if let (true, Some(sent)) = (own, message.sent_timestamp) {
                    state.own_last_seen = state.own_last_seen.max(sent);
                }
                if let (Some(id), None) = (stored, &visible.reaction) {
                    state.stored.push((
                        id,
                        StoredFlags {
                            own,
                            mention: visible.has_mention,
                        },
                    ));
                }
                if let Some(server_id) = parsed.parameters.community_message_server_id {
                    collect_reactions(
                        self.ctx.conversations.as_ref(),
                        conversation_id,
                        server_id,
                        parsed.parameters.reactions.as_ref(),
                        self.identity.reactor(),
                        &mut state.reactions,
                    )
                    .await?;
                }
            }
            MessageKind::Unsend(request) => {
                if let Some(deleted) = self.ctx.handler.handle_unsend(message, request).await? {
                    state.stored.retain(|(id, _)| *id != deleted);
                }
            }
            _ => {
                self.ctx
                    .handler
                    .handle_control(
                        message,
                        &parsed.envelope,
                        ControlContext {
                            conversation_id: conversation,
                            group_id: parsed.parameters.closed_group.as_deref(),
                            from_community: self.from_community,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Thread-level updates once all messages of a conversation are handled.
    ///
    /// Each step runs even when an earlier one failed.
    async fn finish_conversation(&self, conversation: ConversationId, state: &mut ConversationState) {
        let conversations = &self.ctx.conversations;

        if let Err(e) = self.advance_watermark(conversation, state.own_last_seen).await {
            self.log_finish_error(conversation, "mark_read", &e);
        }
        if let Err(e) = conversations.refresh_summary(conversation).await {
            self.log_finish_error(conversation, "refresh_summary", &e);
        }
        if let Err(e) = self.ctx.notifier.update_notification(conversation).await {
            self.log_finish_error(conversation, "update_notification", &e);
        }
        if !state.reactions.is_empty() {
            let reactions = std::mem::take(&mut state.reactions);
            if let Err(e) = conversations.upsert_reactions(reactions, true, false).await {
                self.log_finish_error(conversation, "upsert_reactions", &e);
            }
        }
    }

    async fn advance_watermark(&self, conversation: ConversationId, own_last_seen: u64) -> AppResult<()> {
        let conversations = &self.ctx.conversations;
        // Another batch may have advanced the watermark meanwhile.
        let stored = conversations.last_seen(conversation).await?;
        if own_last_seen > 0 || stored == 0 {
            conversations
                .mark_read(conversation, own_last_seen.max(stored), true)
                .await?;
        }
        Ok(())
    }

    fn log_finish_error(&self, conversation: ConversationId, step: &'static str, err: &AppError) {
        error!(
            job_id = %self.job_id,
            conversation = %conversation,
            step,
            error = %err,
            "Failed to update conversation after batch"
        );
    }

    fn triage(
        &self,
        error: &ReceiveError,
        params: &MessageReceiveParameters,
        state: &mut ConversationState,
    ) {
        match error.kind {
            ReceiveErrorKind::Duplicate | ReceiveErrorKind::SelfSend => {
                debug!(job_id = %self.job_id, kind = %error.kind, "Skipping message: {}", error.message);
                state.dropped += 1;
            }
            ReceiveErrorKind::NonRetryable => {
                error!(job_id = %self.job_id, error = %error, "Couldn't receive message, dropping it");
                state.dropped += 1;
            }
            ReceiveErrorKind::Retryable => {
                error!(job_id = %self.job_id, error = %error, "Couldn't receive message, will retry");
                state.failures.push(params.clone());
            }
        }
    }
}
