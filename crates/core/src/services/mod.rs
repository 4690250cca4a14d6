//! Collaborator contracts.
//!
//! Each trait is object safe and shared as `Arc<dyn Trait>` through the
//! `*Service` aliases.

pub mod account;
pub mod conversation;
pub mod handler;
pub mod notifier;
pub mod parser;
pub mod transport;

pub use account::{AccountState, AccountStateService};
pub use conversation::{ConversationStore, ConversationStoreService};
pub use handler::{
    ControlContext, ReceivedMessageHandler, ReceivedMessageHandlerService, VisibleContext,
};
pub use notifier::{MessageNotifier, MessageNotifierService, NoOpNotifier};
pub use parser::{
    DuplicateCheck, MessageParser, MessageParserService, ParseRequest, ReceiveError,
    ReceiveErrorKind,
};
pub use transport::{
    Attachment, AttachmentTransfer, AttachmentTransferService, CommunityApi, CommunityApiService,
    GroupInviter, GroupInviterService, MessageTransport, MessageTransportService, Outbox,
    OutboxService, PushNotifier, PushNotifierService, PushPayload, STATUS_TOO_MANY_REQUESTS,
    TransportError,
};
