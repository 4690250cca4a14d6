//! Domain model and collaborator contracts for courier.
//!
//! The job queue only ever talks to the outside world through the traits in
//! [`services`]: message parsing, conversation storage, message handling,
//! notifications and the network transports used by outbound jobs.
//! [`memory`] provides in-process implementations used by the daemon and by
//! tests, and [`codec`] a JSON wire parser.

pub mod address;
pub mod codec;
pub mod encoding;
pub mod memory;
pub mod messages;
pub mod services;

pub use address::{Address, CommunityAddress, ConversationId, MessageId};
pub use codec::JsonEnvelopeParser;
pub use messages::{
    CommunityReaction, Destination, Envelope, Message, MessageKind, MessageReceiveParameters,
    OutgoingMessage, ParsedMessage, Reaction, ReactionRecord, UnsendRequest, VisibleMessage,
};
pub use services::*;
