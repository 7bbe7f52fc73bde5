//! Conversation engine: slot extraction, per-user state, and the mediator
//! that drives a turn from inbound message to outbound reply.

pub mod extractor;
pub mod mediator;
pub mod replies;
pub mod slots;
pub mod state;
pub mod store;

pub use mediator::{InboundMessage, Mediator, OutboundReply};
pub use state::{ConversationState, Phase};
pub use store::{ConversationStore, PgConversationStore};
