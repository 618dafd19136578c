//! Client-side reconciliation engine.
//!
//! A pure, transport-agnostic state machine that merges optimistic local
//! sends, server acknowledgements, and pushed events into one ordered,
//! de-duplicated message list per conversation. The connection layer feeds
//! it `ServerEvent`s; the UI reads feeds, unread counts, typing and
//! connection state back out. No I/O happens here.

pub mod engine;
pub mod feed;

pub use engine::{CatchUpPlan, ConnectionStatus, Effect, ReconcileEngine};
pub use feed::{ConversationFeed, Entry, LocalId, LocalMessage};
