//! Message Streaming Module
//!
//! Turns the store's realtime feed into ordered, duplicate-free changes to a
//! conversation's message list, and fans applied changes out to subscribers.

mod manager;
pub mod reconciler;
mod types;

pub use manager::MessageStreamManager;
pub use reconciler::{ReconcileOutcome, RealtimeReconciler, apply_event};
pub use types::{
    ConversationMessageSubscription, InvalidRealtimeEvent, MessageUpdate, RealtimeEvent,
    SubscriptionState, UpdateTrigger,
};
