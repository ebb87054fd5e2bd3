//! Named broadcast channels shared by every block on a page.
//!
//! Blocks never hold references to each other. They agree on channel names
//! through their declarations and exchange the small, closed vocabulary of
//! [`Message`] variants over a [`ChannelBus`].

mod core;
mod message;

pub use self::core::{
    BusStats, ChannelBus, EmitReport, Handler, HandlerFailure, MAX_EMIT_DEPTH, Subscription,
};
pub use message::{ChannelError, Message, MessageTag};
