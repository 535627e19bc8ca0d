//! Parley Relay
//!
//! A WebSocket messaging relay for one-to-one conversations between
//! authenticated principals:
//!
//! 1. **Presence-based routing**: a message to an online principal is pushed
//!    over its live connection and marked delivered immediately.
//!
//! 2. **Offline fallback**: a message to an offline principal is persisted and
//!    a best-effort notification goes to the principal's notify address.
//!
//! 3. **Read receipts**: marking a conversation read flips every unread
//!    message in one atomic update and tells the sender.
//!
//! 4. **Conversation lists**: per-counterpart unread counts and latest
//!    message, computed from the store on demand.
//!
//! Privileged principals (staff) share an inbox: messages to one are mirrored
//! to every other privileged listener.

pub mod connection;
pub mod conversations;
pub mod error;
pub mod handler;
pub mod identity;
pub mod lifecycle;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod receipts;
pub mod router;
pub mod routes;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{RelayError, Result};
pub use state::{RelayConfig, RelayState};
