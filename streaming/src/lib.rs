//! Real-time topic streaming over persistent client connections.
//!
//! # Architecture
//!
//! - **One connection per principal**: a second login for the same identity
//!   replaces the registry entry and tears the previous connection down.
//! - **One forwarding task per (connection, topic)**: re-subscribing is a no-op.
//!   Each task owns a broker stream and a cancellation token that fires on
//!   unsubscribe, connection close or shutdown.
//! - **Bounded outbound queues**: every connection has a fixed-size queue shared by
//!   replies and forwarded messages. What happens when it fills up is decided by
//!   the configured [`OverflowPolicy`].
//! - **Ephemeral messages**: nothing is replayed; a client that is not subscribed
//!   when a message is published never sees it.
//!
//! # Message Flow
//!
//! 1. The transport authenticates the client and opens a [`Session`]
//! 2. The session registers with the [`SubscriptionManager`] and queues a welcome
//! 3. Each inbound frame is decoded, authorized and executed
//! 4. Forwarding tasks push broker messages into the outbound queue
//! 5. The transport drains the queue until the connection's close signal fires
//!
//! # Modules
//!
//! - `connection`: ConnectionRegistry keyed by principal with per-connection topic sets
//! - `manager`: subscription lifecycle, forwarding tasks and backpressure
//! - `message`: inbound/outbound envelopes and protocol error codes
//! - `session`: per-connection state machine and dispatch

pub mod connection;
pub mod manager;
pub mod message;
pub mod session;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionId, ConnectionKey, ConnectionRegistry};
pub use manager::{OverflowPolicy, SubscriptionManager, SubscriptionSettings};
pub use message::{ErrorCode, Response};
pub use session::{ConnectionState, Outbound, Session};
