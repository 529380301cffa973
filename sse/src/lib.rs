//! Server-Sent Events (SSE) broadcast engine.
//!
//! This crate owns the subscriber side of the REST server's event streams: who is
//! listening, what they want, and keeping their streams alive.
//!
//! # Architecture
//!
//! - **Transport seam**: the HTTP layer hands each accepted subscription over as a
//!   [`connection::Transport`]. The manager writes frames through it and closes it on
//!   eviction; it never touches sockets directly.
//! - **Single-lock registry**: the set of live connections sits behind one mutex. A
//!   publish holds it for the whole sweep, so membership cannot change mid-sweep.
//! - **Fire-or-ping sweep**: each publish either delivers the event to a connection or,
//!   if the connection does not want it and has been idle past the ping interval, pings
//!   it. A failed write of either kind evicts the connection.
//! - **Keep-alive task**: a background task polling once a second pings idle
//!   connections when nothing has been published for a full ping interval.
//! - **Ephemeral delivery**: events published while a subscriber is disconnected are
//!   dropped.
//!
//! # Modules
//!
//! - `connection`: `Connection`, `ConnectionId` and the `Transport` seam
//! - `manager`: `Manager` (publish fan-out, keep-alive, eviction)
//! - `message`: `text/event-stream` frame encoding

pub mod connection;
pub mod error;
pub mod manager;
pub mod message;

pub use manager::Manager;
