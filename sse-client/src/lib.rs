//! Subscriber side of the REST server's Server-Sent Events.
//!
//! - `parser`: line reassembly and `text/event-stream` frame parsing
//! - `client`: `EventSourceClient`, a reconnecting subscriber with callbacks
//! - `error`: client error kinds

pub mod client;
pub mod error;
pub mod parser;
