//! Error types for the `sse` crate.
//!
//! Follows the same pattern as the other crates in the workspace: a root `Error` struct
//! holding an error kind and an optional source for chaining.

use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Transport(TransportErrorKind),
    Manager(ManagerErrorKind),
}

/// Errors writing to a subscriber's open response stream.
#[derive(Debug, PartialEq)]
pub enum TransportErrorKind {
    /// The peer went away or the stream was already closed.
    Closed,
}

/// Errors from the connection manager itself.
#[derive(Debug, PartialEq)]
pub enum ManagerErrorKind {
    /// The manager has been closed and accepts no more connections.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Transport(kind) => write!(f, "SSE transport error: {:?}", kind)?,
            ErrorKind::Manager(kind) => write!(f, "SSE manager error: {:?}", kind)?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Helper function to create transport errors.
pub fn transport_error(kind: TransportErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Transport(kind),
    }
}

/// Helper function to create manager errors.
pub fn manager_error(kind: ManagerErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Manager(kind),
    }
}
