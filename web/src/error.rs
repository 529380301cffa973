//! Error types for the `web` layer.
//!
//! Administrative operations on the server (configuration, route registration, start/stop,
//! publish) report failures as `web::error::Error`, a root struct holding a tree of
//! `error_kind` enums plus the optional underlying `source`. Per-request failures never
//! surface here; they are turned into error response bodies by the dispatcher.
use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ServerErrorKind,
}

/// Major categories of errors reported by the server façade.
#[derive(Debug, PartialEq)]
pub enum ServerErrorKind {
    Config(ConfigErrorKind),
    Route(RouteErrorKind),
    Lifecycle(LifecycleErrorKind),
}

/// Rejected configuration changes.
#[derive(Debug, PartialEq)]
pub enum ConfigErrorKind {
    /// Port outside 1024..=65535.
    BadPort,
    /// Blank bind address.
    BadAddress,
    /// Configuration cannot change while the server is running.
    Running,
}

/// Route table failures.
#[derive(Debug, PartialEq)]
pub enum RouteErrorKind {
    /// No route registered for the (path, method) pair.
    NotMapped,
    /// SSE routes cannot end in `/*`.
    WildcardSse,
    /// SSE routes are always `GET`.
    SseMethod,
}

/// Server lifecycle failures.
#[derive(Debug, PartialEq)]
pub enum LifecycleErrorKind {
    /// Publishing requires a running server.
    NotRunning,
    /// The listener could not be bound.
    Bind,
    /// A previous bind failure left the server permanently unusable.
    Unusable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ServerErrorKind::Config(kind) => write!(f, "Configuration error: {:?}", kind)?,
            ServerErrorKind::Route(kind) => write!(f, "Route error: {:?}", kind)?,
            ServerErrorKind::Lifecycle(kind) => write!(f, "Server lifecycle error: {:?}", kind)?,
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
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

/// Helper function to create configuration errors.
pub fn config_error(kind: ConfigErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ServerErrorKind::Config(kind),
    }
}

/// Helper function to create route errors.
pub fn route_error(kind: RouteErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ServerErrorKind::Route(kind),
    }
}

/// Helper function to create lifecycle errors.
pub fn lifecycle_error(kind: LifecycleErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ServerErrorKind::Lifecycle(kind),
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ServerErrorKind::Lifecycle(LifecycleErrorKind::Bind),
        }
    }
}
