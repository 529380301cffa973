use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = core::result::Result<T, Error>;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Failure reported to `EventSourceHandlers::on_error`, or returned from `run`.
#[derive(Debug)]
pub struct Error {
    pub source: Option<BoxError>,
    pub error_kind: ClientErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientErrorKind {
    /// The HTTP client could not be built.
    Setup,
    /// The token provider failed; the attempt is retried.
    Token,
    /// Connecting or reading the stream failed; the attempt is retried.
    Transport,
    /// The server answered with something other than an event stream.
    Rejected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ClientErrorKind::Setup => write!(f, "Client setup error")?,
            ClientErrorKind::Token => write!(f, "Token error")?,
            ClientErrorKind::Transport => write!(f, "Transport error")?,
            ClientErrorKind::Rejected => write!(f, "Rejected by server")?,
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

impl Error {
    pub fn new(error_kind: ClientErrorKind, source: impl Into<BoxError>) -> Self {
        Error {
            source: Some(source.into()),
            error_kind,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::new(ClientErrorKind::Transport, err)
    }
}
