use crate::error::{BoxError, ClientErrorKind, Error, Result};
use crate::parser::{FrameParser, LineSplitter, SseEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::*;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

pub const EVENT_STREAM: &str = "text/event-stream";
pub const LAST_EVENT_ID: &str = "Last-Event-ID";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Connecting,
    Open,
    Closed,
}

/// Callbacks for the life of a subscription. Only `on_message` is required.
pub trait EventSourceHandlers: Send + Sync {
    fn on_connecting(&self) {}
    fn on_open(&self) {}
    fn on_message(&self, event: &SseEvent);
    fn on_error(&self, _error: &Error) {}
    fn on_closed(&self) {}
}

/// Supplies the bearer token sent with each connection attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> std::result::Result<String, BoxError>;
}

/// A fixed token.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> std::result::Result<String, BoxError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub retry_delay: Duration,
    /// Sent as `Last-Event-ID` on the first attempt.
    pub last_event_id: Option<String>,
    /// Accept self-signed server certificates.
    pub accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            last_event_id: None,
            accept_invalid_certs: false,
        }
    }
}

/// EventSource subscriber with reconnect.
///
/// `run` connects, feeds the body through a [`FrameParser`] and reconnects after
/// `retry_delay` whenever the stream ends or fails, until `stop` is called or the server
/// answers with something other than an event stream. A `503` carrying the event-stream
/// content type is retried rather than treated as fatal.
pub struct EventSourceClient {
    url: String,
    options: ClientOptions,
    handlers: Arc<dyn EventSourceHandlers>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    state: Mutex<State>,
    last_event_id: Mutex<Option<String>>,
    stopped: watch::Sender<bool>,
}

impl EventSourceClient {
    pub fn new(
        url: impl Into<String>,
        handlers: Arc<dyn EventSourceHandlers>,
        options: ClientOptions,
    ) -> Self {
        let last_event_id = options.last_event_id.clone();
        Self {
            url: url.into(),
            options,
            handlers,
            token_provider: None,
            state: Mutex::new(State::Initial),
            last_event_id: Mutex::new(last_event_id),
            stopped: watch::channel(false).0,
        }
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    fn state_guard(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> State {
        *self.state_guard()
    }

    /// Id of the last dispatched event that carried one.
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Closes the subscription. An in-flight read or retry wait is interrupted.
    pub fn stop(&self) {
        self.signal_closed();
    }

    /// Runs the connect/retry loop until the client is closed.
    pub async fn run(&self) -> Result<()> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.options.accept_invalid_certs)
            .build()
            .map_err(|e| Error::new(ClientErrorKind::Setup, e))?;
        let mut stopped = self.stopped.subscribe();

        debug!("Beginning SSE connect/retry loop for {}", self.url);
        while self.state() != State::Closed {
            self.connect(&http, &mut stopped).await;
            if self.state() == State::Closed {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.retry_delay) => {}
                _ = stopped.wait_for(|done| *done) => {}
            }
        }
        debug!("SSE client for {} closed", self.url);
        Ok(())
    }

    async fn connect(&self, http: &reqwest::Client, stopped: &mut watch::Receiver<bool>) {
        let mut request = http
            .get(&self.url)
            .header(CACHE_CONTROL, "no-cache")
            .header(ACCEPT, EVENT_STREAM);
        if let Some(provider) = &self.token_provider {
            match provider.token().await {
                Ok(token) => request = request.bearer_auth(token),
                Err(e) => {
                    self.signal_error(Error::new(ClientErrorKind::Token, e));
                    return;
                }
            }
        }
        if let Some(id) = self.last_event_id() {
            request = request.header(LAST_EVENT_ID, id);
        }

        self.set_state(State::Connecting);
        self.handlers.on_connecting();
        debug!("Making SSE request to {}", self.url);
        match request.send().await {
            Ok(response) => self.handle_response(response, stopped).await,
            Err(e) => self.signal_error(e.into()),
        }
    }

    async fn handle_response(
        &self,
        response: reqwest::Response,
        stopped: &mut watch::Receiver<bool>,
    ) {
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let is_event_stream = content_type
            .split(';')
            .next()
            .is_some_and(|media| media.trim().eq_ignore_ascii_case(EVENT_STREAM));

        if !status.is_success() || !is_event_stream {
            self.signal_error(Error::new(
                ClientErrorKind::Rejected,
                format!("StatusCode={}; ContentType={}", status.as_u16(), content_type),
            ));
            if status != StatusCode::SERVICE_UNAVAILABLE || !is_event_stream {
                self.signal_closed();
            }
            return;
        }

        if !self.set_state(State::Open) {
            return;
        }
        self.handlers.on_open();

        let mut parser = FrameParser::new();
        let mut lines = LineSplitter::new();
        let mut body = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = stopped.wait_for(|done| *done) => break,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for line in lines.push(&bytes) {
                        self.process_line(&mut parser, &line);
                    }
                }
                Some(Err(e)) => {
                    self.signal_error(e.into());
                    break;
                }
                None => {
                    if let Some(line) = lines.finish() {
                        self.process_line(&mut parser, &line);
                    }
                    debug!("SSE stream from {} ended", self.url);
                    break;
                }
            }
            if self.state() == State::Closed {
                break;
            }
        }
    }

    fn process_line(&self, parser: &mut FrameParser, line: &str) {
        if let Some(event) = parser.process_line(line) {
            if let Some(id) = &event.id {
                *self
                    .last_event_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
            }
            self.handlers.on_message(&event);
        }
    }

    /// Moves to `next` unless the client is already closed. Returns whether it moved.
    fn set_state(&self, next: State) -> bool {
        let mut state = self.state_guard();
        if *state == State::Closed {
            return false;
        }
        *state = next;
        true
    }

    fn signal_error(&self, error: Error) {
        warn!("SSE client for {}: {error}", self.url);
        self.handlers.on_error(&error);
    }

    fn signal_closed(&self) {
        let previous = std::mem::replace(&mut *self.state_guard(), State::Closed);
        self.stopped.send_replace(true);
        if previous != State::Closed {
            self.handlers.on_closed();
        }
    }
}
