use crate::error::{transport_error, Result, TransportErrorKind};
use log::*;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant};

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// The open response stream of one subscriber.
///
/// The HTTP transport owns the socket; the manager only writes frames through this
/// handle and closes it on eviction. Writes must fail fast once the peer is gone.
pub trait Transport: Send + Sync {
    fn write(&self, frame: &str) -> Result<()>;

    fn close(&self);

    /// Remote address, for log messages.
    fn peer(&self) -> String;
}

/// Transport backed by an unbounded channel whose receiver feeds the response body.
///
/// When the transport drops the body (peer disconnected) the receiver goes away and the
/// next write fails. `close` drops the sender, which ends the body stream.
pub struct ChannelTransport {
    peer: String,
    sender: Mutex<Option<UnboundedSender<String>>>,
}

impl ChannelTransport {
    pub fn new(peer: impl Into<String>) -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            peer: peer.into(),
            sender: Mutex::new(Some(tx)),
        };
        (transport, rx)
    }
}

impl Transport for ChannelTransport {
    fn write(&self, frame: &str) -> Result<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx
                .send(frame.to_string())
                .map_err(|_| transport_error(TransportErrorKind::Closed, "peer disconnected")),
            None => Err(transport_error(
                TransportErrorKind::Closed,
                "stream already closed",
            )),
        }
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// A live subscriber.
pub struct Connection {
    pub id: ConnectionId,
    /// Request path the subscription was opened on (an exact SSE route path).
    pub path: String,
    /// Event types the subscriber asked for; empty means all.
    pub requested_subjects: HashSet<String>,
    /// Time of the last successful write, ping or data.
    pub last_published_at: Instant,
    transport: Box<dyn Transport>,
}

impl Connection {
    pub fn new(
        path: impl Into<String>,
        requested_subjects: HashSet<String>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            path: path.into(),
            requested_subjects,
            last_published_at: Instant::now(),
            transport,
        }
    }

    pub fn wants(&self, event_type: &str) -> bool {
        self.requested_subjects.is_empty() || self.requested_subjects.contains(event_type)
    }

    pub fn is_expired(&self, now: Instant, ping_interval: Duration) -> bool {
        self.last_published_at + ping_interval < now
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    /// Writes a frame, advancing `last_published_at` on success.
    pub fn write(&mut self, frame: &str, now: Instant) -> Result<()> {
        self.transport.write(frame)?;
        self.last_published_at = now;
        Ok(())
    }

    pub fn close(&self) {
        debug!(
            "Closing SSE connection {} from {}",
            self.id.as_str(),
            self.transport.peer()
        );
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subjects(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[tokio::test]
    async fn channel_transport_delivers_frames_in_order() {
        let (transport, mut rx) = ChannelTransport::new("127.0.0.1:40000");

        transport.write(":Accepted\n").unwrap();
        transport.write("event:a\ndata:x\n\n").unwrap();

        assert_eq!(rx.recv().await.unwrap(), ":Accepted\n");
        assert_eq!(rx.recv().await.unwrap(), "event:a\ndata:x\n\n");
    }

    #[tokio::test]
    async fn channel_transport_write_fails_after_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new("peer");
        drop(rx);

        let err = transport.write(":Ping\n").unwrap_err();
        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Transport(TransportErrorKind::Closed)
        );
    }

    #[tokio::test]
    async fn closing_channel_transport_ends_the_stream() {
        let (transport, mut rx) = ChannelTransport::new("peer");

        transport.close();

        assert!(rx.recv().await.is_none());
        assert!(transport.write(":Ping\n").is_err());
    }

    #[tokio::test]
    async fn empty_subject_set_wants_everything() {
        let (transport, _rx) = ChannelTransport::new("peer");
        let connection = Connection::new("/events", HashSet::new(), Box::new(transport));

        assert!(connection.wants("anything"));
    }

    #[tokio::test]
    async fn subject_set_filters_event_types() {
        let (transport, _rx) = ChannelTransport::new("peer");
        let connection = Connection::new("/events", subjects(&["A"]), Box::new(transport));

        assert!(connection.wants("A"));
        assert!(!connection.wants("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_strictly_after_the_interval() {
        let (transport, _rx) = ChannelTransport::new("peer");
        let connection = Connection::new("/events", HashSet::new(), Box::new(transport));
        let interval = Duration::from_secs(90);
        let start = connection.last_published_at;

        assert!(!connection.is_expired(start + interval, interval));
        assert!(connection.is_expired(start + interval + Duration::from_millis(1), interval));
    }
}
