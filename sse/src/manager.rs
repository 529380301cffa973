use crate::connection::{Connection, ConnectionId, Transport};
use crate::error::{manager_error, ManagerErrorKind, Result};
use crate::message::{Message, PING};
use log::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Idle time after which a subscriber is sent a ping frame.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(90);

/// How often the keep-alive task wakes to check for idleness.
pub const KEEP_ALIVE_POLL: Duration = Duration::from_secs(1);

/// Source of the event types an SSE path accepts.
///
/// `None` or an empty set means the path accepts every event type.
pub trait EventTypeLookup: Send + Sync {
    fn event_types_for_path(&self, path: &str) -> Option<HashSet<String>>;
}

/// Lookup that accepts every event type on every path.
pub struct AllEventTypes;

impl EventTypeLookup for AllEventTypes {
    fn event_types_for_path(&self, _path: &str) -> Option<HashSet<String>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub ping_interval: Duration,
    /// Give events published without an id a synthetic, incrementing one.
    pub force_event_id: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            force_event_id: true,
        }
    }
}

struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    /// Time of the most recent sweep over the connections, publish or keep-alive.
    last_publish_at: Instant,
}

struct Shared {
    registry: Mutex<Registry>,
    lookup: Arc<dyn EventTypeLookup>,
    settings: Settings,
    next_event_id: AtomicU64,
}

struct KeepAlive {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the live SSE subscribers: publish fan-out, subject filtering, keep-alive pings
/// and eviction of broken connections.
///
/// Every sweep (publish or keep-alive) holds the registry lock for its whole duration, so
/// connections cannot be added or removed mid-sweep. Both sweeps evict through `evict`.
pub struct Manager {
    shared: Arc<Shared>,
    keep_alive: Mutex<Option<KeepAlive>>,
    closed: AtomicBool,
}

impl Manager {
    pub fn new(lookup: Arc<dyn EventTypeLookup>, settings: Settings) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    connections: HashMap::new(),
                    last_publish_at: Instant::now(),
                }),
                lookup,
                settings,
                next_event_id: AtomicU64::new(0),
            }),
            keep_alive: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a subscriber whose handshake has already been written.
    ///
    /// Starts the keep-alive task on the first connection.
    pub fn add_connection(
        &self,
        path: &str,
        requested_subjects: HashSet<String>,
        transport: Box<dyn Transport>,
    ) -> Result<ConnectionId> {
        let connection = Connection::new(path, requested_subjects, transport);
        let connection_id = connection.id.clone();
        {
            let mut registry = self.shared.registry();
            if self.closed.load(Ordering::SeqCst) {
                connection.close();
                return Err(manager_error(
                    ManagerErrorKind::Closed,
                    "connection manager is closed",
                ));
            }
            debug!(
                "Adding SSE connection {} from {} on '{}'",
                connection_id.as_str(),
                connection.peer(),
                path
            );
            registry.connections.insert(connection_id.clone(), connection);
        }
        self.ensure_keep_alive();
        Ok(connection_id)
    }

    /// Fans an event out to every connection whose path and subject filter accept it.
    ///
    /// Connections that do not fire but have been idle longer than the ping interval get a
    /// ping instead. Connections whose write fails are evicted.
    pub fn publish(&self, event_type: &str, data: &str, id: Option<&str>) {
        self.shared.publish(event_type, data, id);
    }

    /// Evicts every connection opened on `path`. Returns how many were removed.
    pub fn remove_connections_for_path(&self, path: &str) -> usize {
        let mut registry = self.shared.registry();
        let ids: Vec<ConnectionId> = registry
            .connections
            .values()
            .filter(|connection| connection.path == path)
            .map(|connection| connection.id.clone())
            .collect();
        let count = ids.len();
        evict(&mut registry, ids);
        count
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry().connections.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Evicts all connections, then stops and joins the keep-alive task. Idempotent.
    pub async fn close(&self) {
        if let Some(task) = self.shut_down() {
            if let Err(e) = task.await {
                warn!("SSE keep-alive task did not shut down cleanly: {e}");
            }
        }
    }

    /// Evicts all connections and signals the keep-alive task without waiting for it.
    ///
    /// For callers that cannot await, such as `Drop` implementations. Idempotent.
    pub fn shutdown(&self) {
        self.shut_down();
    }

    fn shut_down(&self) -> Option<JoinHandle<()>> {
        {
            let mut registry = self.shared.registry();
            self.closed.store(true, Ordering::SeqCst);
            let ids: Vec<ConnectionId> = registry.connections.keys().cloned().collect();
            evict(&mut registry, ids);
        }

        let keep_alive = self
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let _ = keep_alive.shutdown.send(true);
        Some(keep_alive.task)
    }

    fn ensure_keep_alive(&self) {
        let mut keep_alive = self
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if keep_alive.is_some() || self.is_closed() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let (shutdown, shutdown_rx) = watch::channel(false);
                let task = handle.spawn(run_keep_alive(Arc::clone(&self.shared), shutdown_rx));
                debug!("Started SSE keep-alive task");
                *keep_alive = Some(KeepAlive { shutdown, task });
            }
            Err(e) => warn!("No async runtime available, SSE keep-alive pings are disabled: {e}"),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let keep_alive = self
            .keep_alive
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(keep_alive) = keep_alive {
            let _ = keep_alive.shutdown.send(true);
        }
    }
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event_type: &str, data: &str, id: Option<&str>) {
        let mut message = Message::new(event_type, data, id);
        if message.id.is_none() && self.settings.force_event_id {
            let synthetic = self.next_event_id.fetch_add(1, Ordering::Relaxed);
            message.id = Some(synthetic.to_string());
        }
        let frame = message.encode();
        let ping_interval = self.settings.ping_interval;
        let mut allowed_by_path: HashMap<String, bool> = HashMap::new();

        let mut registry = self.registry();
        let now = Instant::now();
        let mut broken = Vec::new();
        for connection in registry.connections.values_mut() {
            let path_allows = *allowed_by_path
                .entry(connection.path.clone())
                .or_insert_with(|| self.path_allows(&connection.path, &message.event_type));

            if path_allows && connection.wants(&message.event_type) {
                if let Err(e) = connection.write(&frame, now) {
                    warn!(
                        "Failed to send event type '{}' to SSE connection at {}, removing connection: {e}",
                        message.event_type,
                        connection.peer()
                    );
                    broken.push(connection.id.clone());
                }
            } else if connection.is_expired(now, ping_interval) {
                if let Err(e) = connection.write(PING, now) {
                    warn!(
                        "Failed to send ping to SSE connection at {}, removing connection: {e}",
                        connection.peer()
                    );
                    broken.push(connection.id.clone());
                }
            }
        }
        evict(&mut registry, broken);
        registry.last_publish_at = now;
    }

    fn ping_idle_connections(&self) {
        let ping_interval = self.settings.ping_interval;
        let mut registry = self.registry();
        let now = Instant::now();
        let mut broken = Vec::new();
        for connection in registry.connections.values_mut() {
            if !connection.is_expired(now, ping_interval) {
                continue;
            }
            if let Err(e) = connection.write(PING, now) {
                warn!(
                    "Failed to send ping to SSE connection at {}, removing connection: {e}",
                    connection.peer()
                );
                broken.push(connection.id.clone());
            }
        }
        evict(&mut registry, broken);
        registry.last_publish_at = now;
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.registry().last_publish_at + self.settings.ping_interval < now
    }

    fn path_allows(&self, path: &str, event_type: &str) -> bool {
        match self.lookup.event_types_for_path(path) {
            Some(types) => types.is_empty() || types.contains(event_type),
            None => true,
        }
    }
}

fn evict(registry: &mut Registry, ids: Vec<ConnectionId>) {
    for id in ids {
        if let Some(connection) = registry.connections.remove(&id) {
            debug!(
                "Removing SSE connection {} from {}",
                id.as_str(),
                connection.peer()
            );
            connection.close();
        }
    }
}

async fn run_keep_alive(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(KEEP_ALIVE_POLL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if shared.is_idle(Instant::now()) {
                    shared.ping_idle_connections();
                }
            }
        }
    }
    debug!("SSE keep-alive task stopped");
}
