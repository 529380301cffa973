use crate::dispatch::{self, Dispatcher, Translators};
use crate::error::{
    config_error, lifecycle_error, route_error, ConfigErrorKind, LifecycleErrorKind, Result,
    RouteErrorKind,
};
use crate::handler::RequestHandler;
use crate::route::{HttpMethod, Route, RouteKind};
use crate::route_table::{Registration, SharedRouteTable};
use crate::translator::{RequestTranslator, ResponseTranslator};
use log::*;
use service::config::{Config, ALL_INTERFACES};
use sse::manager::{Settings, DEFAULT_PING_INTERVAL};
use sse::Manager;
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_PORT: u32 = 5678;
pub const DEFAULT_MAX_QUEUED_CONNECTIONS: u32 = 100;
pub const DEFAULT_CONNECTION_LINGER: Duration = Duration::from_millis(333);
pub const DEFAULT_SERVER_LINGER: Duration = Duration::from_secs(5);
pub const PORT_RANGE: RangeInclusive<u32> = 1024..=65535;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Bind address; `*` means every interface.
    pub address: String,
    pub port: u32,
    /// Listen backlog.
    pub max_queued_connections: u32,
    pub ping_interval: Duration,
    /// How long an ordinary response stays open after its body is written.
    pub connection_linger: Duration,
    /// How long `stop` waits for in-flight requests before aborting them.
    pub server_linger: Duration,
    pub force_event_id: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: ALL_INTERFACES.to_string(),
            port: DEFAULT_PORT,
            max_queued_connections: DEFAULT_MAX_QUEUED_CONNECTIONS,
            ping_interval: DEFAULT_PING_INTERVAL,
            connection_linger: DEFAULT_CONNECTION_LINGER,
            server_linger: DEFAULT_SERVER_LINGER,
            force_event_id: true,
        }
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        Self {
            address: config.interface.clone(),
            port: config.port,
            max_queued_connections: config.max_queued_connections,
            ping_interval: config.ping_interval(),
            connection_linger: config.connection_linger(),
            server_linger: config.server_linger(),
            force_event_id: config.force_event_id,
        }
    }
}

struct Listener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

/// The embedded REST server: route registration, start/stop and SSE publishing.
///
/// Routes can be added and removed at any time, running or not. Binding happens in
/// `start`; a bind failure poisons the server and every later operation reports
/// `LifecycleErrorKind::Unusable`.
pub struct Server {
    options: Mutex<ServerOptions>,
    routes: SharedRouteTable,
    translators: Arc<RwLock<Translators>>,
    running: AtomicBool,
    /// Set under the options lock while `start` binds, so setters cannot race it.
    starting: AtomicBool,
    failed: AtomicBool,
    manager: RwLock<Option<Arc<Manager>>>,
    listener: tokio::sync::Mutex<Option<Listener>>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Result<Self> {
        validate_port(options.port)?;
        validate_address(&options.address)?;
        Ok(Self {
            options: Mutex::new(options),
            routes: SharedRouteTable::new(),
            translators: Arc::new(RwLock::new(Translators::default())),
            running: AtomicBool::new(false),
            starting: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            manager: RwLock::new(None),
            listener: tokio::sync::Mutex::new(None),
        })
    }

    fn options(&self) -> MutexGuard<'_, ServerOptions> {
        self.options.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn manager(&self) -> Option<Arc<Manager>> {
        self.manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(lifecycle_error(
                LifecycleErrorKind::Unusable,
                "server failed to bind and is no longer usable",
            ));
        }
        Ok(())
    }

    fn ensure_configurable(&self) -> Result<()> {
        self.ensure_usable()?;
        if self.is_running() || self.starting.load(Ordering::SeqCst) {
            return Err(config_error(
                ConfigErrorKind::Running,
                "cannot change configuration while the server is running",
            ));
        }
        Ok(())
    }

    pub fn port(&self) -> u32 {
        self.options().port
    }

    pub fn address(&self) -> String {
        self.options().address.clone()
    }

    pub fn set_port(&self, port: u32) -> Result<()> {
        let mut options = self.options();
        self.ensure_configurable()?;
        validate_port(port)?;
        options.port = port;
        Ok(())
    }

    pub fn set_address(&self, address: &str) -> Result<()> {
        let mut options = self.options();
        self.ensure_configurable()?;
        validate_address(address)?;
        options.address = address.trim().to_string();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .await
            .as_ref()
            .map(|listener| listener.local_addr)
    }

    /// Binds the listener and starts serving. A no-op when already running.
    pub async fn start(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        self.ensure_usable()?;
        if listener.is_some() {
            return Ok(());
        }

        let options = {
            let options = self.options();
            self.starting.store(true, Ordering::SeqCst);
            options.clone()
        };
        let (tcp, local_addr) = match bind(&options).await {
            Ok(bound) => bound,
            Err(e) => {
                self.starting.store(false, Ordering::SeqCst);
                error!(
                    "Failed to bind REST server to {}:{}: {e}",
                    options.address, options.port
                );
                self.failed.store(true, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let manager = Arc::new(Manager::new(
            Arc::new(self.routes.clone()),
            Settings {
                ping_interval: options.ping_interval,
                force_event_id: options.force_event_id,
            },
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            self.routes.clone(),
            Arc::clone(&manager),
            Arc::clone(&self.translators),
            options.connection_linger,
        ));
        let app = dispatch::router(dispatcher);

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(
                tcp,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        *self.manager.write().unwrap_or_else(PoisonError::into_inner) = Some(manager);
        *listener = Some(Listener {
            local_addr,
            shutdown,
            task,
        });
        self.running.store(true, Ordering::SeqCst);
        self.starting.store(false, Ordering::SeqCst);
        info!("REST server listening on {local_addr}");
        Ok(())
    }

    /// Closes every SSE stream, then shuts the listener down. A no-op when not running.
    pub async fn stop(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        self.ensure_usable()?;
        let Some(Listener {
            local_addr,
            shutdown,
            mut task,
        }) = listener.take()
        else {
            return Ok(());
        };

        self.running.store(false, Ordering::SeqCst);
        let manager = self
            .manager
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(manager) = manager {
            manager.close().await;
        }

        let _ = shutdown.send(());
        let linger = self.options().server_linger;
        match tokio::time::timeout(linger, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("REST server on {local_addr} stopped with an error: {e}"),
            Ok(Err(e)) => warn!("REST server task on {local_addr} failed: {e}"),
            Err(_) => {
                warn!("REST server on {local_addr} did not drain within {linger:?}, aborting");
                task.abort();
            }
        }
        info!("REST server on {local_addr} stopped");
        Ok(())
    }

    /// Registers an ordinary route. Re-registering an existing (path, method) is a no-op.
    pub fn add_handler<H>(&self, path: &str, method: HttpMethod, handler: H) -> Result<Registration>
    where
        H: RequestHandler + 'static,
    {
        self.ensure_usable()?;
        self.routes
            .lock()
            .add_route(path, method, RouteKind::Handler(Arc::new(handler)))
    }

    /// Registers a GET SSE route. An empty `allowed_event_types` accepts every event type.
    pub fn add_sse_handler<I, S>(&self, path: &str, allowed_event_types: I) -> Result<Registration>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_usable()?;
        self.routes
            .lock()
            .add_route(path, HttpMethod::Get, RouteKind::sse(allowed_event_types))
    }

    /// Removes a route. Subscribers still connected to a removed SSE route are evicted.
    pub fn remove_handler(&self, path: &str, method: HttpMethod) -> Result<Route> {
        self.ensure_usable()?;
        let route = self.routes.lock().remove_route(path, method)?;
        if route.is_sse() {
            if let Some(manager) = self.manager() {
                let evicted = manager.remove_connections_for_path(&route.path);
                debug!("Evicted {evicted} SSE subscriber(s) from {}", route.path);
            }
        }
        Ok(route)
    }

    pub fn get_handler(&self, path: &str, method: HttpMethod) -> Result<Route> {
        self.ensure_usable()?;
        self.routes.lock().get(path, method).cloned()
    }

    /// Allowed event types of the SSE route at `path`. Empty means all.
    pub fn event_types_from_path(&self, path: &str) -> Result<HashSet<String>> {
        self.ensure_usable()?;
        let table = self.routes.lock();
        let route = table.get(path, HttpMethod::Get)?;
        route.allowed_event_types().cloned().ok_or_else(|| {
            route_error(
                RouteErrorKind::NotMapped,
                &format!("'{path}' is not an SSE route"),
            )
        })
    }

    /// Publishes an event to every subscriber that accepts it.
    pub fn sse_publish(&self, event_type: &str, data: &str, id: Option<&str>) -> Result<()> {
        self.ensure_usable()?;
        match self.manager() {
            Some(manager) if self.is_running() => {
                manager.publish(event_type, data, id);
                Ok(())
            }
            _ => Err(lifecycle_error(
                LifecycleErrorKind::NotRunning,
                "cannot publish while the server is stopped",
            )),
        }
    }

    /// Number of open SSE subscriptions.
    pub fn sse_connection_count(&self) -> usize {
        self.manager()
            .map(|manager| manager.connection_count())
            .unwrap_or(0)
    }

    pub fn set_request_translator(&self, translator: Arc<dyn RequestTranslator>) {
        self.translators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .request = translator;
    }

    pub fn set_response_translator(&self, translator: Arc<dyn ResponseTranslator>) {
        self.translators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .response = translator;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let manager = self
            .manager
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(manager) = manager {
            manager.shutdown();
        }
        if let Some(listener) = self.listener.get_mut().take() {
            let _ = listener.shutdown.send(());
        }
    }
}

fn validate_port(port: u32) -> Result<()> {
    if !PORT_RANGE.contains(&port) {
        return Err(config_error(
            ConfigErrorKind::BadPort,
            &format!("port {port} is outside {}..={}", PORT_RANGE.start(), PORT_RANGE.end()),
        ));
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<()> {
    if address.trim().is_empty() {
        return Err(config_error(
            ConfigErrorKind::BadAddress,
            "bind address must not be blank",
        ));
    }
    Ok(())
}

async fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    if address == ALL_INTERFACES {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }
    tokio::net::lookup_host((address, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for '{address}'"),
            )
        })
}

async fn bind(options: &ServerOptions) -> io::Result<(TcpListener, SocketAddr)> {
    let port = u16::try_from(options.port)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let addr = resolve(&options.address, port).await?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(options.max_queued_connections)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerErrorKind;
    use crate::handler::BoxError;
    use crate::request::{Request, Response};
    use axum::body::Bytes;
    use futures::StreamExt;
    use serde_json::{json, Value};

    fn free_port() -> u32 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        u32::from(listener.local_addr().unwrap().port())
    }

    fn local_server() -> Server {
        Server::new(ServerOptions {
            address: "127.0.0.1".to_string(),
            port: free_port(),
            connection_linger: Duration::ZERO,
            server_linger: Duration::from_secs(1),
            ..ServerOptions::default()
        })
        .unwrap()
    }

    fn hello(_: &Request, response: &mut Response) -> std::result::Result<(), BoxError> {
        response.set_payload(json!("hello"));
        Ok(())
    }

    /// Reads the stream until `expected` shows up in the accumulated text.
    async fn read_until<S>(stream: &mut S, text: &mut String, expected: &str)
    where
        S: futures::Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        while !text.contains(expected) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for SSE frames")
                .expect("stream ended early")
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    #[test]
    fn defaults_match_documented_tunables() {
        let options = ServerOptions::default();

        assert_eq!(options.address, "*");
        assert_eq!(options.port, 5678);
        assert_eq!(options.max_queued_connections, 100);
        assert_eq!(options.ping_interval, Duration::from_secs(90));
        assert_eq!(options.connection_linger, Duration::from_millis(333));
    }

    #[test]
    fn port_bounds_are_enforced() {
        let server = Server::new(ServerOptions::default()).unwrap();

        for port in [80, 70000] {
            let err = server.set_port(port).unwrap_err();
            assert_eq!(err.error_kind, ServerErrorKind::Config(ConfigErrorKind::BadPort));
        }
        for port in [1024, 65535] {
            server.set_port(port).unwrap();
            assert_eq!(server.port(), port);
        }
    }

    #[test]
    fn blank_address_is_rejected() {
        let server = Server::new(ServerOptions::default()).unwrap();

        let err = server.set_address("  ").unwrap_err();

        assert_eq!(
            err.error_kind,
            ServerErrorKind::Config(ConfigErrorKind::BadAddress)
        );
        assert!(Server::new(ServerOptions {
            port: 80,
            ..ServerOptions::default()
        })
        .is_err());
    }

    #[tokio::test]
    async fn configuration_is_frozen_while_running() {
        let server = local_server();
        server.start().await.unwrap();

        let err = server.set_port(2000).unwrap_err();
        assert_eq!(err.error_kind, ServerErrorKind::Config(ConfigErrorKind::Running));
        let err = server.set_address("localhost").unwrap_err();
        assert_eq!(err.error_kind, ServerErrorKind::Config(ConfigErrorKind::Running));

        server.stop().await.unwrap();
        server.set_port(2000).unwrap();
    }

    #[test]
    fn configuration_is_frozen_while_binding() {
        let server = Server::new(ServerOptions::default()).unwrap();
        server.starting.store(true, Ordering::SeqCst);

        let err = server.set_port(2000).unwrap_err();
        assert_eq!(err.error_kind, ServerErrorKind::Config(ConfigErrorKind::Running));
        assert_eq!(server.port(), DEFAULT_PORT);

        server.starting.store(false, Ordering::SeqCst);
        server.set_port(2000).unwrap();
    }

    #[tokio::test]
    async fn setters_succeed_again_after_a_start_completes_and_stops() {
        let server = local_server();
        server.start().await.unwrap();
        let bound = server.local_addr().await.unwrap();

        assert_eq!(u32::from(bound.port()), server.port());
        assert!(!server.starting.load(Ordering::SeqCst));

        server.stop().await.unwrap();
        server.set_address("localhost").unwrap();
    }

    #[tokio::test]
    async fn publish_requires_running_server() {
        let server = local_server();

        let err = server.sse_publish("A", "data", None).unwrap_err();
        assert_eq!(
            err.error_kind,
            ServerErrorKind::Lifecycle(LifecycleErrorKind::NotRunning)
        );

        server.start().await.unwrap();
        server.sse_publish("A", "data", None).unwrap();
        server.stop().await.unwrap();

        assert!(server.sse_publish("A", "data", None).is_err());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let server = local_server();

        server.stop().await.unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().await.unwrap();
        server.start().await.unwrap();
        assert_eq!(server.local_addr().await, Some(addr));

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert_eq!(server.local_addr().await, None);
    }

    #[tokio::test]
    async fn serves_handlers_and_not_found_over_http() {
        let server = local_server();
        server.add_handler("/hello", HttpMethod::Get, hello).unwrap();
        server.start().await.unwrap();
        let base = format!("http://{}", server.local_addr().await.unwrap());

        let ok = reqwest::get(format!("{base}/hello")).await.unwrap();
        assert_eq!(ok.status(), 200);
        let body: Value = ok.json().await.unwrap();
        assert_eq!(body, json!({"status": "ok", "payload": "hello"}));

        let missing = reqwest::get(format!("{base}/missing")).await.unwrap();
        assert_eq!(missing.status(), 404);
        let body: Value = missing.json().await.unwrap();
        assert_eq!(body["uri"], "/missing");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn sse_subscriber_receives_filtered_events_until_stop() {
        let server = local_server();
        server.add_sse_handler("/restsse/", ["A", "B"]).unwrap();
        server.start().await.unwrap();
        let url = format!(
            "http://{}/restsse/?subjects=A",
            server.local_addr().await.unwrap()
        );

        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let mut stream = response.bytes_stream();
        let mut text = String::new();
        read_until(&mut stream, &mut text, ":Accepted\n").await;
        assert_eq!(server.sse_connection_count(), 1);

        server.sse_publish("B", "not for me", Some("1")).unwrap();
        server.sse_publish("A", "line1\nline2", Some("2")).unwrap();
        read_until(&mut stream, &mut text, "\n\n").await;

        assert_eq!(text, ":Accepted\nevent:A\nid:2\ndata:line1\ndata:line2\n\n");

        server.stop().await.unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(rest.is_none() || rest.unwrap().is_err());
    }

    #[tokio::test]
    async fn dropping_a_running_server_ends_sse_streams() {
        let server = local_server();
        server
            .add_sse_handler("/restsse/", Vec::<String>::new())
            .unwrap();
        server.start().await.unwrap();
        let url = format!("http://{}/restsse/", server.local_addr().await.unwrap());

        let response = reqwest::get(url).await.unwrap();
        let mut stream = response.bytes_stream();
        let mut text = String::new();
        read_until(&mut stream, &mut text, ":Accepted\n").await;

        drop(server);

        let rest = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("SSE stream stayed open after the server was dropped");
        assert!(rest.is_none() || rest.unwrap().is_err());
    }

    #[tokio::test]
    async fn removing_sse_route_evicts_its_subscribers() {
        let server = local_server();
        server
            .add_sse_handler("/restsse/", Vec::<String>::new())
            .unwrap();
        server.start().await.unwrap();
        let url = format!("http://{}/restsse/", server.local_addr().await.unwrap());

        let response = reqwest::get(url).await.unwrap();
        let mut stream = response.bytes_stream();
        let mut text = String::new();
        read_until(&mut stream, &mut text, ":Accepted\n").await;

        let route = server
            .remove_handler("/restsse/", HttpMethod::Get)
            .unwrap();

        assert!(route.is_sse());
        assert_eq!(server.sse_connection_count(), 0);
        assert!(server.event_types_from_path("/restsse/").is_err());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn event_types_come_from_sse_routes_only() {
        let server = local_server();
        server.add_sse_handler("/restsse/", ["A"]).unwrap();
        server.add_handler("/hello", HttpMethod::Get, hello).unwrap();

        assert_eq!(
            server.event_types_from_path("/restsse/").unwrap(),
            HashSet::from(["A".to_string()])
        );
        let err = server.event_types_from_path("/hello").unwrap_err();
        assert_eq!(err.error_kind, ServerErrorKind::Route(RouteErrorKind::NotMapped));
        assert!(server.get_handler("/hello", HttpMethod::Get).is_ok());
    }

    #[tokio::test]
    async fn bind_failure_poisons_the_server() {
        let first = local_server();
        first.start().await.unwrap();
        let taken = first.local_addr().await.unwrap();

        let second = Server::new(ServerOptions {
            address: "127.0.0.1".to_string(),
            port: u32::from(taken.port()),
            ..ServerOptions::default()
        })
        .unwrap();

        let err = second.start().await.unwrap_err();
        assert_eq!(
            err.error_kind,
            ServerErrorKind::Lifecycle(LifecycleErrorKind::Bind)
        );

        let unusable = ServerErrorKind::Lifecycle(LifecycleErrorKind::Unusable);
        assert_eq!(second.start().await.unwrap_err().error_kind, unusable);
        assert_eq!(second.set_port(6000).unwrap_err().error_kind, unusable);
        assert_eq!(
            second
                .add_handler("/hello", HttpMethod::Get, hello)
                .unwrap_err()
                .error_kind,
            unusable
        );
        assert_eq!(second.stop().await.unwrap_err().error_kind, unusable);

        first.stop().await.unwrap();
    }
}
