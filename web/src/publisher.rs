use crate::error::Result;
use crate::server::Server;
use log::*;
use serde_json::Value;
use std::sync::{Arc, Weak};

pub const DEFAULT_PUBLISHER_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PUBLISHER_PORT: u32 = 19216;
pub const DEFAULT_PUBLISHER_PATH: &str = "/restsse/";

/// JSON member whose string value becomes the event id.
pub const SSE_ID_MEMBER: &str = "sse_id";

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub address: String,
    pub port: u32,
    pub url_path: String,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_PUBLISHER_ADDRESS.to_string(),
            port: DEFAULT_PUBLISHER_PORT,
            url_path: DEFAULT_PUBLISHER_PATH.to_string(),
        }
    }
}

/// Publishes subject-tagged messages to the SSE subscribers of a server.
///
/// Holds the server weakly so a publisher left behind by a data pipeline does not keep a
/// stopped server alive.
#[derive(Debug, Clone)]
pub struct SsePublisher {
    server: Weak<Server>,
}

impl SsePublisher {
    pub fn new(server: &Arc<Server>) -> Self {
        Self {
            server: Arc::downgrade(server),
        }
    }

    /// Configures `server` from `options`, registers an all-subjects SSE route and starts it.
    pub async fn start(server: &Arc<Server>, options: PublisherOptions) -> Result<Self> {
        server.set_address(&options.address)?;
        server.set_port(options.port)?;
        server.add_sse_handler(&options.url_path, Vec::<String>::new())?;
        server.start().await?;
        info!(
            "SSE publisher serving {} on {}:{}",
            options.url_path, options.address, options.port
        );
        Ok(Self::new(server))
    }

    /// Publishes `message` as an event of type `subject`. Returns `false` if it could not be
    /// handed to the server.
    pub fn send_message(&self, subject: &str, message: &str) -> bool {
        let Some(server) = self.server.upgrade() else {
            warn!("Dropping '{subject}' message: server is gone");
            return false;
        };
        let id = event_id(message);
        match server.sse_publish(subject, message, id.as_deref()) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping '{subject}' message: {e}");
                false
            }
        }
    }
}

/// The `sse_id` member of a JSON object message, if present.
pub fn event_id(message: &str) -> Option<String> {
    serde_json::from_str::<Value>(message)
        .ok()?
        .get(SSE_ID_MEMBER)?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerOptions;
    use futures::StreamExt;
    use std::time::Duration;

    fn free_port() -> u32 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        u32::from(listener.local_addr().unwrap().port())
    }

    #[test]
    fn event_id_comes_from_sse_id_member() {
        assert_eq!(
            event_id(r#"{"sse_id":"42","node":"n1"}"#).as_deref(),
            Some("42")
        );
        assert_eq!(event_id(r#"{"sse_id":42}"#), None);
        assert_eq!(event_id(r#"{"node":"n1"}"#), None);
        assert_eq!(event_id("not json"), None);
    }

    #[test]
    fn send_fails_once_server_is_dropped() {
        let server = Arc::new(Server::new(ServerOptions::default()).unwrap());
        let publisher = SsePublisher::new(&server);
        drop(server);

        assert!(!publisher.send_message("ras", "{}"));
    }

    #[test]
    fn send_fails_while_server_is_stopped() {
        let server = Arc::new(Server::new(ServerOptions::default()).unwrap());
        let publisher = SsePublisher::new(&server);

        assert!(!publisher.send_message("ras", "{}"));
    }

    #[tokio::test]
    async fn started_publisher_reaches_subscribers() {
        let server = Arc::new(Server::new(ServerOptions::default()).unwrap());
        let port = free_port();
        let publisher = SsePublisher::start(
            &server,
            PublisherOptions {
                port,
                ..PublisherOptions::default()
            },
        )
        .await
        .unwrap();

        let response = reqwest::get(format!("http://127.0.0.1:{port}/restsse/"))
            .await
            .unwrap();
        let mut stream = response.bytes_stream();
        let mut text = String::new();
        while !text.contains(":Accepted\n") {
            let chunk = stream.next().await.unwrap().unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }

        assert!(publisher.send_message("ras", r#"{"sse_id":"7","state":"up"}"#));
        while !text.ends_with("\n\n") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }

        assert_eq!(
            text,
            ":Accepted\nevent:ras\nid:7\ndata:{\"sse_id\":\"7\",\"state\":\"up\"}\n\n"
        );
        server.stop().await.unwrap();
    }
}
