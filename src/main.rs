use log::*;
use serde_json::json;
use service::{config::Config, logging::Logger};
use std::sync::Arc;
use web::{BoxError, HttpMethod, Request, Response, Server, ServerOptions, SsePublisher};

const PUBLISH_PREFIX: &str = "/publish/";

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!(
        "Starting REST server [{}:{}], event stream at {}",
        config.interface, config.port, config.sse_path
    );

    let server = match Server::new(ServerOptions::from(&config)) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Invalid server configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = register_routes(&server, &config) {
        error!("Failed to register routes: {e}");
        std::process::exit(1);
    }

    if let Err(e) = server.start().await {
        error!("Failed to start REST server: {e}");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }

    info!("Shutting down REST server...");
    if let Err(e) = server.stop().await {
        error!("Failed to stop REST server cleanly: {e}");
    }
}

fn register_routes(server: &Arc<Server>, config: &Config) -> web::Result<()> {
    server.add_handler("/health", HttpMethod::Get, health)?;

    // The publisher holds the server weakly, so this route does not keep it alive.
    let publisher = SsePublisher::new(server);
    server.add_handler(
        &format!("{PUBLISH_PREFIX}*"),
        HttpMethod::Post,
        move |request: &Request, response: &mut Response| -> Result<(), BoxError> {
            publish(&publisher, request, response)
        },
    )?;

    server.add_sse_handler(&config.sse_path, config.sse_event_types())?;
    Ok(())
}

fn health(_: &Request, response: &mut Response) -> Result<(), BoxError> {
    response.set_payload(json!("healthy"));
    Ok(())
}

/// Publishes the request body as an event typed by the path segment after `/publish/`.
fn publish(
    publisher: &SsePublisher,
    request: &Request,
    response: &mut Response,
) -> Result<(), BoxError> {
    let event_type = request
        .path()
        .strip_prefix(PUBLISH_PREFIX)
        .unwrap_or_default()
        .trim_matches('/');
    if event_type.is_empty() {
        return Err(format!("no event type in '{}'", request.path()).into());
    }
    if !publisher.send_message(event_type, request.body()) {
        return Err(format!("event '{event_type}' was not published").into());
    }
    debug!("Published '{event_type}' from {:?}", request.peer());
    response.set_payload(json!({ "published": event_type }));
    Ok(())
}
