use crate::handler::RequestHandler;
use crate::request::{Request, Response, CONTENT_TYPE_JSON};
use crate::route::{HttpMethod, Route, RouteKind};
use crate::route_table::SharedRouteTable;
use crate::translator::{
    DefaultRequestTranslator, DefaultResponseTranslator, RequestTranslator, ResponseTranslator,
};
use async_stream::stream;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use futures::FutureExt;
use log::*;
use sse::connection::{ChannelTransport, Transport};
use sse::message::ACCEPTED;
use sse::Manager;
use std::any::Any;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

type HttpResponse = axum::response::Response;

/// Largest request body read before dispatch.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub const ROUTE_NOT_FOUND: &str = "Route not found on server";
pub const HANDLER_FAILED: &str = "User handler threw an exception on server";
pub const REPLY_FAILED: &str = "Failed to send reply from server";
pub const REQUEST_UNREADABLE: &str = "Failed to read request on server";
pub const SSE_REJECTED: &str = "Failed to send SSE acknowledgement";

/// The replaceable request/response translators, read once per request.
#[derive(Clone)]
pub struct Translators {
    pub request: Arc<dyn RequestTranslator>,
    pub response: Arc<dyn ResponseTranslator>,
}

impl Default for Translators {
    fn default() -> Self {
        Self {
            request: Arc::new(DefaultRequestTranslator),
            response: Arc::new(DefaultResponseTranslator),
        }
    }
}

/// Resolves each inbound request against the route table and serves it.
pub struct Dispatcher {
    routes: SharedRouteTable,
    manager: Arc<Manager>,
    translators: Arc<RwLock<Translators>>,
    linger: Duration,
}

/// Builds the axum router that sends every request through `dispatcher`.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new().fallback(dispatch).with_state(dispatcher)
}

async fn dispatch(
    State(dispatcher): State<Arc<Dispatcher>>,
    request: axum::extract::Request,
) -> HttpResponse {
    dispatcher.handle(request).await
}

impl Dispatcher {
    pub fn new(
        routes: SharedRouteTable,
        manager: Arc<Manager>,
        translators: Arc<RwLock<Translators>>,
        linger: Duration,
    ) -> Self {
        Self {
            routes,
            manager,
            translators,
            linger,
        }
    }

    fn translators(&self) -> Translators {
        self.translators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn handle(&self, request: axum::extract::Request) -> HttpResponse {
        let translators = self.translators();
        let (parts, body) = request.into_parts();
        let method_name = parts.method.as_str().to_string();
        let uri = match parts.uri.query() {
            Some(query) => format!("{}?{}", parts.uri.path(), query),
            None => parts.uri.path().to_string(),
        };

        let Ok(method) = method_name.parse::<HttpMethod>() else {
            debug!("No route for unsupported method {method_name} {uri}");
            return error_response(
                &translators,
                StatusCode::NOT_FOUND,
                ROUTE_NOT_FOUND,
                &method_name,
                &uri,
                None,
            );
        };
        let Some(route) = self.routes.lookup(parts.uri.path(), method) else {
            debug!("No route for {method} {uri}");
            return error_response(
                &translators,
                StatusCode::NOT_FOUND,
                ROUTE_NOT_FOUND,
                &method_name,
                &uri,
                None,
            );
        };

        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!("Failed to read body of {method} {uri}: {e}");
                return error_response(
                    &translators,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    REQUEST_UNREADABLE,
                    &method_name,
                    &uri,
                    Some(&e),
                );
            }
        };

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let mut request = Request::new(method, parts.uri.path())
            .with_query(parts.uri.query().map(str::to_string))
            .with_body(body)
            .with_peer(peer);
        for (name, value) in parts.headers.iter() {
            if let Ok(value) = value.to_str() {
                request = request.with_header(name.as_str(), value);
            }
        }

        match &route.kind {
            RouteKind::Sse { .. } => self.accept_subscriber(&translators, &route, &request),
            RouteKind::Handler(handler) => {
                self.run_handler(&translators, handler.as_ref(), &request)
                    .await
            }
        }
    }

    /// Writes the SSE handshake and registers the subscriber with the manager.
    fn accept_subscriber(
        &self,
        translators: &Translators,
        route: &Route,
        request: &Request,
    ) -> HttpResponse {
        let subjects = translators.request.sse_subjects(&request.params());
        let peer = request
            .peer()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown peer".to_string());
        let (transport, mut frames) = ChannelTransport::new(peer);

        let accepted = transport.write(ACCEPTED).and_then(|_| {
            self.manager
                .add_connection(&route.path, subjects, Box::new(transport))
        });
        if let Err(e) = accepted {
            warn!("Rejected SSE subscriber on {}: {e}", route.path);
            return error_response(
                translators,
                StatusCode::INTERNAL_SERVER_ERROR,
                SSE_REJECTED,
                request.method().as_str(),
                &request.uri(),
                Some(&e),
            );
        }

        let stream = stream! {
            while let Some(frame) = frames.recv().await {
                yield Ok::<_, Infallible>(Bytes::from(frame));
            }
        };
        (
            StatusCode::OK,
            [
                (CONNECTION, "keep-alive"),
                (CONTENT_TYPE, sse::message::CONTENT_TYPE),
                (CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(stream),
        )
            .into_response()
    }

    async fn run_handler(
        &self,
        translators: &Translators,
        handler: &dyn RequestHandler,
        request: &Request,
    ) -> HttpResponse {
        let method = request.method().as_str();
        let mut response = Response::new(Arc::clone(&translators.response));
        let outcome = AssertUnwindSafe(handler.handle(request, &mut response))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => match self.write_response(response) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Failed to send reply to {method} {}: {e}", request.uri());
                    error_response(
                        translators,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        REPLY_FAILED,
                        method,
                        &request.uri(),
                        Some(e.as_ref()),
                    )
                }
            },
            Ok(Err(e)) => {
                warn!("Handler for {method} {} failed: {e}", request.uri());
                error_response(
                    translators,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HANDLER_FAILED,
                    method,
                    &request.uri(),
                    Some(e.as_ref()),
                )
            }
            Err(panic) => {
                let panic = HandlerPanic::from_payload(panic);
                error!("Handler for {method} {} panicked: {panic}", request.uri());
                error_response(
                    translators,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HANDLER_FAILED,
                    method,
                    &request.uri(),
                    Some(&panic),
                )
            }
        }
    }

    /// Turns the handler's response into an HTTP reply, lingering after the body if set.
    fn write_response(
        &self,
        response: Response,
    ) -> Result<HttpResponse, Box<dyn StdError + Send + Sync>> {
        let code = StatusCode::from_u16(response.code())?;
        let mut builder = axum::http::Response::builder().status(code);
        for (name, value) in response.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            if name == CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, HeaderValue::from_str(value)?);
        }

        let bytes = Bytes::from(response.body().to_string());
        builder = builder.header(CONTENT_LENGTH, bytes.len());
        let body = if self.linger.is_zero() {
            Body::from(bytes)
        } else {
            let linger = self.linger;
            Body::from_stream(stream! {
                yield Ok::<_, Infallible>(bytes);
                tokio::time::sleep(linger).await;
            })
        };
        Ok(builder.body(body)?)
    }
}

fn error_response(
    translators: &Translators,
    code: StatusCode,
    message: &str,
    method: &str,
    uri: &str,
    cause: Option<&(dyn StdError + 'static)>,
) -> HttpResponse {
    let body = translators
        .response
        .make_error(code.as_u16(), message, method, uri, cause);
    (code, [(CONTENT_TYPE, CONTENT_TYPE_JSON)], body.to_string()).into_response()
}

/// A panic raised by a user handler, reported like a returned error.
#[derive(Debug)]
struct HandlerPanic(String);

impl HandlerPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => message.to_string(),
                Err(_) => "handler panicked".to_string(),
            },
        };
        HandlerPanic(message)
    }
}

impl fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "panic: {}", self.0)
    }
}

impl StdError for HandlerPanic {}
