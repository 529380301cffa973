//! Embedded REST server with dynamic routes and Server-Sent Events.
//!
//! Routes are registered at runtime against a shared [`route_table::RouteTable`]; a single
//! axum fallback hands every request to the [`dispatch::Dispatcher`], which resolves it with
//! the table's descending-order match. SSE routes hand subscribers to an [`sse::Manager`]
//! created for each run of the [`server::Server`].

pub mod dispatch;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod request;
pub mod route;
pub mod route_table;
pub mod server;
pub mod translator;

pub use error::{Error, Result};
pub use handler::{BoxError, RequestHandler};
pub use publisher::SsePublisher;
pub use request::{Request, Response};
pub use route::{HttpMethod, Route, RouteKind};
pub use server::{Server, ServerOptions};
