use crate::request::{Request, Response};
use async_trait::async_trait;
use std::error::Error as StdError;

/// Error type user handlers may return; it becomes a 500 response with a formatted trace.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Callback invoked for a request matching an ordinary route.
///
/// The handler fills in `response`; the dispatcher writes it afterwards. Returning an
/// error (or panicking) produces a 500 error body instead.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &Request, response: &mut Response) -> Result<(), BoxError>;
}

/// Plain functions and closures are handlers.
#[async_trait]
impl<F> RequestHandler for F
where
    F: Fn(&Request, &mut Response) -> Result<(), BoxError> + Send + Sync,
{
    async fn handle(&self, request: &Request, response: &mut Response) -> Result<(), BoxError> {
        (self)(request, response)
    }
}
