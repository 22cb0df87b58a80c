//! Extension points for embedding applications.
//!
//! - [`RequestHandler`] answers `request` frames. When none is configured the
//!   client falls back to proxying to the local port, or to `501 Not Implemented`.
//! - [`TunnelEvents`] receives the public URL once the relay has opened the
//!   tunnel, and every recoverable error the client runs into.
//!
//! Closures can be used directly as request handlers:
//!
//! ```rust
//! use relay_tunnel::{HandlerError, HttpRequest, HttpResponse, TunnelConfig};
//! use std::sync::Arc;
//!
//! let config = TunnelConfig::new("my-api-key").with_request_handler(Arc::new(
//!     |request: HttpRequest| async move {
//!         Ok::<_, HandlerError>(HttpResponse::text(200, format!("you asked for {}", request.path)))
//!     },
//! ));
//! # let _ = config;
//! ```

use crate::error::TunnelError;
use crate::protocol::Headers;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

/// Error type returned by user supplied request handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// An HTTP request received through the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Relay-issued identifier, echoed in the response frame
    pub request_id: String,
    pub method: String,
    /// Path and query string, e.g. `/api/items?page=2`
    pub path: String,
    pub headers: Headers,
    pub body: Option<String>,
}

/// The answer to an [`HttpRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Headers,
    /// Always sent as text on the control channel
    pub body: String,
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// A `text/plain` response with the given body.
    pub fn text(status_code: u16, body: impl Into<String>) -> Self {
        Self::new(status_code)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Answers HTTP requests arriving through the tunnel.
///
/// A returned error is reported through [`TunnelEvents::on_error`] and no
/// response frame is sent for that request.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, HandlerError>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, HandlerError>> + Send + 'static,
{
    fn handle(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, HandlerError>> {
        (self)(request).boxed()
    }
}

/// Receives tunnel lifecycle notifications.
///
/// Both methods are called from the session task and must not block.
/// The default implementations log through `tracing`.
pub trait TunnelEvents: Send + Sync + 'static {
    /// The relay has opened the tunnel and published it at `url`.
    fn on_open(&self, url: &str) {
        tracing::info!(url, "Tunnel opened");
    }

    /// A recoverable error occurred. The client keeps running.
    fn on_error(&self, error: &TunnelError) {
        tracing::warn!(error = %error, "Tunnel error");
    }
}

/// Event sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

impl TunnelEvents for LogEvents {}
