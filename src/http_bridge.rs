//! HTTP requests arriving through the tunnel.
//!
//! The handler for `request` frames is chosen once per client, in priority
//! order:
//!
//! 1. the user supplied [`RequestHandler`], if any;
//! 2. [`LocalProxy`] when the tunnel protocol is `http` and a local port is set;
//! 3. [`NotImplemented`], which answers every request with `501`.
//!
//! Every request runs on its own task and produces exactly one `response`
//! frame, except when a user handler fails: that failure goes to
//! [`TunnelEvents::on_error`](crate::TunnelEvents::on_error) and the request
//! gets no answer.

use crate::config::{Protocol, TunnelConfig};
use crate::error::TunnelError;
use crate::handler::{HandlerError, HttpRequest, HttpResponse, RequestHandler};
use crate::protocol::{ClientFrame, Headers};
use crate::session::BridgeContext;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Picks the handler for `request` frames.
pub(crate) fn resolve_handler(config: &TunnelConfig) -> Result<Arc<dyn RequestHandler>, TunnelError> {
    if let Some(handler) = &config.request_handler {
        return Ok(handler.clone());
    }
    match (config.protocol, config.local_port) {
        (Protocol::Http, Some(port)) => Ok(Arc::new(LocalProxy::new(
            &config.local_host,
            port,
            config.proxy_timeout,
        )?)),
        _ => Ok(Arc::new(NotImplemented)),
    }
}

/// Handles `request`: runs the handler and sends the `response` frame.
pub(crate) fn spawn_request(
    ctx: &BridgeContext,
    handler: &Arc<dyn RequestHandler>,
    tasks: &mut JoinSet<()>,
    request: HttpRequest,
) {
    let ctx = ctx.clone();
    let handler = handler.clone();
    let span = tracing::debug_span!(
        "request",
        request_id = %request.request_id,
        method = %request.method,
        path = %request.path
    );
    tasks.spawn(
        async move {
            let request_id = request.request_id.clone();
            let result = AssertUnwindSafe(handler.handle(request)).catch_unwind().await;
            let response = match result {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    ctx.events
                        .on_error(&TunnelError::HandlerFailed(Arc::from(e.to_string())));
                    return;
                }
                Err(_) => {
                    ctx.events
                        .on_error(&TunnelError::HandlerFailed(Arc::from("request handler panicked")));
                    return;
                }
            };
            tracing::debug!(status = response.status_code, "Sending response");
            let frame = ClientFrame::Response {
                request_id,
                status_code: response.status_code,
                headers: response.headers,
                body: response.body,
            };
            let _ = ctx.outbound.send_async(frame).await;
        }
        .instrument(span),
    );
}

/// Forwards requests to an HTTP service on the local machine.
///
/// Upstream responses are passed through whatever their status. Failing to
/// reach the service yields `502 Bad Gateway`, exceeding the timeout yields
/// `504 Gateway Timeout`.
#[derive(Debug, Clone)]
pub struct LocalProxy {
    client: reqwest::Client,
    base_url: String,
}

impl LocalProxy {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, TunnelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| TunnelError::ConfigError(Arc::from(format!("HTTP client: {}", e))))?;
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", host, port),
        })
    }

    /// Performs one round trip. Never fails; errors become 502/504 responses.
    pub async fn forward(&self, request: HttpRequest) -> HttpResponse {
        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return HttpResponse::text(
                    StatusCode::BAD_REQUEST.as_u16(),
                    format!("Invalid HTTP method '{}'", request.method),
                )
            }
        };
        let url = if request.path.starts_with('/') {
            format!("{}{}", self.base_url, request.path)
        } else {
            format!("{}/{}", self.base_url, request.path)
        };

        let mut builder = self
            .client
            .request(method, &url)
            .headers(forwarded_headers(&request.headers));
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return self.failure_response(e),
        };
        let status_code = response.status().as_u16();
        let headers = response_headers(response.headers());
        match response.bytes().await {
            Ok(body) => HttpResponse {
                status_code,
                headers,
                body: String::from_utf8_lossy(&body).into_owned(),
            },
            Err(e) => self.failure_response(e),
        }
    }

    fn failure_response(&self, err: reqwest::Error) -> HttpResponse {
        if err.is_timeout() {
            tracing::warn!(error = %err, "Local service timed out");
            HttpResponse::text(
                StatusCode::GATEWAY_TIMEOUT.as_u16(),
                format!("Gateway Timeout: {} did not answer in time", self.base_url),
            )
        } else {
            tracing::warn!(error = %err, "Local service unreachable");
            HttpResponse::text(
                StatusCode::BAD_GATEWAY.as_u16(),
                format!("Bad Gateway: could not reach local service at {}: {}", self.base_url, err),
            )
        }
    }
}

impl RequestHandler for LocalProxy {
    fn handle(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, HandlerError>> {
        async move { Ok(self.forward(request).await) }.boxed()
    }
}

/// Answers every request with `501 Not Implemented`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotImplemented;

impl RequestHandler for NotImplemented {
    fn handle(&self, _request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, HandlerError>> {
        async move {
            Ok(HttpResponse::text(
                StatusCode::NOT_IMPLEMENTED.as_u16(),
                "Not Implemented",
            ))
        }
        .boxed()
    }
}

fn forwarded_headers(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        // the body goes back as text, so ask the local service not to compress it
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("accept-encoding")
        {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::debug!(header = %name, "Skipping invalid request header"),
        }
    }
    map
}

/// Flattens upstream headers into the frame's one-value-per-name map.
///
/// Repeated headers are joined with `, `. For `set-cookie` that join is lossy
/// (cookie attributes may contain commas); the frame format has no way to
/// carry repeated values.
fn response_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let name = name.as_str();
        // body is re-encoded as text, so the upstream length no longer applies
        if is_hop_by_hop(name) || name == "content-length" {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}
