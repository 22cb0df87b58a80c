//! Tunnel configuration.
//!
//! [`TunnelConfig`] holds everything a session needs to reach the relay and the
//! local service. It is immutable once handed to a [`TunnelClient`](crate::TunnelClient).

use crate::error::TunnelError;
use crate::handler::{LogEvents, RequestHandler, TunnelEvents};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default relay URL.
pub const DEFAULT_SERVER_URL: &str = "wss://relay.tunnel.dev/connect";

/// Interval between liveness pings on the control channel.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(9);

/// How long the control channel may stay completely silent before it is
/// considered dead.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a datagram exchange waits for the local service to answer.
pub const DEFAULT_DATAGRAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for one proxied HTTP round trip.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// The kind of traffic a tunnel carries.
///
/// Serialized on the wire as `http`, `tcp` or `udp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Request/response pairs proxied to a local HTTP service.
    #[default]
    Http,
    /// Byte-stream sub-channels bridged to local TCP sockets.
    Tcp,
    /// Datagram exchanges bridged to a local UDP service.
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "tcp" | "stream" => Ok(Protocol::Tcp),
            "udp" | "datagram" => Ok(Protocol::Udp),
            other => Err(TunnelError::ConfigError(Arc::from(format!(
                "unknown protocol '{}', expected http, tcp or udp",
                other
            )))),
        }
    }
}

/// Configuration for a tunnel client.
///
/// # Construction
///
/// Use [`TunnelConfig::new()`] to create a configuration, then chain
/// `with_*` methods to customize it:
///
/// ```rust
/// use relay_tunnel::{Protocol, TunnelConfig};
///
/// let config = TunnelConfig::new("my-api-key")
///     .with_protocol(Protocol::Tcp)
///     .with_local_port(5432)
///     .with_remote_port(15432);
/// assert_eq!(config.local_port, Some(5432));
/// ```
///
/// # Stability
///
/// This struct is marked `#[non_exhaustive]`, meaning new fields may be added
/// in future versions without a breaking change. Always use the constructor
/// and builder methods rather than struct literal syntax.
#[derive(Clone)]
#[non_exhaustive]
pub struct TunnelConfig {
    /// The relay WebSocket URL (`ws://` or `wss://`)
    pub server_url: String,

    /// Opaque credential presented once in the `open_tunnel` frame
    pub api_key: String,

    /// Traffic kind carried by this tunnel
    pub protocol: Protocol,

    /// Port of the local service traffic is delivered to
    pub local_port: Option<u16>,

    /// Host of the local service (defaults to `127.0.0.1`)
    pub local_host: String,

    /// Public port to ask the relay for; `None` lets the relay choose
    pub remote_port: Option<u16>,

    /// Optional path to a PEM file containing a root CA certificate to trust.
    ///
    /// When set, this CA will be trusted in addition to the default webpki
    /// roots. This is useful for development against self-signed relays.
    pub trust_ca: Option<PathBuf>,

    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub datagram_timeout: Duration,
    pub proxy_timeout: Duration,

    /// Custom handler for `request` frames. Takes priority over proxying.
    pub request_handler: Option<Arc<dyn RequestHandler>>,

    /// Receives the public URL and every recoverable error.
    pub events: Arc<dyn TunnelEvents>,
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("server_url", &self.server_url)
            .field("api_key", &"<redacted>")
            .field("protocol", &self.protocol)
            .field("local_port", &self.local_port)
            .field("local_host", &self.local_host)
            .field("remote_port", &self.remote_port)
            .field("trust_ca", &self.trust_ca)
            .field("ping_interval", &self.ping_interval)
            .field("liveness_timeout", &self.liveness_timeout)
            .field("datagram_timeout", &self.datagram_timeout)
            .field("proxy_timeout", &self.proxy_timeout)
            .field("request_handler", &self.request_handler.is_some())
            .finish()
    }
}

impl TunnelConfig {
    /// Creates a new configuration with default settings.
    ///
    /// The protocol defaults to [`Protocol::Http`], no local port is set and
    /// the relay assigns the public port.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: api_key.into(),
            protocol: Protocol::default(),
            local_port: None,
            local_host: "127.0.0.1".to_string(),
            remote_port: None,
            trust_ca: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            datagram_timeout: DEFAULT_DATAGRAM_TIMEOUT,
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
            request_handler: None,
            events: Arc::new(LogEvents),
        }
    }

    /// Sets a custom relay URL.
    ///
    /// Use this for development or testing against a non-production relay.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Sets the host of the local service.
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    /// Asks the relay for a specific public port.
    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    /// Sets a custom root CA certificate to trust.
    ///
    /// The provided path should point to a PEM file containing one or more
    /// CA certificates.
    pub fn with_trust_ca(mut self, path: PathBuf) -> Self {
        self.trust_ca = Some(path);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_datagram_timeout(mut self, timeout: Duration) -> Self {
        self.datagram_timeout = timeout;
        self
    }

    pub fn with_proxy_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_timeout = timeout;
        self
    }

    /// Installs a handler that answers `request` frames instead of the
    /// built-in local proxy.
    pub fn with_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.request_handler = Some(handler);
        self
    }

    /// Installs the sink for open notifications and errors.
    pub fn with_events(mut self, events: Arc<dyn TunnelEvents>) -> Self {
        self.events = events;
        self
    }

    /// Returns `host:port` of the local service, if a port is configured.
    pub fn local_target(&self) -> Option<String> {
        self.local_port
            .map(|port| format!("{}:{}", self.local_host, port))
    }

    /// Checks the configuration for errors that no amount of retrying fixes.
    pub fn validate(&self) -> Result<(), TunnelError> {
        let uri: http::Uri = self.server_url.parse()?;
        match uri.scheme_str() {
            Some("ws") | Some("wss") => {}
            _ => {
                return Err(TunnelError::ConfigError(Arc::from(format!(
                    "relay URL must use ws:// or wss://, got '{}'",
                    self.server_url
                ))))
            }
        }
        if uri.host().is_none() {
            return Err(TunnelError::ConfigError(Arc::from("URL missing host")));
        }
        if self.api_key.is_empty() {
            return Err(TunnelError::ConfigError(Arc::from("API key is empty")));
        }
        if matches!(self.protocol, Protocol::Tcp | Protocol::Udp) && self.local_port.is_none() {
            return Err(TunnelError::ConfigError(Arc::from(format!(
                "protocol {} requires a local port",
                self.protocol
            ))));
        }
        if self.ping_interval.is_zero() {
            return Err(TunnelError::ConfigError(Arc::from(
                "ping interval must be greater than zero",
            )));
        }
        Ok(())
    }
}
