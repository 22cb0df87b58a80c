//! Relay Tunnel Client Library
//!
//! This library keeps a local service reachable through a relay. It holds one
//! persistent WebSocket control channel to the relay and multiplexes three
//! kinds of traffic over it: HTTP request/response pairs, TCP byte streams and
//! UDP datagram exchanges.
//!
//! # Overview
//!
//! Every frame on the control channel is a JSON text message with a `type`
//! discriminator (see [`protocol`]). The client translates between those frames
//! and local network I/O:
//!
//! - `request` frames are answered by a [`RequestHandler`], by default a
//!   [`LocalProxy`] in front of a local HTTP service
//! - `tcp_connection` / `tcp_data` frames drive local TCP sockets
//! - `udp_data` frames become one-shot UDP exchanges
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐         ┌─────────────────┐         ┌─────────────────┐
//! │  Remote Client  │◄───────►│  Relay          │◄───────►│  TunnelClient   │
//! │                 │  HTTPS  │                 │  WSS    │  (Session)      │
//! │                 │ TCP/UDP │                 │  JSON   │                 │
//! └─────────────────┘         └─────────────────┘         └─────────────────┘
//!                                                                  │
//!                                                                  ▼
//!                                                         ┌─────────────────┐
//!                                                         │  Local Service  │
//!                                                         │  (localhost:N)  │
//!                                                         └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_tunnel::{TunnelClient, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Proxy public HTTP requests to localhost:3000
//!     let config = TunnelConfig::new("your-api-key").with_local_port(3000);
//!     let client = TunnelClient::new(config)?;
//!
//!     let handle = client.spawn();
//!     tokio::signal::ctrl_c().await?;
//!     client.close();
//!     handle.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Reconnection
//!
//! The client reconnects on its own. When the relay closes the channel cleanly
//! a new one is opened right away; after an error the client waits, starting
//! at one second and doubling up to thirty. The wait resets whenever a channel
//! opens. Errors are reported through [`TunnelEvents::on_error`] and never end
//! the loop; only [`TunnelClient::close()`] does.

pub mod backoff;
pub mod client;
pub mod config;
mod datagram_bridge;
pub mod error;
pub mod handler;
pub mod http_bridge;
pub mod protocol;
pub mod session;
mod session_id;
mod stream_bridge;
mod transport;

#[cfg(test)]
mod testing;

pub use backoff::Backoff;
pub use client::{ConnectionState, TunnelClient};
pub use config::{Protocol, TunnelConfig, DEFAULT_SERVER_URL};
pub use error::TunnelError;
pub use handler::{HandlerError, HttpRequest, HttpResponse, LogEvents, RequestHandler, TunnelEvents};
pub use http_bridge::{LocalProxy, NotImplemented};
pub use protocol::{ClientFrame, ServerFrame};
pub use session::{Session, SessionEnd};
pub use session_id::SessionId;
