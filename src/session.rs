//! One control channel lifetime.
//!
//! A [`Session`] owns the WebSocket to the relay from the handshake until the
//! channel closes. It is the only writer on the channel and the only owner of
//! the sub-channel registry; bridge tasks reach it through channels.
//!
//! ```text
//!                        ┌─────────────────────────────────────┐
//!   relay ──── text ───► │ dispatch ──► stream bridge (tasks)  │
//!                        │          ──► datagram bridge (tasks)│
//!                        │          ──► http bridge (tasks)    │
//!   relay ◄─── text ──── │ outbound queue ◄──── bridge tasks   │
//!   relay ◄─── ping ──── │ every ping interval                 │
//!                        └─────────────────────────────────────┘
//! ```
//!
//! When the session ends, for whatever reason, every bridge task is aborted
//! and every local socket it held is released. In-flight local calls are not
//! awaited.

use crate::config::{Protocol, TunnelConfig};
use crate::datagram_bridge;
use crate::error::TunnelError;
use crate::handler::{HttpRequest, RequestHandler, TunnelEvents};
use crate::http_bridge;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::session_id::{next_session_id, SessionId};
use crate::stream_bridge::{StreamBridge, StreamClosed};
use crate::transport::{connect_websocket, WsSink, WsStream};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

/// Capacity of the queue between bridge tasks and the channel writer.
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// How long to wait for the close handshake to be written on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a bridge task needs to talk back to the session.
#[derive(Clone)]
pub(crate) struct BridgeContext {
    pub(crate) config: Arc<TunnelConfig>,
    pub(crate) outbound: flume::Sender<ClientFrame>,
    pub(crate) events: Arc<dyn TunnelEvents>,
}

impl BridgeContext {
    fn new(config: Arc<TunnelConfig>) -> (Self, flume::Receiver<ClientFrame>) {
        let (outbound, outbound_rx) = flume::bounded(OUTBOUND_QUEUE_SIZE);
        let events = config.events.clone();
        (
            Self {
                config,
                outbound,
                events,
            },
            outbound_rx,
        )
    }

    #[cfg(test)]
    pub(crate) fn for_test(config: TunnelConfig) -> (Self, flume::Receiver<ClientFrame>) {
        Self::new(Arc::new(config))
    }
}

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The relay closed the control channel.
    ChannelClosed,
    /// Shutdown was requested locally.
    Shutdown,
}

/// An open control channel and the bridges multiplexed over it.
pub struct Session {
    id: SessionId,
    ws_tx: WsSink,
    ws_rx: WsStream,
    ctx: BridgeContext,
    outbound_rx: flume::Receiver<ClientFrame>,
    closed_rx: flume::Receiver<StreamClosed>,
    streams: StreamBridge,
    http: Arc<dyn RequestHandler>,
    tasks: JoinSet<()>,
}

impl Session {
    /// Connects to the relay and performs the handshake.
    ///
    /// The `open_tunnel` frame is the first thing written on the new channel.
    /// The relay answers later with `tunnel_opened`, which is delivered to
    /// [`TunnelEvents::on_open`] once [`run()`](Self::run) is processing frames.
    pub async fn open(config: Arc<TunnelConfig>) -> Result<Self, TunnelError> {
        let http = http_bridge::resolve_handler(&config)?;
        Self::open_with_handler(config, http, next_session_id()).await
    }

    pub(crate) async fn open_with_handler(
        config: Arc<TunnelConfig>,
        http: Arc<dyn RequestHandler>,
        id: SessionId,
    ) -> Result<Self, TunnelError> {
        tracing::debug!(url = %config.server_url, "Connecting to relay");
        let (ws_tx, ws_rx) = connect_websocket(&config).await?;

        let (ctx, outbound_rx) = BridgeContext::new(config);
        let (closed_tx, closed_rx) = flume::unbounded();
        let streams = StreamBridge::new(ctx.clone(), closed_tx);
        let mut session = Self {
            id,
            ws_tx,
            ws_rx,
            ctx,
            outbound_rx,
            closed_rx,
            streams,
            http,
            tasks: JoinSet::new(),
        };

        let handshake = ClientFrame::OpenTunnel {
            api_key: session.ctx.config.api_key.clone(),
            protocol: session.ctx.config.protocol,
            remote_port: session.ctx.config.remote_port,
        };
        session.send_frame(&handshake).await?;
        tracing::info!(
            protocol = %session.ctx.config.protocol,
            remote_port = ?session.ctx.config.remote_port,
            "Control channel open, tunnel requested"
        );
        Ok(session)
    }

    /// Identifies this session in logs.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Processes frames until the channel closes or `shutdown` becomes `true`.
    ///
    /// Resolves exactly once the channel is gone. Transport errors and a
    /// silent relay (nothing received for the liveness timeout) are returned
    /// as errors; a close initiated by either side is not.
    pub async fn run(mut self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd, TunnelError> {
        let ping_interval = self.ctx.config.ping_interval;
        let liveness_timeout = self.ctx.config.liveness_timeout;

        let mut ping = time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let liveness = time::sleep(liveness_timeout);
        tokio::pin!(liveness);

        let result = loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => {
                    let _ = time::timeout(CLOSE_TIMEOUT, self.ws_tx.send(Message::Close(None))).await;
                    break Ok(SessionEnd::Shutdown);
                },
                message = self.ws_rx.next() => {
                    liveness.as_mut().reset(Instant::now() + liveness_timeout);
                    match message {
                        Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                        Some(Ok(Message::Binary(data))) => {
                            tracing::debug!(len = data.len(), "Ignoring binary frame");
                        },
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(reason = ?frame, "Control channel closed by relay");
                            break Ok(SessionEnd::ChannelClosed);
                        },
                        // ping/pong are answered by tungstenite
                        Some(Ok(_)) => {},
                        Some(Err(e)) => break Err(e.into()),
                        None => break Ok(SessionEnd::ChannelClosed),
                    }
                },
                frame = self.outbound_rx.recv_async() => {
                    if let Ok(frame) = frame {
                        if let Err(e) = self.send_frame(&frame).await {
                            break Err(e);
                        }
                    }
                },
                closed = self.closed_rx.recv_async() => {
                    if let Ok(closed) = closed {
                        self.streams.remove(closed);
                    }
                },
                _ = ping.tick() => {
                    if let Err(e) = self.ws_tx.send(Message::Ping(Bytes::new())).await {
                        break Err(e.into());
                    }
                },
                _ = &mut liveness => {
                    tracing::warn!(timeout = ?liveness_timeout, "Relay went silent");
                    break Err(TunnelError::Timeout);
                },
                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Bridge task panicked");
                        }
                    }
                },
            }
        };

        let abandoned = self.tasks.len();
        let streams = self.streams.len();
        self.tasks.abort_all();
        self.streams.clear();
        tracing::debug!(abandoned, streams, "Session torn down");
        result
    }

    /// Routes one inbound text frame to its bridge.
    fn dispatch(&mut self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping frame");
                return;
            }
        };
        match frame {
            ServerFrame::TunnelOpened { url } => {
                self.ctx.events.on_open(&url);
            }
            ServerFrame::Error { message } => {
                self.ctx
                    .events
                    .on_error(&TunnelError::RelayError(Arc::from(message)));
            }
            ServerFrame::Request {
                request_id,
                method,
                path,
                headers,
                body,
            } => {
                let request = HttpRequest {
                    request_id,
                    method,
                    path,
                    headers,
                    body,
                };
                http_bridge::spawn_request(&self.ctx, &self.http, &mut self.tasks, request);
            }
            ServerFrame::TcpConnection { connection_id } => {
                if self.accepts(Protocol::Tcp, "tcp_connection") {
                    self.streams.open(connection_id, &mut self.tasks);
                }
            }
            ServerFrame::TcpData { connection_id, data } => {
                if self.accepts(Protocol::Tcp, "tcp_data") {
                    self.streams.write(&connection_id, &data);
                }
            }
            ServerFrame::UdpData { packet_id, data, .. } => {
                if self.accepts(Protocol::Udp, "udp_data") {
                    datagram_bridge::spawn_exchange(&self.ctx, &mut self.tasks, packet_id, &data);
                }
            }
        }
    }

    /// Stream and datagram frames are only valid on a tunnel of that kind.
    fn accepts(&self, protocol: Protocol, kind: &str) -> bool {
        if self.ctx.config.protocol == protocol {
            return true;
        }
        tracing::warn!(
            kind,
            tunnel_protocol = %self.ctx.config.protocol,
            "Dropping frame not valid for this tunnel"
        );
        false
    }

    async fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), TunnelError> {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(kind = frame.kind(), error = %e, "Failed to encode frame");
                return Ok(());
            }
        };
        tracing::trace!(kind = frame.kind(), "Sending frame");
        self.ws_tx.send(Message::text(text)).await?;
        Ok(())
    }
}

/// Waits until the shutdown signal is received.
///
/// This is a utility function used in `tokio::select!` blocks to cancel
/// operations when the client is shutting down.
pub(crate) async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }
        if shutdown_rx.changed().await.is_err() {
            // sender gone: nobody can ever request shutdown
            futures::future::pending::<()>().await;
        }
    }
}
