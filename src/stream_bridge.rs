//! Byte-stream sub-channels.
//!
//! Each `tcp_connection` frame opens one local TCP socket, registered under the
//! relay-assigned connection id. The registry lives in the session task; the
//! socket itself is driven by a spawned task that talks back over channels:
//!
//! ```text
//!   session task                         connection task
//!  ┌──────────────┐   write queue (Bytes)  ┌──────────────┐     ┌───────────────┐
//!  │  registry    │ ─────────────────────► │  local write │ ──► │               │
//!  │  id → entry  │                        │              │     │ local service │
//!  │              │ ◄───── outbound ────── │  local read  │ ◄── │               │
//!  └──────────────┘   (tcp_data frames)    └──────────────┘     └───────────────┘
//!         ▲                                        │
//!         └────────── closed notification ─────────┘
//! ```
//!
//! The connection is registered before the local connect completes, so data
//! that arrives in the meantime is queued and written in order.

use crate::error::TunnelError;
use crate::protocol::{decode_payload, ClientFrame};
use crate::session::BridgeContext;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Read buffer size for local sockets.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Sent by a connection task when its local socket is gone.
#[derive(Debug)]
pub(crate) struct StreamClosed {
    connection_id: String,
    serial: u64,
}

struct StreamEntry {
    writer: flume::Sender<Bytes>,
    /// Distinguishes this entry from a later one that reuses the same id.
    serial: u64,
}

/// Registry of live sub-channels for one session.
pub(crate) struct StreamBridge {
    ctx: BridgeContext,
    connections: HashMap<String, StreamEntry>,
    next_serial: u64,
    closed_tx: flume::Sender<StreamClosed>,
}

impl StreamBridge {
    pub(crate) fn new(ctx: BridgeContext, closed_tx: flume::Sender<StreamClosed>) -> Self {
        Self {
            ctx,
            connections: HashMap::new(),
            next_serial: 0,
            closed_tx,
        }
    }

    /// Handles `tcp_connection`: registers the id and starts connecting.
    pub(crate) fn open(&mut self, connection_id: String, tasks: &mut JoinSet<()>) {
        if self.connections.contains_key(&connection_id) {
            tracing::warn!(connection_id = %connection_id, "Ignoring duplicate connection id");
            return;
        }
        let Some(target) = self.ctx.config.local_target() else {
            self.ctx.events.on_error(&TunnelError::ConfigError(Arc::from(
                "stream connection requested but no local port is configured",
            )));
            return;
        };

        self.next_serial += 1;
        let serial = self.next_serial;
        let (writer, writes) = flume::unbounded::<Bytes>();
        self.connections
            .insert(connection_id.clone(), StreamEntry { writer, serial });

        tracing::debug!(connection_id = %connection_id, target = %target, "Opening local stream");
        let span = tracing::debug_span!("stream", connection_id = %connection_id);
        tasks.spawn(
            run_connection(
                self.ctx.clone(),
                connection_id,
                serial,
                target,
                writes,
                self.closed_tx.clone(),
            )
            .instrument(span),
        );
    }

    /// Handles `tcp_data`: queues the decoded payload for the local socket.
    ///
    /// Unknown ids are ignored; the relay may still be sending for a
    /// connection that already closed on this side.
    pub(crate) fn write(&mut self, connection_id: &str, data: &str) {
        let Some(entry) = self.connections.get(connection_id) else {
            tracing::debug!(connection_id, "Data for unknown connection dropped");
            return;
        };
        let payload = match decode_payload(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(connection_id, error = %e, "Dropping stream data");
                return;
            }
        };
        if payload.is_empty() {
            return;
        }
        if entry.writer.send(payload).is_err() {
            // task already gone; its closed notification is on the way
            tracing::debug!(connection_id, "Data for closing connection dropped");
        }
    }

    /// Removes the entry a finished connection task belonged to.
    pub(crate) fn remove(&mut self, closed: StreamClosed) {
        let is_current = self
            .connections
            .get(&closed.connection_id)
            .is_some_and(|entry| entry.serial == closed.serial);
        if is_current {
            self.connections.remove(&closed.connection_id);
            tracing::debug!(connection_id = %closed.connection_id, "Local stream closed");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    /// Drops every entry. Connection tasks see their write queue close and exit.
    pub(crate) fn clear(&mut self) {
        self.connections.clear();
    }
}

async fn run_connection(
    ctx: BridgeContext,
    connection_id: String,
    serial: u64,
    target: String,
    writes: flume::Receiver<Bytes>,
    closed_tx: flume::Sender<StreamClosed>,
) {
    if let Err(e) = bridge_connection(&ctx, &connection_id, &target, writes).await {
        tracing::warn!(error = %e, "Local stream failed");
        ctx.events.on_error(&e);
    }
    let _ = closed_tx.send(StreamClosed {
        connection_id,
        serial,
    });
}

/// Relays bytes between one local socket and the control channel until either
/// side goes away.
async fn bridge_connection(
    ctx: &BridgeContext,
    connection_id: &str,
    target: &str,
    writes: flume::Receiver<Bytes>,
) -> Result<(), TunnelError> {
    let socket = TcpStream::connect(target)
        .await
        .map_err(|e| TunnelError::io(format_args!("Failed to connect to {}", target), e))?;
    let _ = socket.set_nodelay(true);
    let (mut local_read, mut local_write) = socket.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            read = local_read.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("EOF from local service");
                    return Ok(());
                }
                Ok(n) => {
                    let frame = ClientFrame::tcp_data(connection_id, &buf[..n]);
                    if ctx.outbound.send_async(frame).await.is_err() {
                        // session is gone
                        return Ok(());
                    }
                }
                Err(e) => return Err(TunnelError::io("Error reading from local service", e)),
            },
            data = writes.recv_async() => match data {
                Ok(data) => {
                    local_write
                        .write_all(&data)
                        .await
                        .map_err(|e| TunnelError::io("Error writing to local service", e))?;
                }
                // registry entry dropped
                Err(_) => return Ok(()),
            },
        }
    }
}
