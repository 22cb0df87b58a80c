//! One-shot datagram exchanges.
//!
//! Every `udp_data` frame gets its own ephemeral UDP socket: the payload is
//! sent to the local service and the first datagram that comes back is framed
//! as `udp_response`. If nothing comes back within the datagram timeout the
//! exchange ends silently. The socket is released when the task ends, whatever
//! the outcome.

use crate::error::TunnelError;
use crate::protocol::{decode_payload, ClientFrame};
use crate::session::BridgeContext;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Largest datagram we can receive.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// How an exchange ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExchangeOutcome {
    Response(Bytes),
    TimedOut,
}

/// Handles `udp_data`: starts one exchange with the local service.
pub(crate) fn spawn_exchange(
    ctx: &BridgeContext,
    tasks: &mut JoinSet<()>,
    packet_id: String,
    data: &str,
) {
    let payload = match decode_payload(data) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(packet_id = %packet_id, error = %e, "Dropping datagram");
            return;
        }
    };
    let Some(target) = ctx.config.local_target() else {
        ctx.events.on_error(&TunnelError::ConfigError(Arc::from(
            "datagram received but no local port is configured",
        )));
        return;
    };

    let ctx = ctx.clone();
    let wait = ctx.config.datagram_timeout;
    let span = tracing::debug_span!("datagram", packet_id = %packet_id);
    tasks.spawn(
        async move {
            match exchange(&target, &payload, wait).await {
                Ok(ExchangeOutcome::Response(response)) => {
                    let frame = ClientFrame::udp_response(&packet_id, &response);
                    let _ = ctx.outbound.send_async(frame).await;
                }
                Ok(ExchangeOutcome::TimedOut) => {
                    tracing::debug!("No datagram response before timeout");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Datagram exchange failed");
                    ctx.events.on_error(&e);
                }
            }
        }
        .instrument(span),
    );
}

/// Sends `payload` to `target` and waits up to `wait` for the first reply.
pub(crate) async fn exchange(
    target: &str,
    payload: &[u8],
    wait: Duration,
) -> Result<ExchangeOutcome, TunnelError> {
    match tokio::time::timeout(wait, send_and_receive(target, payload)).await {
        Ok(Ok(response)) => Ok(ExchangeOutcome::Response(response)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(ExchangeOutcome::TimedOut),
    }
}

async fn send_and_receive(target: &str, payload: &[u8]) -> Result<Bytes, TunnelError> {
    let addr = resolve(target).await?;
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| TunnelError::io("Failed to bind datagram socket", e))?;
    // connected, so ICMP port-unreachable surfaces as an error instead of a timeout
    socket
        .connect(addr)
        .await
        .map_err(|e| TunnelError::io(format_args!("Failed to connect to {}", addr), e))?;
    socket
        .send(payload)
        .await
        .map_err(|e| TunnelError::io(format_args!("Failed to send datagram to {}", addr), e))?;

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let n = socket
        .recv(&mut buf)
        .await
        .map_err(|e| TunnelError::io(format_args!("Failed to receive datagram from {}", addr), e))?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

async fn resolve(target: &str) -> Result<SocketAddr, TunnelError> {
    tokio::net::lookup_host(target)
        .await
        .map_err(|e| TunnelError::io(format_args!("Failed to resolve {}", target), e))?
        .next()
        .ok_or_else(|| TunnelError::IoError(Arc::from(format!("No address for {}", target))))
}
