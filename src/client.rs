//! Connection supervisor.
//!
//! [`TunnelClient`] keeps one [`Session`] alive at a time and replaces it
//! whenever it ends, until [`close()`](TunnelClient::close) is called.
//!
//! ```text
//!            ┌──────────────── clean close ────────────────┐
//!            ▼                                             │
//!   Idle ─► Connecting ──── open ────► Open ───────────────┘
//!            ▲    │                     │
//!            │    └──── error ──┐       │ error
//!            │                  ▼       ▼
//!            └──── timer ───── Backoff ◄┘
//!
//!   any state ──── close() ────► Closed
//! ```

use crate::backoff::Backoff;
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::handler::RequestHandler;
use crate::http_bridge::resolve_handler;
use crate::session::{wait_for_shutdown, Session, SessionEnd};
use crate::session_id::{next_session_id, SessionId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::Instrument;

/// Where the supervisor currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, [`run()`](TunnelClient::run) not called yet.
    Idle,
    /// Opening a control channel.
    Connecting,
    /// A control channel is open and frames are flowing.
    Open,
    /// Waiting before the next attempt.
    Backoff,
    /// Closed for good.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Backoff => "backoff",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tunnel client that stays connected to the relay.
///
/// The client is cheap to clone; clones share the same connection, so one
/// clone can [`run()`](Self::run) while another calls [`close()`](Self::close).
///
/// # Example
///
/// ```rust,no_run
/// use relay_tunnel::{Protocol, TunnelClient, TunnelConfig};
///
/// # async fn example() -> Result<(), relay_tunnel::TunnelError> {
/// let config = TunnelConfig::new("my-api-key")
///     .with_protocol(Protocol::Tcp)
///     .with_local_port(22);
/// let client = TunnelClient::new(config)?;
///
/// let handle = client.spawn();
/// tokio::signal::ctrl_c().await.ok();
/// client.close();
/// handle.await.ok();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TunnelClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    config: Arc<TunnelConfig>,
    handler: Arc<dyn RequestHandler>,
    /// Flipped once by `close()`, never reset.
    shutdown_tx: watch::Sender<bool>,
    state_tx: watch::Sender<ConnectionState>,
    running: AtomicBool,
    backoff: Backoff,
}

impl TunnelClient {
    /// Creates a client from `config`.
    ///
    /// The configuration is validated here; no connection is made until
    /// [`run()`](Self::run) is called.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ConfigError`] if the configuration is invalid.
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        Self::with_backoff(config, Backoff::default())
    }

    pub(crate) fn with_backoff(config: TunnelConfig, backoff: Backoff) -> Result<Self, TunnelError> {
        config.validate()?;
        let handler = resolve_handler(&config)?;
        let (shutdown_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            shared: Arc::new(ClientShared {
                config: Arc::new(config),
                handler,
                shutdown_tx,
                state_tx,
                running: AtomicBool::new(false),
                backoff,
            }),
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Receives every state change from now on.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.shutdown_tx.borrow()
    }

    /// Stops the client.
    ///
    /// The open control channel, if any, is closed and every local socket is
    /// released. No frame is sent after this returns and no reconnect is
    /// attempted. Calling it more than once has no further effect.
    pub fn close(&self) {
        if !self.shared.shutdown_tx.send_replace(true) {
            tracing::info!("Closing tunnel client");
        }
        self.shared.state_tx.send_replace(ConnectionState::Closed);
    }

    /// Runs the client on a new tokio task.
    pub fn spawn(&self) -> JoinHandle<Result<(), TunnelError>> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// Connects and keeps reconnecting until [`close()`](Self::close) is called.
    ///
    /// Failures along the way go to
    /// [`TunnelEvents::on_error`](crate::TunnelEvents::on_error) and are
    /// retried with exponential backoff; they never end the loop.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::ClientClosed`] if the client was already closed
    /// - [`TunnelError::ConfigError`] if another task is already running it
    pub async fn run(&self) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ClientClosed);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::ConfigError(Arc::from(
                "tunnel client is already running",
            )));
        }
        self.supervise().await;
        self.shared.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn supervise(&self) {
        let shared = &self.shared;
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        let mut backoff = shared.backoff.clone();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let id = next_session_id();
            let span = tracing::info_span!("session", id = %id);
            let outcome = self
                .attempt(id, &mut shutdown_rx, &mut backoff)
                .instrument(span)
                .await;

            match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ChannelClosed) => {
                    tracing::info!("Control channel closed, reconnecting");
                }
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    let delay = backoff.next_delay();
                    if e.is_transient() {
                        tracing::info!("Control channel failed. Will retry in {} ms: {}.", delay.as_millis(), e);
                    } else {
                        tracing::error!("Control channel failed. Will retry in {} ms: {}.", delay.as_millis(), e);
                    }
                    shared.config.events.on_error(&e);

                    self.set_state(ConnectionState::Backoff);
                    tokio::select! {
                        _ = time::sleep(delay) => {},
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    }
                }
            }
        }

        self.set_state(ConnectionState::Closed);
        tracing::info!("Tunnel client stopped");
    }

    /// One session lifetime: connect, handshake, run until the channel ends.
    async fn attempt(
        &self,
        id: SessionId,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd, TunnelError> {
        let shared = &self.shared;
        let session = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => return Ok(SessionEnd::Shutdown),
            session = Session::open_with_handler(shared.config.clone(), shared.handler.clone(), id) => session?,
        };
        backoff.reset();
        self.set_state(ConnectionState::Open);
        session.run(shutdown_rx).await
    }

    /// Moves to `next`, unless the client has already been closed.
    fn set_state(&self, next: ConnectionState) {
        self.shared.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            tracing::debug!(from = %state, to = %next, "State change");
            *state = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::testing::{closed_port, recording_events, MockRelay};
    use std::time::Duration;

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(50), Duration::from_millis(200))
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| *state == want))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[test]
    fn test_new_validates_config() {
        let result = TunnelClient::new(TunnelConfig::new("key").with_protocol(Protocol::Udp));
        assert!(matches!(result, Err(TunnelError::ConfigError(_))));

        let client = TunnelClient::new(TunnelConfig::new("key")).unwrap();
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_run_after_close_is_rejected() {
        let client = TunnelClient::new(TunnelConfig::new("key")).unwrap();
        client.close();
        client.close();
        assert!(client.is_closed());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.run().await, Err(TunnelError::ClientClosed)));
    }

    #[tokio::test]
    async fn test_reconnects_after_relay_close() {
        let relay = MockRelay::bind().await;
        let config = TunnelConfig::new("key").with_server_url(relay.url());
        let client = TunnelClient::with_backoff(config, fast_backoff()).unwrap();
        let mut states = client.subscribe_state();
        let handle = client.spawn();

        let mut first = relay.accept().await;
        first.handshake().await;
        wait_for_state(&mut states, ConnectionState::Open).await;
        first.close().await;

        let mut second = relay.accept().await;
        let hello = second.handshake().await;
        assert_eq!(hello["apiKey"], "key");

        client.close();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(second.recv_json().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_handshake_reports_and_retries() {
        let relay = MockRelay::bind().await;
        let (events, log) = recording_events();
        let config = TunnelConfig::new("key")
            .with_server_url(relay.url())
            .with_events(events);
        let client = TunnelClient::with_backoff(config, fast_backoff()).unwrap();
        let mut states = client.subscribe_state();
        let handle = client.spawn();

        relay.reject().await;
        log.next_error().await;

        let mut conn = relay.accept().await;
        conn.handshake().await;
        wait_for_state(&mut states, ConnectionState::Open).await;

        client.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_interrupts_backoff() {
        let (events, log) = recording_events();
        let config = TunnelConfig::new("key")
            .with_server_url(format!("ws://127.0.0.1:{}/connect", closed_port()))
            .with_events(events);
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(30));
        let client = TunnelClient::with_backoff(config, backoff).unwrap();
        let handle = client.spawn();

        let error = log.next_error().await;
        assert!(matches!(error, TunnelError::ConnectionFailed(_)));

        client.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("supervisor kept waiting after close")
            .unwrap()
            .unwrap();
        // no further attempts
        assert!(log.errors.is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let relay = MockRelay::bind().await;
        let config = TunnelConfig::new("key").with_server_url(relay.url());
        let client = TunnelClient::with_backoff(config, fast_backoff()).unwrap();
        let mut states = client.subscribe_state();
        let handle = client.spawn();

        let mut conn = relay.accept().await;
        conn.handshake().await;
        wait_for_state(&mut states, ConnectionState::Open).await;
        assert!(matches!(client.run().await, Err(TunnelError::ConfigError(_))));

        client.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_backoff_returns_to_floor_after_open() {
        let relay = MockRelay::bind().await;
        let (events, log) = recording_events();
        let config = TunnelConfig::new("key")
            .with_server_url(relay.url())
            .with_ping_interval(Duration::from_secs(60))
            .with_liveness_timeout(Duration::from_millis(300))
            .with_events(events);
        // 100ms, 200ms, 400ms, then 800ms unless an open resets it
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let client = TunnelClient::with_backoff(config, backoff).unwrap();
        let handle = client.spawn();

        for _ in 0..3 {
            relay.reject().await;
            log.next_error().await;
        }
        let mut conn = relay.accept().await;
        conn.handshake().await;

        // the relay goes silent and the session times out
        let error = log.next_error().await;
        assert!(matches!(error, TunnelError::Timeout));
        let failed_at = std::time::Instant::now();
        let _next = relay.accept().await;
        let waited = failed_at.elapsed();
        assert!(waited < Duration::from_millis(600), "waited {:?}", waited);

        client.close();
        handle.await.unwrap().unwrap();
        drop(conn);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
        assert_eq!(ConnectionState::Open.as_str(), "open");
    }
}
