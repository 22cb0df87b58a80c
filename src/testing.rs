//! Local fixtures for tests: a scripted relay, echo and HTTP services, an
//! event recorder and a log capture.

use crate::error::TunnelError;
use crate::handler::TunnelEvents;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Upper bound on any single wait in a test.
const TEST_WAIT: Duration = Duration::from_secs(10);

/// A relay that accepts control channels on a loopback port.
pub(crate) struct MockRelay {
    listener: TcpListener,
}

impl MockRelay {
    pub(crate) async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub(crate) fn url(&self) -> String {
        format!("ws://{}/connect", self.listener.local_addr().unwrap())
    }

    /// Accepts the next control channel.
    pub(crate) async fn accept(&self) -> RelayConn {
        let (socket, _) = tokio::time::timeout(TEST_WAIT, self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        RelayConn { ws }
    }

    /// Accepts one TCP connection and drops it without a WebSocket handshake.
    pub(crate) async fn reject(&self) {
        let (socket, _) = tokio::time::timeout(TEST_WAIT, self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        drop(socket);
    }
}

/// The relay's end of one control channel.
pub(crate) struct RelayConn {
    ws: WebSocketStream<TcpStream>,
}

impl RelayConn {
    /// Next JSON frame, or `None` once the channel closes.
    pub(crate) async fn recv_json(&mut self) -> Option<Value> {
        tokio::time::timeout(TEST_WAIT, self.next_json())
            .await
            .expect("timed out waiting for a frame")
    }

    /// Like [`recv_json`](Self::recv_json) but `None` if nothing arrives in `wait`.
    pub(crate) async fn recv_json_within(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.next_json()).await.ok().flatten()
    }

    async fn next_json(&mut self) -> Option<Value> {
        while let Some(message) = self.ws.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    }

    /// Reads until a ping arrives. Returns `false` on timeout or close.
    pub(crate) async fn wait_for_ping(&mut self, wait: Duration) -> bool {
        let ping = async {
            while let Some(message) = self.ws.next().await {
                match message {
                    Ok(Message::Ping(_)) => return true,
                    Ok(Message::Close(_)) | Err(_) => return false,
                    Ok(_) => {}
                }
            }
            false
        };
        tokio::time::timeout(wait, ping).await.unwrap_or(false)
    }

    pub(crate) async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub(crate) async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    /// Expects `open_tunnel` and answers with `tunnel_opened`.
    pub(crate) async fn handshake(&mut self) -> Value {
        let hello = self.recv_json().await.expect("channel closed before handshake");
        assert_eq!(hello["type"], "open_tunnel");
        self.send_json(serde_json::json!({"type": "tunnel_opened", "url": "https://demo.relay.test"}))
            .await;
        hello
    }

    pub(crate) async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Records lifecycle events for assertions.
pub(crate) struct RecordingEvents {
    opened: flume::Sender<String>,
    errors: flume::Sender<TunnelError>,
}

impl TunnelEvents for RecordingEvents {
    fn on_open(&self, url: &str) {
        let _ = self.opened.send(url.to_string());
    }

    fn on_error(&self, error: &TunnelError) {
        let _ = self.errors.send(error.clone());
    }
}

pub(crate) struct EventLog {
    pub(crate) opened: flume::Receiver<String>,
    pub(crate) errors: flume::Receiver<TunnelError>,
}

impl EventLog {
    pub(crate) async fn next_open(&self) -> String {
        tokio::time::timeout(TEST_WAIT, self.opened.recv_async())
            .await
            .expect("no open event")
            .unwrap()
    }

    pub(crate) async fn next_error(&self) -> TunnelError {
        tokio::time::timeout(TEST_WAIT, self.errors.recv_async())
            .await
            .expect("no error event")
            .unwrap()
    }
}

pub(crate) fn recording_events() -> (Arc<RecordingEvents>, EventLog) {
    let (opened_tx, opened) = flume::unbounded();
    let (errors_tx, errors) = flume::unbounded();
    (
        Arc::new(RecordingEvents {
            opened: opened_tx,
            errors: errors_tx,
        }),
        EventLog { opened, errors },
    )
}

/// A loopback TCP port with nothing listening on it.
pub(crate) fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A loopback UDP port with nothing bound to it.
pub(crate) fn closed_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// TCP service that echoes every byte back.
pub(crate) async fn spawn_tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    port
}

/// UDP service that answers every datagram with itself.
pub(crate) async fn spawn_udp_echo() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    port
}

/// What [`spawn_http_server`] received for one request.
#[derive(Debug, Clone)]
pub(crate) struct ReceivedRequest {
    /// `METHOD target HTTP/1.1`
    pub(crate) request_line: String,
    /// Header lines, names lowercased.
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: String,
}

impl ReceivedRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP service that answers every request with `response` verbatim and
/// reports what it received.
pub(crate) async fn spawn_http_server(response: &'static str) -> (u16, flume::Receiver<ReceivedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = flume::unbounded();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                let head_end = loop {
                    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos;
                    }
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                    }
                };
                let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
                let mut lines = head.split("\r\n");
                let request_line = lines.next().unwrap_or_default().to_string();
                let headers: Vec<(String, String)> = lines
                    .filter_map(|line| line.split_once(':'))
                    .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_string()))
                    .collect();
                let length = headers
                    .iter()
                    .find(|(n, _)| n == "content-length")
                    .and_then(|(_, v)| v.parse::<usize>().ok())
                    .unwrap_or(0);
                let mut body = raw[head_end + 4..].to_vec();
                while body.len() < length {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => body.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = seen_tx.send(ReceivedRequest {
                    request_line,
                    headers,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (port, seen_rx)
}

/// Collects the `message` of every tracing event while installed.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs {
    messages: Arc<Mutex<Vec<String>>>,
}

impl CapturedLogs {
    /// Installs the capture for the current thread until the guard drops.
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::layer::SubscriberExt;
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn count(&self, message: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == message)
            .count()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedLogs {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        struct MessageVisitor(Option<String>);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = Some(format!("{:?}", value));
                }
            }
        }
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.messages.lock().unwrap().push(message);
        }
    }
}
