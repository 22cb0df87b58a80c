//! Control channel transport.
//!
//! Opens the WebSocket to the relay and hands back its split halves. Plain
//! `ws://` URLs are supported for local development; `wss://` uses rustls with
//! the webpki root store, optionally extended with a custom CA.

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use rustls::pki_types::CertificateDer;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

/// The underlying WebSocket type.
pub(crate) type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the control channel.
pub(crate) type WsSink = SplitSink<WsConnection, Message>;

/// Read half of the control channel.
pub(crate) type WsStream = SplitStream<WsConnection>;

/// Establishes the WebSocket connection to the relay.
///
/// If `config.trust_ca` is set, the specified CA certificate is trusted in
/// addition to the default root certificates.
pub(crate) async fn connect_websocket(config: &TunnelConfig) -> Result<(WsSink, WsStream), TunnelError> {
    let mut request = config
        .server_url
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::ConfigError(Arc::from(e.to_string())))?;
    request.headers_mut().insert(
        "User-Agent",
        HeaderValue::from_static(concat!("relay-tunnel/", env!("CARGO_PKG_VERSION"))),
    );

    let ws_stream = match &config.trust_ca {
        Some(ca_path) => {
            let connector = build_tls_connector(ca_path)?;
            let (ws_stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
                request,
                None,
                false,
                Some(connector),
            )
            .await?;
            ws_stream
        }
        None => {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
            ws_stream
        }
    };

    Ok(ws_stream.split())
}

/// Trust anchors for `wss://`: the webpki roots plus the PEM bundle at
/// `ca_path`, if any.
fn relay_root_store(ca_path: Option<&Path>) -> Result<rustls::RootCertStore, TunnelError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let Some(ca_path) = ca_path else {
        return Ok(roots);
    };
    for cert in load_ca_bundle(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| ca_error(ca_path, format_args!("rejected certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Reads every certificate from a PEM bundle. An empty bundle is an error.
fn load_ca_bundle(ca_path: &Path) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let pem = std::fs::read(ca_path).map_err(|e| ca_error(ca_path, e))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ca_error(ca_path, e))?;
    if certs.is_empty() {
        return Err(ca_error(ca_path, "no PEM certificates in file"));
    }
    Ok(certs)
}

fn build_tls_connector(ca_path: &Path) -> Result<Connector, TunnelError> {
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(relay_root_store(Some(ca_path))?)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(tls_config)))
}

fn ca_error(ca_path: &Path, reason: impl std::fmt::Display) -> TunnelError {
    TunnelError::ConfigError(Arc::from(format!(
        "trust CA {}: {}",
        ca_path.display(),
        reason
    )))
}
