//! Control channel frames.
//!
//! Every frame is one WebSocket text message holding a JSON object with a
//! `type` discriminator and camelCase fields.
//!
//! # Outbound (client → relay)
//!
//! | `type`         | Fields                                      |
//! |----------------|---------------------------------------------|
//! | `open_tunnel`  | `apiKey`, `protocol`, `remotePort?`         |
//! | `response`     | `requestId`, `statusCode`, `headers`, `body`|
//! | `tcp_data`     | `connectionId`, `data` (base64)             |
//! | `udp_response` | `packetId`, `data` (base64)                 |
//!
//! # Inbound (relay → client)
//!
//! | `type`           | Fields                                                   |
//! |------------------|----------------------------------------------------------|
//! | `tunnel_opened`  | `url`                                                    |
//! | `error`          | `message`                                                |
//! | `request`        | `requestId`, `method`, `path`, `headers`, `body?`        |
//! | `tcp_connection` | `connectionId`                                           |
//! | `tcp_data`       | `connectionId`, `data` (base64)                          |
//! | `udp_data`       | `packetId`, `data` (base64), `sourceAddress`, `sourcePort`|

use crate::config::Protocol;
use crate::error::{Result, TunnelError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Header map carried in `request` and `response` frames.
pub type Headers = BTreeMap<String, String>;

/// Frames sent from the client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Handshake; always the first frame on a new control channel.
    OpenTunnel {
        api_key: String,
        protocol: Protocol,
        /// Left out when unset; the relay then assigns one.
        #[serde(skip_serializing_if = "Option::is_none")]
        remote_port: Option<u16>,
    },
    /// Answer to one `request` frame.
    Response {
        request_id: String,
        status_code: u16,
        headers: Headers,
        body: String,
    },
    /// Bytes read from a local stream socket.
    TcpData { connection_id: String, data: String },
    /// First datagram the local service answered with.
    UdpResponse { packet_id: String, data: String },
}

impl ClientFrame {
    pub fn tcp_data(connection_id: &str, payload: &[u8]) -> Self {
        ClientFrame::TcpData {
            connection_id: connection_id.to_string(),
            data: encode_payload(payload),
        }
    }

    pub fn udp_response(packet_id: &str, payload: &[u8]) -> Self {
        ClientFrame::UdpResponse {
            packet_id: packet_id.to_string(),
            data: encode_payload(payload),
        }
    }

    /// Serializes the frame to its JSON text form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::OpenTunnel { .. } => "open_tunnel",
            ClientFrame::Response { .. } => "response",
            ClientFrame::TcpData { .. } => "tcp_data",
            ClientFrame::UdpResponse { .. } => "udp_response",
        }
    }
}

/// Frames received from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    TunnelOpened {
        url: String,
    },
    Error {
        message: String,
    },
    Request {
        request_id: String,
        method: String,
        path: String,
        #[serde(default, deserialize_with = "deserialize_headers")]
        headers: Headers,
        #[serde(default)]
        body: Option<String>,
    },
    TcpConnection {
        connection_id: String,
    },
    TcpData {
        connection_id: String,
        data: String,
    },
    UdpData {
        packet_id: String,
        data: String,
        #[serde(default)]
        source_address: Option<String>,
        #[serde(default)]
        source_port: Option<u16>,
    },
}

impl ServerFrame {
    /// Parses one text message from the relay.
    ///
    /// Unknown `type` values and malformed JSON are both reported as
    /// [`TunnelError::ProtocolError`].
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            TunnelError::ProtocolError(Arc::from(format!("malformed frame: {}", e)))
        })
    }
}

/// Encodes a binary payload for the `data` field of a frame.
pub fn encode_payload(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decodes the `data` field of a frame.
pub fn decode_payload(data: &str) -> Result<Bytes> {
    Ok(Bytes::from(BASE64.decode(data)?))
}

/// Relays forward headers the way their HTTP stack saw them, so a value may be
/// a string, a number, or a list of strings for repeated headers.
fn deserialize_headers<'de, D>(deserializer: D) -> std::result::Result<Headers, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    let mut headers = Headers::new();
    for (name, value) in raw.unwrap_or_default() {
        let value = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(s) => s,
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            other => other.to_string(),
        };
        headers.insert(name, value);
    }
    Ok(headers)
}
