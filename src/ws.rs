//! Client-side WebSocket dialer.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves that plug into [`Transport`] as its
//! [`FrameSink`] / [`FrameSource`]. The relay client should use this module
//! rather than `tokio-tungstenite` directly.
//!
//! A single [`connect`] function handles URL to request building, header
//! insertion, TLS negotiation and mapping of handshake refusals.
//!
//! Rust guideline compliant 2026-02

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::error::{Error, Result};
use crate::transport::{FrameSink, FrameSource, WireMessage};

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Handshake statuses that mean "do not retry": 307 sends the user to a
/// login page, 401 is a policy refusal, 400 is a malformed or expired sid
/// and 410 a session the server no longer knows.
pub const FATAL_HANDSHAKE_STATUSES: [u16; 4] = [307, 400, 401, 410];

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        let message = match message {
            WireMessage::Data(data) => tungstenite::Message::Binary(data.into()),
            WireMessage::Text(text) => tungstenite::Message::Text(text.into()),
            WireMessage::Ping(data) => tungstenite::Message::Ping(data.into()),
            WireMessage::Pong(data) => tungstenite::Message::Pong(data.into()),
            WireMessage::Close => tungstenite::Message::Close(None),
        };
        self.sink.send(message).await.map_err(Error::transport)
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.map_err(Error::transport)
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsReader {
    async fn recv(&mut self) -> Option<Result<WireMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(Error::Transport(format!("read error: {e}")))),
            };
            let message = match message {
                tungstenite::Message::Binary(data) => WireMessage::Data(data.to_vec()),
                tungstenite::Message::Text(text) => WireMessage::Text(text.to_string()),
                tungstenite::Message::Ping(data) => WireMessage::Ping(data.to_vec()),
                tungstenite::Message::Pong(data) => WireMessage::Pong(data.to_vec()),
                tungstenite::Message::Close(_) => WireMessage::Close,
                // Raw frames are never yielded when reading.
                tungstenite::Message::Frame(_) => continue,
            };
            return Some(Ok(message));
        }
    }
}

/// Connect to a WebSocket URL with extra headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake. Returns split (writer, reader)
/// halves.
///
/// # Errors
///
/// [`Error::Rejected`] when the server answered the upgrade with one of
/// [`FATAL_HANDSHAKE_STATUSES`], [`Error::Config`] for a malformed URL or
/// header, [`Error::Transport`] otherwise.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| Error::Config(format!("invalid WebSocket URL {url}: {e}")))?;
    let uri = request.uri();
    if !matches!(uri.scheme_str(), Some("ws" | "wss")) || uri.host().is_none_or(str::is_empty) {
        return Err(Error::Config(format!(
            "invalid WebSocket URL {url}: expected ws:// or wss:// with a host"
        )));
    }

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name {name}: {e}")))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("invalid header value for {name}: {e}")))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(handshake_error)?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

fn handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).trim().to_string())
                .unwrap_or_default();
            if FATAL_HANDSHAKE_STATUSES.contains(&status) {
                Error::Rejected {
                    status,
                    message: body,
                }
            } else {
                Error::Transport(format!("upgrade refused with status {status}: {body}"))
            }
        }
        other => Error::Transport(format!("WebSocket connect failed: {other}")),
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
