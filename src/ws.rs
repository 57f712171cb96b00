//! WebSocket transport for the physical link.
//!
//! Thin wrapper around `tokio-tungstenite` providing split reader/writer
//! halves. The runner is the only consumer; the protocol core never sees a
//! socket.
//!
//! Frames go out as binary messages containing compact JSON. Inbound text
//! and binary messages are both accepted and handed to the link as bytes.
//!
//! Rust guideline compliant 2025-01

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// Application data (text or binary frame).
    Data(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send one serialized frame as a binary message.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_frame(&mut self, json: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Binary(json.into_bytes()))
            .await
            .context("WebSocket send_frame failed")
    }

    /// Send a pong frame in response to a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame and flush.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            let message = match message {
                tungstenite::Message::Text(text) => WsMessage::Data(text.into_bytes()),
                tungstenite::Message::Binary(data) => WsMessage::Data(data),
                tungstenite::Message::Ping(data) => WsMessage::Ping(data),
                tungstenite::Message::Pong(data) => WsMessage::Pong(data),
                tungstenite::Message::Close(close_frame) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    WsMessage::Close { code, reason }
                }
                // Raw frames never surface when reading
                tungstenite::Message::Frame(_) => continue,
            };
            return Some(Ok(message));
        }
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// or the WebSocket handshake fails.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let url = http_to_ws_scheme(url);
    let mut request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://example.com/hub"), "wss://example.com/hub");
        assert_eq!(http_to_ws_scheme("http://localhost:4000"), "ws://localhost:4000");
        assert_eq!(http_to_ws_scheme("wss://example.com"), "wss://example.com");
        assert_eq!(http_to_ws_scheme("ws://localhost:4000/x"), "ws://localhost:4000/x");
    }

    #[test]
    fn test_http_to_ws_scheme_only_rewrites_prefix() {
        assert_eq!(
            http_to_ws_scheme("https://example.com/?next=http://other"),
            "wss://example.com/?next=http://other"
        );
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect("not-a-url", &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/hub", &[]).await;
        assert!(result.is_err());
    }
}
