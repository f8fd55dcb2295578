//! TCP connection management with line-delimited I/O.
//!
//! Stratum v1 uses newline-delimited JSON over TCP. This module provides a
//! wrapper around tokio's TCP stream that handles buffered reading and
//! writing of complete JSON-RPC messages (tolerating `\r\n` endings and
//! blank lines). The [`Transport`] trait abstracts message I/O, allowing
//! channel-based mocks for deterministic testing.
//!
//! A malformed line surfaces as an error without poisoning the stream: the
//! offending line is already consumed, so the session can decide whether to
//! tolerate it or hang up.

use async_trait::async_trait;

use super::error::{SessionError, SessionResult};
use super::messages::JsonRpcMessage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

/// Message-level I/O for the Stratum protocol.
///
/// Abstracts reading and writing JSON-RPC messages so a session can run
/// over TCP (production) or channels (tests).
#[async_trait]
pub trait Transport: Send {
    /// Read one complete JSON-RPC message.
    ///
    /// Returns `None` on clean connection close (EOF).
    async fn read_message(&mut self) -> SessionResult<Option<JsonRpcMessage>>;

    /// Write a JSON-RPC message.
    async fn write_message(&mut self, msg: &JsonRpcMessage) -> SessionResult<()>;
}

/// Buffered TCP connection for the Stratum protocol.
pub struct Connection {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer for outgoing messages
    writer: BufWriter<OwnedWriteHalf>,

    /// Line buffer for reading messages
    line_buf: String,
}

impl Connection {
    /// Wrap an accepted TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        // Split the stream for independent reading and writing
        let (read_half, write_half) = stream.into_split();

        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            line_buf: String::with_capacity(4096),
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> SessionResult<Option<JsonRpcMessage>> {
        loop {
            self.line_buf.clear();

            let n = self
                .reader
                .read_line(&mut self.line_buf)
                .await
                .map_err(SessionError::Io)?;

            if n == 0 {
                // EOF - connection closed
                return Ok(None);
            }

            let line = self.line_buf.trim();
            if line.is_empty() {
                // Empty line, skip and read next
                continue;
            }

            trace!(rx = %line, "Received message");

            let msg = serde_json::from_str(line).map_err(|e| {
                SessionError::InvalidMessage(format!("failed to parse JSON: {}, line: {}", e, line))
            })?;

            return Ok(Some(msg));
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> SessionResult<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending message");

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// session's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Test-side handle for a [`MockTransport`].
///
/// Use `send()` to feed messages to the session and `recv()` to read
/// messages the session wrote.
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (session_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, session_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: session_rx,
            tx: session_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> SessionResult<Option<JsonRpcMessage>> {
        match self.rx.recv().await {
            Some(msg) => Ok(Some(msg)),
            None => Ok(None),
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> SessionResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| SessionError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the session.
    pub fn send(&self, msg: JsonRpcMessage) {
        self.tx.send(msg).expect("transport dropped");
    }

    /// Receive a message the session wrote.
    pub async fn recv(&mut self) -> JsonRpcMessage {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Receive with a deadline, for asserting that something was sent.
    pub async fn recv_timeout(&mut self) -> Option<JsonRpcMessage> {
        tokio::time::timeout(std::time::Duration::from_secs(1), self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_message_roundtrip() {
        // Create a local test server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Spawn server task
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket);

            // Echo messages back
            while let Ok(Some(msg)) = conn.read_message().await {
                conn.write_message(&msg).await.unwrap();
            }
        });

        // Connect client
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::new(stream);

        // Send a message
        let request = JsonRpcMessage::Request {
            id: json!(1),
            method: "test.method".to_string(),
            params: json!(["param1", "param2"]),
        };
        conn.write_message(&request).await.unwrap();

        // Read it back
        let response = conn.read_message().await.unwrap().unwrap();
        assert_eq!(response.method(), Some("test.method"));
    }

    #[tokio::test]
    async fn test_crlf_and_blank_lines_tolerated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"\r\n{\"id\":1,\"method\":\"m\",\"params\":[]}\r\n")
                .await
                .unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::new(stream);

        let msg = conn.read_message().await.unwrap().unwrap();
        assert_eq!(msg.method(), Some("m"));
    }

    #[tokio::test]
    async fn test_malformed_line_is_error_not_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"this is not json\n{\"id\":1,\"method\":\"m\",\"params\":[]}\n")
                .await
                .unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::new(stream);

        // First line errors...
        assert!(matches!(
            conn.read_message().await,
            Err(SessionError::InvalidMessage(_))
        ));
        // ...but the stream keeps working.
        let msg = conn.read_message().await.unwrap().unwrap();
        assert_eq!(msg.method(), Some("m"));
    }
}
