//! One live WebSocket connection carrying relay frames.
//!
//! A [`Transport`] hides which WebSocket library produced the connection:
//! the client dials with `tokio-tungstenite` (see [`crate::ws`]), the server
//! receives axum upgrades. Both hand over a [`FrameSink`] / [`FrameSource`]
//! pair.
//!
//! # Frame format
//!
//! ```text
//! +--------------------+------------------+
//! | ack (u32, BE)      | payload (0..64K) |
//! +--------------------+------------------+
//! ```
//!
//! `ack` is the low 24 bits of the sender's receive position. A non-zero
//! top byte is a reset request and fails the read.
//!
//! Rust guideline compliant 2026-02

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::constants::{ACK_HEADER_LEN, ACK_RESERVED_MASK, CLOSE_FRAME_TIMEOUT, SEQ_MASK};
use crate::error::{Error, Result};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Library-neutral WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Binary frame: one relay frame.
    Data(Vec<u8>),
    /// Text frame. Not part of the protocol, ignored.
    Text(String),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame.
    Close,
}

/// Write half of a WebSocket connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one message.
    async fn send(&mut self, message: WireMessage) -> Result<()>;

    /// Send a close frame and flush.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a WebSocket connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next message, `None` once the stream ended.
    async fn recv(&mut self) -> Option<Result<WireMessage>>;
}

/// Received relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    ack: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Parse a binary message. Shorter than the header or a reserved ack
    /// byte is an error.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let Some(header) = data.get(..ACK_HEADER_LEN) else {
            return Err(Error::Transport(format!(
                "frame of {} bytes is shorter than the ack header",
                data.len()
            )));
        };
        let ack = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if ack & ACK_RESERVED_MASK != 0 {
            return Err(Error::ResetRequested(ack));
        }
        Ok(Self { ack, data })
    }

    /// Encode `ack` and `payload` into one binary message.
    pub fn encode(ack: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(ACK_HEADER_LEN + payload.len());
        data.extend_from_slice(&(ack & SEQ_MASK).to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    /// Truncated receive position of the sender.
    pub fn ack(&self) -> u32 {
        self.ack
    }

    /// Bytes after the header.
    pub fn payload(&self) -> &[u8] {
        &self.data[ACK_HEADER_LEN..]
    }

    /// Size on the wire.
    pub fn wire_len(&self) -> usize {
        self.data.len()
    }
}

/// One WebSocket connection, shared by an outbound and an inbound task.
///
/// Sends and receives are bounded by their timeouts and abort as soon as
/// [`Transport::close`] is called.
pub struct Transport {
    id: u64,
    peer: String,
    sink: Mutex<Box<dyn FrameSink>>,
    source: Mutex<Box<dyn FrameSource>>,
    cancel: CancellationToken,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Wrap a sink/source pair.
    ///
    /// `read_timeout` is the longest silence tolerated from the peer, any
    /// message counts. `write_timeout` bounds each send.
    pub fn new(
        peer: impl Into<String>,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            cancel: CancellationToken::new(),
            read_timeout,
            write_timeout,
        }
    }

    /// Process-unique id, used to detect a transport change.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address or URL, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// True once [`Transport::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Write one relay frame.
    pub async fn send_frame(&self, ack: u32, payload: &[u8]) -> Result<usize> {
        let data = Frame::encode(ack, payload);
        let len = data.len();
        self.send(WireMessage::Data(data)).await?;
        log::trace!(
            "[Transport] #{} sent frame ack={:06x} payload={}",
            self.id,
            ack & SEQ_MASK,
            payload.len()
        );
        Ok(len)
    }

    /// Write a keepalive ping.
    pub async fn send_ping(&self) -> Result<()> {
        self.send(WireMessage::Ping(Vec::new())).await
    }

    async fn send(&self, message: WireMessage) -> Result<()> {
        let mut sink = tokio::select! {
            () = self.cancel.cancelled() => return Err(self.closed_error()),
            sink = self.sink.lock() => sink,
        };
        tokio::select! {
            () = self.cancel.cancelled() => Err(self.closed_error()),
            result = tokio::time::timeout(self.write_timeout, sink.send(message)) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Transport(format!(
                    "write timed out after {:?}",
                    self.write_timeout
                ))),
            },
        }
    }

    /// Read the next relay frame.
    ///
    /// Pings, pongs and text messages are skipped but still count as
    /// signs of life.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut source = tokio::select! {
            () = self.cancel.cancelled() => return Err(self.closed_error()),
            source = self.source.lock() => source,
        };
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return Err(self.closed_error()),
                next = tokio::time::timeout(self.read_timeout, source.recv()) => next,
            };
            let message = match next {
                Err(_) => {
                    return Err(Error::Transport(format!(
                        "nothing received for {:?}",
                        self.read_timeout
                    )))
                }
                Ok(None) => return Err(Error::transport("connection ended")),
                Ok(Some(message)) => message?,
            };
            match message {
                WireMessage::Data(data) => return Frame::parse(data),
                WireMessage::Close => return Err(Error::transport("closed by peer")),
                WireMessage::Ping(_) | WireMessage::Pong(_) => {
                    log::trace!("[Transport] #{} keepalive", self.id);
                }
                WireMessage::Text(text) => {
                    log::debug!(
                        "[Transport] #{} ignoring {} byte text message",
                        self.id,
                        text.len()
                    );
                }
            }
        }
    }

    /// Abort pending and future reads and writes. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Close, then try to send a close frame within a short grace period.
    pub async fn shutdown(&self) {
        self.close();
        let graceful = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        })
        .await;
        match graceful {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("[Transport] #{} close frame failed: {}", self.id, e),
            Err(_) => log::debug!("[Transport] #{} close frame timed out", self.id),
        }
    }

    fn closed_error(&self) -> Error {
        Error::Transport(format!("transport #{} closed", self.id))
    }
}

/// In-memory transports for tests.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use tokio::sync::mpsc;

    /// Sink half backed by a channel.
    pub(crate) struct ChannelSink(pub(crate) mpsc::UnboundedSender<WireMessage>);

    /// Source half backed by a channel.
    pub(crate) struct ChannelSource(pub(crate) mpsc::UnboundedReceiver<WireMessage>);

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn send(&mut self, message: WireMessage) -> Result<()> {
            self.0
                .send(message)
                .map_err(|_| Error::transport("peer dropped"))
        }

        async fn close(&mut self) -> Result<()> {
            self.send(WireMessage::Close).await
        }
    }

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn recv(&mut self) -> Option<Result<WireMessage>> {
            self.0.recv().await.map(Ok)
        }
    }

    /// Two transports wired to each other.
    pub(crate) fn pair(read_timeout: Duration) -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let write_timeout = Duration::from_secs(5);
        let a = Transport::new(
            "memory-a",
            Box::new(ChannelSink(a_tx)),
            Box::new(ChannelSource(b_rx)),
            read_timeout,
            write_timeout,
        );
        let b = Transport::new(
            "memory-b",
            Box::new(ChannelSink(b_tx)),
            Box::new(ChannelSource(a_rx)),
            read_timeout,
            write_timeout,
        );
        (a, b)
    }

    /// A transport plus the raw channel ends of its peer.
    pub(crate) fn raw(
        read_timeout: Duration,
    ) -> (
        Transport,
        mpsc::UnboundedSender<WireMessage>,
        mpsc::UnboundedReceiver<WireMessage>,
    ) {
        let (to_transport, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_transport) = mpsc::unbounded_channel();
        let transport = Transport::new(
            "memory-raw",
            Box::new(ChannelSink(to_peer)),
            Box::new(ChannelSource(from_peer)),
            read_timeout,
            Duration::from_secs(5),
        );
        (transport, to_transport, from_transport)
    }
}
