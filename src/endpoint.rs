//! One end of a resumable byte stream.
//!
//! An [`Endpoint`] owns a send window, a receive window and a
//! [`ReplaceableTransport`]. Two tasks move bytes between the windows and
//! whatever transport is current:
//!
//! - **outbound**: drains the send window into frames, piggybacking the
//!   receive position as the ack, and sends keepalive pings.
//! - **inbound**: reads frames, records the peer's ack and fills the
//!   receive window.
//!
//! When the transport changes, each task reconciles its window with the
//! offsets the new transport was attached with. Transport failures evict
//! the transport and the tasks wait for the next one; only a terminal
//! [`Endpoint::close`] stops them.
//!
//! The client tunnel and the server session both drive an `Endpoint`; they
//! differ only in where transports come from.
//!
//! Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_FRAME_PAYLOAD;
use crate::counters::{EndpointCounters, TransportCounters};
use crate::error::{Error, Result};
use crate::handle::{Attachment, ReplaceableTransport};
use crate::transport::Transport;
use crate::window::seq::truncate;
use crate::window::{BlockingReceiveWindow, BlockingSendWindow, BufferPool, WindowStats};

/// Timing knobs of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Longest wait before a pure ack is flushed.
    pub ack_interval: Duration,
    /// Keepalive ping period.
    pub ping_interval: Duration,
    /// Longest silence tolerated from the peer.
    pub ping_timeout: Duration,
    /// Bound on each transport write.
    pub write_timeout: Duration,
    /// Bound on each application or downstream write.
    pub conn_write_timeout: Duration,
}

/// Everything endpoints of one process share.
#[derive(Debug, Clone)]
pub struct EndpointContext {
    /// Buffers for every window.
    pub pool: Arc<BufferPool>,
    /// Cap on unacknowledged outgoing bytes.
    pub max_send_window: u64,
    /// Cap on undelivered incoming bytes.
    pub max_receive_window: u64,
    /// Timing knobs.
    pub timeouts: Timeouts,
    /// Task activity, summed over endpoints.
    pub counters: Arc<EndpointCounters>,
    /// Handle transitions, summed over endpoints.
    pub transport_counters: Arc<TransportCounters>,
}

/// Counters of one endpoint's windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndpointWindows {
    /// Outgoing direction.
    pub send: WindowStats,
    /// Incoming direction.
    pub receive: WindowStats,
}

#[derive(Debug)]
struct Inner {
    label: String,
    send: BlockingSendWindow,
    receive: BlockingReceiveWindow,
    handle: ReplaceableTransport,
    timeouts: Timeouts,
    read_size: usize,
    counters: Arc<EndpointCounters>,
    closed: CancellationToken,
    error: Mutex<Option<Error>>,
}

/// Cheaply clonable handle to one end of a stream.
#[derive(Debug, Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Create an endpoint with empty windows and no transport.
    ///
    /// Nothing moves until [`Endpoint::start`].
    pub fn new(label: impl Into<String>, context: &EndpointContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                send: BlockingSendWindow::new(Arc::clone(&context.pool), context.max_send_window),
                receive: BlockingReceiveWindow::new(
                    Arc::clone(&context.pool),
                    context.max_receive_window,
                ),
                handle: ReplaceableTransport::new(Arc::clone(&context.transport_counters)),
                timeouts: context.timeouts,
                read_size: context.pool.buffer_size(),
                counters: Arc::clone(&context.counters),
                closed: CancellationToken::new(),
                error: Mutex::new(None),
            }),
        }
    }

    /// Spawn the outbound and inbound tasks.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.counters.outbound_started.increment();
            let result = inner.run_outbound().await;
            inner.finish("outbound", result);
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.counters.inbound_started.increment();
            let result = inner.run_inbound().await;
            inner.finish("inbound", result);
        });
    }

    /// Name used in logs.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The transport handle.
    pub fn handle(&self) -> &ReplaceableTransport {
        &self.inner.handle
    }

    /// Attach a transport. See [`ReplaceableTransport::set`].
    pub fn attach(
        &self,
        transport: Arc<Transport>,
        read_until: u32,
        written_until: u32,
    ) -> Result<Attachment> {
        self.inner.handle.set(transport, read_until, written_until)
    }

    /// Copy `reader` into the send window until EOF.
    ///
    /// Returns the number of bytes read.
    ///
    /// # Errors
    ///
    /// A read failure, or the terminal error once the endpoint is closed.
    pub async fn send_from<R>(&self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let inner = &self.inner;
        let mut buf = vec![0u8; inner.read_size];
        let mut total = 0u64;
        loop {
            inner.send.wait_to_fill().await?;
            let n = tokio::select! {
                () = inner.closed.cancelled() => return Err(self.terminal_error()),
                read = reader.read(&mut buf) => read.map_err(|e| Error::Transport(format!("read: {e}")))?,
            };
            if n == 0 {
                return Ok(total);
            }
            inner.send.fill(&buf[..n]).await?;
            inner.counters.app_bytes_in.add(n as u64);
            total += n as u64;
        }
    }

    /// Copy the receive window into `writer` until the endpoint closes.
    ///
    /// Each write is bounded by the conn-write timeout and followed by a
    /// flush.
    ///
    /// # Errors
    ///
    /// Always ends with an error: a write failure or timeout, or the
    /// terminal error.
    pub async fn receive_into<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let inner = &self.inner;
        let limit = inner.timeouts.conn_write_timeout;
        loop {
            inner.receive.wait_to_empty().await?;
            let data = inner.receive.peek(inner.read_size).await;
            let write = async {
                writer.write_all(&data).await?;
                writer.flush().await
            };
            match tokio::time::timeout(limit, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(Error::Transport(format!("write: {e}"))),
                Err(_) => {
                    return Err(Error::Transport(format!("write timed out after {limit:?}")))
                }
            }
            inner.receive.empty(data.len()).await;
            inner.counters.app_bytes_out.add(data.len() as u64);
        }
    }

    /// Wait until the peer acknowledged everything sent, at most `limit`.
    ///
    /// Returns `false` on timeout.
    pub async fn drain(&self, limit: Duration) -> Result<bool> {
        match tokio::time::timeout(limit, self.inner.send.wait_acknowledged()).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Run [`Endpoint::send_from`] and [`Endpoint::receive_into`] together
    /// until one of them ends.
    ///
    /// At EOF on `reader`, waits at most `drain_limit` for the peer to
    /// acknowledge everything and returns the number of bytes read. The
    /// endpoint is left open; the caller decides how to close it.
    pub async fn relay<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        drain_limit: Duration,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let outbound = async {
            let sent = self.send_from(reader).await?;
            log::debug!("[Endpoint] {} EOF after {} bytes, draining", self.label(), sent);
            if !self.drain(drain_limit).await? {
                log::warn!(
                    "[Endpoint] {} gave up waiting for the final acknowledgment",
                    self.label()
                );
            }
            Ok::<_, Error>(sent)
        };
        let inbound = self.receive_into(writer);

        tokio::select! {
            result = outbound => result,
            result = inbound => result.map(|()| 0),
        }
    }

    /// Stop for good. Idempotent; the first error wins.
    pub fn close(&self, err: Error) {
        self.inner.close(err);
    }

    /// Whether [`Endpoint::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolve with the terminal error once closed.
    pub async fn closed(&self) -> Error {
        self.inner.closed.cancelled().await;
        self.terminal_error()
    }

    /// Counters of both windows.
    pub async fn windows(&self) -> EndpointWindows {
        EndpointWindows {
            send: self.inner.send.stats().await,
            receive: self.inner.receive.stats().await,
        }
    }

    fn terminal_error(&self) -> Error {
        self.inner.terminal_error()
    }
}

impl Inner {
    fn close(&self, err: Error) {
        {
            let mut error = self.error.lock().unwrap_or_else(PoisonError::into_inner);
            if error.is_some() {
                return;
            }
            *error = Some(err.clone());
        }
        log::info!("[Endpoint] {} closed: {}", self.label, err);
        self.handle.close(err.clone());
        self.send.fail(err.clone());
        self.receive.fail(err);
        self.closed.cancel();
    }

    fn terminal_error(&self) -> Error {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Error::Closed("endpoint closed".into()))
    }

    fn finish(&self, task: &str, result: Result<()>) {
        let (stopped, errored) = if task == "outbound" {
            (&self.counters.outbound_stopped, &self.counters.outbound_error)
        } else {
            (&self.counters.inbound_stopped, &self.counters.inbound_error)
        };
        match result {
            Ok(()) => stopped.increment(),
            Err(err @ Error::Closed(_)) => {
                log::debug!("[Endpoint] {} {} task stopped: {}", self.label, task, err);
                stopped.increment();
                self.close(err);
            }
            Err(err) => {
                log::warn!("[Endpoint] {} {} task failed: {}", self.label, task, err);
                errored.increment();
                self.close(err);
            }
        }
    }

    async fn run_outbound(&self) -> Result<()> {
        let mut current: Option<u64> = None;
        let mut last_ack: Option<u32> = None;
        let mut last_ping = Instant::now();

        loop {
            match self.send.wait_to_empty_for(self.timeouts.ack_interval).await {
                Ok(()) | Err(Error::Expired) => {}
                Err(err) => return Err(err),
            }
            let (transport, written_until, read_until) = self.handle.get_for_send().await?;

            if current != Some(transport.id()) {
                // A reset violation means the two sides disagree about the
                // stream itself; another transport cannot fix that.
                let target = self.send.reset(written_until).await?;
                log::debug!(
                    "[Endpoint] {} outbound on transport #{} from offset {}",
                    self.label,
                    transport.id(),
                    target
                );
                current = Some(transport.id());
                last_ack = None;
                last_ping = Instant::now();
            } else if let Err(err) = self.send.acknowledge_until(written_until).await {
                self.handle.error(&transport, err);
                continue;
            }

            if last_ping.elapsed() >= self.timeouts.ping_interval {
                if let Err(err) = transport.send_ping().await {
                    self.handle.error(&transport, err);
                    continue;
                }
                self.counters.pings_sent.increment();
                last_ping = Instant::now();
            }

            let payload = self.send.peek(MAX_FRAME_PAYLOAD).await;
            if payload.is_empty() && last_ack == Some(read_until) {
                continue;
            }
            match transport.send_frame(read_until, &payload).await {
                Ok(wire_len) => {
                    self.send.empty(payload.len()).await;
                    self.counters.frames_sent.increment();
                    self.counters.transport_bytes_sent.add(wire_len as u64);
                    last_ack = Some(read_until);
                }
                Err(err) => {
                    self.handle.error(&transport, err);
                }
            }
        }
    }

    async fn run_inbound(&self) -> Result<()> {
        let mut current: Option<u64> = None;

        loop {
            self.receive.wait_to_fill().await?;
            let (transport, read_until) = self.handle.get_for_receive().await?;

            if current != Some(transport.id()) {
                let position = self.receive.reset(read_until).await?;
                log::debug!(
                    "[Endpoint] {} inbound on transport #{} from offset {}",
                    self.label,
                    transport.id(),
                    position
                );
                current = Some(transport.id());
            }

            let frame = match transport.recv_frame().await {
                Ok(frame) => frame,
                Err(err) => {
                    self.handle.error(&transport, err);
                    continue;
                }
            };
            self.counters.frames_received.increment();
            self.counters
                .transport_bytes_received
                .add(frame.wire_len() as u64);

            self.handle.push_written_until(&transport, frame.ack());
            let position = self.receive.fill(frame.payload()).await?;
            self.handle.push_read_until(&transport, truncate(position));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Eviction;
    use crate::transport::memory::{pair, raw};
    use crate::transport::{Frame, WireMessage};

    fn context() -> EndpointContext {
        EndpointContext {
            pool: Arc::new(BufferPool::new(64)),
            max_send_window: 4096,
            max_receive_window: 4096,
            timeouts: Timeouts {
                ack_interval: Duration::from_millis(20),
                ping_interval: Duration::from_secs(10),
                ping_timeout: Duration::from_secs(30),
                write_timeout: Duration::from_secs(5),
                conn_write_timeout: Duration::from_secs(5),
            },
            counters: Arc::new(EndpointCounters::default()),
            transport_counters: Arc::new(TransportCounters::default()),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    async fn read_exact(endpoint: &Endpoint, len: usize) -> Vec<u8> {
        let (mut app, mut sink) = tokio::io::duplex(1 << 16);
        let reader = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let _ = endpoint.receive_into(&mut sink).await;
            })
        };
        let mut out = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(10), app.read_exact(&mut out))
            .await
            .expect("timed out reading")
            .unwrap();
        reader.abort();
        out
    }

    // ========== Data Path Tests ==========

    #[tokio::test]
    async fn test_bytes_cross_a_memory_pair() {
        let ctx = context();
        let client = Endpoint::new("client", &ctx);
        let server = Endpoint::new("server", &ctx);
        client.start();
        server.start();

        let (a, b) = pair(Duration::from_secs(30));
        client.attach(Arc::new(a), 0, 0).unwrap();
        server.attach(Arc::new(b), 0, 0).unwrap();

        let data = payload(3000);
        let mut source = &data[..];
        client.send_from(&mut source).await.unwrap();
        assert_eq!(read_exact(&server, 3000).await, data);

        assert!(client.drain(Duration::from_secs(5)).await.unwrap());
        let windows = client.windows().await;
        assert_eq!(windows.send.acknowledged, 3000);
    }

    #[tokio::test]
    async fn test_resume_after_transport_failure_is_exact() {
        let ctx = context();
        let client = Endpoint::new("client", &ctx);
        let server = Endpoint::new("server", &ctx);
        client.start();
        server.start();

        let (a, b) = pair(Duration::from_secs(30));
        let a = Arc::new(a);
        client.attach(Arc::clone(&a), 0, 0).unwrap();
        server.attach(Arc::new(b), 0, 0).unwrap();

        let first = payload(1500);
        client.send_from(&mut &first[..]).await.unwrap();
        assert_eq!(read_exact(&server, 1500).await, first);

        // Kill the transport from the client side, then resume the way the
        // tunnel does: client offers (pos = written_until, ack = read_until).
        client.handle().error(&a, Error::transport("cut"));
        let (pos, ack) = client.handle().get_write_read_until();
        let (a, b) = pair(Duration::from_secs(30));
        client.attach(Arc::new(a), ack, pos).unwrap();
        server.attach(Arc::new(b), pos, ack).unwrap();

        let second = payload(2500)[1500..].to_vec();
        client.send_from(&mut &second[..]).await.unwrap();
        assert_eq!(read_exact(&server, 1000).await, second);
    }

    #[tokio::test]
    async fn test_reserved_ack_byte_evicts_transport() {
        let ctx = context();
        let endpoint = Endpoint::new("server", &ctx);
        endpoint.start();

        let (transport, to_transport, _from) = raw(Duration::from_secs(30));
        let attachment = endpoint.attach(Arc::new(transport), 0, 0).unwrap();

        let mut data = Frame::encode(0, b"x");
        data[0] = 0x01;
        to_transport.send(WireMessage::Data(data)).unwrap();

        assert_eq!(
            attachment.wait().await,
            Eviction::Failed(Error::ResetRequested(0x0100_0000))
        );
        assert!(!endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_impossible_ack_evicts_transport() {
        let ctx = context();
        let endpoint = Endpoint::new("client", &ctx);
        endpoint.start();

        let (transport, to_transport, mut from_transport) = raw(Duration::from_secs(30));
        let attachment = endpoint.attach(Arc::new(transport), 0, 0).unwrap();

        // Establish the transport on the outbound side with one ack frame.
        assert!(matches!(
            from_transport.recv().await,
            Some(WireMessage::Data(_))
        ));
        to_transport
            .send(WireMessage::Data(Frame::encode(500, b"")))
            .unwrap();

        assert!(matches!(
            attachment.wait().await,
            Eviction::Failed(Error::Window(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_violation_closes_endpoint() {
        let ctx = context();
        let endpoint = Endpoint::new("server", &ctx);
        endpoint.start();

        let (transport, _to, _from) = raw(Duration::from_secs(30));
        // Claims the peer already has bytes this side never sent.
        endpoint.attach(Arc::new(transport), 0, 10).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), endpoint.closed())
            .await
            .unwrap();
        assert!(matches!(err, Error::Window(_)), "{err}");
        assert_eq!(ctx.counters.outbound_error.get(), 1);
    }

    // ========== Close Tests ==========

    #[tokio::test]
    async fn test_close_unblocks_application() {
        let ctx = context();
        let endpoint = Endpoint::new("client", &ctx);
        endpoint.start();

        let receiver = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.receive_into(&mut tokio::io::sink()).await })
        };
        tokio::task::yield_now().await;
        endpoint.close(Error::Closed("done".into()));

        assert_eq!(
            receiver.await.unwrap(),
            Err(Error::Closed("done".into()))
        );
        assert_eq!(endpoint.closed().await, Error::Closed("done".into()));

        let mut input = &b"late"[..];
        assert!(endpoint.send_from(&mut input).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_endpoint_sends_pings() {
        let mut ctx = context();
        ctx.timeouts.ping_interval = Duration::from_millis(100);
        let endpoint = Endpoint::new("client", &ctx);
        endpoint.start();

        let (transport, _to, mut from_transport) = raw(Duration::from_secs(30));
        endpoint.attach(Arc::new(transport), 0, 0).unwrap();

        let mut pings = 0;
        while pings < 2 {
            match from_transport.recv().await {
                Some(WireMessage::Ping(_)) => pings += 1,
                Some(_) => {}
                None => panic!("transport dropped"),
            }
        }
        assert!(ctx.counters.pings_sent.get() >= 2);
    }
}
