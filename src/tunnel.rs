//! Client side of the relay.
//!
//! A [`Tunnel`] asks the server for a sid once, then keeps one WebSocket
//! transport attached to its [`Endpoint`], reconnecting with backoff and
//! resuming at the offsets both sides last agreed on. Transient failures
//! are invisible to the application; only [`Tunnel::close`] or a fatal
//! handshake refusal ends the tunnel.
//!
//! ```text
//!  app --send_from--> [send window]  --outbound--> WebSocket --> server
//!  app <-receive_into- [recv window] <--inbound--- WebSocket <-- server
//!                          ^
//!                   keep_connected: /proxy once, then /connect?sid&pos&ack
//! ```
//!
//! Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::endpoint::{Endpoint, EndpointContext};
use crate::error::{Error, Result};
use crate::handle::Eviction;
use crate::retry::{retry, sleep_or_cancel, Backoff, RetryPolicy};
use crate::transport::Transport;
use crate::ws;

/// Tunnel connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelStatus {
    /// No transport attached.
    Disconnected = 0,
    /// Handshake in progress.
    Connecting = 1,
    /// A transport is attached.
    Connected = 2,
    /// Closed for good.
    Closed = 3,
}

impl From<u8> for TunnelStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => TunnelStatus::Connecting,
            2 => TunnelStatus::Connected,
            3 => TunnelStatus::Closed,
            _ => TunnelStatus::Disconnected,
        }
    }
}

/// Where a tunnel goes and how it gets there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Relay base URL, `http(s)://host[:port]`.
    pub proxy: String,
    /// `Origin` header value.
    pub origin: String,
    /// Destination host, as seen from the server.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Reconnect backoff.
    pub retry: RetryPolicy,
}

#[derive(Debug)]
struct Inner {
    options: TunnelOptions,
    endpoint: Endpoint,
    status: AtomicU8,
    cancel: CancellationToken,
    read_timeout: Duration,
    write_timeout: Duration,
    conn_write_timeout: Duration,
}

/// One resumable client stream.
#[derive(Debug, Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl Tunnel {
    /// Create a tunnel. Nothing is dialed until [`Tunnel::start`].
    pub fn new(options: TunnelOptions, context: &EndpointContext) -> Self {
        let label = format!("tunnel {}:{}", options.host, options.port);
        Self {
            inner: Arc::new(Inner {
                endpoint: Endpoint::new(label, context),
                options,
                status: AtomicU8::new(TunnelStatus::Disconnected as u8),
                cancel: CancellationToken::new(),
                read_timeout: context.timeouts.ping_timeout,
                write_timeout: context.timeouts.write_timeout,
                conn_write_timeout: context.timeouts.conn_write_timeout,
            }),
        }
    }

    /// Start the endpoint tasks and the reconnect loop.
    ///
    /// The returned task ends when the tunnel is closed, with the fatal
    /// error if one stopped it.
    pub fn start(&self) -> JoinHandle<Result<()>> {
        self.inner.endpoint.start();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.keep_connected().await;
            inner.set_status(TunnelStatus::Closed);
            if let Err(err) = &result {
                inner.endpoint.close(err.clone());
            }
            result
        })
    }

    /// Current connection status.
    pub fn status(&self) -> TunnelStatus {
        TunnelStatus::from(self.inner.status.load(Ordering::SeqCst))
    }

    /// The tunnel's stream endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Close for good. Idempotent.
    pub fn close(&self) {
        self.inner
            .endpoint
            .close(Error::Closed("close requested".into()));
        self.inner.cancel.cancel();
    }

    /// Relay `reader` into the tunnel and the tunnel into `writer`.
    ///
    /// At EOF on `reader`, waits (bounded by the conn-write timeout) for the
    /// server to acknowledge everything, then closes the tunnel.
    ///
    /// # Errors
    ///
    /// A read or write failure on the local side, or the error that closed
    /// the tunnel.
    pub async fn pipe<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self
            .inner
            .endpoint
            .relay(&mut reader, &mut writer, self.inner.conn_write_timeout)
            .await;
        self.close();
        match result {
            Ok(_) => Ok(()),
            Err(Error::Closed(reason)) if reason == "close requested" => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Inner {
    fn set_status(&self, status: TunnelStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    async fn keep_connected(&self) -> Result<()> {
        let options = &self.options;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(Error::transport)?;

        self.set_status(TunnelStatus::Connecting);
        let sid = retry("requesting sid", options.retry, &self.cancel, || {
            get_sid(&http, &options.proxy, &options.origin, &options.host, options.port)
        })
        .await?;
        log::info!(
            "[Tunnel] sid {} for {}:{}",
            crate::session::short_sid(&sid),
            options.host,
            options.port
        );

        let mut backoff = Backoff::new(options.retry);
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.set_status(TunnelStatus::Connecting);
            let (pos, ack) = self.endpoint.handle().get_write_read_until();
            let url = connect_url(&options.proxy, &sid, pos, ack)?;

            let headers = [("Origin", options.origin.as_str())];
            let dialed = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                dialed = ws::connect(&url, &headers) => dialed,
            };
            let err = match dialed {
                Ok((writer, reader)) => {
                    let transport = Arc::new(Transport::new(
                        options.proxy.clone(),
                        Box::new(writer),
                        Box::new(reader),
                        self.read_timeout,
                        self.write_timeout,
                    ));
                    let attachment = self.endpoint.attach(Arc::clone(&transport), ack, pos)?;
                    self.set_status(TunnelStatus::Connected);
                    log::info!(
                        "[Tunnel] connected, transport #{} pos={:06x} ack={:06x}",
                        transport.id(),
                        pos,
                        ack
                    );

                    let attached_at = Instant::now();
                    let eviction = attachment.wait().await;
                    self.set_status(TunnelStatus::Disconnected);
                    transport.shutdown().await;
                    if attached_at.elapsed() > options.retry.max_delay {
                        backoff.reset();
                    }
                    match eviction {
                        Eviction::Closed(Error::Closed(reason)) if reason == "close requested" => {
                            return Ok(())
                        }
                        Eviction::Closed(err) => return Err(err),
                        Eviction::Replaced => continue,
                        Eviction::Failed(err) => err,
                    }
                }
                Err(err) if err.is_fatal() => {
                    log::error!("[Tunnel] server refused the session: {}", err);
                    return Err(err);
                }
                Err(err) => err,
            };

            let Some(delay) = backoff.next_delay() else {
                log::error!("[Tunnel] giving up after {} attempts: {}", backoff.failures(), err);
                return Err(err);
            };
            log::warn!("[Tunnel] disconnected: {} (retry in {:?})", err, delay);
            if !sleep_or_cancel(delay, &self.cancel).await {
                return Ok(());
            }
        }
    }
}

/// Ask the relay for a sid bound to `host:port`.
///
/// # Errors
///
/// [`Error::Rejected`] for 307 (authentication required) and 401 (denied by
/// the server's policy); [`Error::Transport`] for anything retryable.
pub async fn get_sid(
    http: &reqwest::Client,
    proxy: &str,
    origin: &str,
    host: &str,
    port: u16,
) -> Result<String> {
    let mut url = reqwest::Url::parse(proxy)
        .and_then(|base| base.join("proxy"))
        .map_err(|e| Error::Config(format!("invalid proxy URL {proxy}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("host", host)
        .append_pair("port", &port.to_string());

    let response = http
        .get(url)
        .header(reqwest::header::ORIGIN, origin)
        .send()
        .await
        .map_err(|e| Error::Transport(format!("sid request failed: {e}")))?;

    let status = response.status();
    match status {
        StatusCode::OK => {}
        StatusCode::TEMPORARY_REDIRECT => {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(Error::Rejected {
                status: status.as_u16(),
                message: format!("authentication rejected, redirected to {location:?}"),
            });
        }
        StatusCode::UNAUTHORIZED => {
            return Err(Error::Rejected {
                status: status.as_u16(),
                message: "rejected, ACLs?".into(),
            });
        }
        _ => {
            return Err(Error::Transport(format!(
                "sid request returned status {status}"
            )))
        }
    }

    let body = response
        .text()
        .await
        .map_err(|e| Error::Transport(format!("sid response: {e}")))?;
    let sid = body.trim();
    if sid.is_empty() {
        return Err(Error::transport("sid response was empty"));
    }
    Ok(sid.to_string())
}

/// WebSocket URL resuming `sid` at `pos` (our written offset acknowledged
/// by the server) and `ack` (our read offset).
pub fn connect_url(proxy: &str, sid: &str, pos: u32, ack: u32) -> Result<String> {
    let mut url = reqwest::Url::parse(proxy)
        .and_then(|base| base.join("connect"))
        .map_err(|e| Error::Config(format!("invalid proxy URL {proxy}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("sid", sid)
        .append_pair("pos", &pos.to_string())
        .append_pair("ack", &ack.to_string());
    Ok(ws::http_to_ws_scheme(url.as_str()))
}
