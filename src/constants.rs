//! Application-wide constants for botster-relay.
//!
//! This module centralizes the magic numbers of the wire protocol and the
//! default timeouts. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Wire**: sequence truncation and frame layout
//! - **Windows**: buffer and window sizes
//! - **Client timeouts**: defaults for `connect`
//! - **Server timeouts**: defaults for `serve`
//! - **Retry**: reconnect backoff bounds

use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// Mask of the bits of a byte counter carried on the wire (24 bits).
pub const SEQ_MASK: u32 = 0x00ff_ffff;

/// Reserved top byte of the 4-byte ack field. Non-zero means "reset".
pub const ACK_RESERVED_MASK: u32 = 0xff00_0000;

/// Size of the ack header in front of every data frame.
pub const ACK_HEADER_LEN: usize = 4;

/// Largest payload gathered into a single outbound frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

// ============================================================================
// Windows
// ============================================================================

/// Default capacity of each pooled buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default cap on unacknowledged bytes in the send window.
pub const DEFAULT_MAX_SEND_WINDOW: u64 = 1024 * 1024;

/// Default cap on undelivered bytes in the receive window.
pub const DEFAULT_MAX_RECEIVE_WINDOW: u64 = 1024 * 1024;

/// Smallest accepted window or buffer size.
///
/// Anything under the 4-byte ack header is unusable, and a few times that
/// keeps the window from thrashing.
pub const MIN_WINDOW: u64 = 16;

/// Free buffers kept by a pool before extra ones are dropped.
pub const POOL_MAX_IDLE: usize = 1024;

// ============================================================================
// Client timeouts
// ============================================================================

/// How long a write to the local application may block.
pub const CLIENT_CONN_WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a WebSocket write may block before the transport is dropped.
pub const CLIENT_TRANSPORT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long pending acks may wait before an ack-only frame goes out.
pub const ACK_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between WebSocket pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Silence tolerated on a transport before it is considered dead.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1 + 2 * 10);

// ============================================================================
// Server timeouts
// ============================================================================

/// How long a WebSocket write may block on the server.
pub const SERVER_TRANSPORT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a write to the downstream connection may block.
pub const SERVER_CONN_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long resolving and dialing the downstream may take.
pub const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an issued sid stays redeemable before its first connect.
pub const TICKET_TTL: Duration = Duration::from_secs(5 * 60);

/// Default server listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8022";

// ============================================================================
// Retry
// ============================================================================

/// First reconnect delay.
pub const RETRY_MIN_DELAY: Duration = Duration::from_millis(250);

/// Reconnect delay cap.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Best-effort close frame budget when dropping a transport.
pub const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);
