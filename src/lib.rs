//! Botster Relay - resumable TCP over WebSocket.
//!
//! This crate carries one logical byte stream between a client and a
//! downstream TCP service across a sequence of WebSocket connections. When a
//! WebSocket drops, the client reconnects and both sides resume at the byte
//! offsets they last acknowledged; the application never sees the gap.
//!
//! # Architecture
//!
//! Both sides run the same engine:
//!
//! - **Windows** - pooled byte buffers tracking filled / emptied /
//!   acknowledged offsets, with 24-bit sequence numbers on the wire
//! - **Handle** - the replaceable transport slot and the offsets it was
//!   attached at
//! - **Endpoint** - outbound and inbound tasks moving frames between the
//!   windows and whatever transport is attached
//!
//! and differ only in who dials:
//!
//! - **Tunnel** - client; asks `/proxy` for a sid, then keeps a
//!   `/connect` WebSocket attached
//! - **Server** - accepts `/connect`, dials the destination once and keeps
//!   the session for resumption
//!
//! # Modules
//!
//! - [`window`] - buffer pool, send/receive windows, waiter
//! - [`transport`] - frame codec over one WebSocket
//! - [`endpoint`] - the shared relay engine
//! - [`tunnel`] - client side
//! - [`server`] - HTTP routes and session handling
//! - [`config`] - configuration loading

// Library modules
pub mod endpoint;
pub mod handle;
pub mod server;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod window;
pub mod ws;

pub mod config;
pub mod constants;
pub mod counters;
pub mod error;
pub mod filter;
pub mod retry;

// Re-export commonly used types
pub use config::Config;
pub use endpoint::{Endpoint, EndpointContext, Timeouts};
pub use error::{Error, Result, WindowError};
pub use filter::{Filter, GlobFilter};
pub use server::{ServerState, ServerStats};
pub use session::{ExpirationPolicy, Session, SessionTable};
pub use tunnel::{Tunnel, TunnelOptions, TunnelStatus};
