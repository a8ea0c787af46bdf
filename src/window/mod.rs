//! Byte windows that survive transport replacement.
//!
//! - [`pool`]: fixed-size buffer recycling.
//! - [`seq`]: 24-bit wire counters and their un-wrapping.
//! - [`send`] / [`receive`]: single-threaded windows with resend and
//!   duplicate-skip logic.
//! - [`blocking`]: the same windows behind an async mutex with
//!   back-pressure, one filler and one emptier each.

pub mod blocking;
pub mod pool;
pub mod receive;
pub mod send;
pub mod seq;
pub mod waiter;

pub use blocking::{BlockingReceiveWindow, BlockingSendWindow, WindowStats};
pub use pool::{Buffer, BufferPool};
pub use receive::ReceiveWindow;
pub use send::SendWindow;
pub use seq::{to_absolute, truncate};
pub use waiter::Waiter;
