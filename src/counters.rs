//! Lock-free counters for observability.
//!
//! Every group is a struct of [`Counter`] fields plus a serializable
//! snapshot with the same field names. The server publishes the snapshots
//! as JSON on `/stats`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Add one.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! counter_group {
    (
        $(#[$meta:meta])*
        $name:ident => $snapshot:ident {
            $( $(#[$field_meta:meta])* $field:ident, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $( $(#[$field_meta])* pub $field: Counter, )*
        }

        #[doc = concat!("Point-in-time copy of [`", stringify!($name), "`].")]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct $snapshot {
            $( $(#[$field_meta])* pub $field: u64, )*
        }

        impl $name {
            /// Read every counter.
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $( $field: self.$field.get(), )*
                }
            }
        }
    };
}

counter_group! {
    /// Buffer pool activity.
    PoolCounters => PoolStats {
        /// Buffers handed out.
        gets,
        /// Buffers returned.
        puts,
        /// Buffers allocated because the free list was empty.
        news,
    }
}

counter_group! {
    /// Replaceable transport handle transitions.
    TransportCounters => TransportStats {
        /// Attached with zero offsets.
        started,
        /// Attached with non-zero resume offsets.
        resumed,
        /// A live transport was evicted by a newer one.
        replaced,
        /// A live transport failed and was dropped.
        orphaned,
        /// A terminal close notified the owner of a live transport.
        stopped,
        /// A terminal close dropped a live transport.
        closed,
    }
}

counter_group! {
    /// Outbound/inbound task activity of one or many endpoints.
    EndpointCounters => EndpointStats {
        /// Outbound task started.
        outbound_started,
        /// Outbound task stopped.
        outbound_stopped,
        /// Outbound task stopped with an error.
        outbound_error,
        /// Inbound task started.
        inbound_started,
        /// Inbound task stopped.
        inbound_stopped,
        /// Inbound task stopped with an error.
        inbound_error,
        /// Frames written to a transport.
        frames_sent,
        /// Data frames read from a transport.
        frames_received,
        /// Bytes written to a transport, headers included.
        transport_bytes_sent,
        /// Bytes read from a transport, headers included.
        transport_bytes_received,
        /// Pings written to a transport.
        pings_sent,
        /// Bytes accepted from the local application or downstream.
        app_bytes_in,
        /// Bytes delivered to the local application or downstream.
        app_bytes_out,
    }
}

counter_group! {
    /// Server session table.
    SessionCounters => SessionStats {
        /// Sessions created.
        created,
        /// Sessions looked up for resumption.
        resumed,
        /// Sessions whose transport went away without closing them.
        orphaned,
        /// Sessions removed from the table.
        deleted,
        /// Lookups that found an unusable entry.
        invalid,
    }
}

counter_group! {
    /// Expiration sweeps.
    ExpireCounters => ExpireStats {
        /// Sweeps started.
        runs,
        /// Sweeps that found more sessions than the orphan threshold.
        above_threshold_runs,
        /// Sessions closed for being orphaned longer than the limit.
        orphan_closed,
        /// Sessions closed because the ruthless threshold was exceeded.
        ruthless_closed,
        /// Sessions resumed between scan and expiry.
        raced,
    }
}

counter_group! {
    /// Handshake request failures.
    RequestCounters => RequestStats {
        /// `/proxy` with an empty host.
        proxy_invalid_host,
        /// `/proxy` with a missing or malformed port.
        proxy_invalid_port,
        /// `/proxy` to a destination the filter denies.
        proxy_denied,
        /// Request with an origin outside the allowed prefixes.
        bad_origin,
        /// `/connect` with an unknown or expired sid.
        connect_invalid_sid,
        /// `/connect` with a malformed ack.
        connect_invalid_ack,
        /// `/connect` with a malformed pos.
        connect_invalid_pos,
        /// `/connect` to a destination the filter denies.
        connect_denied,
        /// `/connect` resuming a session the server does not know.
        resume_unknown_sid,
        /// Downstream dial failed.
        dial_failed,
        /// Two connects raced to create the same session.
        create_raced,
    }
}
