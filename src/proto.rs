//! Wire types shared between client limiters and the coordinator.
//!
//! Everything here is serde-serializable so a remote transport can frame it
//! with its codec of choice; the in-process transport passes the same values
//! through the coordinator's mailbox unserialized.
//!
//! Sequence numbers are per-client and strictly increasing per issued RPC.
//! A retried RPC reuses its original number; together with the coordinator's
//! replay gate that makes `TryAcquire` and `Release` idempotent under
//! at-least-once delivery.

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use uuid::Uuid;

/// Durable identity of one client limiter process.
///
/// Minted once per limiter; the coordinator keys all per-client state on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Mint a fresh identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Client-to-coordinator RPC requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorRequest {
    /// Debit up to `permits` from the global pool. All-or-nothing: the
    /// response grants either the full amount or zero.
    TryAcquire {
        /// Identity of the requesting client.
        client_id: ClientId,
        /// Per-client sequence number for replay detection.
        seq: u64,
        /// Permit count requested.
        permits: u32,
    },
    /// Return permits previously charged to this client.
    Release {
        /// Identity of the releasing client.
        client_id: ClientId,
        /// Per-client sequence number for replay detection.
        seq: u64,
        /// Permit count returned.
        permits: u32,
    },
    /// Heartbeat proving the client is alive; touches its purge clock.
    RefreshLease {
        /// Identity of the client refreshing its lease.
        client_id: ClientId,
    },
    /// Deregister the client and return everything charged to it.
    Unregister {
        /// Identity of the departing client.
        client_id: ClientId,
    },
}

/// Coordinator replies to [`CoordinatorRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorResponse {
    /// Answer to `TryAcquire`: the number of permits debited (0 or the full
    /// request).
    Granted {
        /// Permits granted to the caller.
        permits: u32,
    },
    /// Acknowledgement for operations with no payload.
    Ack,
    /// Protocol-level rejection.
    Error {
        /// The rejection reason.
        error: PermitError,
    },
}

/// Protocol-level rejections carried in [`CoordinatorResponse::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Snafu)]
pub enum PermitError {
    /// The permit count is outside the global budget. A well-behaved client
    /// never sends this; it indicates a client bug.
    #[snafu(display("invalid permit count {requested} (global budget is {max})"))]
    InvalidArgument {
        /// The count the client asked for.
        requested: u32,
        /// The configured global budget.
        max: u32,
    },
}

/// Operational snapshot of the coordinator's pool.
///
/// `available_permits + permits_in_use` equals the global budget whenever no
/// RPC is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStats {
    /// Configured global budget.
    pub global_permits: u32,
    /// Permits currently free at the coordinator.
    pub available_permits: u32,
    /// Sum of permits charged to registered clients.
    pub permits_in_use: u32,
    /// Number of registered clients.
    pub registered_clients: u32,
    /// Number of clients queued for capacity.
    pub pending_clients: u32,
}
