//! Fixed operational constants.
//!
//! Bounds that are deliberately not configuration: they shape failure
//! behavior rather than capacity, and a fleet is easier to reason about when
//! every process shares them.

use std::time::Duration;

/// Default cadence of the coordinator's idle-client purge timer.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(5);

/// Reconciler back-off after a failed coordinator RPC.
///
/// The failed call's sequence number is held and reused on retry, so the
/// coordinator's idempotency gate absorbs duplicates.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Default timeout for in-process coordinator calls, in milliseconds.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;
