//! Permit lease handles.
//!
//! A [`Lease`] is the host's receipt for acquired permits. Dropping it (or
//! calling [`Lease::release`]) returns the permits to the owning limiter's
//! local cache, where they serve queued waiters first and flow back to the
//! coordinator as surplus. Release is purely local, so it is cheap and safe
//! to run in `Drop`.

use std::fmt;
use std::sync::Arc;

use crate::limiter::LimiterShared;

/// Reason attached to a lease rejected by queue backpressure.
pub(crate) const QUEUE_LIMIT_REASON: &str = "Queue limit reached";

/// A handle to permits drawn from the cluster-wide pool.
///
/// A lease is either acquired (it owes `permits()` on release) or
/// not-acquired (a refusal, optionally carrying a reason). Release is
/// idempotent; the second and later calls are no-ops.
#[must_use = "dropping an unexamined lease immediately returns its permits"]
pub struct Lease {
    permits: u32,
    acquired: bool,
    reason: Option<String>,
    owner: Option<Arc<LimiterShared>>,
}

impl Lease {
    /// An acquired lease owing `permits` to `owner` on release.
    pub(crate) fn acquired(permits: u32, owner: Arc<LimiterShared>) -> Self {
        Self {
            permits,
            acquired: true,
            reason: None,
            owner: Some(owner),
        }
    }

    /// A successful zero-permit probe. Owes nothing.
    pub(crate) fn noop() -> Self {
        Self {
            permits: 0,
            acquired: true,
            reason: None,
            owner: None,
        }
    }

    /// A refusal, optionally explained.
    pub(crate) fn not_acquired(reason: Option<&str>) -> Self {
        Self {
            permits: 0,
            acquired: false,
            reason: reason.map(str::to_owned),
            owner: None,
        }
    }

    /// Whether the acquire succeeded.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Permits owed on release. Zero for refusals and zero-permit probes.
    pub fn permits(&self) -> u32 {
        self.permits
    }

    /// Why the acquire was refused, when a reason was recorded.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Return the permits to the limiter's local cache.
    ///
    /// Idempotent: only the first call has an effect. Called automatically
    /// on drop.
    pub fn release(&mut self) {
        if let Some(owner) = self.owner.take()
            && self.permits > 0
        {
            owner.lease_released(self.permits);
        }
    }

    /// Disarm the lease without returning permits.
    ///
    /// Used when a fulfilled waiter turns out to have vanished and the
    /// caller rolls the accounting back by hand while holding the limiter
    /// lock; running the normal release path there would deadlock.
    pub(crate) fn defuse(mut self) {
        self.owner = None;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("acquired", &self.acquired)
            .field("permits", &self.permits)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}
