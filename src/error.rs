//! Error types surfaced by the limiter and its transport seam.
//!
//! Hosts only ever see [`AcquireError`] (or a not-acquired lease with an
//! optional reason). [`TransportError`] is internal to the reconciler, which
//! logs it and retries with a fixed back-off rather than propagating it.

use snafu::Snafu;

use crate::proto::PermitError;

/// Errors returned synchronously from acquire calls.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AcquireError {
    /// The requested permit count exceeds the cluster's global budget.
    ///
    /// This is a caller bug: no amount of waiting can satisfy the request.
    #[snafu(display("requested {requested} permits but the global budget is {max}"))]
    InvalidArgument {
        /// The permit count the caller asked for.
        requested: u32,
        /// The configured global budget.
        max: u32,
    },

    /// The caller's cancellation token fired before the waiter was served.
    ///
    /// Distinct from a not-acquired lease: the caller abandoned the wait.
    #[snafu(display("acquire cancelled while waiting"))]
    Cancelled,
}

/// Failures talking to the coordinator.
///
/// Never reaches a host: the reconciler absorbs these with a back-off and
/// retries under the same sequence number.
#[derive(Debug, Snafu)]
pub enum TransportError {
    /// The coordinator could not be reached or did not answer in time.
    #[snafu(display("coordinator unreachable: {reason}"))]
    Unreachable {
        /// Transport-level failure description.
        reason: String,
    },

    /// The coordinator answered with a protocol-level rejection.
    #[snafu(display("coordinator rejected request: {source}"))]
    Rejected {
        /// The rejection carried in the response envelope.
        source: PermitError,
    },
}
