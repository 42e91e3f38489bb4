//! Cluster-wide concurrency limiting with a coordinator-brokered global
//! permit pool.
//!
//! A single [`PermitCoordinator`] per cluster owns a budget of N permits.
//! Each process runs a [`ClusterLimiter`] that serves acquires from a local
//! permit cache, queues waiters when the cache runs dry, and reconciles with
//! the coordinator in the background: pulling deficits, returning surplus,
//! and heartbeating so a crashed process's permits are reclaimed after the
//! idle timeout. The sum of free permits at the coordinator and permits
//! charged to clients always equals the budget.
//!
//! The lease protocol is idempotent under at-least-once delivery: every RPC
//! carries a per-client sequence number, and the coordinator replays its
//! recorded answer for any duplicate.
//!
//! ```ignore
//! use alder::{ClusterLimiter, CoordinatorArgs, CoordinatorClient, LimiterConfig, PermitCoordinator};
//! use ractor::Actor;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = LimiterConfig::default();
//! let (coordinator, _handle) =
//!     Actor::spawn(None, PermitCoordinator, CoordinatorArgs::new(config.clone())).await?;
//! let limiter = ClusterLimiter::new(config, CoordinatorClient::new(coordinator).into_arc())?;
//!
//! let lease = limiter.acquire(2, &CancellationToken::new()).await?;
//! // ... do 2 permits' worth of concurrent work ...
//! drop(lease); // permits return to the local cache, then the cluster
//! ```

#![warn(missing_docs)]

/// Limiter configuration with validation and environment overrides.
pub mod config;
/// Fixed operational constants.
pub mod constants;
/// The cluster-wide permit coordinator actor.
pub mod coordinator;
/// Error types surfaced by the limiter and its transport seam.
pub mod error;
/// Permit lease handles.
pub mod lease;
/// The process-local limiter: fast path, waiter queue, reconciler.
pub mod limiter;
/// Wire types shared between clients and the coordinator.
pub mod proto;
/// The transport seam between client limiters and the coordinator.
pub mod transport;

pub use config::{ConfigError, LimiterConfig};
pub use coordinator::{CoordinatorArgs, CoordinatorMessage, PermitCoordinator};
pub use error::{AcquireError, TransportError};
pub use lease::Lease;
pub use limiter::ClusterLimiter;
pub use proto::{ClientId, CoordinatorStats};
pub use transport::{
    CallbackRef, ClientHandle, CoordinatorClient, CoordinatorTransport, PermitCallback,
};
