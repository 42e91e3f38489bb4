//! The cluster-wide permit coordinator.
//!
//! One coordinator runs per cluster. It owns the global permit ledger and
//! answers the four RPCs of the lease protocol (`TryAcquire`, `Release`,
//! `RefreshLease`, `Unregister`), reclaiming the charge of any client that
//! falls silent for longer than the idle timeout.
//!
//! The pure ledger lives in [`state`]; the ractor shell in [`actor`] gives
//! it a mailbox, a purge timer, and best-effort wake-up delivery.

mod actor;
mod state;

pub use actor::{CoordinatorActorState, CoordinatorArgs, CoordinatorMessage, PermitCoordinator};
