//! Process-local permit limiter.
//!
//! Each process runs one [`ClusterLimiter`]. Acquires are served from a
//! local cache of permits whenever possible; on a cache miss the caller
//! joins a bounded FIFO waiter queue and a background reconciler task pulls
//! the deficit from the coordinator. Released permits serve queued waiters
//! first, refill the cache to its target, and flow back to the coordinator
//! as surplus.
//!
//! # Design
//!
//! A single `parking_lot` mutex protects all limiter state. No RPC and no
//! suspension ever happens under the lock; the reconciler (see
//! [`reconciler`]) is the sole issuer of RPCs. Waiter promises are oneshot
//! channels completed under the lock, with the accounting rolled back when
//! the receiving side has already vanished.
//!
//! Fairness: the fast path is disabled while any waiter is queued, so a
//! late small acquire can never starve an earlier large one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snafu::ensure;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ConfigError, LimiterConfig};
use crate::error::{AcquireError, CancelledSnafu, InvalidArgumentSnafu};
use crate::lease::{Lease, QUEUE_LIMIT_REASON};
use crate::proto::ClientId;
use crate::transport::CoordinatorTransport;

mod reconciler;

/// A suspended acquire waiting for permits.
struct Waiter {
    /// Removal handle used by cancellation.
    token: u64,
    /// Permits this waiter needs.
    count: u32,
    /// Completed with the waiter's lease; dropped receivers roll back.
    tx: oneshot::Sender<Lease>,
}

struct LimiterState {
    /// Permits cached locally and not handed to any lease.
    local_available: u32,
    /// Permits currently held by host leases.
    handed_out: u32,
    /// FIFO queue of suspended acquires.
    waiters: VecDeque<Waiter>,
    /// Sum of `count` over `waiters`; bounded by the queue limit.
    outstanding_waiter_permits: u32,
    next_waiter_token: u64,
    /// Set when the limiter has no leases out and no waiters queued.
    idle_since: Option<Instant>,
    shutdown: bool,
}

/// State shared between the limiter handle, its leases, and the reconciler.
pub(crate) struct LimiterShared {
    id: ClientId,
    config: LimiterConfig,
    transport: Arc<dyn CoordinatorTransport>,
    state: Mutex<LimiterState>,
    /// Wakes the reconciler: waiter enqueued, lease released, or the
    /// coordinator advised that capacity is available.
    wake: Notify,
    shutdown_token: CancellationToken,
}

impl LimiterShared {
    /// Return permits from a disposed lease to the local cache.
    pub(crate) fn lease_released(self: Arc<Self>, count: u32) {
        {
            let mut state = self.state.lock();
            state.handed_out = state.handed_out.saturating_sub(count);
            Self::credit_locked(&self, &mut state, count);
        }
        self.wake.notify_one();
    }

    /// Credit permits granted by the coordinator and serve queued waiters.
    pub(crate) fn credit(self: Arc<Self>, count: u32) {
        let mut state = self.state.lock();
        Self::credit_locked(&self, &mut state, count);
    }

    fn credit_locked(this: &Arc<Self>, state: &mut LimiterState, count: u32) {
        let budget = this.config.global_permits;
        state.local_available = match state.local_available.checked_add(count) {
            Some(total) if total <= budget => total,
            _ => {
                warn!(client = %this.id, "local cache exceeded global budget, clamping");
                budget
            }
        };
        Self::drain_waiters_locked(this, state);
        update_idle(state);
    }

    /// Serve waiters from the head while the cache covers them.
    ///
    /// Completion happens under the lock so it cannot race enqueue or
    /// cancellation; a send can only fail when the receiver is gone, in
    /// which case the permits go back to the cache and the dead waiter's
    /// queue debt stays retired.
    fn drain_waiters_locked(this: &Arc<Self>, state: &mut LimiterState) {
        loop {
            let count = match state.waiters.front() {
                Some(head) if head.count <= state.local_available => head.count,
                _ => break,
            };
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.local_available -= count;
            state.outstanding_waiter_permits = state.outstanding_waiter_permits.saturating_sub(count);
            state.handed_out += count;
            if let Err(lease) = waiter.tx.send(Lease::acquired(count, Arc::clone(this))) {
                lease.defuse();
                state.handed_out -= count;
                state.local_available += count;
                debug!(client = %this.id, permits = count, "waiter vanished before completion, permits returned");
            }
        }
    }

    /// Deficit to pull from the coordinator and the surplus currently held.
    ///
    /// With a waiter queued, the deficit is exactly the head's shortfall:
    /// grants are all-or-nothing, so padding the request up to the cache
    /// target could make it unsatisfiable and stall the head behind permits
    /// it does not need. Cache top-up to the target resumes once the queue
    /// is empty.
    fn reconcile_targets(&self) -> (u32, u32) {
        let state = self.state.lock();
        let target = self.config.target_permits_per_client;
        let head = state.waiters.front().map(|waiter| waiter.count).unwrap_or(0);
        let mut deficit = target.saturating_sub(state.local_available);
        if head > state.local_available {
            deficit = head - state.local_available;
        }
        deficit = deficit.min(target.max(head));
        let surplus = state.local_available.saturating_sub(target);
        (deficit, surplus)
    }

    /// Reserve the surplus above the cache target by subtracting it now, so
    /// concurrent acquires see the correct cache while the return RPC is in
    /// flight. Restored via [`Self::credit`] if the RPC fails.
    fn reserve_surplus(&self) -> u32 {
        let mut state = self.state.lock();
        let surplus = state
            .local_available
            .saturating_sub(self.config.target_permits_per_client);
        state.local_available -= surplus;
        surplus
    }

    /// Mark the limiter shut down and fail every queued waiter.
    /// Idempotent.
    fn begin_shutdown(&self) {
        let drained: Vec<Waiter> = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.outstanding_waiter_permits = 0;
            state.waiters.drain(..).collect()
        };
        for waiter in drained {
            if waiter.tx.send(Lease::not_acquired(None)).is_err() {
                debug!(client = %self.id, "waiter vanished during shutdown");
            }
        }
    }
}

/// Re-evaluate the idle clock after any state change.
fn update_idle(state: &mut LimiterState) {
    if state.handed_out == 0 && state.waiters.is_empty() {
        if state.idle_since.is_none() {
            state.idle_since = Some(Instant::now());
        }
    } else {
        state.idle_since = None;
    }
}

/// Process-local limiter over the cluster-wide permit pool.
///
/// Must be constructed inside a Tokio runtime; construction spawns the
/// background reconciler that brokers permits with the coordinator.
pub struct ClusterLimiter {
    shared: Arc<LimiterShared>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterLimiter {
    /// Create a limiter speaking to the coordinator through `transport`.
    ///
    /// Validates the configuration and spawns the reconciler task.
    pub fn new(
        config: LimiterConfig,
        transport: Arc<dyn CoordinatorTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let shared = Arc::new(LimiterShared {
            id: ClientId::new(),
            config,
            transport,
            state: Mutex::new(LimiterState {
                local_available: 0,
                handed_out: 0,
                waiters: VecDeque::new(),
                outstanding_waiter_permits: 0,
                next_waiter_token: 1,
                idle_since: Some(Instant::now()),
                shutdown: false,
            }),
            wake: Notify::new(),
            shutdown_token: CancellationToken::new(),
        });
        let task = tokio::spawn(reconciler::run(Arc::clone(&shared)));
        Ok(Self {
            shared,
            reconciler: Mutex::new(Some(task)),
        })
    }

    /// This limiter's durable identity at the coordinator.
    pub fn client_id(&self) -> ClientId {
        self.shared.id
    }

    /// Acquire without blocking.
    ///
    /// Succeeds only if the local cache covers the request and no waiter is
    /// queued ahead of it. A zero-permit request probes availability without
    /// consuming anything. Returns `AcquireError::InvalidArgument` when the
    /// request exceeds the global budget; every other refusal is a
    /// not-acquired lease.
    pub fn attempt_acquire(&self, permits: u32) -> Result<Lease, AcquireError> {
        ensure!(
            permits <= self.shared.config.global_permits,
            InvalidArgumentSnafu {
                requested: permits,
                max: self.shared.config.global_permits,
            }
        );
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Ok(Lease::not_acquired(None));
        }
        if permits == 0 {
            return Ok(if state.local_available > 0 {
                Lease::noop()
            } else {
                Lease::not_acquired(None)
            });
        }
        if state.outstanding_waiter_permits == 0 && state.local_available >= permits {
            state.local_available -= permits;
            state.handed_out += permits;
            state.idle_since = None;
            return Ok(Lease::acquired(permits, Arc::clone(&self.shared)));
        }
        Ok(Lease::not_acquired(None))
    }

    /// Acquire, suspending until permits are available or `cancel` fires.
    ///
    /// Waiters are served strictly in FIFO order. When the queue's
    /// outstanding permits would exceed the configured limit, the call
    /// returns immediately with a not-acquired lease whose reason is
    /// `"Queue limit reached"`. Cancellation before fulfilment removes the
    /// waiter and refunds its queue debt; a fulfilment that races the
    /// cancellation returns the permits to the cache.
    pub async fn acquire(
        &self,
        permits: u32,
        cancel: &CancellationToken,
    ) -> Result<Lease, AcquireError> {
        ensure!(
            permits <= self.shared.config.global_permits,
            InvalidArgumentSnafu {
                requested: permits,
                max: self.shared.config.global_permits,
            }
        );
        let (token, mut rx) = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Ok(Lease::not_acquired(None));
            }
            if permits == 0 {
                return Ok(Lease::noop());
            }
            if state.outstanding_waiter_permits == 0 && state.local_available >= permits {
                state.local_available -= permits;
                state.handed_out += permits;
                state.idle_since = None;
                return Ok(Lease::acquired(permits, Arc::clone(&self.shared)));
            }
            let projected = state
                .outstanding_waiter_permits
                .checked_add(permits)
                .filter(|total| *total <= self.shared.config.queue_limit);
            let Some(projected) = projected else {
                return Ok(Lease::not_acquired(Some(QUEUE_LIMIT_REASON)));
            };
            let (tx, rx) = oneshot::channel();
            let token = state.next_waiter_token;
            state.next_waiter_token += 1;
            state.waiters.push_back(Waiter { token, count: permits, tx });
            state.outstanding_waiter_permits = projected;
            state.idle_since = None;
            (token, rx)
        };
        self.shared.wake.notify_one();

        tokio::select! {
            completed = &mut rx => match completed {
                Ok(lease) => Ok(lease),
                // The limiter vanished mid-wait; treat as a refusal.
                Err(_) => Ok(Lease::not_acquired(None)),
            },
            _ = cancel.cancelled() => {
                self.cancel_waiter(token, permits);
                // A fulfilment may have raced the cancellation; returning
                // the delivered lease to the cache keeps the accounting
                // exact.
                if let Ok(lease) = rx.try_recv() {
                    drop(lease);
                }
                CancelledSnafu.fail()
            }
        }
    }

    /// Advisory snapshot of the local permit cache.
    pub fn available_permits(&self) -> u32 {
        self.shared.state.lock().local_available
    }

    /// Sum of permits requested by queued waiters.
    pub fn queued_permits(&self) -> u32 {
        self.shared.state.lock().outstanding_waiter_permits
    }

    /// How long the limiter has been idle: no leases out and no waiters
    /// queued. `None` while the limiter is in use.
    pub fn idle_duration(&self) -> Option<Duration> {
        self.shared.state.lock().idle_since.map(|since| since.elapsed())
    }

    /// Shut the limiter down.
    ///
    /// Queued waiters complete with a not-acquired lease, the reconciler is
    /// stopped and awaited, and the coordinator is asked (best-effort) to
    /// release everything charged to this client.
    pub async fn shutdown(&self) {
        self.shared.begin_shutdown();
        self.shared.shutdown_token.cancel();
        let task = self.reconciler.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                debug!(client = %self.shared.id, error = %error, "reconciler task aborted");
            }
        }
    }

    fn cancel_waiter(&self, token: u64, permits: u32) {
        let mut state = self.shared.state.lock();
        if let Some(position) = state.waiters.iter().position(|waiter| waiter.token == token) {
            state.waiters.remove(position);
            state.outstanding_waiter_permits =
                state.outstanding_waiter_permits.saturating_sub(permits);
            update_idle(&mut state);
            debug!(client = %self.shared.id, permits, "waiter cancelled");
        }
    }
}

impl Drop for ClusterLimiter {
    fn drop(&mut self) {
        // Synchronous part of shutdown; the reconciler observes the token
        // and unregisters on its own.
        self.shared.begin_shutdown();
        self.shared.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::ClientHandle;
    use async_trait::async_trait;

    /// Transport that never grants; the coordinator side of these tests is
    /// exercised separately.
    struct DenyTransport;

    #[async_trait]
    impl CoordinatorTransport for DenyTransport {
        async fn try_acquire(
            &self,
            _client: &ClientHandle,
            _seq: u64,
            _permits: u32,
        ) -> Result<u32, TransportError> {
            Ok(0)
        }

        async fn release(
            &self,
            _client: &ClientHandle,
            _seq: u64,
            _permits: u32,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn refresh_lease(&self, _client: &ClientHandle) -> Result<(), TransportError> {
            Ok(())
        }

        async fn unregister(&self, _client: &ClientHandle) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn test_config() -> LimiterConfig {
        LimiterConfig {
            global_permits: 100,
            // High target so the reconciler never returns surplus behind the
            // tests' backs.
            target_permits_per_client: 50,
            queue_limit: 40,
            idle_client_timeout: Duration::from_secs(60),
            lease_refresh_interval: Duration::from_secs(30),
        }
    }

    fn deny_limiter() -> ClusterLimiter {
        ClusterLimiter::new(test_config(), Arc::new(DenyTransport)).expect("valid config")
    }

    async fn wait_for_queued(limiter: &ClusterLimiter, expected: u32) {
        for _ in 0..500 {
            if limiter.queued_permits() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "waiter queue never reached {expected} (now {})",
            limiter.queued_permits()
        );
    }

    #[tokio::test]
    async fn test_fast_path_serves_from_cache() {
        let limiter = deny_limiter();
        Arc::clone(&limiter.shared).credit(10);

        let lease = limiter.attempt_acquire(4).expect("valid count");
        assert!(lease.is_acquired());
        assert_eq!(lease.permits(), 4);
        assert_eq!(limiter.available_permits(), 6);

        drop(lease);
        assert_eq!(limiter.available_permits(), 10);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let limiter = deny_limiter();
        Arc::clone(&limiter.shared).credit(5);

        let mut lease = limiter.attempt_acquire(5).expect("valid count");
        lease.release();
        lease.release();
        drop(lease);
        assert_eq!(limiter.available_permits(), 5);
    }

    #[tokio::test]
    async fn test_fast_path_never_steals_from_waiters() {
        let limiter = Arc::new(deny_limiter());
        Arc::clone(&limiter.shared).credit(10);

        let cancel = CancellationToken::new();
        let waiting = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(20, &cancel).await })
        };
        wait_for_queued(&limiter, 20).await;

        // Cache holds 10, but the queued waiter has priority.
        let lease = limiter.attempt_acquire(5).expect("valid count");
        assert!(!lease.is_acquired());

        cancel.cancel();
        let result = waiting.await.expect("task completes");
        assert!(matches!(result, Err(AcquireError::Cancelled)));
        assert_eq!(limiter.available_permits(), 10);
        assert_eq!(limiter.queued_permits(), 0);
    }

    #[tokio::test]
    async fn test_queue_limit_rejects_with_reason() {
        let limiter = Arc::new(deny_limiter());
        let cancel = CancellationToken::new();

        let first = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(40, &cancel).await })
        };
        wait_for_queued(&limiter, 40).await;

        let rejected = limiter.acquire(1, &cancel).await.expect("not an error");
        assert!(!rejected.is_acquired());
        assert_eq!(rejected.reason(), Some("Queue limit reached"));

        cancel.cancel();
        let _ = first.await;
    }

    #[tokio::test]
    async fn test_zero_permit_probes() {
        let limiter = deny_limiter();
        let cancel = CancellationToken::new();

        let empty = limiter.attempt_acquire(0).expect("valid count");
        assert!(!empty.is_acquired());

        Arc::clone(&limiter.shared).credit(1);
        let probe = limiter.attempt_acquire(0).expect("valid count");
        assert!(probe.is_acquired());
        assert_eq!(probe.permits(), 0);
        drop(probe);
        // The probe consumed nothing.
        assert_eq!(limiter.available_permits(), 1);

        let async_probe = limiter.acquire(0, &cancel).await.expect("valid count");
        assert!(async_probe.is_acquired());
        assert_eq!(async_probe.permits(), 0);
    }

    #[tokio::test]
    async fn test_over_budget_request_is_invalid() {
        let limiter = deny_limiter();
        let cancel = CancellationToken::new();

        assert!(matches!(
            limiter.attempt_acquire(101),
            Err(AcquireError::InvalidArgument { .. })
        ));
        assert!(matches!(
            limiter.acquire(101, &cancel).await,
            Err(AcquireError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_fulfilment_refunds_queue() {
        let limiter = Arc::new(deny_limiter());
        let cancel = CancellationToken::new();

        let waiting = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(5, &cancel).await })
        };
        wait_for_queued(&limiter, 5).await;

        cancel.cancel();
        let result = waiting.await.expect("task completes");
        assert!(matches!(result, Err(AcquireError::Cancelled)));
        assert_eq!(limiter.queued_permits(), 0);
        assert_eq!(limiter.available_permits(), 0);
    }

    #[tokio::test]
    async fn test_cancel_racing_fulfilment_loses_no_permits() {
        let limiter = Arc::new(deny_limiter());
        let cancel = CancellationToken::new();

        let waiting = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(5, &cancel).await })
        };
        wait_for_queued(&limiter, 5).await;

        // Fulfil and cancel back-to-back; the waiter's select sees both.
        Arc::clone(&limiter.shared).credit(5);
        cancel.cancel();

        match waiting.await.expect("task completes") {
            Ok(lease) => {
                assert!(lease.is_acquired());
                assert_eq!(lease.permits(), 5);
                drop(lease);
            }
            Err(AcquireError::Cancelled) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
        // Either way the permits are back in the cache.
        assert_eq!(limiter.available_permits(), 5);
        assert_eq!(limiter.queued_permits(), 0);
    }

    #[tokio::test]
    async fn test_deficit_is_exactly_the_head_shortfall() {
        let limiter = Arc::new(deny_limiter());
        let cancel = CancellationToken::new();

        let waiting = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(5, &cancel).await })
        };
        wait_for_queued(&limiter, 5).await;

        // A queued head below the cache target (50) shrinks the pull to the
        // head's shortfall; an all-or-nothing request padded to the target
        // could be refused while the 5 the head needs are free.
        assert_eq!(limiter.shared.reconcile_targets(), (5, 0));

        // A partial cache shrinks it further.
        Arc::clone(&limiter.shared).credit(2);
        assert_eq!(limiter.shared.reconcile_targets(), (3, 0));

        cancel.cancel();
        let result = waiting.await.expect("task completes");
        assert!(matches!(result, Err(AcquireError::Cancelled)));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_waiters() {
        let limiter = Arc::new(deny_limiter());
        let cancel = CancellationToken::new();

        let waiting = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(5, &cancel).await })
        };
        wait_for_queued(&limiter, 5).await;

        limiter.shutdown().await;
        let lease = waiting
            .await
            .expect("task completes")
            .expect("shutdown is a refusal, not an error");
        assert!(!lease.is_acquired());
        assert_eq!(lease.reason(), None);
        assert_eq!(limiter.queued_permits(), 0);

        let after = limiter.attempt_acquire(1).expect("valid count");
        assert!(!after.is_acquired());
    }

    #[tokio::test]
    async fn test_idle_duration_tracks_leases_and_waiters() {
        let limiter = deny_limiter();
        assert!(limiter.idle_duration().is_some());

        Arc::clone(&limiter.shared).credit(5);
        assert!(limiter.idle_duration().is_some(), "a cached permit is not in use");

        let lease = limiter.attempt_acquire(5).expect("valid count");
        assert!(limiter.idle_duration().is_none());

        drop(lease);
        assert!(limiter.idle_duration().is_some());
    }

    #[tokio::test]
    async fn test_fifo_order_among_waiters() {
        let limiter = Arc::new(deny_limiter());
        let cancel = CancellationToken::new();

        let first = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(10, &cancel).await })
        };
        wait_for_queued(&limiter, 10).await;
        let second = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(2, &cancel).await })
        };
        wait_for_queued(&limiter, 12).await;

        // Enough for the second waiter but not the first: nobody is served.
        Arc::clone(&limiter.shared).credit(5);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.queued_permits(), 12);

        // Covering the head serves both in order.
        Arc::clone(&limiter.shared).credit(7);
        let first_lease = first.await.expect("join").expect("acquired");
        let second_lease = second.await.expect("join").expect("acquired");
        assert_eq!(first_lease.permits(), 10);
        assert_eq!(second_lease.permits(), 2);
    }
}
