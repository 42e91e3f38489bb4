//! Background reconciler: brokers permits between the local cache and the
//! coordinator.
//!
//! One long-lived task per limiter, and the limiter's sole issuer of RPCs.
//! Each tick it pulls the cache's deficit (raised to cover the head waiter),
//! returns any surplus above the target, and heartbeats when nothing else
//! proves the client alive. Transport failures are absorbed here: log, hold
//! the sequence number, back off, retry. The coordinator's replay gate makes
//! the retried call idempotent.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use super::LimiterShared;
use crate::constants::RETRY_BACKOFF;
use crate::transport::{CallbackRef, ClientHandle, PermitCallback};

/// Coordinator-facing callback endpoint for one limiter.
///
/// Holds a weak back-reference: the coordinator owns this only for the
/// duration of a notify, and a notify after the limiter is gone reports
/// failure instead of keeping the limiter's state alive.
struct ReconcilerCallback {
    shared: Weak<LimiterShared>,
}

#[async_trait]
impl PermitCallback for ReconcilerCallback {
    async fn permits_available(&self, approx_available: u32) -> anyhow::Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            anyhow::bail!("limiter no longer running");
        };
        debug!(client = %shared.id, approx_available, "capacity advisory from coordinator");
        shared.wake.notify_one();
        Ok(())
    }
}

pub(crate) async fn run(shared: Arc<LimiterShared>) {
    let handle = ClientHandle {
        id: shared.id,
        callback: Arc::new(ReconcilerCallback {
            shared: Arc::downgrade(&shared),
        }) as CallbackRef,
    };
    let refresh = shared.config.lease_refresh_interval;
    // Sequence numbers are strictly increasing per issued RPC and advance
    // only on success; a failed call retries under the same number.
    let mut next_seq: u64 = 1;
    let mut last_contact = Instant::now();

    loop {
        tokio::select! {
            _ = shared.shutdown_token.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = sleep_until(last_contact + refresh) => {}
        }
        if shared.state.lock().shutdown {
            break;
        }

        let (deficit, surplus_pending) = shared.reconcile_targets();

        if deficit == 0 && surplus_pending == 0 && last_contact.elapsed() >= refresh {
            match shared.transport.refresh_lease(&handle).await {
                Ok(()) => last_contact = Instant::now(),
                Err(error) => {
                    warn!(client = %shared.id, error = %error, "lease refresh failed");
                    backoff(&shared).await;
                    continue;
                }
            }
        }

        if deficit > 0 {
            match shared.transport.try_acquire(&handle, next_seq, deficit).await {
                Ok(granted) => {
                    debug!(
                        client = %shared.id,
                        seq = next_seq,
                        requested = deficit,
                        granted,
                        "reconciled with coordinator"
                    );
                    next_seq += 1;
                    last_contact = Instant::now();
                    if granted > 0 {
                        Arc::clone(&shared).credit(granted);
                    }
                }
                Err(error) => {
                    warn!(
                        client = %shared.id,
                        seq = next_seq,
                        error = %error,
                        "try-acquire failed, retrying"
                    );
                    backoff(&shared).await;
                    continue;
                }
            }
        }

        let surplus = shared.reserve_surplus();
        if surplus > 0 {
            match shared.transport.release(&handle, next_seq, surplus).await {
                Ok(()) => {
                    debug!(client = %shared.id, seq = next_seq, returned = surplus, "returned surplus");
                    next_seq += 1;
                    last_contact = Instant::now();
                }
                Err(error) => {
                    warn!(
                        client = %shared.id,
                        seq = next_seq,
                        error = %error,
                        "surplus return failed, restoring reservation"
                    );
                    Arc::clone(&shared).credit(surplus);
                    backoff(&shared).await;
                    continue;
                }
            }
        }
    }

    if let Err(error) = shared.transport.unregister(&handle).await {
        debug!(client = %shared.id, error = %error, "unregister failed during shutdown");
    }
}

/// Shutdown-interruptible back-off after a failed RPC.
async fn backoff(shared: &LimiterShared) {
    tokio::select! {
        _ = shared.shutdown_token.cancelled() => {}
        _ = sleep(RETRY_BACKOFF) => {}
    }
}
