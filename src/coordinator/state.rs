//! Pure state machine for the global permit pool.
//!
//! [`PermitPool`] owns the cluster-wide ledger: free permits, per-client
//! charges, and the FIFO queue of clients waiting for capacity. It performs
//! no I/O; notification callbacks are collected into a batch the actor
//! delivers after the mutation completes, so the conservation invariant
//! (`available + Σ in_use = budget`) holds at every return.
//!
//! Replay protection: each client sends strictly increasing sequence
//! numbers. A request at or below the highest observed number is answered
//! with the recorded grant and mutates nothing beyond the liveness clock,
//! which makes `TryAcquire` and `Release` idempotent under at-least-once
//! delivery.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::proto::{ClientId, CoordinatorStats, PermitError};
use crate::transport::CallbackRef;

/// Per-client ledger entry.
struct ClientRecord {
    /// Permits currently charged to this client.
    in_use: u32,
    /// Liveness clock; clients unseen past the idle timeout are purged.
    last_seen: Instant,
    /// Highest sequence number observed from this client.
    seq: u64,
    /// Grant recorded for the highest observed sequence number, replayed on
    /// duplicates.
    last_acquired_grant: u32,
    /// The permit count this client last asked for and could not receive.
    pending_request: Option<u32>,
    /// Endpoint for advisory wake-ups.
    callback: CallbackRef,
}

/// An advisory wake-up owed to a client, to be delivered outside the
/// mutation.
pub(crate) struct Notification {
    pub(crate) client_id: ClientId,
    pub(crate) callback: CallbackRef,
    pub(crate) approx_available: u32,
}

/// The coordinator's ledger of the cluster-wide permit budget.
pub(crate) struct PermitPool {
    capacity: u32,
    available: u32,
    idle_timeout: Duration,
    clients: HashMap<ClientId, ClientRecord>,
    /// Clients waiting for capacity, FIFO by first rejection. Each id
    /// appears at most once; stale entries are dropped during service.
    pending: VecDeque<ClientId>,
}

impl PermitPool {
    pub(crate) fn new(capacity: u32, idle_timeout: Duration) -> Self {
        Self {
            capacity,
            available: capacity,
            idle_timeout,
            clients: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Debit `permits` from the pool for `client_id`. All-or-nothing: the
    /// full amount is granted, or zero and the client joins the pending
    /// queue.
    pub(crate) fn try_acquire(
        &mut self,
        client_id: ClientId,
        callback: &CallbackRef,
        seq: u64,
        permits: u32,
        now: Instant,
        notifications: &mut Vec<Notification>,
    ) -> Result<u32, PermitError> {
        if permits > self.capacity {
            return Err(PermitError::InvalidArgument {
                requested: permits,
                max: self.capacity,
            });
        }
        self.touch(client_id, callback, now);
        if let Some(record) = self.clients.get(&client_id)
            && seq <= record.seq
        {
            debug!(client = %client_id, seq, granted = record.last_acquired_grant, "replaying acquire response");
            return Ok(record.last_acquired_grant);
        }
        self.drop_idle_clients(now);

        let granted = if self.available >= permits {
            self.available -= permits;
            let record = self.record_mut(client_id, callback, now);
            record.in_use += permits;
            record.pending_request = None;
            permits
        } else {
            let record = self.record_mut(client_id, callback, now);
            if record.pending_request.is_none() {
                record.pending_request = Some(permits);
                self.pending.push_back(client_id);
            }
            0
        };

        let record = self.record_mut(client_id, callback, now);
        record.seq = seq;
        record.last_acquired_grant = granted;

        debug!(
            client = %client_id,
            seq,
            requested = permits,
            granted,
            available = self.available,
            "try-acquire"
        );
        self.service_pending(notifications);
        Ok(granted)
    }

    /// Credit `permits` back to the pool from `client_id`.
    pub(crate) fn release(
        &mut self,
        client_id: ClientId,
        callback: &CallbackRef,
        seq: u64,
        permits: u32,
        now: Instant,
        notifications: &mut Vec<Notification>,
    ) -> Result<(), PermitError> {
        if permits > self.capacity {
            return Err(PermitError::InvalidArgument {
                requested: permits,
                max: self.capacity,
            });
        }
        self.touch(client_id, callback, now);
        if let Some(record) = self.clients.get(&client_id)
            && seq <= record.seq
        {
            debug!(client = %client_id, seq, "replaying release response");
            return Ok(());
        }
        self.drop_idle_clients(now);

        let record = self.record_mut(client_id, callback, now);
        if permits > record.in_use {
            warn!(
                client = %client_id,
                released = permits,
                in_use = record.in_use,
                "release exceeds charged permits, clamping"
            );
            record.in_use = 0;
        } else {
            record.in_use -= permits;
        }
        record.seq = seq;
        record.last_acquired_grant = 0;
        self.available = (self.available + permits).min(self.capacity);

        debug!(
            client = %client_id,
            seq,
            released = permits,
            available = self.available,
            "release"
        );
        self.service_pending(notifications);
        Ok(())
    }

    /// Touch the liveness clock of a known client. Unknown clients are left
    /// alone; they re-register on their next acquire or release.
    pub(crate) fn refresh(&mut self, client_id: ClientId, now: Instant) {
        if let Some(record) = self.clients.get_mut(&client_id) {
            record.last_seen = now;
        }
    }

    /// Remove a client and return everything charged to it.
    pub(crate) fn unregister(
        &mut self,
        client_id: ClientId,
        notifications: &mut Vec<Notification>,
    ) {
        if let Some(record) = self.clients.remove(&client_id) {
            self.available = (self.available + record.in_use).min(self.capacity);
            debug!(
                client = %client_id,
                reclaimed = record.in_use,
                available = self.available,
                "client unregistered"
            );
            self.service_pending(notifications);
        }
    }

    /// Timer entry point: drop silent clients and service the queue with
    /// whatever was reclaimed.
    pub(crate) fn purge_idle(&mut self, now: Instant, notifications: &mut Vec<Notification>) {
        if self.drop_idle_clients(now) > 0 {
            self.service_pending(notifications);
        }
    }

    pub(crate) fn stats(&self) -> CoordinatorStats {
        let permits_in_use = self.clients.values().map(|record| record.in_use).sum();
        CoordinatorStats {
            global_permits: self.capacity,
            available_permits: self.available,
            permits_in_use,
            registered_clients: self.clients.len() as u32,
            pending_clients: self.pending.len() as u32,
        }
    }

    fn touch(&mut self, client_id: ClientId, callback: &CallbackRef, now: Instant) {
        self.clients
            .entry(client_id)
            .and_modify(|record| record.last_seen = now)
            .or_insert_with(|| {
                debug!(client = %client_id, "registering client");
                ClientRecord {
                    in_use: 0,
                    last_seen: now,
                    seq: 0,
                    last_acquired_grant: 0,
                    pending_request: None,
                    callback: callback.clone(),
                }
            });
    }

    /// Fetch the client's record, re-creating it if an interleaved purge
    /// removed it.
    fn record_mut(
        &mut self,
        client_id: ClientId,
        callback: &CallbackRef,
        now: Instant,
    ) -> &mut ClientRecord {
        self.clients.entry(client_id).or_insert_with(|| ClientRecord {
            in_use: 0,
            last_seen: now,
            seq: 0,
            last_acquired_grant: 0,
            pending_request: None,
            callback: callback.clone(),
        })
    }

    /// Drop every client unseen past the idle timeout and reclaim its
    /// permits. Purged ids may linger in `pending`; service filters them.
    fn drop_idle_clients(&mut self, now: Instant) -> u32 {
        let idle: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > self.idle_timeout)
            .map(|(id, _)| *id)
            .collect();
        let mut reclaimed = 0u32;
        for client_id in idle {
            if let Some(record) = self.clients.remove(&client_id) {
                warn!(
                    client = %client_id,
                    reclaimed = record.in_use,
                    "dropping idle client"
                );
                reclaimed = reclaimed.saturating_add(record.in_use);
            }
        }
        if reclaimed > 0 {
            self.available = (self.available + reclaimed).min(self.capacity);
        }
        reclaimed
    }

    /// Wake queued clients whose pending request now fits, head first.
    ///
    /// The wake-up is advisory: the grant itself is never handed out here,
    /// because a grant requires a fresh sequence number from the client.
    fn service_pending(&mut self, notifications: &mut Vec<Notification>) {
        while let Some(&head) = self.pending.front() {
            let Some(record) = self.clients.get_mut(&head) else {
                self.pending.pop_front();
                continue;
            };
            let Some(wanted) = record.pending_request else {
                self.pending.pop_front();
                continue;
            };
            if self.available < wanted {
                break;
            }
            record.pending_request = None;
            notifications.push(Notification {
                client_id: head,
                callback: record.callback.clone(),
                approx_available: self.available,
            });
            self.pending.pop_front();
        }
    }
}
