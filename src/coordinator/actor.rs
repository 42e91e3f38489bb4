//! Actor shell for the permit coordinator.
//!
//! The actor follows our standard ractor pattern of an immutable actor
//! struct with mutable state:
//! - [`PermitCoordinator`]: empty shell (zero-sized type) implementing the
//!   `Actor` trait
//! - [`CoordinatorActorState`]: the [`PermitPool`] ledger plus the purge
//!   timer handle
//! - [`CoordinatorMessage`]: message enum (no Clone due to RpcReplyPort
//!   one-time use)
//!
//! The mailbox serializes all state mutations, so conservation holds across
//! interleaved clients by construction. The only suspension inside a handler
//! is outgoing notification delivery, which runs after the reply is sent and
//! swallows failures: an unreachable client retries via heartbeat or is
//! purged.

use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::state::{Notification, PermitPool};
use crate::config::LimiterConfig;
use crate::constants::PURGE_INTERVAL;
use crate::proto::{CoordinatorRequest, CoordinatorResponse, CoordinatorStats};
use crate::transport::CallbackRef;

/// Messages accepted by the coordinator actor.
///
/// Note: Does NOT derive Clone because RpcReplyPort is not cloneable.
pub enum CoordinatorMessage {
    /// An RPC from a client limiter, paired with the client's callback
    /// endpoint. Registration is implicit on first contact.
    Request(CoordinatorRequest, CallbackRef, RpcReplyPort<CoordinatorResponse>),
    /// Periodic idle-client purge tick.
    PurgeIdle,
    /// Operational snapshot of the pool.
    GetStats(RpcReplyPort<CoordinatorStats>),
}

/// Arguments passed to the actor on startup.
#[derive(Debug, Clone)]
pub struct CoordinatorArgs {
    /// Shared tuning parameters; the coordinator uses the global budget and
    /// the idle timeout.
    pub config: LimiterConfig,
    /// Cadence of the idle purge timer. Defaults to [`PURGE_INTERVAL`].
    pub purge_interval: Duration,
}

impl CoordinatorArgs {
    /// Arguments with the default purge cadence.
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            purge_interval: PURGE_INTERVAL,
        }
    }
}

/// Actor shell for the permit coordinator.
///
/// This is an empty struct following ractor's pattern where the actor is
/// stateless and all mutable state lives in `Self::State`.
pub struct PermitCoordinator;

/// Mutable state for the coordinator actor.
pub struct CoordinatorActorState {
    pool: PermitPool,
    purge_timer: Option<JoinHandle<()>>,
}

impl Actor for PermitCoordinator {
    type Msg = CoordinatorMessage;
    type State = CoordinatorActorState;
    type Arguments = CoordinatorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        args.config
            .validate()
            .map_err(|e| ActorProcessingErr::from(e.to_string()))?;

        info!(
            global_permits = args.config.global_permits,
            idle_timeout_ms = args.config.idle_client_timeout.as_millis() as u64,
            purge_interval_ms = args.purge_interval.as_millis() as u64,
            "permit coordinator starting"
        );

        let purge_timer =
            myself.send_interval(args.purge_interval, || CoordinatorMessage::PurgeIdle);

        Ok(CoordinatorActorState {
            pool: PermitPool::new(args.config.global_permits, args.config.idle_client_timeout),
            purge_timer: Some(purge_timer),
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(timer) = state.purge_timer.take() {
            timer.abort();
        }
        info!("permit coordinator stopping");
        Ok(())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMessage::Request(request, callback, reply) => {
                let now = Instant::now();
                let mut notifications = Vec::new();
                let response = dispatch(&mut state.pool, request, &callback, now, &mut notifications);
                if reply.send(response).is_err() {
                    warn!("failed to send coordinator reply - caller dropped");
                }
                deliver(notifications).await;
            }
            CoordinatorMessage::PurgeIdle => {
                let mut notifications = Vec::new();
                state.pool.purge_idle(Instant::now(), &mut notifications);
                deliver(notifications).await;
            }
            CoordinatorMessage::GetStats(reply) => {
                if reply.send(state.pool.stats()).is_err() {
                    warn!("failed to send stats reply - caller dropped");
                }
            }
        }
        Ok(())
    }
}

fn dispatch(
    pool: &mut PermitPool,
    request: CoordinatorRequest,
    callback: &CallbackRef,
    now: Instant,
    notifications: &mut Vec<Notification>,
) -> CoordinatorResponse {
    match request {
        CoordinatorRequest::TryAcquire { client_id, seq, permits } => {
            match pool.try_acquire(client_id, callback, seq, permits, now, notifications) {
                Ok(granted) => CoordinatorResponse::Granted { permits: granted },
                Err(error) => CoordinatorResponse::Error { error },
            }
        }
        CoordinatorRequest::Release { client_id, seq, permits } => {
            match pool.release(client_id, callback, seq, permits, now, notifications) {
                Ok(()) => CoordinatorResponse::Ack,
                Err(error) => CoordinatorResponse::Error { error },
            }
        }
        CoordinatorRequest::RefreshLease { client_id } => {
            pool.refresh(client_id, now);
            CoordinatorResponse::Ack
        }
        CoordinatorRequest::Unregister { client_id } => {
            pool.unregister(client_id, notifications);
            CoordinatorResponse::Ack
        }
    }
}

/// Deliver advisory wake-ups collected during a mutation. Best-effort:
/// failures are logged and swallowed.
async fn deliver(notifications: Vec<Notification>) {
    for notification in notifications {
        if let Err(error) = notification
            .callback
            .permits_available(notification.approx_available)
            .await
        {
            debug!(
                client = %notification.client_id,
                error = %error,
                "permit notification failed - client will retry via heartbeat"
            );
        }
    }
}
