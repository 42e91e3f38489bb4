//! The transport seam between client limiters and the coordinator.
//!
//! Client limiters speak to the coordinator exclusively through the
//! [`CoordinatorTransport`] trait, and the coordinator reaches back through
//! [`PermitCallback`]. The cluster runtime that routes these calls is
//! deliberately opaque: the in-process [`CoordinatorClient`] below wraps the
//! coordinator actor directly, while a networked deployment substitutes its
//! own implementation of the same trait.
//!
//! ## Design
//!
//! The client does not run as an actor; it wraps an `ActorRef` and uses
//! ractor's `call_t!` macro for request-response messaging, keeping a clean
//! separation between the limiter fast path and the coordination plane.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{ActorRef, call_t};

use crate::constants::DEFAULT_RPC_TIMEOUT_MS;
use crate::coordinator::CoordinatorMessage;
use crate::error::TransportError;
use crate::proto::{ClientId, CoordinatorRequest, CoordinatorResponse};

/// Coordinator-to-client advisory callback.
///
/// The coordinator invokes this when capacity a client queued for has become
/// available. It is a wake-up, not a grant: the client must come back with
/// its own `TryAcquire` so the single per-client sequence space stays the
/// only idempotency channel. Failures are logged and swallowed by the
/// coordinator; an unreachable client retries via heartbeat or is purged.
#[async_trait]
pub trait PermitCallback: Send + Sync + 'static {
    /// Advise the client that roughly `approx_available` permits are free.
    async fn permits_available(&self, approx_available: u32) -> anyhow::Result<()>;
}

/// Shared handle to a client's callback endpoint.
pub type CallbackRef = Arc<dyn PermitCallback>;

/// A client's identity paired with its callback endpoint.
///
/// Sent with every RPC; the coordinator registers the client implicitly on
/// first contact and holds the callback only for the duration of a notify.
#[derive(Clone)]
pub struct ClientHandle {
    /// Durable client identity.
    pub id: ClientId,
    /// Endpoint the coordinator dials for advisory wake-ups.
    pub callback: CallbackRef,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Client-to-coordinator RPC surface.
///
/// Implementations must provide at-least-once semantics at worst; the
/// protocol's sequence numbers make duplicates harmless. All four calls may
/// fail with [`TransportError`], which the reconciler absorbs and retries.
#[async_trait]
pub trait CoordinatorTransport: Send + Sync + 'static {
    /// Debit up to `permits` from the global pool. All-or-nothing.
    async fn try_acquire(
        &self,
        client: &ClientHandle,
        seq: u64,
        permits: u32,
    ) -> Result<u32, TransportError>;

    /// Return permits previously charged to this client.
    async fn release(
        &self,
        client: &ClientHandle,
        seq: u64,
        permits: u32,
    ) -> Result<(), TransportError>;

    /// Heartbeat proving the client is alive.
    async fn refresh_lease(&self, client: &ClientHandle) -> Result<(), TransportError>;

    /// Deregister the client and return everything charged to it.
    async fn unregister(&self, client: &ClientHandle) -> Result<(), TransportError>;
}

/// In-process transport that forwards RPCs to the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorClient {
    coordinator: ActorRef<CoordinatorMessage>,
    timeout_ms: u64,
}

impl CoordinatorClient {
    /// Create a transport with the default RPC timeout.
    pub fn new(coordinator: ActorRef<CoordinatorMessage>) -> Self {
        Self::with_timeout(coordinator, DEFAULT_RPC_TIMEOUT_MS)
    }

    /// Create a transport with a custom per-call timeout in milliseconds.
    pub fn with_timeout(coordinator: ActorRef<CoordinatorMessage>, timeout_ms: u64) -> Self {
        Self {
            coordinator,
            timeout_ms,
        }
    }

    /// Wrap this transport in an `Arc` for sharing across limiters.
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    async fn request(
        &self,
        request: CoordinatorRequest,
        callback: CallbackRef,
    ) -> Result<CoordinatorResponse, TransportError> {
        call_t!(
            self.coordinator,
            CoordinatorMessage::Request,
            self.timeout_ms,
            request,
            callback
        )
        .map_err(|err| TransportError::Unreachable {
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl CoordinatorTransport for CoordinatorClient {
    async fn try_acquire(
        &self,
        client: &ClientHandle,
        seq: u64,
        permits: u32,
    ) -> Result<u32, TransportError> {
        let request = CoordinatorRequest::TryAcquire {
            client_id: client.id,
            seq,
            permits,
        };
        match self.request(request, client.callback.clone()).await? {
            CoordinatorResponse::Granted { permits } => Ok(permits),
            CoordinatorResponse::Error { error } => Err(TransportError::Rejected { source: error }),
            other => Err(TransportError::Unreachable {
                reason: format!("unexpected response to TryAcquire: {other:?}"),
            }),
        }
    }

    async fn release(
        &self,
        client: &ClientHandle,
        seq: u64,
        permits: u32,
    ) -> Result<(), TransportError> {
        let request = CoordinatorRequest::Release {
            client_id: client.id,
            seq,
            permits,
        };
        match self.request(request, client.callback.clone()).await? {
            CoordinatorResponse::Ack => Ok(()),
            CoordinatorResponse::Error { error } => Err(TransportError::Rejected { source: error }),
            other => Err(TransportError::Unreachable {
                reason: format!("unexpected response to Release: {other:?}"),
            }),
        }
    }

    async fn refresh_lease(&self, client: &ClientHandle) -> Result<(), TransportError> {
        let request = CoordinatorRequest::RefreshLease { client_id: client.id };
        match self.request(request, client.callback.clone()).await? {
            CoordinatorResponse::Ack => Ok(()),
            CoordinatorResponse::Error { error } => Err(TransportError::Rejected { source: error }),
            other => Err(TransportError::Unreachable {
                reason: format!("unexpected response to RefreshLease: {other:?}"),
            }),
        }
    }

    async fn unregister(&self, client: &ClientHandle) -> Result<(), TransportError> {
        let request = CoordinatorRequest::Unregister { client_id: client.id };
        match self.request(request, client.callback.clone()).await? {
            CoordinatorResponse::Ack => Ok(()),
            CoordinatorResponse::Error { error } => Err(TransportError::Rejected { source: error }),
            other => Err(TransportError::Unreachable {
                reason: format!("unexpected response to Unregister: {other:?}"),
            }),
        }
    }
}
