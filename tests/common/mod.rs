//! Shared harness for integration tests: a coordinator, its transport, and
//! convergence helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use ractor::{Actor, ActorRef};
use tokio::task::JoinHandle;

use alder::config::LimiterConfig;
use alder::coordinator::{CoordinatorArgs, CoordinatorMessage, PermitCoordinator};
use alder::limiter::ClusterLimiter;
use alder::proto::{ClientId, CoordinatorStats};
use alder::transport::{ClientHandle, CoordinatorClient, CoordinatorTransport, PermitCallback};

/// The literal scenario setup (N = 100, T = 20, Q = 200) with durations
/// scaled down so idle reclamation is observable in a test run.
pub fn test_config() -> LimiterConfig {
    LimiterConfig {
        global_permits: 100,
        target_permits_per_client: 20,
        queue_limit: 200,
        idle_client_timeout: Duration::from_millis(400),
        lease_refresh_interval: Duration::from_millis(100),
    }
}

/// A running coordinator with an in-process transport attached.
pub struct TestCluster {
    pub actor: ActorRef<CoordinatorMessage>,
    pub actor_handle: JoinHandle<()>,
    pub transport: Arc<dyn CoordinatorTransport>,
}

impl TestCluster {
    pub async fn stats(&self) -> Result<CoordinatorStats> {
        stats(&self.actor).await
    }
}

/// Install a test-writer tracing subscriber once per binary, honoring
/// `RUST_LOG` for debugging failing runs.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub async fn spawn_cluster(config: &LimiterConfig) -> Result<TestCluster> {
    init_tracing();
    let args = CoordinatorArgs {
        config: config.clone(),
        purge_interval: Duration::from_millis(50),
    };
    let (actor, actor_handle) = Actor::spawn(None, PermitCoordinator, args)
        .await
        .map_err(|err| anyhow::anyhow!("failed to spawn coordinator: {err}"))?;
    let transport: Arc<dyn CoordinatorTransport> = CoordinatorClient::new(actor.clone()).into_arc();
    Ok(TestCluster {
        actor,
        actor_handle,
        transport,
    })
}

pub async fn stats(actor: &ActorRef<CoordinatorMessage>) -> Result<CoordinatorStats> {
    ractor::call_t!(actor, CoordinatorMessage::GetStats, 1000)
        .map_err(|err| anyhow::anyhow!("stats call failed: {err}"))
}

/// Poll the coordinator until `available_permits` reaches `expected`,
/// checking conservation on every probe.
pub async fn wait_for_available(actor: &ActorRef<CoordinatorMessage>, expected: u32) -> Result<()> {
    let mut last = None;
    for _ in 0..150 {
        let snapshot = stats(actor).await?;
        assert_eq!(
            snapshot.available_permits + snapshot.permits_in_use,
            snapshot.global_permits,
            "conservation violated: {snapshot:?}"
        );
        if snapshot.available_permits == expected {
            return Ok(());
        }
        last = Some(snapshot);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("coordinator never reached {expected} available permits (last: {last:?})")
}

/// Poll a limiter until its waiter queue holds `expected` permits.
pub async fn wait_for_queued(limiter: &ClusterLimiter, expected: u32) -> Result<()> {
    for _ in 0..500 {
        if limiter.queued_permits() == expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bail!(
        "waiter queue never reached {expected} permits (now {})",
        limiter.queued_permits()
    )
}

/// Callback that accepts and ignores advisories, for raw-RPC clients that
/// stand in for processes without a limiter (e.g. crashed ones).
pub struct NoopCallback;

#[async_trait::async_trait]
impl PermitCallback for NoopCallback {
    async fn permits_available(&self, _approx_available: u32) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn raw_handle() -> ClientHandle {
    ClientHandle {
        id: ClientId::new(),
        callback: Arc::new(NoopCallback),
    }
}
