//! Wires the fleet, the health endpoints and the heartbeat together.
use std::sync::Arc;

use anyhow::{Context as _, Result};
use cmapisrv_common::shutdown::cancel_on_signal;
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use crate::{
    config::{Backend, MockerConfig, Opts},
    fleet::Fleet,
    health::{self, HealthState},
    heartbeat,
    kvstore::{EtcdHttpClient, KvStore, MemoryStore},
    metrics::Metrics,
    random::Random,
    signal::{fail_fast, spawn_fatal, StoppableWaitGroup},
};

/// User the remote agents authenticate as.
const REMOTE_USER: &str = "remote";
const REMOTE_ROLES: [&str; 2] = ["local", "remote"];

/// Run the mocker until a termination signal is received.
#[tracing::instrument(skip_all)]
pub async fn mocker(opts: Opts) -> Result<()> {
    let cfg = MockerConfig::try_from_opts(opts)?;
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    cancel_on_signal(&tracker, cancel.clone())?;

    let res = match cfg.backend.clone() {
        Backend::Etcd(etcd) => {
            info!(
                endpoint = %etcd.endpoint,
                prefix = %cfg.prefix,
                tls_client_cert = etcd.client_cert.is_some(),
                authenticated = etcd.credentials.is_some(),
                "publishing into etcd"
            );
            let client = EtcdHttpClient::connect(&etcd)?;
            Mocker::new(cfg, Arc::new(client))?
                .run(&tracker, cancel.clone())
                .await
        }
        Backend::Memory => {
            info!(prefix = %cfg.prefix, "dry run, publishing in memory");
            let store = Arc::new(MemoryStore::new());
            let res = Mocker::new(cfg, store.clone())?
                .run(&tracker, cancel.clone())
                .await;
            info!(
                writes = store.writes(),
                keys = store.key_count(),
                "dry run completed"
            );
            res
        }
    };

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    res
}

/// A fleet of mocked clusters plus the tasks serving and watching it.
pub struct Mocker {
    cfg: Arc<MockerConfig>,
    backend: Arc<dyn KvStore>,
    rnd: Arc<Random>,
    metrics: Arc<Metrics>,
    synced: StoppableWaitGroup,
}

impl Mocker {
    pub fn new(cfg: MockerConfig, backend: Arc<dyn KvStore>) -> Result<Self> {
        let rnd = match cfg.seed {
            Some(seed) => Random::with_seed(&cfg.random, seed)?,
            None => Random::new(&cfg.random)?,
        };
        Ok(Self {
            cfg: Arc::new(cfg),
            backend,
            rnd: Arc::new(rnd),
            metrics: Arc::new(Metrics::new()?),
            synced: StoppableWaitGroup::new(),
        })
    }

    /// Barrier completing once every cluster finished its initial synchronization.
    pub fn synced(&self) -> StoppableWaitGroup {
        self.synced.clone()
    }

    /// Run until `cancel` fires or a fatal error occurs. Side tasks are spawned on `tracker`.
    pub async fn run(self, tracker: &TaskTracker, cancel: CancellationToken) -> Result<()> {
        let roles: Vec<String> = REMOTE_ROLES.iter().map(|role| role.to_string()).collect();
        self.backend
            .user_enforce_presence(REMOTE_USER, &roles)
            .await
            .with_context(|| format!("failed to enforce presence of user {REMOTE_USER}"))
            .map_err(|err| fail_fast(&cancel, err))?;

        let listener = TcpListener::bind(self.cfg.health_addr)
            .await
            .with_context(|| format!("failed to bind health server to {}", self.cfg.health_addr))?;
        let state = HealthState {
            synced: self.synced.clone(),
            metrics: self.metrics.clone(),
        };
        let health = spawn_fatal(
            tracker,
            &cancel,
            "health server failed",
            health::serve(listener, state, cancel.clone()),
        );

        {
            let done = self.synced.done();
            let metrics = self.metrics.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                if done.wait(&cancel).await.is_ok() {
                    metrics.set_ready(true);
                    info!("every cluster completed its initial synchronization");
                }
            });
        }

        match self.cfg.heartbeat_interval {
            Some(every) => {
                tracker.spawn(heartbeat::run(
                    self.backend.clone(),
                    self.cfg.prefix.clone(),
                    every,
                    cancel.clone(),
                ));
            }
            None => warn!("kvstore heartbeat disabled"),
        }

        let fleet = Fleet::new(self.cfg, self.backend, self.rnd, self.metrics)
            .run(cancel.clone(), &self.synced)
            .await;
        cancel.cancel();
        let health = health.await.context("health server task panicked")?;
        fleet.and(health)
    }
}
