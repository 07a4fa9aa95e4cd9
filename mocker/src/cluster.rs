//! One simulated cluster: its configuration record and the four kinds it publishes.
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cache::WorkingSet,
    config::{MockerConfig, Workload},
    kinds::{
        endpoint::IpIdentityPair, identity::Identity, node::Node, service::ClusterService, Change,
        Endpoints, Identities, Kind, Nodes, Params, Services,
    },
    kvstore::KvStore,
    metrics::Metrics,
    random::Random,
    signal::{fail_fast, Signal, SyncedSlot},
    store::{Marshal, Target},
    syncer::Syncer,
};

/// Identity of a simulated cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    pub id: u32,
    pub name: String,
}

impl ClusterInfo {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: format!("cluster-{id:03}"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Capabilities {
    synced_canaries: bool,
    max_connected_clusters: u32,
    cached: bool,
}

/// Record announcing a cluster and what its readers may rely on.
#[derive(Debug, Serialize)]
struct CiliumClusterConfig {
    id: u32,
    capabilities: Capabilities,
}

/// Key of the configuration record of `cluster`.
pub fn config_key(prefix: &str, cluster: &str) -> String {
    format!("{prefix}/cluster-config/{cluster}")
}

/// Coordinates the producers of one cluster.
pub struct Cluster {
    info: ClusterInfo,
    cfg: Arc<MockerConfig>,
    backend: Arc<dyn KvStore>,
    rnd: Arc<Random>,
    metrics: Arc<Metrics>,
}

impl Cluster {
    pub fn new(
        id: u32,
        cfg: Arc<MockerConfig>,
        backend: Arc<dyn KvStore>,
        rnd: Arc<Random>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            info: ClusterInfo::new(id),
            cfg,
            backend,
            rnd,
            metrics,
        }
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    /// Publish the cluster until `cancel` fires.
    ///
    /// `slot` is released once all four kinds completed their initial
    /// synchronization, and churn starts once `fleet_synced` fires.
    #[tracing::instrument(skip_all, fields(cluster = %self.info.name))]
    pub async fn run(
        self,
        cancel: CancellationToken,
        slot: SyncedSlot,
        fleet_synced: Signal,
    ) -> Result<()> {
        self.write_config()
            .await
            .map_err(|err| fail_fast(&cancel, err))?;

        let params = Params {
            cluster: self.info.clone(),
            rnd: self.rnd.clone(),
            backend: self.backend.clone(),
            enable_ipv6: self.cfg.enable_ipv6,
            encryption: self.cfg.encryption,
            node_annotations: self.cfg.node_annotations.clone(),
        };
        let nodes = Arc::new(Nodes::new(params.clone(), self.working_set(Kind::Nodes)));
        let identities = Arc::new(Identities::new(
            params.clone(),
            self.working_set(Kind::Identities),
        ));
        let services = Services::new(params.clone(), self.working_set(Kind::Services));
        let endpoints = Endpoints::new(
            params,
            self.working_set(Kind::Endpoints),
            nodes.clone(),
            identities.clone(),
        );

        let node_syncer = self.syncer::<Node>(Kind::Nodes);
        let identity_syncer = self.syncer::<Identity>(Kind::Identities);
        let endpoint_syncer = self.syncer::<IpIdentityPair>(Kind::Endpoints);
        let service_syncer = self.syncer::<ClusterService>(Kind::Services);
        let initialized = [
            node_syncer.initialized(),
            identity_syncer.initialized(),
            endpoint_syncer.initialized(),
            service_syncer.initialized(),
        ];

        let mut tasks = JoinSet::new();
        {
            let nodes = nodes.clone();
            tasks.spawn(node_syncer.run(
                cancel.clone(),
                self.cfg.nodes,
                fleet_synced.clone(),
                move |synced| nodes.next(synced),
            ));
        }
        {
            let identities = identities.clone();
            tasks.spawn(identity_syncer.run(
                cancel.clone(),
                self.cfg.identities,
                fleet_synced.clone(),
                move |synced| identities.next(synced),
            ));
        }
        tasks.spawn(service_syncer.run(
            cancel.clone(),
            self.cfg.services,
            fleet_synced.clone(),
            move |synced| services.next(synced),
        ));
        tasks.spawn(gated(
            [initialized[0].clone(), initialized[1].clone()],
            endpoint_syncer,
            cancel.clone(),
            self.cfg.endpoints,
            fleet_synced,
            move |synced| endpoints.next(synced),
        ));

        let mut synced = true;
        for signal in &initialized {
            if signal.wait(&cancel).await.is_err() {
                synced = false;
                break;
            }
        }
        if synced {
            info!("initial synchronization completed");
            slot.done();
        }

        cancel.cancelled().await;
        let mut res = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.context("syncer task panicked").and_then(|r| r);
            if res.is_ok() {
                res = outcome;
            }
        }
        debug!("cluster stopped");
        res
    }

    async fn write_config(&self) -> Result<()> {
        let config = CiliumClusterConfig {
            id: self.info.id,
            capabilities: Capabilities {
                synced_canaries: true,
                max_connected_clusters: self.cfg.max_connected_clusters,
                cached: true,
            },
        };
        let key = config_key(&self.cfg.prefix, &self.info.name);
        self.backend
            .update(&key, serde_json::to_vec(&config)?)
            .await
            .with_context(|| format!("failed to write cluster configuration {key}"))?;
        debug!(%key, "cluster configuration written");
        Ok(())
    }

    fn working_set<T: Marshal + Clone>(&self, kind: Kind) -> WorkingSet<T> {
        WorkingSet::with_gauge(self.metrics.working_set(&self.info.name, kind.as_str()))
    }

    fn syncer<T: Marshal + Send + 'static>(&self, kind: Kind) -> Syncer<T> {
        Syncer::new(
            Target {
                cluster: self.info.name.clone(),
                kind,
                prefix: self.cfg.prefix.clone(),
            },
            self.backend.clone(),
            self.metrics.clone(),
            self.cfg.queue_size,
        )
    }
}

/// Run `syncer` once every signal in `after` fired.
async fn gated<T, F>(
    after: [Signal; 2],
    syncer: Syncer<T>,
    cancel: CancellationToken,
    workload: Workload,
    fleet_synced: Signal,
    next: F,
) -> Result<()>
where
    T: Marshal + Send + 'static,
    F: FnMut(bool) -> Result<Change<T>> + Send,
{
    for signal in &after {
        if signal.wait(&cancel).await.is_err() {
            return Ok(());
        }
    }
    syncer.run(cancel, workload, fleet_synced, next).await
}
