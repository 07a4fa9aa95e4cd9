//! The set of simulated clusters and the barrier gating their churn.
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cluster::Cluster, config::MockerConfig, kvstore::KvStore, metrics::Metrics, random::Random,
    signal::StoppableWaitGroup,
};

/// Every mocked cluster, numbered from the first configured cluster ID.
pub struct Fleet {
    clusters: Vec<Cluster>,
}

impl Fleet {
    pub fn new(
        cfg: Arc<MockerConfig>,
        backend: Arc<dyn KvStore>,
        rnd: Arc<Random>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let clusters = cfg
            .cluster_ids()
            .map(|id| {
                Cluster::new(
                    id,
                    cfg.clone(),
                    backend.clone(),
                    rnd.clone(),
                    metrics.clone(),
                )
            })
            .collect();
        Self { clusters }
    }

    /// Run every cluster until `cancel` fires.
    ///
    /// Each cluster holds one slot of `synced`, which completes once all of them
    /// finished their initial synchronization. Its completion starts the churn.
    #[tracing::instrument(skip_all, fields(clusters = self.clusters.len()))]
    pub async fn run(self, cancel: CancellationToken, synced: &StoppableWaitGroup) -> Result<()> {
        let mut tasks = JoinSet::new();
        for cluster in self.clusters {
            info!(cluster = %cluster.info().name, id = cluster.info().id, "starting cluster");
            tasks.spawn(cluster.run(cancel.clone(), synced.add(), synced.done()));
        }
        synced.stop();

        let mut res = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.context("cluster task panicked").and_then(|r| r);
            if res.is_ok() {
                res = outcome;
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{collections::BTreeSet, time::Duration};

    use test_log::test;

    use crate::{
        cluster::{tests::config, ClusterInfo},
        kinds::Kind,
        kvstore::{Event, MemoryStore},
        random::RandomConfig,
    };

    fn fleet(cfg: MockerConfig, backend: Arc<MemoryStore>) -> Fleet {
        Fleet::new(
            Arc::new(cfg),
            backend,
            Arc::new(Random::with_seed(&RandomConfig::default(), 7).unwrap()),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    async fn wait_synced(synced: &StoppableWaitGroup, cancel: &CancellationToken) {
        tokio::time::timeout(Duration::from_secs(10), synced.done().wait(cancel))
            .await
            .unwrap()
            .unwrap();
    }

    #[test(tokio::test)]
    async fn identity_key_spaces_are_disjoint() {
        let backend = Arc::new(MemoryStore::new());
        let mut cfg = config(2, 1, 3);
        cfg.identities.target = 1000;
        let cancel = CancellationToken::new();
        let synced = StoppableWaitGroup::new();
        let task = {
            let (cancel, synced) = (cancel.clone(), synced.clone());
            let fleet = fleet(cfg, backend.clone());
            tokio::spawn(async move { fleet.run(cancel, &synced).await })
        };
        wait_synced(&synced, &cancel).await;

        let ids = |cluster: u32| -> BTreeSet<u32> {
            backend
                .keys(&format!(
                    "cilium/state/identities/v1/{}/id/",
                    ClusterInfo::new(cluster).name
                ))
                .iter()
                .map(|key| key.parse().unwrap())
                .collect()
        };
        let first = ids(1);
        let second = ids(2);
        assert_eq!(first.len(), 1000);
        assert_eq!(second.len(), 1000);
        assert!(first.iter().all(|id| id >> 16 == 1));
        assert!(second.iter().all(|id| id >> 16 == 2));
        assert!(first.is_disjoint(&second));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test(tokio::test)]
    async fn churn_starts_after_every_cluster_synced() {
        let backend = Arc::new(MemoryStore::recording());
        let mut cfg = config(3, 1, 10);
        for workload in [
            &mut cfg.nodes,
            &mut cfg.identities,
            &mut cfg.endpoints,
            &mut cfg.services,
        ] {
            workload.qps = 1000.0;
        }
        let cancel = CancellationToken::new();
        let synced = StoppableWaitGroup::new();
        let task = {
            let (cancel, synced) = (cancel.clone(), synced.clone());
            let fleet = fleet(cfg, backend.clone());
            tokio::spawn(async move { fleet.run(cancel, &synced).await })
        };
        wait_synced(&synced, &cancel).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let history = backend.history();
        let key = |event: &Event| match event {
            Event::Update(key) | Event::Delete(key) => key.clone(),
        };
        let last_marker = history
            .iter()
            .rposition(|event| key(event).starts_with("cilium/synced/"))
            .unwrap();
        let markers = history
            .iter()
            .filter(|event| key(event).starts_with("cilium/synced/"))
            .count();
        assert_eq!(markers, 12);

        for id in 1..=3 {
            let cluster = ClusterInfo::new(id).name;
            for kind in Kind::ALL {
                let prefix = format!("{}/", kind.data_prefix("cilium", &cluster));
                let bootstrap = history[..last_marker]
                    .iter()
                    .filter(|event| key(event).starts_with(&prefix))
                    .count();
                assert_eq!(bootstrap, 10, "{cluster} {kind} wrote before the fleet synced");
            }
        }
        assert!(history.len() > last_marker + 1, "no churn once synced");
    }

    #[test(tokio::test)]
    async fn readiness_needs_every_cluster() {
        let backend = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let synced = StoppableWaitGroup::new();
        let task = {
            let (cancel, synced) = (cancel.clone(), synced.clone());
            let fleet = fleet(config(4, 10, 2), backend.clone());
            tokio::spawn(async move { fleet.run(cancel, &synced).await })
        };
        wait_synced(&synced, &cancel).await;

        for id in 10..14 {
            let name = ClusterInfo::new(id).name;
            assert!(backend.get(&format!("cilium/cluster-config/{name}")).is_some());
            assert_eq!(
                backend.keys(&format!("cilium/synced/{name}/")).len(),
                4,
                "{name} not synced"
            );
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
