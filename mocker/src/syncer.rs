//! Drives one kind of one cluster through bootstrap and churn.
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::Workload,
    kinds::Change,
    kvstore::KvStore,
    metrics::Metrics,
    ratelimit::Limiter,
    signal::{fail_fast, Cancelled, Signal},
    store::{Marshal, SyncStore, Target},
};

/// Runs a kind's producer and feeds its changes to a [`SyncStore`].
///
/// The producer is called with `synced == false` exactly `target` times, then the
/// synced marker is armed. Churn (`synced == true`) only starts once the whole
/// fleet has completed its initial synchronization.
pub struct Syncer<T> {
    target: Target,
    store: SyncStore<T>,
}

impl<T: Marshal + Send + 'static> Syncer<T> {
    pub fn new(
        target: Target,
        backend: Arc<dyn KvStore>,
        metrics: Arc<Metrics>,
        queue_size: usize,
    ) -> Self {
        Self {
            store: SyncStore::new(target.clone(), backend, metrics, queue_size),
            target,
        }
    }

    /// Fired once the bootstrap changes and the synced marker reached the store.
    pub fn initialized(&self) -> Signal {
        self.store.initialized()
    }

    /// Run until `cancel` fires.
    ///
    /// Errors other than cancellation are fatal: `cancel` is cancelled and the
    /// error returned once the upload loop has stopped.
    pub async fn run<F>(
        mut self,
        cancel: CancellationToken,
        workload: Workload,
        fleet_synced: Signal,
        next: F,
    ) -> Result<()>
    where
        F: FnMut(bool) -> Result<Change<T>> + Send,
    {
        let uploader = self.store.run_background(cancel.clone())?;

        let driven = match self.drive(&cancel, workload, &fleet_synced, next).await {
            Ok(()) => Ok(()),
            Err(err) if err.is::<Cancelled>() || cancel.is_cancelled() => {
                debug!(cluster = %self.target.cluster, kind = %self.target.kind, error = %err, "syncer stopped");
                Ok(())
            }
            Err(err) => Err(fail_fast(&cancel, err)),
        };
        let uploaded = uploader.await?;
        driven.and(uploaded)
    }

    async fn drive<F>(
        &mut self,
        cancel: &CancellationToken,
        workload: Workload,
        fleet_synced: &Signal,
        mut next: F,
    ) -> Result<()>
    where
        F: FnMut(bool) -> Result<Change<T>> + Send,
    {
        let cluster = self.target.cluster.as_str();
        let kind = self.target.kind.as_str();

        for _ in 0..workload.target {
            let change = next(false)?;
            self.store.apply(cancel, change).await?;
        }
        self.store
            .mark_synced_after(cancel, workload.target as usize)
            .await?;
        debug!(cluster, kind, target = workload.target, "bootstrap enqueued");

        fleet_synced.wait(cancel).await?;
        if !workload.churns() {
            debug!(cluster, kind, "churn disabled");
            cancel.cancelled().await;
            return Ok(());
        }

        info!(cluster, kind, qps = workload.qps, "starting churn");
        let mut limiter = Limiter::new(workload.qps);
        loop {
            limiter.wait(cancel).await?;
            let change = next(true)?;
            self.store.apply(cancel, change).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        collections::BTreeSet,
        sync::{
            atomic::{AtomicU64, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use test_log::test;
    use tokio::task::JoinHandle;

    use crate::{
        cache::{Keyed, WorkingSet},
        kinds::{node::Node, tests::params, Endpoints, Identities, Kind, Nodes, Services},
        kvstore::{Event, MemoryStore},
    };

    #[derive(Clone, Debug)]
    struct Entry(usize);

    impl Keyed for Entry {
        fn key(&self) -> String {
            self.0.to_string()
        }
    }

    impl Marshal for Entry {
        fn marshal(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn target(kind: Kind) -> Target {
        Target {
            cluster: "cluster-001".to_owned(),
            kind,
            prefix: "cilium".to_owned(),
        }
    }

    fn syncer<T: Marshal + Send + 'static>(kind: Kind, backend: Arc<dyn KvStore>) -> Syncer<T> {
        Syncer::new(target(kind), backend, Arc::new(Metrics::new().unwrap()), 16)
    }

    /// A producer minting increasing entries and recording the `synced` flag of every call.
    fn recorder() -> (
        Arc<Mutex<Vec<bool>>>,
        impl FnMut(bool) -> Result<Change<Entry>> + Send,
    ) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let next = move |synced| {
            let mut calls = recorded.lock().unwrap();
            calls.push(synced);
            Ok(Change::Upsert(Entry(calls.len())))
        };
        (calls, next)
    }

    #[test(tokio::test(start_paused = true))]
    async fn churn_waits_for_the_fleet() {
        let cancel = CancellationToken::new();
        let fleet_synced = Signal::new();
        let syncer = syncer::<Entry>(Kind::Services, Arc::new(MemoryStore::new()));
        let initialized = syncer.initialized();
        let (calls, next) = recorder();
        let task = tokio::spawn(syncer.run(
            cancel.clone(),
            Workload {
                target: 3,
                qps: 100.0,
            },
            fleet_synced.clone(),
            next,
        ));

        initialized.wait(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*calls.lock().unwrap(), vec![false; 3]);

        fleet_synced.fire();
        tokio::time::sleep(Duration::from_millis(95)).await;
        {
            let calls = calls.lock().unwrap();
            assert!(calls.len() > 3, "no churn after the fleet synced");
            assert!(calls[3..].iter().all(|synced| *synced));
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn no_churn_without_rate() {
        let cancel = CancellationToken::new();
        let fleet_synced = Signal::new();
        fleet_synced.fire();
        let syncer = syncer::<Entry>(Kind::Services, Arc::new(MemoryStore::new()));
        let (calls, next) = recorder();
        let task = tokio::spawn(syncer.run(
            cancel.clone(),
            Workload {
                target: 2,
                qps: 0.0,
            },
            fleet_synced,
            next,
        ));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn empty_target_syncs_and_never_churns() {
        let cancel = CancellationToken::new();
        let fleet_synced = Signal::new();
        fleet_synced.fire();
        let backend = Arc::new(MemoryStore::recording());
        let syncer = syncer::<Entry>(Kind::Services, backend.clone());
        let initialized = syncer.initialized();
        let (calls, next) = recorder();
        let task = tokio::spawn(syncer.run(
            cancel.clone(),
            Workload {
                target: 0,
                qps: 1000.0,
            },
            fleet_synced,
            next,
        ));

        initialized.wait(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(
            backend.history(),
            vec![Event::Update(
                "cilium/synced/cluster-001/cilium/cache/services/v1".to_owned()
            )]
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test(tokio::test)]
    async fn producer_error_is_fatal() {
        let cancel = CancellationToken::new();
        let syncer = syncer::<Entry>(Kind::Nodes, Arc::new(MemoryStore::new()));
        let mut count = 0;
        let next = move |_| {
            count += 1;
            if count == 2 {
                anyhow::bail!("failed to generate key");
            }
            Ok(Change::Upsert(Entry(count)))
        };

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            syncer.run(
                cancel.clone(),
                Workload {
                    target: 5,
                    qps: 0.0,
                },
                Signal::new(),
                next,
            ),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(cancel.is_cancelled());
        assert_eq!(err.to_string(), "failed to generate key");
    }

    #[test(tokio::test(start_paused = true))]
    async fn node_churn_keeps_removal_floor() {
        let cancel = CancellationToken::new();
        let fleet_synced = Signal::new();
        let backend = Arc::new(MemoryStore::recording());
        let nodes = Arc::new(Nodes::new(params(1), WorkingSet::new()));
        let syncer = syncer::<Node>(Kind::Nodes, backend.clone());
        let initialized = syncer.initialized();

        let task = {
            let nodes = nodes.clone();
            tokio::spawn(syncer.run(
                cancel.clone(),
                Workload {
                    target: 5,
                    qps: 1000.0,
                },
                fleet_synced.clone(),
                move |synced| nodes.next(synced),
            ))
        };

        initialized.wait(&cancel).await.unwrap();
        let prefix = "cilium/state/nodes/v1/cluster-001/";
        let bootstrapped: BTreeSet<_> = backend.keys(prefix).into_iter().collect();
        let live: BTreeSet<_> = nodes.working_set().keys().into_iter().collect();
        assert_eq!(bootstrapped, live);
        assert_eq!(live.len(), 5);

        fleet_synced.fire();
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(nodes.working_set().len() >= 3);
        let deletes = backend
            .history()
            .iter()
            .filter(|event| matches!(event, Event::Delete(_)))
            .count();
        assert!(deletes > 0, "churn never removed a node");
    }

    /// Bootstrap `target` values, churn for two seconds, then let the upload
    /// loop drain while time stands still. Nothing else runs until the caller
    /// awaits again.
    async fn churn<T, F>(
        kind: Kind,
        backend: Arc<MemoryStore>,
        target: u32,
        mut next: F,
    ) -> (CancellationToken, JoinHandle<Result<()>>)
    where
        T: Marshal + Send + Sync + 'static,
        F: FnMut(bool) -> Result<Change<T>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let fleet_synced = Signal::new();
        fleet_synced.fire();
        let produced = Arc::new(AtomicU64::new(0));
        let task = {
            let produced = produced.clone();
            tokio::spawn(syncer::<T>(kind, backend.clone()).run(
                cancel.clone(),
                Workload {
                    target,
                    qps: 1000.0,
                },
                fleet_synced,
                move |synced| {
                    produced.fetch_add(1, Ordering::SeqCst);
                    next(synced)
                },
            ))
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        // One write per change plus the synced marker.
        while backend.writes() != produced.load(Ordering::SeqCst) + 1 {
            tokio::task::yield_now().await;
        }
        (cancel, task)
    }

    /// The store holds exactly the live values of `set`, byte for byte.
    fn assert_mirrors<T: Marshal + Clone>(backend: &MemoryStore, kind: Kind, set: &WorkingSet<T>) {
        let prefix = format!("{}/", kind.data_prefix("cilium", "cluster-001"));
        let stored: BTreeSet<_> = backend.keys(&prefix).into_iter().collect();
        let live: BTreeSet<_> = set.keys().into_iter().collect();
        assert_eq!(stored, live);
        for value in set.values() {
            let key = value.key();
            assert_eq!(
                backend.get(&format!("{prefix}{key}")),
                Some(value.marshal().unwrap()),
                "stale value at {key}"
            );
        }
    }

    #[test(tokio::test(start_paused = true))]
    async fn identity_churn_mirrors_store() {
        let backend = Arc::new(MemoryStore::new());
        let identities = Arc::new(Identities::new(params(1), WorkingSet::new()));
        let (cancel, task) = {
            let identities = identities.clone();
            churn(Kind::Identities, backend.clone(), 10, move |synced| {
                identities.next(synced)
            })
            .await
        };

        assert!(backend.writes() > 11, "no churn happened");
        assert_mirrors(&backend, Kind::Identities, identities.working_set());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn service_churn_mirrors_store() {
        let backend = Arc::new(MemoryStore::new());
        let services = Arc::new(Services::new(params(1), WorkingSet::new()));
        let (cancel, task) = {
            let services = services.clone();
            churn(Kind::Services, backend.clone(), 10, move |synced| {
                services.next(synced)
            })
            .await
        };

        assert!(backend.writes() > 11, "no churn happened");
        assert_mirrors(&backend, Kind::Services, services.working_set());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test(tokio::test(start_paused = true))]
    async fn endpoint_churn_mirrors_store() {
        let backend = Arc::new(MemoryStore::new());
        let params = params(1);
        let nodes = Arc::new(Nodes::new(params.clone(), WorkingSet::new()));
        let identities = Arc::new(Identities::new(params.clone(), WorkingSet::new()));
        for _ in 0..5 {
            nodes.next(false).unwrap();
            identities.next(false).unwrap();
        }
        let endpoints = Arc::new(Endpoints::new(
            params,
            WorkingSet::new(),
            nodes.clone(),
            identities.clone(),
        ));
        let (cancel, task) = {
            let endpoints = endpoints.clone();
            churn(Kind::Endpoints, backend.clone(), 10, move |synced| {
                endpoints.next(synced)
            })
            .await
        };

        assert!(backend.writes() > 11, "no churn happened");
        assert_mirrors(&backend, Kind::Endpoints, endpoints.working_set());
        let live_ids: BTreeSet<u32> = identities
            .working_set()
            .values()
            .iter()
            .map(|identity| identity.id)
            .collect();
        let prefix = Kind::Endpoints.data_prefix("cilium", "cluster-001");
        for endpoint in endpoints.working_set().values() {
            let stored = backend
                .get(&format!("{prefix}/{}", endpoint.key()))
                .unwrap();
            let stored: serde_json::Value = serde_json::from_slice(&stored).unwrap();
            assert_eq!(stored["ID"], endpoint.id);
            assert!(live_ids.contains(&endpoint.id));
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
