//! Ordered upload of one kind's changes into the key-value store.
use std::{marker::PhantomData, sync::Arc};

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::Utc;
use tokio::{select, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cache::Keyed,
    kinds::{Change, Kind},
    kvstore::KvStore,
    metrics::Metrics,
    signal::{fail_fast, Cancelled, Signal},
};

/// Objects that can be written to the key-value store.
pub trait Marshal: Keyed {
    /// Serialized value stored under the object's key.
    fn marshal(&self) -> Result<Vec<u8>>;
}

#[derive(Debug)]
enum Op {
    Upsert { key: String, value: Vec<u8> },
    Delete { key: String },
    Synced,
}

/// Where one kind of one cluster is published.
#[derive(Clone, Debug)]
pub struct Target {
    pub cluster: String,
    pub kind: Kind,
    pub prefix: String,
}

/// Queue feeding a single uploader, so the store sees changes in enqueue order.
pub struct SyncStore<T> {
    tx: mpsc::Sender<Op>,
    uploader: Option<Uploader>,
    initialized: Signal,
    enqueued: usize,
    armed: bool,
    _value: PhantomData<fn(T)>,
}

impl<T: Marshal> SyncStore<T> {
    pub fn new(
        target: Target,
        backend: Arc<dyn KvStore>,
        metrics: Arc<Metrics>,
        queue_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let initialized = Signal::new();
        let uploader = Uploader {
            data_prefix: target.kind.data_prefix(&target.prefix, &target.cluster),
            synced_key: target.kind.synced_key(&target.prefix, &target.cluster),
            target,
            backend,
            metrics,
            rx,
            initialized: initialized.clone(),
        };
        Self {
            tx,
            uploader: Some(uploader),
            initialized,
            enqueued: 0,
            armed: false,
            _value: PhantomData,
        }
    }

    /// Start the upload loop. It returns once `cancel` fires, or with an error
    /// after cancelling `cancel` when the backend rejects a write.
    pub fn run_background(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<()>>> {
        let uploader = self
            .uploader
            .take()
            .ok_or_else(|| anyhow!("upload loop already started"))?;
        Ok(tokio::spawn(uploader.run(cancel)))
    }

    /// Enqueue a change.
    pub async fn apply(&mut self, cancel: &CancellationToken, change: Change<T>) -> Result<()> {
        match change {
            Change::Upsert(obj) => self.upsert(cancel, &obj).await,
            Change::Delete(obj) => self.delete(cancel, &obj).await,
        }
    }

    pub async fn upsert(&mut self, cancel: &CancellationToken, obj: &T) -> Result<()> {
        let key = obj.key();
        let value = obj
            .marshal()
            .with_context(|| format!("failed to marshal {key}"))?;
        self.send(cancel, Op::Upsert { key, value }).await
    }

    pub async fn delete(&mut self, cancel: &CancellationToken, obj: &T) -> Result<()> {
        self.send(cancel, Op::Delete { key: obj.key() }).await
    }

    /// Arm the synced marker once exactly `count` changes have been enqueued.
    ///
    /// The marker is written after every change enqueued before it, and
    /// [`SyncStore::initialized`] fires once it has been acknowledged.
    pub async fn mark_synced_after(
        &mut self,
        cancel: &CancellationToken,
        count: usize,
    ) -> Result<()> {
        if self.armed {
            bail!("synced marker already armed");
        }
        if self.enqueued != count {
            bail!(
                "synced marker expected after {count} changes, {} enqueued",
                self.enqueued
            );
        }
        self.send(cancel, Op::Synced).await?;
        self.armed = true;
        Ok(())
    }

    /// Fired once the initial synchronization has been acknowledged.
    pub fn initialized(&self) -> Signal {
        self.initialized.clone()
    }

    async fn send(&mut self, cancel: &CancellationToken, op: Op) -> Result<()> {
        select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            sent = self.tx.send(op) => sent.map_err(|_| anyhow!("upload loop stopped"))?,
        }
        self.enqueued += 1;
        Ok(())
    }
}

struct Uploader {
    target: Target,
    data_prefix: String,
    synced_key: String,
    backend: Arc<dyn KvStore>,
    metrics: Arc<Metrics>,
    rx: mpsc::Receiver<Op>,
    initialized: Signal,
}

impl Uploader {
    async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        loop {
            let op = select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                op = self.rx.recv() => op,
            };
            let Some(op) = op else {
                return Ok(());
            };
            select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = self.write(op) => res.map_err(|err| fail_fast(&cancel, err))?,
            }
        }
    }

    async fn write(&self, op: Op) -> Result<()> {
        let cluster = self.target.cluster.as_str();
        let kind = self.target.kind.as_str();
        match op {
            Op::Upsert { key, value } => {
                debug!(cluster, kind, %key, "upserting key");
                let res = self
                    .backend
                    .update(&format!("{}/{key}", self.data_prefix), value)
                    .await;
                self.metrics.record_write(cluster, kind, "upsert", res.is_ok());
                res.with_context(|| format!("failed to upsert {kind} key {key}"))
            }
            Op::Delete { key } => {
                debug!(cluster, kind, %key, "deleting key");
                let res = self
                    .backend
                    .delete(&format!("{}/{key}", self.data_prefix))
                    .await;
                self.metrics.record_write(cluster, kind, "delete", res.is_ok());
                res.with_context(|| format!("failed to delete {kind} key {key}"))
            }
            Op::Synced => {
                let now = Utc::now().to_rfc3339();
                let res = self.backend.update(&self.synced_key, now.into_bytes()).await;
                self.metrics.record_write(cluster, kind, "synced", res.is_ok());
                res.with_context(|| format!("failed to write {kind} synced marker"))?;
                info!(cluster, kind, "initial synchronization completed");
                self.initialized.fire();
                Ok(())
            }
        }
    }
}
