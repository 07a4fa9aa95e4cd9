//! Periodic heartbeat proving the kvstore is being written to.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    select,
    time::{interval, timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kvstore::KvStore;

const WRITE_TIMEOUT: Duration = Duration::from_secs(25);

pub fn heartbeat_key(prefix: &str) -> String {
    format!("{prefix}/.heartbeat")
}

/// Write the current time under `<prefix>/.heartbeat` right away, then every `every`.
///
/// Failures are only logged.
#[tracing::instrument(skip(backend, cancel))]
pub async fn run(
    backend: Arc<dyn KvStore>,
    prefix: String,
    every: Duration,
    cancel: CancellationToken,
) {
    let key = heartbeat_key(&prefix);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let now = Utc::now().to_rfc3339();
        let written = select! {
            biased;
            _ = cancel.cancelled() => return,
            written = timeout(WRITE_TIMEOUT, backend.update(&key, now.into_bytes())) => written,
        };
        match written {
            Ok(Ok(())) => debug!(%key, "heartbeat written"),
            Ok(Err(err)) => warn!(%key, error = %err, "failed to write heartbeat"),
            Err(_) => warn!(%key, timeout = ?WRITE_TIMEOUT, "heartbeat write timed out"),
        }
    }
}
