//! One-shot signals and the fleet-wide readiness barrier.
use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use tokio::{select, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, warn};

/// Returned by waits that were interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// A one-shot broadcast. Once fired, every current and future waiter is released.
#[derive(Clone, Debug, Default)]
pub struct Signal {
    token: CancellationToken,
}

impl Signal {
    /// Create a signal that has not fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Firing more than once has no further effect.
    pub fn fire(&self) {
        self.token.cancel()
    }

    /// Report whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires or `cancel` is cancelled, whichever comes first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        select! {
            biased;
            _ = self.token.cancelled() => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }
}

/// Log a fatal error and cancel every task sharing `cancel`.
///
/// The returned error is meant to be propagated up to `main`, which exits non-zero.
pub fn fail_fast(cancel: &CancellationToken, err: anyhow::Error) -> anyhow::Error {
    error!(error = format!("{err:#}"), "fatal error, terminating");
    cancel.cancel();
    err
}

/// Spawn `task` on `tracker`, failing fast if it returns an error.
///
/// The error stays in the returned handle so the caller can report it.
pub fn spawn_fatal<F>(
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    what: &'static str,
    task: F,
) -> JoinHandle<anyhow::Result<()>>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let cancel = cancel.clone();
    tracker.spawn(async move {
        task.await
            .map_err(|err| fail_fast(&cancel, err.context(what)))
    })
}

#[derive(Debug, Default)]
struct WaitGroupState {
    pending: usize,
    stopped: bool,
}

/// A wait group that completes once every allocated slot has fired and
/// [`StoppableWaitGroup::stop`] has been called.
///
/// Stopping is what allows the group to tell "no slots yet" apart from
/// "all slots done".
#[derive(Clone, Debug, Default)]
pub struct StoppableWaitGroup {
    state: Arc<Mutex<WaitGroupState>>,
    done: Signal,
}

impl StoppableWaitGroup {
    /// Create an empty wait group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new slot. Slots allocated after `stop` are inert.
    pub fn add(&self) -> SyncedSlot {
        let mut state = self.state.lock().expect("should be able to acquire lock");
        if state.stopped {
            warn!("slot allocated after the wait group was stopped, ignoring it");
            return SyncedSlot { group: None };
        }
        state.pending += 1;
        SyncedSlot {
            group: Some(self.clone()),
        }
    }

    /// Declare that no further slots will be allocated.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("should be able to acquire lock");
        state.stopped = true;
        self.complete_if_done(&state);
    }

    /// The signal fired on completion.
    pub fn done(&self) -> Signal {
        self.done.clone()
    }

    /// Report whether the wait group has completed.
    pub fn is_complete(&self) -> bool {
        self.done.is_fired()
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("should be able to acquire lock");
        state.pending -= 1;
        self.complete_if_done(&state);
    }

    fn complete_if_done(&self, state: &WaitGroupState) {
        if state.stopped && state.pending == 0 {
            self.done.fire();
        }
    }
}

/// One participant of a [`StoppableWaitGroup`], released by calling [`SyncedSlot::done`].
#[derive(Debug)]
#[must_use]
pub struct SyncedSlot {
    group: Option<StoppableWaitGroup>,
}

impl SyncedSlot {
    /// Mark this participant as synchronized.
    pub fn done(self) {
        if let Some(group) = self.group {
            group.release();
        }
    }
}
