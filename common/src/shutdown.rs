//! Translates process signals into cancellation.
use anyhow::Result;
use futures::StreamExt;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::select;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

/// Cancel `cancellation` as soon as the process receives a termination signal.
///
/// The listener runs on `tracker` and exits once the token is cancelled, whatever the cause.
pub fn cancel_on_signal(tracker: &TaskTracker, cancellation: CancellationToken) -> Result<()> {
    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT, SIGQUIT])?;
    let handle = signals.handle();
    tracker.spawn(async move {
        select! {
            signal = signals.next() => {
                if let Some(signal) = signal {
                    info!(?signal, "signal received");
                    cancellation.cancel();
                }
            }
            _ = cancellation.cancelled() => {}
        }
        handle.close();
    });
    Ok(())
}
