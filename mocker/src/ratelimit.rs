//! Token bucket rate limiter pacing the churn phase.
use tokio::{
    select,
    time::{sleep_until, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::signal::Cancelled;

/// Token bucket with a burst of one: at most one token is ever banked, so an
/// idle limiter grants a single immediate event and then paces at `qps`.
#[derive(Debug)]
pub struct Limiter {
    /// Time between two tokens, `None` when the rate is zero.
    interval: Option<Duration>,
    /// Instant at which the next token becomes available.
    next: Instant,
}

impl Limiter {
    /// Create a limiter producing `qps` tokens per second.
    ///
    /// A non positive (or non finite) rate never produces a token.
    pub fn new(qps: f64) -> Self {
        let interval = (qps.is_finite() && qps > 0.0).then(|| Duration::from_secs_f64(1.0 / qps));
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Wait for the next token.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let Some(interval) = self.interval else {
            cancel.cancelled().await;
            return Err(Cancelled);
        };

        let at = self.next.max(Instant::now());
        select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            _ = sleep_until(at) => {}
        }
        trace!(?interval, "token granted");
        self.next = at + interval;
        Ok(())
    }
}
