//! Sample rate limiting
//!
//! A single [`RateLimiter`] is shared by every task writing replicas. It wraps
//! a [`promfire_throttle::Throttle`] refilling `samples_per_second` units per
//! second with a burst of twice that, one unit per sample.

use std::num::NonZeroU32;

use metrics::gauge;
use promfire_signal::Watcher;
use promfire_throttle::{Clock, RealClock, Throttle};
use tokio::sync::Mutex;
use tracing::debug;

/// Errors produced by [`RateLimiter`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// The run was cancelled while waiting for capacity.
    #[error("Rate limiter wait abandoned due to shutdown")]
    Shutdown,
    /// The request could never be satisfied.
    #[error("Requested {requested} samples, more than the burst capacity of {burst}")]
    Capacity {
        /// Samples requested
        requested: usize,
        /// Burst capacity of the limiter
        burst: NonZeroU32,
    },
    /// The underlying throttle failed.
    #[error(transparent)]
    Throttle(#[from] promfire_throttle::Error),
}

/// Token-bucket limiter bounding samples written per second.
#[derive(Debug)]
pub struct RateLimiter<C = RealClock> {
    throttle: Mutex<Throttle<C>>,
    burst: NonZeroU32,
}

impl RateLimiter<RealClock> {
    /// Create a new, full, [`RateLimiter`] admitting `samples_per_second`
    /// steadily with bursts of twice that.
    #[must_use]
    pub fn new(samples_per_second: NonZeroU32) -> Self {
        Self::with_clock(samples_per_second, RealClock::default())
    }
}

impl<C> RateLimiter<C>
where
    C: Clock + Send + Sync,
{
    /// Create a new [`RateLimiter`] driven by `clock`.
    #[must_use]
    pub fn with_clock(samples_per_second: NonZeroU32, clock: C) -> Self {
        let burst = samples_per_second.saturating_add(samples_per_second.get());
        gauge!("samples_per_second").set(f64::from(samples_per_second.get()));
        debug!(
            samples_per_second = samples_per_second.get(),
            burst = burst.get(),
            "Rate limiter initialized"
        );
        Self {
            throttle: Mutex::new(Throttle::with_clock(samples_per_second, burst, clock)),
            burst,
        }
    }

    /// The largest number of samples a single [`RateLimiter::acquire`] may
    /// request.
    #[must_use]
    pub fn burst(&self) -> NonZeroU32 {
        self.burst
    }

    /// Wait until `samples` units are available and consume them.
    ///
    /// Requesting zero samples returns immediately. Waiters are served in
    /// arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if `shutdown` fires before capacity is
    /// available, in which case nothing is consumed, and
    /// [`Error::Capacity`] if `samples` exceeds [`RateLimiter::burst`].
    pub async fn acquire(&self, samples: usize, shutdown: &mut Watcher) -> Result<(), Error> {
        if samples == 0 {
            return Ok(());
        }
        let request = u32::try_from(samples)
            .ok()
            .and_then(NonZeroU32::new)
            .filter(|request| *request <= self.burst)
            .ok_or(Error::Capacity {
                requested: samples,
                burst: self.burst,
            })?;

        let wait = async {
            let mut throttle = self.throttle.lock().await;
            throttle.wait_for(request).await
        };

        tokio::select! {
            biased;

            () = shutdown.recv() => Err(Error::Shutdown),
            result = wait => Ok(result?),
        }
    }
}
