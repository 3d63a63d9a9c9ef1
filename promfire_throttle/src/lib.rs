//! The promfire throttle mechanism
//!
//! This library bounds the rate at which promfire emits samples into the
//! remote-write target. Capacity is expressed in abstract units; promfire
//! uses one unit per sample.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use async_trait::async_trait;
use std::num::NonZeroU32;
use tokio::time::{self, Duration, Instant};

pub mod stable;

/// Errors produced by [`Throttle`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// The steady-rate valve refused the request.
    #[error(transparent)]
    Stable(#[from] stable::Error),
}

#[async_trait]
/// Time source driving a [`Throttle`], in microsecond ticks.
pub trait Clock {
    /// Ticks since the clock started
    fn ticks_elapsed(&self) -> u64;
    /// Sleep for `ticks`
    async fn wait(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// [`Clock`] reading `tokio::time`, so a paused test runtime drives it too.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    fn ticks_elapsed(&self) -> u64 {
        let micros = Instant::now().duration_since(self.start).as_micros();
        u64::try_from(micros).unwrap_or(u64::MAX)
    }

    async fn wait(&self, ticks: u64) {
        time::sleep(Duration::from_micros(ticks)).await;
    }
}

/// Token bucket refilling `rate` units per second up to `burst` units.
///
/// The bucket starts full, so the first `burst` units are granted without
/// waiting.
#[derive(Debug)]
pub struct Throttle<C = RealClock> {
    inner: stable::Stable<C>,
}

impl Throttle<RealClock> {
    /// Create a new [`Throttle`] on tokio time.
    #[must_use]
    pub fn new(rate: NonZeroU32, burst: NonZeroU32) -> Self {
        Self::with_clock(rate, burst, RealClock::default())
    }
}

impl<C> Throttle<C>
where
    C: Clock + Sync + Send,
{
    /// Create a new [`Throttle`] driven by `clock`.
    #[must_use]
    pub fn with_clock(rate: NonZeroU32, burst: NonZeroU32, clock: C) -> Self {
        Self {
            inner: stable::Stable::with_clock(rate, burst, clock),
        }
    }

    /// The largest request this throttle will ever grant in one call.
    #[must_use]
    pub fn burst(&self) -> NonZeroU32 {
        self.inner.burst()
    }

    /// Sleep until `request` units are available, then take them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stable`] if `request` exceeds [`Throttle::burst`], such
    /// a request could never be granted.
    pub async fn wait_for(&mut self, request: NonZeroU32) -> Result<(), Error> {
        self.inner.wait_for(request).await?;
        Ok(())
    }
}
