//! Run-wide sample timestamps
//!
//! Replicated samples never carry their source timestamp. Every sample written
//! during a run is stamped by one [`TimestampCoordinator`], which hands out
//! strictly increasing millisecond timestamps no matter how many tasks ask
//! concurrently or how the wall clock behaves.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Gap enforced between consecutive timestamps when the wall clock has not
/// moved past the last one handed out.
const INCREMENT_MS: i64 = 1;

/// A source of wall-clock time in milliseconds since the Unix epoch.
pub trait WallClock {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// [`WallClock`] backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_millis(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_millis() as i64,
            // A clock set before 1970 only delays us until `last + 1` catches
            // up, ordering is unaffected.
            Err(before) => -(before.duration().as_millis() as i64),
        }
    }
}

/// Hands out strictly increasing timestamps, shared across tasks.
#[derive(Debug)]
pub struct TimestampCoordinator<C = SystemClock> {
    last: AtomicI64,
    clock: C,
}

impl TimestampCoordinator<SystemClock> {
    /// Create a coordinator seeded from the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for TimestampCoordinator<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TimestampCoordinator<C>
where
    C: WallClock,
{
    /// Create a coordinator reading time from `clock`, seeded with its
    /// current reading.
    #[must_use]
    pub fn with_clock(clock: C) -> Self {
        Self {
            last: AtomicI64::new(clock.now_millis()),
            clock,
        }
    }

    /// Return a timestamp greater than every timestamp this coordinator has
    /// returned before, from any caller.
    ///
    /// This is the wall clock when it has moved past the previous timestamp,
    /// otherwise the previous timestamp plus one millisecond.
    pub fn next_timestamp(&self) -> i64 {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let now = self.clock.now_millis();
            let next = if now > last {
                now
            } else {
                last.saturating_add(INCREMENT_MS)
            };
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}
