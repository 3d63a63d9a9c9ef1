//! Stable throttle
//!
//! This throttle refills capacity continuously at a steady rate, up to a
//! fixed burst ceiling.

use std::num::NonZeroU32;

use super::{Clock, RealClock};

// An 'interval' is one second of ticks, each tick being one microsecond. The
// valve accounts capacity in micro-units: a throttle refilling `rate` units per
// interval gains `rate` micro-units every tick, which keeps the arithmetic in
// integers without losing sub-unit progress between calls.
const INTERVAL_TICKS: u64 = 1_000_000;

/// Errors produced by [`Stable`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// The request exceeds the burst and could never be granted.
    #[error("Request exceeds burst capacity")]
    Capacity,
}

/// Steady-rate throttle: a token valve plus the clock that drives it.
#[derive(Debug)]
pub struct Stable<C = RealClock> {
    valve: Valve,
    clock: C,
}

impl<C> Stable<C>
where
    C: Clock + Send + Sync,
{
    pub(crate) async fn wait_for(&mut self, request: NonZeroU32) -> Result<(), Error> {
        loop {
            let slop: u64 = self
                .valve
                .request(self.clock.ticks_elapsed(), request.get())?;
            if slop == 0 {
                break;
            }
            self.clock.wait(slop).await;
        }
        Ok(())
    }

    pub(crate) fn with_clock(rate: NonZeroU32, burst: NonZeroU32, clock: C) -> Self {
        Self {
            valve: Valve::new(rate, burst),
            clock,
        }
    }

    pub(crate) fn burst(&self) -> NonZeroU32 {
        self.valve.burst
    }
}

/// Clock-free core of [`Stable`], driven by explicit tick counts.
#[derive(Debug)]
struct Valve {
    /// Units added per `INTERVAL_TICKS`.
    rate: u64,
    /// The largest number of units the valve will ever hold.
    burst: NonZeroU32,
    /// Current capacity, in micro-units. Never exceeds `burst *
    /// INTERVAL_TICKS`.
    capacity: u64,
    /// The tick at which `capacity` was last refilled.
    last_tick: u64,
}

impl Valve {
    /// Create a new, full, `Valve`.
    fn new(rate: NonZeroU32, burst: NonZeroU32) -> Self {
        Self {
            rate: u64::from(rate.get()),
            burst,
            capacity: u64::from(burst.get()) * INTERVAL_TICKS,
            last_tick: 0,
        }
    }

    fn ceiling(&self) -> u64 {
        u64::from(self.burst.get()) * INTERVAL_TICKS
    }

    /// Refill up to `ticks_elapsed`, then either grant `capacity_request` and
    /// return 0 or return the ticks until it could be granted. Nothing is
    /// drawn unless the request is granted.
    fn request(&mut self, ticks_elapsed: u64, capacity_request: u32) -> Result<u64, Error> {
        if capacity_request == 0 {
            return Ok(0);
        }

        if capacity_request > self.burst.get() {
            return Err(Error::Capacity);
        }

        if ticks_elapsed > self.last_tick {
            let refill = (ticks_elapsed - self.last_tick).saturating_mul(self.rate);
            self.capacity = self.capacity.saturating_add(refill).min(self.ceiling());
            self.last_tick = ticks_elapsed;
        }

        let needed = u64::from(capacity_request) * INTERVAL_TICKS;
        if needed <= self.capacity {
            self.capacity -= needed;
            Ok(0)
        } else {
            Ok((needed - self.capacity).div_ceil(self.rate))
        }
    }
}

#[cfg(test)]
mod test {
    use std::num::NonZeroU32;

    use proptest::{collection, prelude::*};

    use crate::stable::{INTERVAL_TICKS, Valve};

    #[test]
    fn starts_full() {
        let mut valve = Valve::new(NonZeroU32::new(10).unwrap(), NonZeroU32::new(20).unwrap());
        assert_eq!(valve.request(0, 20).unwrap(), 0);
        // Empty now. One unit takes a tenth of a second at ten units per second.
        assert_eq!(valve.request(0, 1).unwrap(), INTERVAL_TICKS / 10);
        assert_eq!(valve.request(INTERVAL_TICKS / 10, 1).unwrap(), 0);
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let mut valve = Valve::new(NonZeroU32::new(10).unwrap(), NonZeroU32::new(20).unwrap());
        assert_eq!(valve.request(0, 20).unwrap(), 0);
        // An hour of idleness still only buys one burst.
        let later = 3_600 * INTERVAL_TICKS;
        assert_eq!(valve.request(later, 20).unwrap(), 0);
        assert!(valve.request(later, 1).unwrap() > 0);
    }

    #[test]
    fn zero_request_is_free() {
        let mut valve = Valve::new(NonZeroU32::MIN, NonZeroU32::MIN);
        assert_eq!(valve.request(0, 1).unwrap(), 0);
        assert_eq!(valve.request(0, 0).unwrap(), 0);
    }

    fn granted_never_exceeds_budget_inner(
        rate: u32,
        burst: u32,
        requests: Vec<(u32, u64)>,
    ) -> Result<(), proptest::test_runner::TestCaseError> {
        let mut valve = Valve::new(
            NonZeroU32::new(rate).unwrap(),
            NonZeroU32::new(burst).unwrap(),
        );

        let mut ticks_elapsed: u64 = 0;
        let mut granted: u64 = 0;

        for (request, pause) in requests {
            ticks_elapsed += pause;
            match valve.request(ticks_elapsed, request) {
                Ok(0) => granted += u64::from(request),
                Ok(slop) => {
                    // Waiting the full slop must be enough.
                    ticks_elapsed += slop;
                    prop_assert!(matches!(valve.request(ticks_elapsed, request), Ok(0)));
                    granted += u64::from(request);
                }
                Err(_) => prop_assert!(request > burst),
            }
            // Over any run the valve hands out at most one burst plus whatever
            // the rate refilled.
            let budget = u128::from(burst) * u128::from(INTERVAL_TICKS)
                + u128::from(ticks_elapsed) * u128::from(rate);
            prop_assert!(u128::from(granted) * u128::from(INTERVAL_TICKS) <= budget);
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn granted_never_exceeds_budget(
            rate in 1..100_000u32,
            burst in 1..200_000u32,
            requests in collection::vec((1..250_000u32, 0..2_000_000u64), 1..100)
        ) {
            granted_never_exceeds_budget_inner(rate, burst, requests)?;
        }
    }
}
