//! Monotonic time and sleeping, behind a capability chosen at construction.
//!
//! Hosts with a real clock use [`SystemClock`]. Targets that only expose a
//! wrapping millisecond counter use [`TickClock`], which compares stamps with
//! signed modular arithmetic so a counter rollover never looks like a huge
//! elapsed time or a negative one.

use std::time::{Duration, Instant};

/// A point in time, in milliseconds, in the clock's own reference frame.
///
/// Stamps from different clocks are not comparable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stamp(pub u64);

pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Stamp;

    /// Time elapsed since `start`; never negative.
    fn elapsed(&self, start: Stamp) -> Duration;

    /// Block the calling thread.
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn has_timed_out(&self, start: Stamp, timeout: Duration) -> bool {
        self.elapsed(start) >= timeout
    }
}

/// Wall-clock time from [`std::time::Instant`].
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Stamp {
        Stamp(self.origin.elapsed().as_millis() as u64)
    }

    fn elapsed(&self, start: Stamp) -> Duration {
        Duration::from_millis(self.now().0.saturating_sub(start.0))
    }
}

/// A wrapping millisecond tick counter with a power-of-two period.
pub struct TickClock<F> {
    ticks: F,
    period_bits: u32,
}

impl<F> TickClock<F>
where
    F: Fn() -> u64 + Send + Sync,
{
    /// `ticks` returns the raw counter; only its low `period_bits` bits are
    /// used. `period_bits` is clamped to `1..=63`.
    pub fn new(ticks: F, period_bits: u32) -> Self {
        Self {
            ticks,
            period_bits: period_bits.clamp(1, 63),
        }
    }

    fn mask(&self) -> u64 {
        (1u64 << self.period_bits) - 1
    }

    /// `end - start`, normalized into `[-period/2, period/2)`.
    pub fn ticks_diff(&self, end: Stamp, start: Stamp) -> i64 {
        let period = 1u64 << self.period_bits;
        let half = period >> 1;
        let raw = end.0.wrapping_sub(start.0).wrapping_add(half) & self.mask();
        raw as i64 - half as i64
    }
}

impl<F> Clock for TickClock<F>
where
    F: Fn() -> u64 + Send + Sync,
{
    fn now(&self) -> Stamp {
        Stamp((self.ticks)() & self.mask())
    }

    fn elapsed(&self, start: Stamp) -> Duration {
        let diff = self.ticks_diff(self.now(), start);
        Duration::from_millis(diff.max(0) as u64)
    }

    fn has_timed_out(&self, start: Stamp, timeout: Duration) -> bool {
        self.ticks_diff(self.now(), start) >= timeout.as_millis() as i64
    }
}

/// Simulated time for unit tests: sleeping advances the clock instantly and
/// every reading moves it forward by a millisecond, so polling loops always
/// make progress.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn millis(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Stamp {
        Stamp(self.now.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }

    fn elapsed(&self, start: Stamp) -> Duration {
        Duration::from_millis(self.millis().saturating_sub(start.0))
    }

    fn sleep(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_millis() as u64, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    fn counter(bits: u32, start: u64) -> (Arc<AtomicU64>, TickClock<impl Fn() -> u64 + Send + Sync>) {
        let ticks = Arc::new(AtomicU64::new(start));
        let source = ticks.clone();
        (ticks, TickClock::new(move || source.load(Ordering::SeqCst), bits))
    }

    #[test]
    fn tick_clock_measures_across_rollover() {
        let (ticks, clock) = counter(16, 0xFFF0);
        let start = clock.now();
        ticks.store(0x1_0010, Ordering::SeqCst);

        assert_eq!(clock.elapsed(start), Duration::from_millis(0x20));
        assert!(clock.has_timed_out(start, Duration::from_millis(0x20)));
        assert!(!clock.has_timed_out(start, Duration::from_millis(0x21)));
    }

    #[test]
    fn tick_clock_treats_future_stamps_as_not_elapsed() {
        let (ticks, clock) = counter(16, 100);
        let start = clock.now();
        ticks.store(90, Ordering::SeqCst);

        assert_eq!(clock.ticks_diff(clock.now(), start), -10);
        assert_eq!(clock.elapsed(start), Duration::ZERO);
        assert!(!clock.has_timed_out(start, Duration::ZERO));
    }

    #[test]
    fn ticks_diff_normalizes_into_half_period() {
        let (_ticks, clock) = counter(8, 0);
        assert_eq!(clock.ticks_diff(Stamp(127), Stamp(0)), 127);
        assert_eq!(clock.ticks_diff(Stamp(128), Stamp(0)), -128);
        assert_eq!(clock.ticks_diff(Stamp(5), Stamp(250)), 11);
    }

    #[test]
    fn system_clock_elapses() {
        let clock = SystemClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(5));
        assert!(clock.has_timed_out(start, Duration::from_millis(5)));
        assert!(!clock.has_timed_out(start, Duration::from_secs(60)));
    }
}
