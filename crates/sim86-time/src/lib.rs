//! Simulation-time and cycle-count primitives shared by the bus, scheduler and CPU backends.
//!
//! `SimulationTime` is the single global monotone clock of the emulator, expressed in
//! nanoseconds. Each CPU additionally has a cycle period derived from its frequency; converting
//! between the two always rounds the same way regardless of which backend or component performs
//! the conversion (time -> cycles rounds up, cycles -> time truncates).

use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Nanoseconds since the system was reset. Signed so that "time remaining" (downcount) can go
/// negative when a backend overruns its slice before yielding.
pub type SimulationTime = i64;

/// A count of CPU clock cycles.
pub type CycleCount = i64;

/// Derives the cycle period (ns/tick) for a CPU running at `frequency_hz`.
pub fn cycle_period_ns(frequency_hz: f64) -> SimulationTime {
    debug_assert!(frequency_hz > 0.0);
    (1_000_000_000.0 / frequency_hz).round() as SimulationTime
}

/// Converts simulated nanoseconds to a cycle count at the given cycle period, rounding up.
///
/// Per the data model invariant, callers must never lose pending simulation time: any fractional
/// cycle remaining after `cycles_to_time` must still be accounted for in the next slice.
pub fn time_to_cycles(time: SimulationTime, cycle_period: SimulationTime) -> CycleCount {
    debug_assert!(cycle_period > 0);
    if time <= 0 {
        return 0;
    }
    (time + cycle_period - 1) / cycle_period
}

/// Converts a cycle count to simulated nanoseconds at the given cycle period, truncating.
pub fn cycles_to_time(cycles: CycleCount, cycle_period: SimulationTime) -> SimulationTime {
    debug_assert!(cycle_period > 0);
    cycles * cycle_period
}

/// A point in simulated time, newtyped so it can't be confused with a raw nanosecond duration
/// (e.g. an event's downcount) by accident at call sites that juggle both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Instant(pub SimulationTime);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub fn as_ns(self) -> SimulationTime {
        self.0
    }
}

impl Add<SimulationTime> for Instant {
    type Output = Instant;
    fn add(self, rhs: SimulationTime) -> Instant {
        Instant(self.0 + rhs)
    }
}

impl AddAssign<SimulationTime> for Instant {
    fn add_assign(&mut self, rhs: SimulationTime) {
        self.0 += rhs;
    }
}

impl Sub<Instant> for Instant {
    type Output = SimulationTime;
    fn sub(self, rhs: Instant) -> SimulationTime {
        self.0 - rhs.0
    }
}

impl Sub<SimulationTime> for Instant {
    type Output = Instant;
    fn sub(self, rhs: SimulationTime) -> Instant {
        Instant(self.0 - rhs)
    }
}

impl SubAssign<SimulationTime> for Instant {
    fn sub_assign(&mut self, rhs: SimulationTime) {
        self.0 -= rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_to_cycles_rounds_up() {
        assert_eq!(time_to_cycles(0, 10), 0);
        assert_eq!(time_to_cycles(1, 10), 1);
        assert_eq!(time_to_cycles(10, 10), 1);
        assert_eq!(time_to_cycles(11, 10), 2);
        assert_eq!(time_to_cycles(-5, 10), 0);
    }

    #[test]
    fn cycles_to_time_truncates() {
        assert_eq!(cycles_to_time(3, 10), 30);
        assert_eq!(cycles_to_time(0, 10), 0);
    }

    #[test]
    fn cycle_period_matches_frequency() {
        // 1 MHz -> 1000 ns/cycle.
        assert_eq!(cycle_period_ns(1_000_000.0), 1000);
        // 100 MHz -> 10 ns/cycle.
        assert_eq!(cycle_period_ns(100_000_000.0), 10);
    }

    #[test]
    fn instant_arithmetic() {
        let a = Instant(100);
        let b = a + 50;
        assert_eq!(b.as_ns(), 150);
        assert_eq!(b - a, 50);
    }
}
