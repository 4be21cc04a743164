use sim86_time::{cycle_period_ns, CycleCount, SimulationTime};

/// A periodic or one-shot unit of simulated work, driven by the CPU's cycle counter rather than
/// wall-clock time. Mirrors `pce::TimingEvent`: a callback plus a frequency-derived interval and
/// a downcount telling the scheduler how many more cycles can elapse before the callback is due.
pub struct TimingEvent {
    name: String,
    frequency: f64,
    cycle_period: SimulationTime,
    interval: CycleCount,
    downcount: CycleCount,
    time_since_last_run: SimulationTime,
    active: bool,
    callback: Box<dyn FnMut(CycleCount, CycleCount)>,
}

impl TimingEvent {
    /// `interval` is the number of cycles, at `frequency`, between firings. The event starts
    /// inactive; the scheduler activates it explicitly.
    pub fn new(
        name: impl Into<String>,
        frequency: f64,
        interval: CycleCount,
        callback: Box<dyn FnMut(CycleCount, CycleCount)>,
    ) -> Self {
        assert!(interval > 0);
        Self {
            name: name.into(),
            frequency,
            cycle_period: cycle_period_ns(frequency),
            interval,
            downcount: interval,
            time_since_last_run: 0,
            active: false,
            callback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn downcount(&self) -> CycleCount {
        self.downcount
    }

    pub fn interval(&self) -> CycleCount {
        self.interval
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn cycle_period(&self) -> SimulationTime {
        self.cycle_period
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        if active && !self.active {
            self.downcount = self.interval;
            self.time_since_last_run = 0;
        }
        self.active = active;
    }

    /// Sets the downcount directly, e.g. to delay or accelerate the next firing.
    pub(crate) fn reschedule(&mut self, cycles: CycleCount) {
        self.downcount = cycles;
    }

    /// Resets the event as if it had just fired on schedule: downcount returns to a full
    /// interval, any fractional time carried across a frequency change is cleared.
    pub(crate) fn reset(&mut self) {
        self.downcount = self.interval;
        self.time_since_last_run = 0;
    }

    pub(crate) fn set_interval(&mut self, interval: CycleCount) {
        assert!(interval > 0);
        self.interval = interval;
    }

    /// Changing frequency mid-flight rescales the remaining downcount so a timer that's 80% of
    /// the way to firing stays 80% of the way there at the new rate, rather than snapping to a
    /// full interval. `pce::TimingEvent::SetFrequency` does the same proportional rescale.
    pub(crate) fn set_frequency(&mut self, frequency: f64) {
        assert!(frequency > 0.0);
        if self.interval > 0 {
            let elapsed_fraction = 1.0 - (self.downcount as f64 / self.interval as f64).clamp(0.0, 1.0);
            self.frequency = frequency;
            self.cycle_period = cycle_period_ns(frequency);
            self.downcount = ((1.0 - elapsed_fraction) * self.interval as f64).round() as CycleCount;
            if self.downcount < 1 {
                self.downcount = 1;
            }
        } else {
            self.frequency = frequency;
            self.cycle_period = cycle_period_ns(frequency);
        }
    }

    /// Advances the event by `cycles` of global simulation time, invoking the callback once per
    /// interval elapsed (an event whose interval is smaller than the advance fires more than
    /// once, each time reporting how many cycles late it ran so periodic work can resync).
    pub(crate) fn advance(&mut self, cycles: CycleCount) {
        if !self.active {
            return;
        }
        self.downcount -= cycles;
        self.time_since_last_run += sim86_time::cycles_to_time(cycles, self.cycle_period);
        while self.downcount <= 0 {
            let late = -self.downcount;
            (self.callback)(self.interval, late);
            self.downcount += self.interval;
            self.time_since_last_run = 0;
        }
    }

    /// Forces the callback to run now regardless of downcount, as if the full interval (minus
    /// whatever is left) had elapsed, then rearms for the next interval. Used when a write to a
    /// device register needs its effect to be visible before the event would naturally fire.
    pub(crate) fn invoke_early(&mut self) {
        if !self.active {
            return;
        }
        let elapsed = self.interval - self.downcount;
        (self.callback)(elapsed.max(0), 0);
        self.downcount = self.interval;
        self.time_since_last_run = 0;
    }
}
