//! Cycle-driven event scheduling: the timing substrate every clocked device (PIT, RTC, cached
//! interpreter quantum, CPU backend yield point) hangs off of. See `Scheduler` and `TimingEvent`.

mod event;
mod scheduler;

pub use event::TimingEvent;
pub use scheduler::{EventHandle, Scheduler};
