use sim86_time::CycleCount;

use crate::event::TimingEvent;

/// Stable identifier for a registered event, handed out by `Scheduler::create_event`. Indexes
/// into the scheduler's arena; never reused while the event it named is still registered. This
/// is the "pointer graph -> arena + handle" translation of `pce::System`'s raw `TimingEvent*`
/// list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u32);

/// Drives a set of `TimingEvent`s off a single shared cycle counter. Owns every event it creates;
/// there is no cross-referencing between events.
pub struct Scheduler {
    events: Vec<Option<TimingEvent>>,
    free_slots: Vec<u32>,
    /// Cached `min(downcount over active events)`, recomputed after every mutation that could
    /// change it. The CPU backend polls this to know how many cycles it may execute unattended.
    downcount: CycleCount,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            free_slots: Vec::new(),
            downcount: CycleCount::MAX,
        }
    }

    pub fn create_event(
        &mut self,
        name: impl Into<String>,
        frequency: f64,
        interval: CycleCount,
        callback: Box<dyn FnMut(CycleCount, CycleCount)>,
    ) -> EventHandle {
        let event = TimingEvent::new(name, frequency, interval, callback);
        if let Some(slot) = self.free_slots.pop() {
            self.events[slot as usize] = Some(event);
            EventHandle(slot)
        } else {
            self.events.push(Some(event));
            EventHandle((self.events.len() - 1) as u32)
        }
    }

    pub fn remove_event(&mut self, handle: EventHandle) {
        if self.events[handle.0 as usize].take().is_some() {
            self.free_slots.push(handle.0);
            self.recompute_downcount();
        }
    }

    fn event_mut(&mut self, handle: EventHandle) -> &mut TimingEvent {
        self.events[handle.0 as usize]
            .as_mut()
            .expect("use of a removed event handle")
    }

    fn event(&self, handle: EventHandle) -> &TimingEvent {
        self.events[handle.0 as usize]
            .as_ref()
            .expect("use of a removed event handle")
    }

    pub fn activate_event(&mut self, handle: EventHandle) {
        self.event_mut(handle).set_active(true);
        self.recompute_downcount();
    }

    pub fn deactivate_event(&mut self, handle: EventHandle) {
        self.event_mut(handle).set_active(false);
        self.recompute_downcount();
    }

    pub fn is_event_active(&self, handle: EventHandle) -> bool {
        self.event(handle).is_active()
    }

    pub fn reschedule_event(&mut self, handle: EventHandle, cycles: CycleCount) {
        self.event_mut(handle).reschedule(cycles);
        self.recompute_downcount();
    }

    pub fn reset_event(&mut self, handle: EventHandle) {
        self.event_mut(handle).reset();
        self.recompute_downcount();
    }

    pub fn set_event_interval(&mut self, handle: EventHandle, interval: CycleCount) {
        self.event_mut(handle).set_interval(interval);
        self.recompute_downcount();
    }

    pub fn set_event_frequency(&mut self, handle: EventHandle, frequency: f64) {
        self.event_mut(handle).set_frequency(frequency);
        self.recompute_downcount();
    }

    pub fn invoke_event_early(&mut self, handle: EventHandle) {
        self.event_mut(handle).invoke_early();
        self.recompute_downcount();
    }

    pub fn event_downcount(&self, handle: EventHandle) -> CycleCount {
        self.event(handle).downcount()
    }

    pub fn event_interval(&self, handle: EventHandle) -> CycleCount {
        self.event(handle).interval()
    }

    /// The number of cycles the caller (almost always the active CPU backend) may execute before
    /// any event becomes due. A backend must never execute more than this without calling `run`,
    /// or an event could be skipped entirely rather than merely run late.
    pub fn downcount(&self) -> CycleCount {
        self.downcount
    }

    fn recompute_downcount(&mut self) {
        self.downcount = self
            .events
            .iter()
            .flatten()
            .filter(|e| e.is_active())
            .map(|e| e.downcount())
            .min()
            .unwrap_or(CycleCount::MAX);
    }

    /// Advances every active event by `cycles` of global simulation time, firing any callback
    /// whose downcount reaches zero or below (possibly more than once, for an event whose
    /// interval divides evenly into a large `cycles`), then recomputes the cached downcount.
    pub fn run(&mut self, cycles: CycleCount) {
        if cycles <= 0 {
            return;
        }
        for event in self.events.iter_mut().flatten() {
            event.advance(cycles);
        }
        self.recompute_downcount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn fires_exactly_once_per_interval() {
        let mut sched = Scheduler::new();
        let fires = Rc::new(RefCell::new(Vec::new()));
        let sink = fires.clone();
        let handle = sched.create_event(
            "pit",
            1_000_000.0,
            100,
            Box::new(move |cycles, late| sink.borrow_mut().push((cycles, late))),
        );
        sched.activate_event(handle);
        assert_eq!(sched.downcount(), 100);
        sched.run(100);
        assert_eq!(*fires.borrow(), vec![(100, 0)]);
        assert_eq!(sched.downcount(), 100);
    }

    #[test]
    fn catches_up_multiple_firings_in_one_run() {
        let mut sched = Scheduler::new();
        let count = Rc::new(RefCell::new(0u32));
        let sink = count.clone();
        let handle = sched.create_event(
            "fast",
            1.0,
            10,
            Box::new(move |_cycles, _late| *sink.borrow_mut() += 1),
        );
        sched.activate_event(handle);
        sched.run(35);
        assert_eq!(*count.borrow(), 3);
        assert_eq!(sched.event_downcount(handle), 5);
    }

    #[test]
    fn downcount_reflects_minimum_of_active_events() {
        let mut sched = Scheduler::new();
        let a = sched.create_event("a", 1.0, 1000, Box::new(|_, _| {}));
        let b = sched.create_event("b", 1.0, 50, Box::new(|_, _| {}));
        sched.activate_event(a);
        sched.activate_event(b);
        assert_eq!(sched.downcount(), 50);
        sched.deactivate_event(b);
        assert_eq!(sched.downcount(), 1000);
    }

    #[test]
    fn inactive_events_do_not_contribute_to_downcount_or_fire() {
        let mut sched = Scheduler::new();
        let fired = Rc::new(RefCell::new(false));
        let sink = fired.clone();
        let handle = sched.create_event("x", 1.0, 10, Box::new(move |_, _| *sink.borrow_mut() = true));
        sched.run(100);
        assert!(!*fired.borrow());
        assert_eq!(sched.downcount(), CycleCount::MAX);
        let _ = handle;
    }

    #[test]
    fn invoke_early_fires_immediately_and_rearms() {
        let mut sched = Scheduler::new();
        let fires = Rc::new(RefCell::new(Vec::new()));
        let sink = fires.clone();
        let handle = sched.create_event(
            "rtc",
            1.0,
            1000,
            Box::new(move |cycles, late| sink.borrow_mut().push((cycles, late))),
        );
        sched.activate_event(handle);
        sched.run(300);
        sched.invoke_event_early(handle);
        assert_eq!(*fires.borrow(), vec![(300, 0)]);
        assert_eq!(sched.event_downcount(handle), 1000);
    }
}
