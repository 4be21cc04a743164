//! The i8253/8254 programmable interval timer: three 16-bit counters at ports 0x40-0x42 plus a
//! shared control/mode register at 0x43. Channel 0's output drives IRQ0 through a
//! [`crate::pic::Pic8259`] handle; channels 1 and 2 (historically DRAM refresh and the PC speaker)
//! only implement the programming interface, since nothing in this workspace consumes their
//! output.
//!
//! `original_source/` does not carry a PIT implementation (filtered out of the retrieval pack), so
//! this is grounded on the documented 8253 register layout itself plus `sim86-timers::Scheduler`'s
//! existing cycle-driven event contract (§4.7), which channel 0 drives exactly the way the PIT
//! scenario in `sim86-timers`' own tests does (`Scheduler::create_event` with a periodic
//! interval).

use std::cell::RefCell;
use std::rc::Rc;

use sim86_cpu::{Component, ComponentError};
use sim86_mem::Bus;
use sim86_snapshot::{StateLoadError, StateReader, StateWriter};
use sim86_timers::{EventHandle, Scheduler};

use crate::pic::Pic8259;

const IOPORT_CHANNEL_0: u16 = 0x40;
const IOPORT_CHANNEL_2: u16 = 0x42;
const IOPORT_CONTROL: u16 = 0x43;

const NUM_CHANNELS: usize = 3;
const SERIALIZATION_ID: u32 = 0x5049_5431; // "PIT1"

/// The 8253's own input clock, in Hz. Channel reload counts are defined in terms of this rate
/// regardless of the host CPU's clock, so converting a reload value to scheduler cycles needs the
/// ratio between the two, supplied at construction.
pub const PIT_INPUT_FREQUENCY_HZ: f64 = 1_193_182.0;

#[derive(Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    LatchCount,
    LowByteOnly,
    HighByteOnly,
    LowThenHigh,
}

impl AccessMode {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0b00 => AccessMode::LatchCount,
            0b01 => AccessMode::LowByteOnly,
            0b10 => AccessMode::HighByteOnly,
            _ => AccessMode::LowThenHigh,
        }
    }

    fn bits(self) -> u8 {
        match self {
            AccessMode::LatchCount => 0b00,
            AccessMode::LowByteOnly => 0b01,
            AccessMode::HighByteOnly => 0b10,
            AccessMode::LowThenHigh => 0b11,
        }
    }
}

struct Channel {
    mode: u8,
    bcd: bool,
    access_mode: AccessMode,
    reload: u16,
    /// Bytes accumulated from the data port while a `LowThenHigh` write is in progress.
    write_low_pending: Option<u8>,
    latched_value: Option<u16>,
    /// Byte order state for a two-byte read (low first, then high).
    read_high_pending: bool,
    event: Option<EventHandle>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            mode: 0,
            bcd: false,
            access_mode: AccessMode::LowThenHigh,
            reload: 0,
            write_low_pending: None,
            latched_value: None,
            read_high_pending: false,
            event: None,
        }
    }
}

struct Inner {
    channels: [Channel; NUM_CHANNELS],
    scheduler_cycles_per_tick: f64,
    pic: Option<Pic8259>,
}

impl Inner {
    fn rearm_channel_0(&mut self, scheduler: &mut Scheduler) {
        let interval = ((self.channels[0].reload.max(1) as f64) * self.scheduler_cycles_per_tick)
            .round()
            .max(1.0) as i64;
        match self.channels[0].event {
            Some(handle) => {
                scheduler.set_event_interval(handle, interval);
                scheduler.reset_event(handle);
            }
            None => {
                let pic = self.pic.clone();
                let handle = scheduler.create_event(
                    "pit-channel-0",
                    PIT_INPUT_FREQUENCY_HZ,
                    interval,
                    Box::new(move |_cycles, _late| {
                        if let Some(pic) = &pic {
                            pic.set_irq_line(0, true);
                            pic.set_irq_line(0, false);
                        }
                    }),
                );
                scheduler.activate_event(handle);
                self.channels[0].event = Some(handle);
            }
        }
    }

    fn write_control(&mut self, value: u8, scheduler: &mut Scheduler) {
        let channel_select = (value >> 6) & 0x03;
        if channel_select == 3 {
            // Read-back command: not implemented, treated as a no-op (no consumer exercises it).
            return;
        }
        let channel = &mut self.channels[channel_select as usize];
        let access = AccessMode::from_bits((value >> 4) & 0x03);
        if access == AccessMode::LatchCount {
            channel.latched_value = Some(channel.reload);
            return;
        }
        channel.access_mode = access;
        channel.mode = (value >> 1) & 0x07;
        channel.bcd = value & 0x01 != 0;
        channel.write_low_pending = None;
        channel.read_high_pending = false;
        let _ = scheduler;
    }

    fn write_data(&mut self, channel_index: usize, value: u8, scheduler: &mut Scheduler) {
        let channel = &mut self.channels[channel_index];
        let completed_reload = match channel.access_mode {
            AccessMode::LowByteOnly => {
                channel.reload = value as u16;
                true
            }
            AccessMode::HighByteOnly => {
                channel.reload = (value as u16) << 8;
                true
            }
            AccessMode::LowThenHigh => match channel.write_low_pending.take() {
                None => {
                    channel.write_low_pending = Some(value);
                    false
                }
                Some(low) => {
                    channel.reload = low as u16 | ((value as u16) << 8);
                    true
                }
            },
            AccessMode::LatchCount => false,
        };
        if completed_reload && channel_index == 0 {
            self.rearm_channel_0(scheduler);
        }
    }

    fn read_data(&mut self, channel_index: usize) -> u8 {
        let channel = &mut self.channels[channel_index];
        let value = channel.latched_value.unwrap_or(channel.reload);
        let byte = match channel.access_mode {
            AccessMode::HighByteOnly => (value >> 8) as u8,
            AccessMode::LowByteOnly => value as u8,
            _ => {
                if channel.read_high_pending {
                    channel.read_high_pending = false;
                    channel.latched_value = None;
                    (value >> 8) as u8
                } else {
                    channel.read_high_pending = true;
                    value as u8
                }
            }
        };
        byte
    }
}

/// Programmable interval timer, owning its three channels' registers and (for channel 0) the
/// scheduler event that periodically pulses the PIC's IRQ0 line.
pub struct Pit8253 {
    inner: Rc<RefCell<Inner>>,
    scheduler: Rc<RefCell<Scheduler>>,
}

impl Pit8253 {
    /// `cpu_frequency_hz` is used only to convert channel-0 reload counts (defined at the PIT's
    /// fixed 1.193182 MHz input clock) into the scheduler's cycle domain, which this workspace
    /// otherwise measures in CPU cycles (see DESIGN.md's scheduler tick-unit note).
    pub fn new(scheduler: Rc<RefCell<Scheduler>>, pic: Pic8259, cpu_frequency_hz: f64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                channels: [Channel::default(), Channel::default(), Channel::default()],
                scheduler_cycles_per_tick: cpu_frequency_hz / PIT_INPUT_FREQUENCY_HZ,
                pic: Some(pic),
            })),
            scheduler,
        }
    }

    pub fn channel_reload(&self, channel: usize) -> u16 {
        self.inner.borrow().channels[channel].reload
    }
}

impl Component for Pit8253 {
    fn name(&self) -> &str {
        "i8253-pit"
    }

    fn initialize(&mut self, bus: &mut Bus) -> Result<(), ComponentError> {
        let owner = bus.mint_owner_id();
        let ports = bus.ports_mut();

        for channel in 0..NUM_CHANNELS {
            let port = IOPORT_CHANNEL_0 + channel as u16;
            let read_inner = self.inner.clone();
            ports.connect_read_byte(port, owner, Box::new(move |_| read_inner.borrow_mut().read_data(channel)));
            let write_inner = self.inner.clone();
            let scheduler = self.scheduler.clone();
            ports.connect_write_byte(
                port,
                owner,
                Box::new(move |_, value| write_inner.borrow_mut().write_data(channel, value, &mut scheduler.borrow_mut())),
            );
        }

        let write_inner = self.inner.clone();
        let scheduler = self.scheduler.clone();
        ports.connect_write_byte(
            IOPORT_CONTROL,
            owner,
            Box::new(move |_, value| write_inner.borrow_mut().write_control(value, &mut scheduler.borrow_mut())),
        );

        Ok(())
    }

    fn reset(&mut self, _bus: &mut Bus) {
        let mut inner = self.inner.borrow_mut();
        let mut scheduler = self.scheduler.borrow_mut();
        for channel in &mut inner.channels {
            if let Some(handle) = channel.event.take() {
                scheduler.remove_event(handle);
            }
            *channel = Channel::default();
        }
    }

    fn save_state(&self, w: &mut StateWriter) {
        let inner = self.inner.borrow();
        w.write_u32(SERIALIZATION_ID);
        for channel in &inner.channels {
            w.write_u8(channel.mode);
            w.write_u8(channel.bcd as u8);
            w.write_u8(channel.access_mode.bits());
            w.write_u16(channel.reload);
        }
    }

    fn load_state(&mut self, r: &mut StateReader) -> Result<(), StateLoadError> {
        let id = r.read_u32()?;
        if id != SERIALIZATION_ID {
            return Err(StateLoadError::ComponentSetMismatch {
                expected: vec!["i8253-pit".to_string()],
                found: vec![format!("unknown id {id:#x}")],
            });
        }
        let mut inner = self.inner.borrow_mut();
        let mut scheduler = self.scheduler.borrow_mut();
        for channel in &mut inner.channels {
            channel.mode = r.read_u8()?;
            channel.bcd = r.read_u8()? != 0;
            channel.access_mode = AccessMode::from_bits(r.read_u8()?);
            channel.reload = r.read_u16()?;
            channel.write_low_pending = None;
            channel.latched_value = None;
            channel.read_high_pending = false;
            if let Some(handle) = channel.event.take() {
                scheduler.remove_event(handle);
            }
        }
        drop(scheduler);
        drop(inner);
        // Channel 0's periodic IRQ event is not itself part of the save-state: it is fully
        // re-derived from the reload value just restored above, matching how `write_data`
        // arms it the first time a program writes a reload count.
        if self.channel_reload(0) > 0 {
            self.inner.borrow_mut().rearm_channel_0(&mut self.scheduler.borrow_mut());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim86_time::CycleCount;

    fn bus() -> Bus {
        let mut bus = Bus::new(20);
        bus.allocate_ram(0x1000);
        bus.create_ram_region(0, 0xFFF);
        bus
    }

    #[test]
    fn programming_channel_0_arms_a_periodic_event() {
        let scheduler = Rc::new(RefCell::new(Scheduler::new()));
        let pic = Pic8259::new();
        let mut pit = Pit8253::new(scheduler.clone(), pic.clone(), 4_772_728.0);
        let mut bus = bus();
        pit.initialize(&mut bus).unwrap();

        bus.write_io_port_byte(IOPORT_CONTROL, 0b0011_0100); // channel 0, lo/hi, mode 2
        bus.write_io_port_byte(IOPORT_CHANNEL_0, 0x00);
        bus.write_io_port_byte(IOPORT_CHANNEL_0, 0x10); // reload = 0x1000

        assert_eq!(pit.channel_reload(0), 0x1000);
        assert!(scheduler.borrow().downcount() < CycleCount::MAX);
    }

    #[test]
    fn channel_0_firing_pulses_irq0() {
        let scheduler = Rc::new(RefCell::new(Scheduler::new()));
        let pic = Pic8259::new();
        let mut pit = Pit8253::new(scheduler.clone(), pic.clone(), PIT_INPUT_FREQUENCY_HZ);
        let mut bus = bus();
        pit.initialize(&mut bus).unwrap();
        pit.reset(&mut bus);

        bus.write_io_port_byte(IOPORT_CONTROL, 0b0011_0100);
        bus.write_io_port_byte(IOPORT_CHANNEL_0, 0x64);
        bus.write_io_port_byte(IOPORT_CHANNEL_0, 0x00); // reload = 100, 1:1 tick ratio

        let observed_high = std::rc::Rc::new(std::cell::Cell::new(false));
        let sink = observed_high.clone();
        pic.set_irq_line_callback(Box::new(move |state| {
            if state {
                sink.set(true);
            }
        }));
        scheduler.borrow_mut().run(100);
        assert!(observed_high.get());
    }
}
