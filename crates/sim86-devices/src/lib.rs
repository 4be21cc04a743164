//! The minimal peripheral set (§4.9): an i8259 interrupt controller, an i8253 interval timer, and
//! a CMOS RTC/NVRAM, each implementing [`sim86_cpu::Component`] so `sim86-machine`'s `System` can
//! drive them through the same init/reset/save/load lifecycle as the CPU itself.

pub mod cmos;
pub mod pic;
pub mod pit;

pub use cmos::CmosRtc;
pub use pic::Pic8259;
pub use pit::{Pit8253, PIT_INPUT_FREQUENCY_HZ};
