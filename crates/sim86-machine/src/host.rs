//! The boundary between `System` and whatever embeds it (§6): display surface, audio mixer,
//! indicator lamps, scan-code/mouse delivery, and status messages. Grounded on
//! `pce/host_interface.h`, collapsed to the subset this workspace's minimal peripheral set
//! (§4.9) can actually drive — none of `sim86-devices`' PIC/PIT/CMOS or `sim86-cpu` ever see a
//! `HostInterface`; only `System` calls into it, exactly as `pce::HostInterface::GetSystem()`
//! implies the relationship runs System -> HostInterface and not the other way around.

/// State transitions `System` reports to the host (`pce::HostInterface::OnSimulation*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

/// Everything a front-end needs to implement to host a [`crate::System`]. Every method has a
/// no-op default; a host only overrides what it cares about (a headless scenario runner overrides
/// nothing at all, see [`NullHostInterface`]).
pub trait HostInterface {
    /// A human-readable status line (`pce::HostInterface::ReportMessage`), e.g. a BIOS POST
    /// message written to the diagnostic port.
    fn report_message(&mut self, message: &str) {
        let _ = message;
    }

    /// Called whenever `System`'s run state changes (`OnSimulationResumed`/`Paused`/`Stopped`).
    fn on_state_change(&mut self, state: RunState) {
        let _ = state;
    }

    /// Emulation speed relative to real time, updated periodically while running.
    fn on_speed_update(&mut self, percent_of_real_time: f32) {
        let _ = percent_of_real_time;
    }

    /// Presents a completed frame. No device in this workspace's minimal peripheral set produces
    /// one (VGA/display adapters are out of scope per §1's Non-goals); kept as a no-op hook so a
    /// host embedding a future display device does not need a trait change.
    fn present_display(&mut self, framebuffer: &[u8], width: u32, height: u32) {
        let _ = (framebuffer, width, height);
    }

    /// Mixes a block of audio samples. Same status as `present_display`: no audio device exists
    /// yet, this is the hook point §6 calls for.
    fn mix_audio(&mut self, samples: &[i16]) {
        let _ = samples;
    }

    /// An indicator lamp changed (e.g. a keyboard LED, or a disk-activity light).
    fn set_indicator(&mut self, name: &str, active: bool) {
        let _ = (name, active);
    }

    /// A scan code arrives from the host's keyboard. No PS/2 controller is implemented in the
    /// minimal peripheral set (§4.9), so `System` does not currently route this anywhere; the
    /// method exists on the trait so a host can be written against the full §6 surface today.
    fn deliver_scancode(&mut self, scancode: u8, key_down: bool) {
        let _ = (scancode, key_down);
    }

    /// A relative mouse motion/button event from the host.
    fn deliver_mouse_event(&mut self, dx: i32, dy: i32, buttons: u8) {
        let _ = (dx, dy, buttons);
    }
}

/// The `HostInterface` used by tests and the CLI's default invocation: every hook is the trait's
/// no-op default. Mirrors `pce-tests/stub_host_interface.h`'s role of letting the core run without
/// a real front-end attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHostInterface;

impl HostInterface for NullHostInterface {}
