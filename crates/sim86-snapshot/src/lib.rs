//! Save-state binary codec (§6). Low-level primitives (`StateWriter`/`StateReader`) are used by
//! `sim86-cpu` and `sim86-devices` to implement `Component::save_state`/`load_state`; the Bus
//! section codec lives here too since the Bus is foundational. The full system-level assembly
//! (header + bus + components + events) is driven by `sim86-machine`, the only crate that can see
//! every component at once.

mod bus;
mod io;

pub use bus::{load_bus, save_bus, BUS_SERIALIZATION_ID};
pub use io::{StateLoadError, StateReader, StateWriter};
