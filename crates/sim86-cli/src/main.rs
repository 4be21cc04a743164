//! Host wrapper around [`sim86_machine::System`] (SPEC_FULL.md §12): not part of the simulation
//! core, just enough `clap` plumbing to boot a ROM image under an optional `[System]` config and
//! run it for a fixed simulated-time slice. Mirrors `aero-machine-cli`'s role of gluing the
//! library crate to a process boundary and using `anyhow` to collect whatever goes wrong there.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sim86_machine::{System, SystemClass};

/// The conventional IBM PC/AT reset vector: real-mode CS:IP `F000:FFF0`, linear `0xFFFF0`.
const RESET_VECTOR_ADDRESS: u32 = 0xFFFF0;

#[derive(Parser, Debug)]
#[command(name = "sim86", about = "Run a ROM image against the sim86 simulation substrate")]
struct Args {
    /// Path to an INI-format system configuration. Defaults to a bare `isapc` system with its
    /// built-in RAM size and CPU frequency when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// ROM image loaded at the CPU's reset vector (`0xFFFF0`) before the first reset.
    #[arg(long)]
    rom: Option<PathBuf>,

    /// Simulated nanoseconds to run before reporting final state and exiting.
    #[arg(long = "run-ns")]
    run_ns: i64,
}

fn build_system(args: &Args) -> Result<System> {
    let system = match &args.config {
        Some(path) => {
            let source = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let config = sim86_config::parse(&source)
                .with_context(|| format!("failed to parse config {}", path.display()))?;
            System::from_config(&config)?
        }
        None => System::new(
            SystemClass::IsaPc,
            SystemClass::IsaPc.default_ram_size(),
            SystemClass::IsaPc.default_cpu_frequency_hz(),
        ),
    };
    Ok(system)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut system = build_system(&args)?;

    if let Some(rom) = &args.rom {
        system
            .load_rom_file(rom, RESET_VECTOR_ADDRESS, None)
            .with_context(|| format!("failed to load ROM {}", rom.display()))?;
    }

    system.initialize()?;
    system.reset();

    let ran_ns = system.execute_slice(args.run_ns);

    let stats = system.cpu().execution_stats();
    println!("ran {ran_ns} simulated ns ({} requested)", args.run_ns);
    println!("halted: {}", system.cpu().is_halted());
    println!(
        "instructions_executed={} cycles_executed={} blocks_compiled={} blocks_invalidated={} exceptions_raised={}",
        stats.instructions_executed,
        stats.cycles_executed,
        stats.blocks_compiled,
        stats.blocks_invalidated,
        stats.exceptions_raised,
    );

    Ok(())
}
