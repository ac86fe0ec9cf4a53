//! Flash bench desktop emulator
//!
//! Runs the same worker loop as the firmware against a simulated NOR chip,
//! with the "microSD card" mapped to a host directory.
//!
//! ```bash
//! cargo run -p firmware --bin emulator --features emulator -- --dir sdcard
//! cargo run -p firmware --bin emulator --features emulator -- --keys "2 5 q"
//! RUST_LOG=debug cargo run -p firmware --bin emulator --features emulator
//! ```

use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use embassy_time::Delay;
use firmware::console::{parse_line, Command};
use firmware::worker::{self, COMMANDS, STATUS};
use flashbench::{TransferBuffers, Workbench};
use platform::storage_local::LocalFileStorage;
use platform::{config, TextSink};
use spi_nor::sim::SimFlash;
use spi_nor::{JedecId, SpiNor};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "emulator")]
#[command(about = "Flash Bench against a simulated SPI NOR chip", long_about = None)]
struct Cli {
    /// Directory standing in for the microSD card
    #[arg(long, env = "FLASH_BENCH_ROOT", default_value = "sdcard")]
    dir: PathBuf,

    /// Simulated part
    #[arg(long, value_enum, default_value_t = Chip::W25q32)]
    chip: Chip,

    /// Keys to run instead of reading stdin (quits at the end)
    #[arg(long)]
    keys: Option<String>,

    /// Force bit 0 of this address to read as zero
    #[arg(long, value_parser = parse_addr)]
    stuck_bit: Option<u32>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Chip {
    /// Winbond W25Q32FV, 4 MB
    W25q32,
    /// Microchip SST26VF016B, 2 MB
    Sst26,
    /// A 1 MB part the envelope table does not know
    Unknown,
}

impl Chip {
    fn build(self) -> SimFlash {
        match self {
            Self::W25q32 => SimFlash::w25q32(),
            Self::Sst26 => SimFlash::sst26vf016b(),
            Self::Unknown => SimFlash::new(1 << 20).with_jedec(JedecId::new(0xC2, 0x20, 0x14)),
        }
    }
}

fn parse_addr(text: &str) -> Result<u32, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("bad hex address {text}: {e}"))
}

/// Transcript straight to the terminal.
struct StdoutSink(std::io::Stdout);

impl TextSink for StdoutSink {
    fn write_text(&mut self, text: &str) {
        let mut out = self.0.lock();
        if out.write_all(text.as_bytes()).and_then(|()| out.flush()).is_err() {
            tracing::warn!("stdout closed");
        }
    }
}

/// Feed commands to the worker from a script or stdin; `Quit` at the end.
fn spawn_feeder(keys: Option<String>) {
    std::thread::spawn(move || {
        let send = |command: Command| embassy_futures::block_on(COMMANDS.send(command));
        match keys {
            Some(script) => parse_line(&script).for_each(send),
            None => {
                for line in std::io::stdin().lock().lines() {
                    match line {
                        Ok(line) => parse_line(&line).for_each(send),
                        Err(e) => {
                            tracing::warn!("stdin: {e}");
                            break;
                        }
                    }
                }
            }
        }
        send(Command::Quit);
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.dir)?;
    tracing::info!("storage root: {}", cli.dir.display());

    let mut sim = cli.chip.build();
    if let Some(addr) = cli.stuck_bit {
        sim.set_stuck_bit(addr, 0);
        tracing::info!("bit 0 at {addr:#08x} stuck low");
    }

    let mut console = StdoutSink(std::io::stdout());
    console.write_text(config::banner());
    console.write_text("\r\n");

    let mut buffers = Box::new(TransferBuffers::new());
    let storage = LocalFileStorage::new(cli.dir);
    let mut bench = Workbench::new(SpiNor::new(sim, Delay), storage, &STATUS, &mut *buffers);

    spawn_feeder(cli.keys);
    worker::serve(&mut bench, COMMANDS.receiver(), &STATUS, &mut console).await;
    Ok(())
}
