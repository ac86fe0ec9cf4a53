// Desktop/tooling crate: unwrap/expect/panic acceptable in non-embedded code.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod check;
mod doc;
mod emulate;
mod flash;
mod logs;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Flash Bench development tasks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash firmware to STM32H7 hardware via probe-rs
    Flash {
        /// Build and flash release version
        #[arg(short, long)]
        release: bool,
    },
    /// Run the desktop emulator against a simulated chip
    Emulate {
        /// Directory standing in for the microSD card
        #[arg(long, default_value = "sdcard")]
        dir: PathBuf,
        /// Simulated part: w25q32, sst26 or unknown
        #[arg(long, default_value = "w25q32")]
        chip: String,
        /// Console keys to run, then quit (e.g. "2 5 q")
        #[arg(long)]
        keys: Option<String>,
        /// Re-run the key script whenever a source file changes
        #[arg(long, requires = "keys")]
        watch: bool,
    },
    /// Check firmware builds for both hardware and emulator targets
    Check,
    /// Run all tests (unit, integration, and doc)
    Test {
        /// Run only unit tests
        #[arg(long)]
        unit: bool,
        /// Run only integration tests
        #[arg(long)]
        integration: bool,
    },
    /// Build and optionally open documentation
    Doc {
        /// Open documentation in browser
        #[arg(long)]
        open: bool,
    },
    /// Score BENCH.CSV from a copied card against SPICHIPS.CSV
    Identify {
        /// Directory holding BENCH.CSV and SPICHIPS.CSV
        #[arg(long)]
        dir: PathBuf,
    },
    /// Cut RESULTS.CSV and BENCH.CSV back to their last session marker
    EraseSession {
        /// Directory holding the logs
        #[arg(long)]
        dir: PathBuf,
    },
    /// Print RESULTS.CSV from a copied card
    Results {
        /// Directory holding RESULTS.CSV
        #[arg(long)]
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Flash { release } => flash::run(release),
        Commands::Emulate {
            dir,
            chip,
            keys,
            watch,
        } => emulate::run(&emulate::Options { dir, chip, keys }, watch),
        Commands::Check => check::run(),
        Commands::Test { unit, integration } => test::run(unit, integration),
        Commands::Doc { open } => doc::run(open),
        Commands::Identify { dir } => logs::identify(&dir),
        Commands::EraseSession { dir } => logs::erase_session(&dir),
        Commands::Results { dir } => logs::results(&dir),
    }
}
