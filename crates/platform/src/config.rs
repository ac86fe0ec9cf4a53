//! Application configuration and constants
//!
//! Board-independent names and file locations. Everything that depends on
//! the chip under test lives in `flashbench::config` instead.

/// The application name
pub const APP_NAME: &str = "Flash Bench";

/// Application version (synchronized with Cargo.toml)
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-sample benchmark log (8.3 name: the FAT driver has no long names).
pub const SAMPLES_PATH: &str = "RESULTS.CSV";

/// Per-frequency aggregate log.
pub const AGGREGATES_PATH: &str = "BENCH.CSV";

/// Reference catalog of known chips.
pub const CATALOG_PATH: &str = "SPICHIPS.CSV";

/// Raw flash image written by backup and read by restore.
pub const BACKUP_PATH: &str = "BACKUP.BIN";

/// Banner printed at boot and at the top of the status transcript.
pub const fn banner() -> &'static str {
    "Flash Bench - SPI NOR benchmark / backup / restore"
}
