//! SPI NOR flash bench firmware
//!
//! Board wiring and the task layer around the `flashbench` core: a console
//! task that turns keys into commands, and a flash worker that owns the chip
//! and the storage and runs one action at a time.
//!
//! # Architecture
//!
//! ```text
//! Console task (UART keys / emulator stdin)
//!         ↓  COMMANDS channel
//! Flash worker (worker::serve → flashbench::Workbench)
//!         ↓
//! spi-nor over ClockedSpi        platform::Storage (microSD / host dir)
//!         ↓
//! Platform HAL (Embassy, STM32)
//! ```
//!
//! # Features
//!
//! - `hardware` - Build for the STM32H743 target (embassy, defmt, microSD)
//! - `emulator` - Desktop build against the simulated chip (tokio, tracing)
//! - `std` - Enable standard library (for emulator and testing)
//!
//! # Examples
//!
//! ## Hardware Target
//!
//! ```bash
//! cargo build --release --target thumbv7em-none-eabihf --features hardware
//! ```
//!
//! ## Emulator Target
//!
//! ```bash
//! cargo run -p firmware --bin emulator --features emulator -- --dir sdcard
//! ```

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
// Upgrade relevant warns to deny; keep pedantic as warn (too noisy for firmware)
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Critical correctness: deny these
#![deny(clippy::await_holding_lock)] // holding a blocking Mutex across .await is a bug
#![deny(unsafe_op_in_unsafe_fn)]
// unsafe fn body is not implicitly unsafe block
// Logging discipline (allow println in tests via clippy.toml)
#![warn(clippy::print_stdout)] // prefer tracing/defmt over println! in lib code
#![warn(clippy::dbg_macro)] // dbg! should not be left in committed code
// Intentional allows for this codebase:
#![allow(clippy::module_name_repetitions)] // common in Rust crates; not a real issue
#![allow(clippy::missing_errors_doc)] // most errors are self-explanatory
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(async_fn_in_trait)] // Embassy no_std: single-threaded, Send bounds not needed

pub mod boot;
pub mod clocked;
pub mod console;
pub mod worker;

pub use clocked::ClockedSpi;
pub use console::{parse_key, Command};
pub use worker::{COMMANDS, STATUS};
