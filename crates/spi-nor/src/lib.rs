//! SPI NOR flash driver with timed primitives
//!
//! Drives 25-series serial NOR flash over any
//! [`embedded_hal_async::spi::SpiDevice`] and measures what it does.
//!
//! # Layers
//!
//! ```text
//! timed     timed_erase_sector / timed_program_page256 / timed_read_*
//!   ↓
//! wait      WaitPolicy + BusyPoller (WIP polling, deadline, pacing)
//!   ↓
//! transport SpiNor: JEDEC, status, SFDP, read, program, erase, reset
//!   ↓
//! SpiDevice (STM32 SPI, embedded-hal-mock, or sim::SimFlash)
//! ```
//!
//! [`chip::SafeEnvelope`] holds per-part clock and timeout limits, and
//! [`nor::NorStorage`] exposes the chip through `embedded-storage-async`.
//!
//! # Example
//!
//! ```no_run
//! use embedded_hal_async::{delay::DelayNs, spi::SpiDevice};
//! use spi_nor::{FlashAddress, SpiNor, WaitPolicy};
//!
//! async fn erase_first_sector<S: SpiDevice, D: DelayNs>(nor: &mut SpiNor<S, D>) -> Option<i64> {
//!     let result = nor
//!         .timed_erase_sector(FlashAddress::ZERO, &WaitPolicy::cooperative(800))
//!         .await
//!         .ok()?;
//!     (!result.timed_out()).then_some(result.elapsed_us)
//! }
//! ```
//!
//! # Features
//!
//! - `sim`: [`sim::SimFlash`], an in-memory chip behind `SpiDevice` (implies `std`)
//! - `defmt` / `tracing`: log through either backend; neither is silent

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(clippy::unreachable)] // no unreachable!() that isn't documented
#![deny(unused_must_use)]
// all Results must be handled
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::print_stdout)]
#![allow(clippy::doc_markdown)] // opcode names and hex in doc comments
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(async_fn_in_trait)]

#[macro_use]
mod fmt;

pub mod chip;
pub mod command;
pub mod error;
pub mod nor;
pub mod timed;
pub mod transport;
pub mod wait;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use chip::SafeEnvelope;
pub use command::{
    FlashAddress, JedecId, Opcode, SfdpHeader, StatusKind, StatusRegister, PAGE_SIZE, SECTOR_SIZE,
};
pub use error::{ConfigError, Error, WaitError};
pub use nor::{NorStorage, NorStorageError};
pub use timed::{ascending_page, mbps, ScratchWindow, TimedResult, Xorshift32};
pub use transport::SpiNor;
pub use wait::{BusyPoller, Pacing, PollStep, WaitPolicy};
