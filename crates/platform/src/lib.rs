//! Platform contracts for the SPI NOR flash bench
//!
//! This crate defines the collaborator interfaces the benchmark core needs
//! from the board, plus host and hardware implementations of them, so the
//! core crates can be developed and tested without physical hardware.
//!
//! # Architecture Layers
//!
//! ```text
//! Application Layer (firmware crate: console, worker task)
//!         ↓
//! Bench Layer (flashbench: orchestrator, identify, backup/restore)
//!         ↓
//! Flash Layer (spi-nor: transport, timed primitives)
//!         ↓
//! Platform contracts (this crate - storage, text sink, SPI clock)
//!         ↓
//! Hardware Layer (Embassy HAL + embedded-sdmmc)
//! ```
//!
//! # Contracts
//!
//! - [`Storage`] / [`File`] - append-log style file access (CSV logs, backup images)
//! - [`TextSink`] - transcript output (console or in-memory buffer)
//! - [`SpiClock`] - re-clock the SPI bus that carries the flash chip
//!
//! # Features
//!
//! - `std`: `std::fs` storage and in-memory mocks (host tests, emulator)
//! - `sdcard`: FAT storage on microSD through `embedded-sdmmc`
//! - `defmt`: defmt derives; [`ConsoleSink`] logs through defmt
//! - `tracing`: [`ConsoleSink`] logs through tracing
//!
//! # Example
//!
//! ```no_run
//! use platform::{File, OpenMode, Storage};
//!
//! async fn append_row<S: Storage>(storage: &S) -> Result<(), S::Error> {
//!     let mut file = storage.open("RESULTS.CSV", OpenMode::Append).await?;
//!     file.write(b"1,ERASE_4K\n").await?;
//!     file.flush().await
//! }
//! ```

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
#![deny(unsafe_op_in_unsafe_fn)] // unsafe fn body is not implicitly unsafe block
#![warn(clippy::print_stdout)] // prefer tracing/defmt over println! in lib code
#![allow(clippy::doc_markdown)] // hex addresses and register names in doc comments
#![allow(clippy::must_use_candidate)] // accessors, callers decide
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(async_fn_in_trait)] // Embassy no_std: single-threaded, Send bounds not needed

pub mod config;
pub mod mocks;
pub mod peripheral;
pub mod sink;
pub mod storage;

#[cfg(any(test, feature = "std"))]
pub mod storage_local;

#[cfg(feature = "sdcard")]
pub mod storage_sdcard;

pub use peripheral::{BitOrder, SpiClock, SpiConfig, SpiMode};
pub use sink::{BufferSink, ConsoleSink, TextSink};
pub use storage::{File, OpenMode, Removable, RemovableError, Storage};
