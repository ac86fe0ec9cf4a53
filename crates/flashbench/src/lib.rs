//! SPI NOR flash benchmark, identification, and backup/restore
//!
//! Everything here is board-independent: the chip is reached through
//! [`spi_nor::SpiNor`], files through [`platform::Storage`], and reports go
//! to a [`platform::TextSink`]. The firmware crate wires these to real
//! hardware; the tests wire them to [`spi_nor::sim::SimFlash`] and
//! [`platform::mocks::MemStorage`].
//!
//! # Modules
//!
//! - [`orchestrator`] - per-clock trial sweep, aggregates, summary, connection test
//! - [`identify`] - score saved averages against the reference catalog
//! - [`backup`] - whole-chip image to and from storage
//! - [`log`] / [`record`] / [`csv`] - CSV logs with session markers
//! - [`status`] - advisory progress and transcript shared with observers
//! - [`actions`] - console actions and their dispatch
//! - [`config`] - defaults and the per-run [`BenchConfig`]
//!
//! # Features
//!
//! - `std`: host storage backends in `platform`
//! - `defmt`: defmt logging and `Format` derives
//! - `tracing`: tracing logging (emulator, host tools)

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(clippy::unreachable)] // no unreachable!() that isn't documented
#![deny(unused_must_use)]
// all Results must be handled
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(async_fn_in_trait)] // Embassy no_std: single-threaded, Send bounds not needed

#[macro_use]
mod fmt;

pub mod actions;
pub mod backup;
pub mod config;
pub mod csv;
pub mod identify;
pub mod log;
pub mod orchestrator;
pub mod record;
pub mod status;

pub use actions::{Action, ActionError, Workbench};
pub use backup::{BackupError, RestoreReport, TransferBuffers, TransferPolicy};
pub use config::{BenchConfig, BenchConfigError};
pub use identify::{IdentificationResult, IdentifyError, IdentifyWeights};
pub use log::{LogError, SessionErase};
pub use orchestrator::{BenchReport, ClockStats, ConnectionReport, Stat};
pub use record::{BenchmarkAggregate, BenchmarkSample, OpKind};
pub use status::{BenchStatus, Phase, StatusSnapshot};
