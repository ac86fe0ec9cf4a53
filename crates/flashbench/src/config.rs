//! Benchmark configuration and compile-time defaults
//!
//! The constants mirror the bench firmware this crate grew out of; the
//! runtime [`BenchConfig`] starts from them and is adjusted per invocation
//! (trial count from the console, clocks clamped by the chip envelope).

use embassy_time::Duration;
use heapless::Vec;
use spi_nor::{ScratchWindow, WaitPolicy};

/// Hz in one MHz.
pub const MHZ: u32 = 1_000_000;

/// Whole MHz in `hz`, for headings.
#[allow(clippy::arithmetic_side_effects)] // MHZ is non-zero
pub const fn whole_mhz(hz: u32) -> u32 {
    hz / MHZ
}

/// Most read clocks one sweep may visit.
pub const MAX_CLOCKS: usize = 8;

/// Read clocks swept by the full benchmark.
pub const DEFAULT_CLOCKS: [u32; 3] = [12_000_000, 24_000_000, 36_000_000];

/// Read clocks swept by the quick benchmark.
pub const QUICK_CLOCKS: [u32; 2] = [12_000_000, 24_000_000];

/// Clock for erase, program, and their read-back. Marginal wiring still
/// programs reliably here.
pub const SAFE_PROG_HZ: u32 = 12_000_000;

/// Trials per clock for the full benchmark.
pub const DEFAULT_TRIALS: u32 = 100;

/// Trials per clock for the quick benchmark.
pub const QUICK_TRIALS: u32 = 2;

/// First byte of the region the bench may clobber.
pub const SCRATCH_BASE: u32 = 0;

/// Size of the scratch region.
pub const SCRATCH_SIZE: u32 = 0x4_0000;

/// Bytes per timed sequential read.
pub const READ_SEQ_BYTES: u32 = 0x4_0000;

/// Random 256-byte reads per trial.
pub const RAND_ITERS: u32 = 16;

/// Sector erase deadline before the chip envelope raises it.
pub const ERASE_TIMEOUT_MS: u64 = 800;

/// Page program deadline.
pub const PROGRAM_TIMEOUT_MS: u64 = 5;

/// Trials between breathers.
pub const BREATHER_EVERY: u32 = 8;

/// Length of one breather.
pub const BREATHER_MS: u64 = 2;

/// Clock whose aggregate row drives chip identification.
pub const IDENTIFY_REF_HZ: u32 = 12_000_000;

/// Backup/restore size when the JEDEC capacity byte is not a density code.
pub const DEFAULT_CHIP_BYTES: u32 = 0x80_0000;

/// Per-operation erase deadline during restore.
pub const RESTORE_ERASE_TIMEOUT_MS: u64 = 5000;

/// Per-page program deadline during restore.
pub const RESTORE_PROGRAM_TIMEOUT_MS: u64 = 100;

/// Rejected [`BenchConfig`] adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BenchConfigError {
    /// More than [`MAX_CLOCKS`] clocks.
    #[error("at most 8 clocks per sweep")]
    TooManyClocks,
    /// Clocks must be strictly ascending and non-zero.
    #[error("clocks must be non-zero and strictly ascending")]
    NotAscending,
}

/// One benchmark invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    /// Trials per clock. Zero produces "no data" aggregates.
    pub trials: u32,
    /// Read clocks, ascending.
    pub clocks: Vec<u32, MAX_CLOCKS>,
    /// Requested erase/program clock (clamped by the chip envelope).
    pub prog_clock_hz: u32,
    /// Region erased and programmed by the trials.
    pub window: ScratchWindow,
    /// Bytes per sequential read.
    pub read_seq_bytes: u32,
    /// Random reads per trial.
    pub rand_iters: u32,
    /// Erase the whole window before the first clock.
    pub pre_erase: bool,
    /// Append one sample row per measurement.
    pub persist_samples: bool,
    /// Append one aggregate row per clock.
    pub persist_aggregates: bool,
    /// Wait used after each sector erase.
    pub erase_wait: WaitPolicy,
    /// Wait used after each page program.
    pub program_wait: WaitPolicy,
    /// Pause after every `breather_every` trials; zero disables.
    pub breather_every: u32,
    /// Breather length.
    pub breather: Duration,
}

impl BenchConfig {
    /// Two trials at 12 and 24 MHz, nothing persisted.
    pub fn quick() -> Self {
        let mut cfg = Self::default().with_trials(QUICK_TRIALS);
        cfg.clocks = QUICK_CLOCKS.iter().copied().collect();
        cfg
    }

    /// Override the trial count.
    #[must_use]
    pub fn with_trials(mut self, trials: u32) -> Self {
        self.trials = trials;
        self
    }

    /// Persist sample and aggregate rows.
    #[must_use]
    pub fn saving(mut self, save: bool) -> Self {
        self.persist_samples = save;
        self.persist_aggregates = save;
        self
    }

    /// Replace the clock list.
    pub fn with_clocks(mut self, clocks: &[u32]) -> Result<Self, BenchConfigError> {
        if clocks.len() > MAX_CLOCKS {
            return Err(BenchConfigError::TooManyClocks);
        }
        let ascending =
            !clocks.contains(&0) && clocks.windows(2).all(|w| matches!(w, [a, b] if a < b));
        if !ascending {
            return Err(BenchConfigError::NotAscending);
        }
        self.clocks = clocks.iter().copied().collect();
        Ok(self)
    }

    /// Replace the scratch window.
    #[must_use]
    pub fn with_window(mut self, window: ScratchWindow) -> Self {
        self.window = window;
        self
    }

    /// Whether trial `trial` (1-based) is followed by a breather.
    #[allow(clippy::arithmetic_side_effects)] // breather_every checked non-zero
    pub fn breather_after(&self, trial: u32) -> bool {
        self.breather_every != 0 && trial % self.breather_every == 0
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        let window =
            ScratchWindow::new(SCRATCH_BASE, SCRATCH_SIZE).unwrap_or(ScratchWindow::FIRST_SECTOR);
        Self {
            trials: DEFAULT_TRIALS,
            clocks: DEFAULT_CLOCKS.iter().copied().collect(),
            prog_clock_hz: SAFE_PROG_HZ,
            window,
            read_seq_bytes: READ_SEQ_BYTES,
            rand_iters: RAND_ITERS,
            pre_erase: false,
            persist_samples: false,
            persist_aggregates: false,
            erase_wait: WaitPolicy::cooperative(ERASE_TIMEOUT_MS),
            program_wait: WaitPolicy::cooperative(PROGRAM_TIMEOUT_MS),
            breather_every: BREATHER_EVERY,
            breather: Duration::from_millis(BREATHER_MS),
        }
    }
}
