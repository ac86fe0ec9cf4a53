//! Console actions and their dispatch
//!
//! The flash worker owns a [`Workbench`] and runs one [`Action`] at a time.
//! Every action writes a transcript that goes both to the caller's sink and
//! into the shared [`BenchStatus`], so an observer that missed the console
//! output can still fetch it.

use core::fmt;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;
use platform::{config as paths, sink_line, File, OpenMode, SpiClock, Storage, TextSink};
use spi_nor::{Error, JedecId, SafeEnvelope, SpiNor};

use crate::backup::{self, BackupError, TransferBuffers, TransferPolicy};
use crate::config::{BenchConfig, DEFAULT_TRIALS, QUICK_CLOCKS, QUICK_TRIALS};
use crate::identify::{self, IdentifyError, IdentifyWeights};
use crate::log::{self, LineReader, LogError, SessionErase};
use crate::orchestrator::{run_benchmark, test_connection};
use crate::status::{BenchStatus, Phase, StatusSnapshot};

/// Something the operator can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Read identity and status; optionally erase, program, and verify the
    /// first scratch sector.
    TestConnection {
        /// Also run the destructive write check.
        write_check: bool,
    },
    /// Full sweep over the configured clocks.
    RunBenchmark {
        /// Trials per clock.
        trials: u32,
        /// Persist per-run and aggregate rows.
        save: bool,
    },
    /// Two trials at 12 and 24 MHz, nothing saved.
    QuickBenchmark,
    /// Dump the per-run log.
    ReadResults,
    /// Cut both logs back to their last session marker.
    EraseLastSession,
    /// Score the saved averages against the catalog.
    Identify,
    /// Advisory state and storage overview.
    Status,
    /// Copy the whole chip into the backup image.
    Backup,
    /// Write the backup image back to the chip.
    Restore {
        /// Read back and compare every sector.
        verify: bool,
    },
}

impl Action {
    /// Action for a console key, `None` for keys that are not actions.
    pub const fn from_menu_key(key: char) -> Option<Self> {
        Some(match key {
            '1' => Self::RunBenchmark {
                trials: DEFAULT_TRIALS,
                save: false,
            },
            '2' => Self::TestConnection { write_check: false },
            '3' => Self::RunBenchmark {
                trials: DEFAULT_TRIALS,
                save: true,
            },
            '4' => Self::ReadResults,
            '5' => Self::QuickBenchmark,
            '6' => Self::EraseLastSession,
            '7' => Self::Identify,
            '8' => Self::Backup,
            '9' => Self::Restore { verify: true },
            's' | 'S' => Self::Status,
            'w' | 'W' => Self::TestConnection { write_check: true },
            _ => return None,
        })
    }

    /// Phase published while the action runs.
    pub const fn phase(self) -> Phase {
        match self {
            Self::RunBenchmark { .. } | Self::QuickBenchmark => Phase::Setup,
            Self::Identify => Phase::Identify,
            Self::Backup => Phase::Backup,
            Self::Restore { .. } => Phase::Restore,
            Self::TestConnection { .. } | Self::ReadResults | Self::EraseLastSession | Self::Status => {
                Phase::Maintenance
            }
        }
    }

    /// Whether the action erases or programs the chip.
    pub const fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::TestConnection { write_check: true }
                | Self::RunBenchmark { .. }
                | Self::QuickBenchmark
                | Self::Restore { .. }
        )
    }
}

/// Console menu, one option per line.
pub const MENU: &[&str] = &[
    "1: Run Benchmark (summary only)",
    "2: Run Test Connection",
    "3: Run Benchmark and Save Results (per-run + averages)",
    "4: Read Results (dump RESULTS.CSV)",
    "5: Quick Benchmark (2 runs at 12/24 MHz, summary only)",
    "6: Erase last saved session from RESULTS.CSV and BENCH.CSV",
    "7: Identify Chip (uses 12 MHz averages)",
    "8: Backup flash to BACKUP.BIN",
    "9: Restore flash from BACKUP.BIN (with verify)",
    "w: Test Connection with write check (erases one sector)",
    "s: Show status",
    "m: Show this menu",
];

/// Print the menu and prompt.
pub fn write_menu<T: TextSink>(sink: &mut T) {
    sink_line!(sink);
    sink_line!(sink);
    sink_line!(sink, "=== {} ===", paths::APP_NAME);
    for line in MENU {
        sink_line!(sink, "{}", line);
    }
    sink.write_text("> ");
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an action stopped. `S` is the SPI error, `F` the storage error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActionError<S, F> {
    /// Bus failure outside backup/restore.
    Flash(Error<S>),
    /// Log access failed.
    Log(LogError<F>),
    /// Identification could not read its inputs.
    Identify(IdentifyError<F>),
    /// Backup or restore failed.
    Transfer(BackupError<S, F>),
}

impl<S, F> From<Error<S>> for ActionError<S, F> {
    fn from(e: Error<S>) -> Self {
        Self::Flash(e)
    }
}

impl<S, F> From<LogError<F>> for ActionError<S, F> {
    fn from(e: LogError<F>) -> Self {
        Self::Log(e)
    }
}

impl<S, F> From<IdentifyError<F>> for ActionError<S, F> {
    fn from(e: IdentifyError<F>) -> Self {
        Self::Identify(e)
    }
}

impl<S, F> From<BackupError<S, F>> for ActionError<S, F> {
    fn from(e: BackupError<S, F>) -> Self {
        Self::Transfer(e)
    }
}

impl<S: fmt::Debug, F: fmt::Debug> fmt::Display for ActionError<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash(e) => write!(f, "flash: {e}"),
            Self::Log(e) => write!(f, "log: {e}"),
            Self::Identify(e) => write!(f, "identify: {e}"),
            Self::Transfer(e) => write!(f, "{e}"),
        }
    }
}

/// Result of one action.
pub type ActionResult<T, S, F> = Result<T, ActionError<S, F>>;

// ---------------------------------------------------------------------------
// Tee
// ---------------------------------------------------------------------------

/// Writes everything to two sinks.
pub struct Tee<A, B> {
    first: A,
    second: B,
}

impl<A: TextSink, B: TextSink> Tee<A, B> {
    /// Combine two sinks.
    pub const fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: TextSink, B: TextSink> TextSink for Tee<A, B> {
    fn write_text(&mut self, text: &str) {
        self.first.write_text(text);
        self.second.write_text(text);
    }
}

// ---------------------------------------------------------------------------
// Free-standing maintenance actions
// ---------------------------------------------------------------------------

/// Dump `path` line by line. `Ok(false)` when it cannot be opened.
pub async fn read_results<S: Storage, T: TextSink>(
    storage: &S,
    path: &str,
    sink: &mut T,
) -> Result<bool, LogError<S::Error>> {
    sink_line!(sink, "=== Results CSV ===");
    sink_line!(sink);
    let Ok(mut file) = storage.open(path, OpenMode::Read).await else {
        sink_line!(sink, "ERROR: Could not open {}", path);
        return Ok(false);
    };
    let mut lines = LineReader::new(&mut file).await?;
    while let Some(line) = lines.next_line().await? {
        sink_line!(sink, "{}", line.text);
    }
    sink_line!(sink);
    sink_line!(sink, "=== End of File ===");
    Ok(true)
}

/// Cut the sample and aggregate logs back to their last session marker.
pub async fn erase_sessions<S: Storage, T: TextSink>(
    storage: &S,
    sink: &mut T,
) -> Result<u32, LogError<S::Error>> {
    sink_line!(sink, "Erasing last session...");
    let mut erased = 0u32;
    for path in [paths::SAMPLES_PATH, paths::AGGREGATES_PATH] {
        match log::erase_last_session(storage, path).await? {
            SessionErase::NoLog => sink_line!(sink, "{}: no log file.", path),
            SessionErase::NoMarker => {
                sink_line!(sink, "{}: no session marker found; nothing to erase.", path);
            }
            SessionErase::Erased { offset } => {
                erased = erased.saturating_add(1);
                sink_line!(sink, "{}: erased last session starting at byte {}.", path, offset);
            }
        }
    }
    Ok(erased)
}

async fn log_size<S: Storage>(storage: &S, path: &str) -> Option<u64> {
    if !storage.exists(path).await.ok()? {
        return None;
    }
    let file = storage.open(path, OpenMode::Read).await.ok()?;
    Some(file.size())
}

/// Status report from a snapshot taken before the action started.
pub async fn write_status<S: Storage, T: TextSink>(
    storage: &S,
    before: &StatusSnapshot,
    jedec: Option<JedecId>,
    sink: &mut T,
) {
    sink_line!(sink, "=== System Status ===");
    sink_line!(sink);
    sink_line!(sink, "{} {}", paths::banner(), paths::APP_VERSION);
    sink_line!(
        sink,
        "Last action: {} ({}%){}",
        before.phase,
        before.percent,
        if before.complete { ", complete" } else { "" }
    );
    match jedec {
        Some(id) if !id.is_absent() => {
            sink_line!(sink, "Flash: JEDEC {} ({})", id, SafeEnvelope::for_jedec(id).name);
        }
        _ => sink_line!(sink, "Flash: not responding"),
    }
    let card = storage.exists(paths::SAMPLES_PATH).await.is_ok();
    sink_line!(sink, "SD Card: {}", if card { "Connected" } else { "Not Connected" });
    for path in [
        paths::SAMPLES_PATH,
        paths::AGGREGATES_PATH,
        paths::CATALOG_PATH,
        paths::BACKUP_PATH,
    ] {
        match log_size(storage, path).await {
            Some(size) => sink_line!(sink, "  {}: {} bytes", path, size),
            None => sink_line!(sink, "  {}: absent", path),
        }
    }
}

// ---------------------------------------------------------------------------
// Workbench
// ---------------------------------------------------------------------------

/// Everything an action needs: the chip, storage, and shared status.
pub struct Workbench<'b, SPI, D, S> {
    nor: SpiNor<SPI, D>,
    storage: S,
    status: &'b BenchStatus,
    buffers: &'b mut TransferBuffers,
    /// Base configuration for benchmark actions.
    pub config: BenchConfig,
    /// Identification weights.
    pub weights: IdentifyWeights,
    /// Waits used by restore.
    pub transfer: TransferPolicy,
    /// Backup/restore size; `None` derives it from the JEDEC id.
    pub image_bytes: Option<u32>,
}

impl<'b, SPI, D, S> Workbench<'b, SPI, D, S>
where
    SPI: SpiDevice + SpiClock,
    D: DelayNs,
    S: Storage,
{
    /// Workbench with default configuration.
    pub fn new(nor: SpiNor<SPI, D>, storage: S, status: &'b BenchStatus, buffers: &'b mut TransferBuffers) -> Self {
        Self {
            nor,
            storage,
            status,
            buffers,
            config: BenchConfig::default(),
            weights: IdentifyWeights::default(),
            transfer: TransferPolicy::default(),
            image_bytes: None,
        }
    }

    /// The flash transport.
    pub fn nor(&self) -> &SpiNor<SPI, D> {
        &self.nor
    }

    /// The flash transport, mutably.
    pub fn nor_mut(&mut self) -> &mut SpiNor<SPI, D> {
        &mut self.nor
    }

    /// The storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Give back the transport and storage.
    pub fn into_parts(self) -> (SpiNor<SPI, D>, S) {
        (self.nor, self.storage)
    }

    /// Run `action`, copying its transcript to `console`.
    ///
    /// Returns `Ok(true)` when the action reached its goal, `Ok(false)` when
    /// it ran but reported a failure (connection test failed, nothing to
    /// identify), and `Err` when it was stopped.
    pub async fn run<T: TextSink>(
        &mut self,
        action: Action,
        console: &mut T,
    ) -> ActionResult<bool, SPI::Error, S::Error> {
        let status = self.status;
        let before = status.snapshot();
        status.begin(action.phase());
        let mut sink = Tee::new(console, status.sink());
        info!("action: {}", action.phase().as_str());

        let result = self.execute(action, &before, &mut sink).await;
        match &result {
            Ok(_) => {}
            // backup and restore print their own failure line
            Err(ActionError::Transfer(_)) => {}
            Err(e) => sink_line!(sink, "ERROR: {}", e),
        }
        status.finish(matches!(result, Ok(true)));
        result
    }

    async fn live_jedec(&mut self) -> Result<JedecId, Error<SPI::Error>> {
        self.nor.set_clock(self.config.prog_clock_hz);
        self.nor.read_identity().await
    }

    async fn image_bytes(&mut self) -> Result<u32, Error<SPI::Error>> {
        match self.image_bytes {
            Some(bytes) => Ok(bytes),
            None => Ok(backup::default_total_bytes(self.live_jedec().await?)),
        }
    }

    async fn execute<T: TextSink>(
        &mut self,
        action: Action,
        before: &StatusSnapshot,
        sink: &mut T,
    ) -> ActionResult<bool, SPI::Error, S::Error> {
        let status = self.status;
        match action {
            Action::TestConnection { write_check } => {
                let window = write_check.then_some(&self.config.window);
                let report = test_connection(&mut self.nor, self.config.prog_clock_hz, window, sink).await?;
                Ok(report.passed())
            }
            Action::RunBenchmark { trials, save } => {
                let config = self.config.clone().with_trials(trials).saving(save);
                sink_line!(
                    sink,
                    "=== Running Benchmark ({} runs per clock{}) ===",
                    trials,
                    if save { ", saving results" } else { "" }
                );
                run_benchmark(&mut self.nor, &self.storage, &config, status, sink).await?;
                sink_line!(sink);
                sink_line!(sink, "=== Benchmark Complete ===");
                Ok(true)
            }
            Action::QuickBenchmark => {
                let mut config = self.config.clone().with_trials(QUICK_TRIALS).saving(false);
                config.clocks = QUICK_CLOCKS.iter().copied().collect();
                sink_line!(sink, "=== Quick Benchmark ===");
                run_benchmark(&mut self.nor, &self.storage, &config, status, sink).await?;
                sink_line!(sink);
                sink_line!(sink, "=== Quick Benchmark Complete ===");
                Ok(true)
            }
            Action::ReadResults => Ok(read_results(&self.storage, paths::SAMPLES_PATH, sink).await?),
            Action::EraseLastSession => {
                erase_sessions(&self.storage, sink).await?;
                Ok(true)
            }
            Action::Identify => {
                // a silent chip falls back to the id logged with the averages
                let live = self.live_jedec().await.ok();
                let found = identify::identify(&self.storage, live, &self.weights, sink).await?;
                Ok(found.is_some())
            }
            Action::Status => {
                let jedec = self.live_jedec().await.ok();
                write_status(&self.storage, before, jedec, sink).await;
                Ok(true)
            }
            Action::Backup => {
                let total = self.image_bytes().await?;
                backup::backup_to_storage(
                    &mut self.nor,
                    &self.storage,
                    paths::BACKUP_PATH,
                    total,
                    &mut self.buffers.data,
                    status,
                    sink,
                )
                .await?;
                Ok(true)
            }
            Action::Restore { verify } => {
                let total = self.image_bytes().await?;
                backup::restore_from_storage(
                    &mut self.nor,
                    &self.storage,
                    paths::BACKUP_PATH,
                    total,
                    verify,
                    &self.transfer,
                    self.buffers,
                    status,
                    sink,
                )
                .await?;
                Ok(true)
            }
        }
    }
}
