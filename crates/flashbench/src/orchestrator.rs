//! Benchmark sweep over read clocks
//!
//! One invocation:
//!
//! 1. **Setup**: identify the chip at the program clock, look up its
//!    [`SafeEnvelope`], clamp clocks and timeouts, optionally pre-erase the
//!    scratch window, open the logs and stamp a session marker.
//! 2. **Per clock**: run the trials. Each trial erases a rotating sector and
//!    programs its first page at the program clock, then switches to the
//!    clock under test for one sequential and several random reads.
//! 3. **Aggregate**: averages and latency ranges, one aggregate row, a
//!    summary in the transcript.
//! 4. **Teardown**: flush the logs and leave the bus at the program clock.
//!
//! Timeouts and verify errors are counted, never fatal. Only a bus error
//! stops the sweep. Storage trouble disables the affected log and the
//! benchmark carries on.

use embassy_time::{Duration, Instant, Timer};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;
use heapless::Vec;
use platform::{config as paths, sink_line, File, SpiClock, Storage, TextSink};
use spi_nor::{
    ascending_page, mbps, Error, JedecId, SafeEnvelope, ScratchWindow, SpiNor, StatusRegister, WaitError,
    WaitPolicy, Xorshift32, PAGE_SIZE, SECTOR_SIZE,
};

use crate::config::{BenchConfig, MAX_CLOCKS};
use crate::log::{open_log, CsvLog};
use crate::record::{BenchmarkAggregate, BenchmarkSample, OpKind, AGGREGATE_HEADER, SAMPLE_HEADER};
use crate::status::{BenchStatus, Phase};

/// Trials between progress lines.
pub const PROGRESS_EVERY: u32 = 10;

#[allow(clippy::cast_possible_truncation)] // 4096 and 256 fit u32
const SECTOR_BYTES: u32 = SECTOR_SIZE as u32;
#[allow(clippy::cast_possible_truncation)]
const PAGE_BYTES: u32 = PAGE_SIZE as u32;

/// Result type of bus-level failures.
pub type BusResult<T, E> = Result<T, Error<E>>;

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Running sum, extremes and count of one quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stat {
    sum: f64,
    min: f64,
    max: f64,
    n: u32,
}

impl Stat {
    /// No samples.
    pub const fn new() -> Self {
        Self {
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            n: 0,
        }
    }

    /// Add one sample.
    pub fn push(&mut self, v: f64) {
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.n = self.n.saturating_add(1);
    }

    /// Samples seen.
    pub const fn count(&self) -> u32 {
        self.n
    }

    /// Arithmetic mean, 0 with no samples.
    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.sum / f64::from(self.n)
        }
    }

    /// Smallest sample, 0 with no samples.
    pub fn min(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.min
        }
    }

    /// Largest sample, 0 with no samples.
    pub fn max(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.max
        }
    }
}

impl Default for Stat {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulators for one read clock. Timed-out operations are counted
/// separately and kept out of the averages.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockStats {
    /// Clock under test.
    pub spi_hz: u32,
    /// Trials completed.
    pub trials: u32,
    /// Sector erase, µs.
    pub erase_us: Stat,
    /// Page program, µs.
    pub prog_us: Stat,
    /// Page program, MB/s.
    pub prog_mbps: Stat,
    /// Sequential read of the whole block, µs.
    pub readseq_us: Stat,
    /// Sequential read, MB/s.
    pub readseq_mbps: Stat,
    /// One random 256-byte read, µs.
    pub readrand_us: Stat,
    /// Per-trial mean of the random reads, MB/s.
    pub readrand_mbps: Stat,
    /// Mismatching bytes over all trials.
    pub verify_errors: u32,
    /// Erases that hit the deadline.
    pub erase_timeouts: u32,
    /// Programs that hit the deadline.
    pub program_timeouts: u32,
}

impl ClockStats {
    /// Empty accumulators for `spi_hz`.
    pub fn new(spi_hz: u32) -> Self {
        Self {
            spi_hz,
            ..Self::default()
        }
    }

    /// Averages as persisted. Zero trials gives the "no data" row.
    pub fn aggregate(&self, timestamp_ms: u64, jedec: JedecId) -> BenchmarkAggregate {
        if self.trials == 0 {
            return BenchmarkAggregate::no_data(timestamp_ms, jedec, self.spi_hz);
        }
        BenchmarkAggregate {
            timestamp_ms,
            jedec,
            spi_hz: self.spi_hz,
            avg_erase_ms: self.erase_us.mean() / 1000.0,
            avg_write256_kbps: self.prog_mbps.mean() * 1024.0,
            avg_readseq_kbps: self.readseq_mbps.mean() * 1024.0,
            avg_readrand_mbps: self.readrand_mbps.mean(),
            verify_errors: self.verify_errors,
            trials: self.trials,
        }
    }

    /// Operations excluded from the averages.
    pub fn timeouts(&self) -> u32 {
        self.erase_timeouts.saturating_add(self.program_timeouts)
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// What setup learned about the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChipInfo {
    /// JEDEC id read at the program clock.
    pub jedec: JedecId,
    /// The SFDP signature was present.
    pub sfdp: bool,
    /// Limits in force for this run.
    pub envelope: SafeEnvelope,
}

/// Read identity and SFDP, report them, and pick the envelope.
pub async fn detect<SPI, D, T>(nor: &mut SpiNor<SPI, D>, sink: &mut T) -> BusResult<ChipInfo, SPI::Error>
where
    SPI: SpiDevice,
    D: DelayNs,
    T: TextSink,
{
    let jedec = nor.read_identity().await?;
    let sfdp = nor.read_sfdp_header().await?.is_valid();
    let envelope = SafeEnvelope::for_jedec(jedec);
    let [m, t, c] = [jedec.manufacturer, jedec.memory_type, jedec.capacity];
    if envelope.is_conservative() {
        sink_line!(sink, "Unknown JEDEC: {:02X} {:02X} {:02X}, using conservative limits.", m, t, c);
    } else {
        sink_line!(sink, "Detected: {} (JEDEC {:02X} {:02X} {:02X})", envelope.name, m, t, c);
    }
    sink_line!(
        sink,
        "# JEDEC={:02X} {:02X} {:02X}  SFDP={}",
        m,
        t,
        c,
        if sfdp { "OK" } else { "N/A" }
    );
    info!("chip {:#x}, sfdp {}", jedec.to_u32(), sfdp);
    Ok(ChipInfo { jedec, sfdp, envelope })
}

/// Erase wait with its deadline raised to the part's minimum.
pub fn clamp_erase_wait(policy: WaitPolicy, envelope: &SafeEnvelope) -> WaitPolicy {
    let floor = Duration::from_millis(u64::from(envelope.erase_timeout_ms));
    policy.with_timeout(policy.timeout.map(|t| t.max(floor)))
}

fn bus_only<E>(e: WaitError<E>) -> Result<(), Error<E>> {
    match e {
        WaitError::Spi(e) => Err(Error::Spi(e)),
        WaitError::Timeout { last_status } => {
            warn!("pre-erase wait gave up, SR1={:#x}", last_status.bits());
            Ok(())
        }
    }
}

/// Erase every sector of `window`, waiting without a deadline.
#[allow(clippy::arithmetic_side_effects)] // KB heading
pub async fn pre_erase<SPI, D, T>(
    nor: &mut SpiNor<SPI, D>,
    window: &ScratchWindow,
    sink: &mut T,
) -> BusResult<(), SPI::Error>
where
    SPI: SpiDevice,
    D: DelayNs,
    T: TextSink,
{
    sink_line!(
        sink,
        "Pre-erasing {} KB at 0x{:06X}...",
        window.size() / 1024,
        window.base().get()
    );
    for index in 0..window.sectors() {
        nor.erase_sector_4k(window.sector(index)).await?;
        if let Err(e) = nor.wait_ready(&WaitPolicy::blocking()).await {
            bus_only(e)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// The optional logs of one run. A log that fails is dropped with a
/// warning and the run continues without it.
pub struct SessionLogs<F> {
    samples: Option<CsvLog<F>>,
    aggregates: Option<CsvLog<F>>,
}

impl<F: File> SessionLogs<F> {
    /// No logging.
    pub const fn disabled() -> Self {
        Self {
            samples: None,
            aggregates: None,
        }
    }

    /// Whether per-run rows are being written.
    pub fn samples_enabled(&self) -> bool {
        self.samples.is_some()
    }

    /// Whether averages are being written.
    pub fn aggregates_enabled(&self) -> bool {
        self.aggregates.is_some()
    }

    async fn sample<T: TextSink>(&mut self, row: &BenchmarkSample, sink: &mut T) {
        let Some(log) = self.samples.as_mut() else {
            return;
        };
        if let Err(e) = log.append(row).await {
            sink_line!(
                sink,
                "WARNING: writing {} failed ({}); per-run rows will not be saved.",
                paths::SAMPLES_PATH,
                e
            );
            warn!("sample log disabled");
            self.samples = None;
        }
    }

    async fn aggregate<T: TextSink>(&mut self, row: &BenchmarkAggregate, sink: &mut T) {
        let Some(log) = self.aggregates.as_mut() else {
            return;
        };
        let written = match log.append(row).await {
            Ok(()) => log.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            sink_line!(
                sink,
                "WARNING: writing {} failed ({}); averages will not be saved.",
                paths::AGGREGATES_PATH,
                e
            );
            warn!("aggregate log disabled");
            self.aggregates = None;
        }
    }

    /// Flush both logs; returns (sample rows, aggregate rows) saved.
    async fn close<T: TextSink>(&mut self, sink: &mut T) -> (u32, u32) {
        let mut saved = (0, 0);
        if let Some(mut log) = self.samples.take() {
            match log.flush().await {
                Ok(()) => saved.0 = log.rows(),
                Err(e) => sink_line!(sink, "WARNING: final sync of {} failed ({}).", paths::SAMPLES_PATH, e),
            }
        }
        if let Some(mut log) = self.aggregates.take() {
            match log.flush().await {
                Ok(()) => {
                    saved.1 = log.rows();
                    sink_line!(sink, "Saved averages to {}", paths::AGGREGATES_PATH);
                }
                Err(e) => sink_line!(sink, "WARNING: final sync of {} failed ({}).", paths::AGGREGATES_PATH, e),
            }
        }
        saved
    }
}

async fn open_optional<'s, S: Storage, T: TextSink>(
    storage: &'s S,
    path: &str,
    header: &str,
    what: &str,
    timestamp_ms: u64,
    sink: &mut T,
) -> Option<CsvLog<S::File<'s>>> {
    let opened = match open_log(storage, path, header).await {
        Ok(mut log) => log.begin_session(timestamp_ms).await.map(|_| log),
        Err(e) => Err(e),
    };
    match opened {
        Ok(log) => Some(log),
        Err(e) => {
            sink_line!(sink, "WARNING: {} not opened ({}); {} will not be saved.", path, e, what);
            warn!("{} not opened", path);
            None
        }
    }
}

/// Open the logs `config` asks for and stamp a session marker in each.
pub async fn open_logs<'s, S: Storage, T: TextSink>(
    storage: &'s S,
    config: &BenchConfig,
    timestamp_ms: u64,
    sink: &mut T,
) -> SessionLogs<S::File<'s>> {
    let mut logs = SessionLogs::disabled();
    if config.persist_aggregates {
        logs.aggregates = open_optional(
            storage,
            paths::AGGREGATES_PATH,
            AGGREGATE_HEADER,
            "averages",
            timestamp_ms,
            sink,
        )
        .await;
    }
    if config.persist_samples {
        logs.samples = open_optional(
            storage,
            paths::SAMPLES_PATH,
            SAMPLE_HEADER,
            "per-run rows",
            timestamp_ms,
            sink,
        )
        .await;
    }
    logs
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// Results for one clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockResult {
    /// Raw accumulators.
    pub stats: ClockStats,
    /// Row derived from them.
    pub aggregate: BenchmarkAggregate,
}

/// Outcome of a benchmark invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    /// Chip identity and limits.
    pub chip: ChipInfo,
    /// Clock used for erase and program.
    pub prog_clock_hz: u32,
    /// Erase wait after clamping.
    pub erase_wait: WaitPolicy,
    /// One entry per clock benchmarked, in order.
    pub clocks: Vec<ClockResult, MAX_CLOCKS>,
    /// Clocks above the envelope.
    pub skipped: Vec<u32, MAX_CLOCKS>,
    /// Sample rows saved.
    pub samples_saved: u32,
    /// Aggregate rows saved.
    pub aggregates_saved: u32,
}

impl BenchReport {
    /// Verify errors over every clock.
    pub fn verify_errors(&self) -> u32 {
        self.clocks
            .iter()
            .fold(0u32, |acc, c| acc.saturating_add(c.stats.verify_errors))
    }
}

struct Plan<'c> {
    config: &'c BenchConfig,
    jedec: JedecId,
    prog_hz: u32,
    erase_wait: WaitPolicy,
    page: [u8; PAGE_SIZE],
    total_steps: u32,
}

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

/// Run the benchmark described by `config`.
pub async fn run_benchmark<SPI, D, S, T>(
    nor: &mut SpiNor<SPI, D>,
    storage: &S,
    config: &BenchConfig,
    status: &BenchStatus,
    sink: &mut T,
) -> BusResult<BenchReport, SPI::Error>
where
    SPI: SpiDevice + SpiClock,
    D: DelayNs,
    S: Storage,
    T: TextSink,
{
    status.set_phase(Phase::Setup);
    nor.set_clock(config.prog_clock_hz);
    let chip = detect(nor, sink).await?;
    let prog_hz = chip.envelope.clamp_write(config.prog_clock_hz);
    nor.set_clock(prog_hz);

    let active = config
        .clocks
        .iter()
        .filter(|&&hz| chip.envelope.allows_read(hz))
        .count();
    let plan = Plan {
        config,
        jedec: chip.jedec,
        prog_hz,
        erase_wait: clamp_erase_wait(config.erase_wait, &chip.envelope),
        page: ascending_page(),
        total_steps: config
            .trials
            .saturating_mul(u32::try_from(active).unwrap_or(u32::MAX)),
    };

    if config.pre_erase {
        pre_erase(nor, &config.window, sink).await?;
    }
    let mut logs = open_logs(storage, config, now_ms(), sink).await;

    status.set_phase(Phase::Benchmark);
    let swept = sweep(nor, &plan, &chip.envelope, &mut logs, status, sink).await;
    let (samples_saved, aggregates_saved) = logs.close(sink).await;
    nor.set_clock(prog_hz);
    let (clocks, skipped) = swept?;

    Ok(BenchReport {
        chip,
        prog_clock_hz: prog_hz,
        erase_wait: plan.erase_wait,
        clocks,
        skipped,
        samples_saved,
        aggregates_saved,
    })
}

type SweepOutcome = (Vec<ClockResult, MAX_CLOCKS>, Vec<u32, MAX_CLOCKS>);

async fn sweep<SPI, D, F, T>(
    nor: &mut SpiNor<SPI, D>,
    plan: &Plan<'_>,
    envelope: &SafeEnvelope,
    logs: &mut SessionLogs<F>,
    status: &BenchStatus,
    sink: &mut T,
) -> BusResult<SweepOutcome, SPI::Error>
where
    SPI: SpiDevice + SpiClock,
    D: DelayNs,
    F: File,
    T: TextSink,
{
    let mut results = Vec::new();
    let mut skipped = Vec::new();
    let mut done = 0u32;

    for &hz in &plan.config.clocks {
        if !envelope.allows_read(hz) {
            sink_line!(sink);
            sink_line!(
                sink,
                "[SKIP] {} Hz is above safe read clock ({} Hz) for this chip.",
                hz,
                envelope.max_read_hz
            );
            let _ = skipped.push(hz);
            continue;
        }
        status.set_clock(hz);
        let stats = run_clock(nor, plan, hz, logs, status, &mut done, sink).await?;
        let aggregate = stats.aggregate(now_ms(), plan.jedec);
        write_summary(&stats, plan.config.read_seq_bytes, sink);
        // a no-data row would later be scored as a real measurement
        if stats.trials > 0 {
            logs.aggregate(&aggregate, sink).await;
        }
        let _ = results.push(ClockResult { stats, aggregate });
    }
    Ok((results, skipped))
}

#[allow(clippy::too_many_arguments, clippy::cast_precision_loss)]
async fn run_clock<SPI, D, F, T>(
    nor: &mut SpiNor<SPI, D>,
    plan: &Plan<'_>,
    hz: u32,
    logs: &mut SessionLogs<F>,
    status: &BenchStatus,
    done: &mut u32,
    sink: &mut T,
) -> BusResult<ClockStats, SPI::Error>
where
    SPI: SpiDevice + SpiClock,
    D: DelayNs,
    F: File,
    T: TextSink,
{
    let cfg = plan.config;
    let window = &cfg.window;
    let mut stats = ClockStats::new(hz);
    debug!("clock {} Hz: {} trials", hz, cfg.trials);

    for trial in 1..=cfg.trials {
        let sector = window.sector_for_trial(trial);

        // erase + program at the program clock
        nor.set_clock(plan.prog_hz);
        let erase = nor.timed_erase_sector(sector, &plan.erase_wait).await?;
        if erase.timed_out() {
            stats.erase_timeouts = stats.erase_timeouts.saturating_add(1);
        } else {
            stats.erase_us.push(erase.elapsed_us as f64);
        }
        logs.sample(
            &BenchmarkSample {
                trial,
                op: OpKind::Erase4k,
                spi_hz: plan.prog_hz,
                addr: sector,
                bytes: SECTOR_BYTES,
                duration_us: erase.elapsed_us,
                mbps: 0.0,
                verify_errors: 0,
                status1_end: erase.end_status,
            },
            sink,
        )
        .await;

        let prog = nor
            .timed_program_page256(sector, &plan.page, &cfg.program_wait)
            .await?;
        let prog_mbps = mbps(u64::from(PAGE_BYTES), prog.elapsed_us);
        stats.verify_errors = stats.verify_errors.saturating_add(prog.mismatches());
        if prog.timed_out() {
            stats.program_timeouts = stats.program_timeouts.saturating_add(1);
        } else {
            stats.prog_us.push(prog.elapsed_us as f64);
            stats.prog_mbps.push(prog_mbps);
        }
        logs.sample(
            &BenchmarkSample {
                trial,
                op: OpKind::Program256,
                spi_hz: plan.prog_hz,
                addr: sector,
                bytes: PAGE_BYTES,
                duration_us: prog.elapsed_us,
                mbps: prog_mbps,
                verify_errors: prog.mismatches(),
                status1_end: prog.end_status,
            },
            sink,
        )
        .await;

        // reads at the clock under test
        nor.set_clock(hz);
        let seq_us = nor
            .timed_read_sequential(window.base(), cfg.read_seq_bytes)
            .await?;
        let seq_mbps = mbps(u64::from(cfg.read_seq_bytes), seq_us);
        stats.readseq_us.push(seq_us as f64);
        stats.readseq_mbps.push(seq_mbps);
        if logs.samples_enabled() {
            let status1_end = nor.status1().await?;
            logs.sample(
                &BenchmarkSample {
                    trial,
                    op: OpKind::ReadSeq,
                    spi_hz: hz,
                    addr: window.base(),
                    bytes: cfg.read_seq_bytes,
                    duration_us: seq_us,
                    mbps: seq_mbps,
                    verify_errors: 0,
                    status1_end,
                },
                sink,
            )
            .await;
        }

        let mut rng = Xorshift32::for_trial(trial, hz);
        let mut rand_sum = 0.0;
        for _ in 0..cfg.rand_iters {
            let (us, addr) = nor.timed_read_random256(window, &mut rng).await?;
            let m = mbps(u64::from(PAGE_BYTES), us);
            stats.readrand_us.push(us as f64);
            rand_sum += m;
            if logs.samples_enabled() {
                let status1_end = nor.status1().await?;
                logs.sample(
                    &BenchmarkSample {
                        trial,
                        op: OpKind::ReadRand,
                        spi_hz: hz,
                        addr,
                        bytes: PAGE_BYTES,
                        duration_us: us,
                        mbps: m,
                        verify_errors: 0,
                        status1_end,
                    },
                    sink,
                )
                .await;
            }
        }
        if cfg.rand_iters > 0 {
            stats.readrand_mbps.push(rand_sum / f64::from(cfg.rand_iters));
        }

        stats.trials = trial;
        *done = done.saturating_add(1);
        status.set_progress(*done, plan.total_steps);
        #[allow(clippy::arithmetic_side_effects)] // PROGRESS_EVERY is non-zero
        let report = trial % PROGRESS_EVERY == 0;
        if report {
            sink_line!(sink, "  Progress: {}/{}...", trial, cfg.trials);
        }
        if cfg.breather_after(trial) {
            Timer::after(cfg.breather).await;
        }
    }
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Human-readable averages for one clock.
#[allow(clippy::arithmetic_side_effects)] // KB heading
pub fn write_summary<T: TextSink>(stats: &ClockStats, read_seq_bytes: u32, sink: &mut T) {
    sink_line!(sink);
    if stats.trials == 0 {
        sink_line!(sink, "No trials run at {} Hz; nothing to average.", stats.spi_hz);
        return;
    }
    let agg = stats.aggregate(0, JedecId::default());
    let seq_kb = read_seq_bytes / 1024;

    sink_line!(sink, "=== Benchmark (avg over {} runs) ===", stats.trials);
    sink_line!(sink, "SPI clock: {} Hz", stats.spi_hz);
    sink_line!(sink);

    sink_line!(sink, "--- Erase 4KB ---");
    sink_line!(sink, "Avg time:  {:.2} ms", agg.avg_erase_ms);
    sink_line!(
        sink,
        "Latency range: min {:.2} ms, max {:.2} ms",
        stats.erase_us.min() / 1000.0,
        stats.erase_us.max() / 1000.0
    );

    sink_line!(sink);
    sink_line!(sink, "--- Write 256B ---");
    sink_line!(
        sink,
        "Avg speed: {:.2} KB/s ({:.3} MB/s)",
        agg.avg_write256_kbps,
        stats.prog_mbps.mean()
    );
    sink_line!(
        sink,
        "Latency range: min {:.2} µs, max {:.2} µs",
        stats.prog_us.min(),
        stats.prog_us.max()
    );

    sink_line!(sink);
    sink_line!(sink, "--- Read {}KB (sequential) ---", seq_kb);
    sink_line!(
        sink,
        "Avg speed: {:.2} KB/s ({:.3} MB/s)",
        agg.avg_readseq_kbps,
        stats.readseq_mbps.mean()
    );
    sink_line!(
        sink,
        "Latency range for {}KB block: min {:.2} ms, max {:.2} ms",
        seq_kb,
        stats.readseq_us.min() / 1000.0,
        stats.readseq_us.max() / 1000.0
    );

    sink_line!(sink);
    sink_line!(sink, "--- Read 256B (random) ---");
    sink_line!(
        sink,
        "Avg speed: {:.2} KB/s ({:.3} MB/s)",
        agg.avg_readrand_mbps * 1024.0,
        agg.avg_readrand_mbps
    );
    sink_line!(
        sink,
        "Per-transaction latency range: min {:.2} µs, max {:.2} µs",
        stats.readrand_us.min(),
        stats.readrand_us.max()
    );

    if stats.timeouts() > 0 {
        sink_line!(
            sink,
            "WARNING: {} erase and {} program timeout(s) left out of the averages.",
            stats.erase_timeouts,
            stats.program_timeouts
        );
    }
    if stats.verify_errors > 0 {
        write_verify_checklist(stats.verify_errors, stats.trials, sink);
    }
}

/// The fixed explanation printed when read-back did not match.
pub fn write_verify_checklist<T: TextSink>(errors: u32, trials: u32, sink: &mut T) {
    sink_line!(
        sink,
        "ERROR: Verify failed - {} mismatched byte(s) across {} run(s).",
        errors,
        trials
    );
    sink_line!(sink, "Explanation: data read back did not match what was written.");
    sink_line!(sink, "Common causes:");
    sink_line!(sink, "  • Sector not erased before programming (must be 0xFF)");
    sink_line!(sink, "  • SPI clock too high for write/verify on this wiring");
    sink_line!(sink, "  • Page program crossing a 256-byte boundary");
    sink_line!(sink, "  • Loose wiring / noisy signals (MISO/MOSI/SCK/CS)");
}

// ---------------------------------------------------------------------------
// Connection test
// ---------------------------------------------------------------------------

/// Marker written by the destructive connection test.
pub const HELLO: &[u8] = b"Hello, Flash!\r\n";

/// Outcome of [`test_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionReport {
    /// Id read at the safe clock.
    pub jedec: JedecId,
    /// Status register 1.
    pub sr1: StatusRegister,
    /// Status register 2.
    pub sr2: StatusRegister,
    /// Mismatches of the write check, when it ran.
    pub write_errors: Option<u32>,
}

impl ConnectionReport {
    /// Something answered and, if checked, wrote back correctly.
    pub fn passed(&self) -> bool {
        !self.jedec.is_absent() && self.write_errors.map_or(true, |e| e == 0)
    }
}

/// Read id and status at `safe_hz`; with `write_at`, also erase that
/// sector, program a marker page, and compare it.
pub async fn test_connection<SPI, D, T>(
    nor: &mut SpiNor<SPI, D>,
    safe_hz: u32,
    write_at: Option<&ScratchWindow>,
    sink: &mut T,
) -> BusResult<ConnectionReport, SPI::Error>
where
    SPI: SpiDevice + SpiClock,
    D: DelayNs,
    T: TextSink,
{
    let destructive = write_at.is_some();
    sink_line!(sink);
    if destructive {
        sink_line!(sink, "=== Test Connection ===");
    } else {
        sink_line!(sink, "=== Test Connection (Non-Destructive) ===");
    }
    nor.set_clock(safe_hz);

    let jedec = nor.read_identity().await?;
    sink_line!(
        sink,
        "JEDEC ID: {:02X} {:02X} {:02X}",
        jedec.manufacturer,
        jedec.memory_type,
        jedec.capacity
    );
    let sr1 = nor.read_status(spi_nor::StatusKind::Primary).await?;
    let sr2 = nor.read_status(spi_nor::StatusKind::Secondary).await?;
    sink_line!(sink, "SR1: {:02X}  SR2: {:02X}", sr1.bits(), sr2.bits());

    let mut write_errors = None;
    if let Some(window) = write_at.filter(|_| !jedec.is_absent()) {
        let addr = window.base();
        sink_line!(sink, "Erasing 4K @0x{:06X}...", addr.get());
        let erase = nor
            .timed_erase_sector(addr, &WaitPolicy::cooperative(crate::config::RESTORE_ERASE_TIMEOUT_MS))
            .await?;
        sink_line!(sink, "Erase took {} us, SR1={:02X}", erase.elapsed_us, erase.end_status.bits());

        let mut page = [0xFFu8; PAGE_SIZE];
        if let Some(head) = page.get_mut(..HELLO.len()) {
            head.copy_from_slice(HELLO);
        }
        sink_line!(sink, "Programming 256 bytes...");
        let prog = nor
            .timed_program_page256(addr, &page, &WaitPolicy::cooperative(crate::config::RESTORE_PROGRAM_TIMEOUT_MS))
            .await?;
        let errors = prog.mismatches();
        sink_line!(
            sink,
            "Verification {} (errors={}). SR1={:02X}",
            if errors == 0 { "PASSED" } else { "FAILED" },
            errors,
            prog.end_status.bits()
        );

        let mut head = [0u8; 32];
        nor.read_data(addr, &mut head).await?;
        sink.write_text("Read-back (32B): ");
        for b in head {
            sink.write_args(format_args!("{b:02X} "));
        }
        sink_line!(sink);
        write_errors = Some(errors);
    }

    let report = ConnectionReport {
        jedec,
        sr1,
        sr2,
        write_errors,
    };
    if jedec.is_absent() {
        sink_line!(sink, "Result: FAILED - device not responding.");
    } else if report.passed() {
        sink_line!(sink, "Result: PASSED - device responding and readable.");
    } else {
        sink_line!(sink, "Result: FAILED - device responding but write check failed.");
    }
    sink_line!(sink, "=== Done ===");
    Ok(report)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::float_cmp,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use platform::BufferSink;
    use spi_nor::sim::SimFlash;

    #[test]
    fn stat_guards_empty() {
        let s = Stat::new();
        assert_eq!((s.mean(), s.min(), s.max(), s.count()), (0.0, 0.0, 0.0, 0));
    }

    #[test]
    fn stat_tracks_extremes() {
        let mut s = Stat::new();
        for v in [3.0, 1.0, 2.0] {
            s.push(v);
        }
        assert_eq!((s.mean(), s.min(), s.max(), s.count()), (2.0, 1.0, 3.0, 3));
    }

    #[test]
    fn zero_trials_is_no_data() {
        let stats = ClockStats::new(12_000_000);
        let agg = stats.aggregate(7, JedecId::new(0xEF, 0x40, 0x16));
        assert_eq!(agg, BenchmarkAggregate::no_data(7, JedecId::new(0xEF, 0x40, 0x16), 12_000_000));
        let mut sink = BufferSink::<256>::new();
        write_summary(&stats, 0x4_0000, &mut sink);
        assert!(sink.as_str().contains("No trials run at 12000000 Hz"));
    }

    #[test]
    fn aggregate_units() {
        let mut stats = ClockStats::new(24_000_000);
        stats.trials = 2;
        stats.erase_us.push(40_000.0);
        stats.erase_us.push(50_000.0);
        stats.prog_mbps.push(0.5);
        stats.readseq_mbps.push(2.0);
        stats.readrand_mbps.push(1.5);
        let agg = stats.aggregate(1, JedecId::default());
        assert_eq!(agg.avg_erase_ms, 45.0);
        assert_eq!(agg.avg_write256_kbps, 512.0);
        assert_eq!(agg.avg_readseq_kbps, 2048.0);
        assert_eq!(agg.avg_readrand_mbps, 1.5);
        assert_eq!(agg.trials, 2);
    }

    #[test]
    fn erase_wait_raised_to_envelope() {
        let env = SafeEnvelope::for_jedec(JedecId::new(0xEF, 0x40, 0x16));
        let clamped = clamp_erase_wait(WaitPolicy::cooperative(800), &env);
        assert_eq!(clamped.timeout, Some(Duration::from_millis(2000)));
        let longer = clamp_erase_wait(WaitPolicy::cooperative(5000), &env);
        assert_eq!(longer.timeout, Some(Duration::from_millis(5000)));
        assert_eq!(clamp_erase_wait(WaitPolicy::blocking(), &env).timeout, None);
    }

    #[test]
    fn checklist_text() {
        let mut sink = BufferSink::<512>::new();
        write_verify_checklist(3, 4, &mut sink);
        let text = sink.as_str();
        assert!(text.starts_with("ERROR: Verify failed - 3 mismatched byte(s) across 4 run(s).\r\n"));
        assert_eq!(text.matches("  • ").count(), 4);
    }

    #[tokio::test]
    async fn connection_passes_and_fails() {
        let mut nor = SpiNor::new(SimFlash::w25q32(), NoopDelay);
        let mut sink = BufferSink::<512>::new();
        let report = test_connection(&mut nor, 12_000_000, None, &mut sink).await.unwrap();
        assert!(report.passed());
        assert_eq!(report.write_errors, None);
        assert!(sink.as_str().contains("JEDEC ID: EF 40 16\r\n"));
        assert!(sink.as_str().contains("Result: PASSED"));

        let mut dead = SpiNor::new(SimFlash::new(1 << 16).with_jedec(JedecId::new(0, 0, 0)), NoopDelay);
        let mut sink = BufferSink::<512>::new();
        let report = test_connection(&mut dead, 12_000_000, None, &mut sink).await.unwrap();
        assert!(!report.passed());
        assert!(sink.as_str().contains("Result: FAILED - device not responding."));
    }

    #[tokio::test]
    async fn connection_write_check() {
        let mut nor = SpiNor::new(SimFlash::w25q32(), NoopDelay);
        let window = ScratchWindow::FIRST_SECTOR;
        let mut sink = BufferSink::<1024>::new();
        let report = test_connection(&mut nor, 12_000_000, Some(&window), &mut sink)
            .await
            .unwrap();
        assert_eq!(report.write_errors, Some(0));
        assert!(sink.as_str().contains("Verification PASSED (errors=0)"));
        assert!(sink.as_str().contains("Read-back (32B): 48 65 6C 6C 6F 2C 20 46"));
        assert_eq!(&nor.device().contents()[..HELLO.len()], HELLO);
    }
}
