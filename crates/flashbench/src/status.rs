//! Advisory progress shared between the flash worker and its observers
//!
//! The worker is the only writer. Observers (console, service layer) read
//! the atomics without locking; a reader may see `percent` from one clock
//! and `current_hz` from the next. That is fine for a progress display and
//! nothing here is used for control flow except the reset [`Signal`].
//!
//! ```
//! use flashbench::status::{BenchStatus, Phase};
//!
//! static STATUS: BenchStatus = BenchStatus::new();
//!
//! STATUS.begin(Phase::Benchmark);
//! STATUS.set_progress(1, 4);
//! let snap = STATUS.snapshot();
//! assert_eq!(snap.phase, Phase::Benchmark);
//! assert_eq!(snap.percent, 25);
//! assert!(snap.running);
//! ```

use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use platform::TextSink;

/// Bytes of transcript kept for the most recent action.
///
/// Sized for the default sweep (three clocks, 100 trials, progress every
/// ten trials) with room for the verify checklist on every clock.
pub const TRANSCRIPT_CAPACITY: usize = 8192;

/// What the worker is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Phase {
    /// Waiting for an action.
    Idle = 0,
    /// Reading the chip's identity and opening logs.
    Setup = 1,
    /// Running trials.
    Benchmark = 2,
    /// Scoring against the reference catalog.
    Identify = 3,
    /// Copying the chip to storage.
    Backup = 4,
    /// Copying storage to the chip.
    Restore = 5,
    /// Short actions: connection test, log maintenance, status.
    Maintenance = 6,
    /// Last action finished.
    Done = 7,
    /// Last action stopped on an error.
    Failed = 8,
}

impl Phase {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Setup,
            2 => Self::Benchmark,
            3 => Self::Identify,
            4 => Self::Backup,
            5 => Self::Restore,
            6 => Self::Maintenance,
            7 => Self::Done,
            8 => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// Lower-case label for status lines.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Setup => "setup",
            Self::Benchmark => "benchmark",
            Self::Identify => "identify",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Maintenance => "maintenance",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One read of every advisory field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusSnapshot {
    /// Current phase.
    pub phase: Phase,
    /// 0..=100 within the current action.
    pub percent: u8,
    /// An action is executing.
    pub running: bool,
    /// The last action ran to completion.
    pub complete: bool,
    /// Clock being measured, 0 outside a sweep.
    pub current_hz: u32,
}

/// Shared progress, transcript, and reset request.
pub struct BenchStatus {
    phase: AtomicU8,
    percent: AtomicU8,
    running: AtomicBool,
    complete: AtomicBool,
    current_hz: AtomicU32,
    transcript: Mutex<CriticalSectionRawMutex, RefCell<heapless::String<TRANSCRIPT_CAPACITY>>>,
    truncated: AtomicBool,
    reset: Signal<CriticalSectionRawMutex, ()>,
}

impl BenchStatus {
    /// Idle status with an empty transcript. Usable in a `static`.
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Idle as u8),
            percent: AtomicU8::new(0),
            running: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            current_hz: AtomicU32::new(0),
            transcript: Mutex::new(RefCell::new(heapless::String::new())),
            truncated: AtomicBool::new(false),
            reset: Signal::new(),
        }
    }

    /// Start an action: clear the transcript and mark running.
    pub fn begin(&self, phase: Phase) {
        self.clear_transcript();
        self.percent.store(0, Ordering::Relaxed);
        self.current_hz.store(0, Ordering::Relaxed);
        self.complete.store(false, Ordering::Relaxed);
        self.phase.store(phase as u8, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);
    }

    /// Move to another phase of the running action.
    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    /// Publish `done` of `total` steps as a percentage.
    pub fn set_progress(&self, done: u32, total: u32) {
        self.percent.store(percent(done, total), Ordering::Relaxed);
    }

    /// Publish the clock being measured.
    pub fn set_clock(&self, hz: u32) {
        self.current_hz.store(hz, Ordering::Relaxed);
    }

    /// End the running action.
    pub fn finish(&self, ok: bool) {
        let phase = if ok { Phase::Done } else { Phase::Failed };
        self.phase.store(phase as u8, Ordering::Relaxed);
        if ok {
            self.percent.store(100, Ordering::Relaxed);
        }
        self.current_hz.store(0, Ordering::Relaxed);
        self.complete.store(ok, Ordering::Relaxed);
        self.running.store(false, Ordering::Release);
    }

    /// Read every field. Fields may come from different moments.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.running.load(Ordering::Acquire),
            phase: Phase::from_u8(self.phase.load(Ordering::Relaxed)),
            percent: self.percent.load(Ordering::Relaxed),
            complete: self.complete.load(Ordering::Relaxed),
            current_hz: self.current_hz.load(Ordering::Relaxed),
        }
    }

    // -- transcript ---------------------------------------------------------

    /// Append to the transcript; text past the capacity is dropped.
    pub fn append(&self, text: &str) {
        if self.truncated.load(Ordering::Relaxed) {
            return;
        }
        let fits = self.transcript.lock(|t| {
            let mut t = t.borrow_mut();
            if t.push_str(text).is_ok() {
                return true;
            }
            for ch in text.chars() {
                if t.push(ch).is_err() {
                    break;
                }
            }
            false
        });
        if !fits {
            self.truncated.store(true, Ordering::Relaxed);
        }
    }

    /// Forget the transcript.
    pub fn clear_transcript(&self) {
        self.transcript.lock(|t| t.borrow_mut().clear());
        self.truncated.store(false, Ordering::Relaxed);
    }

    /// Run `f` on the transcript while holding the lock.
    pub fn with_transcript<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        self.transcript.lock(|t| f(t.borrow().as_str()))
    }

    /// Whether the transcript lost text.
    pub fn transcript_truncated(&self) -> bool {
        self.truncated.load(Ordering::Relaxed)
    }

    /// A sink that appends here.
    pub fn sink(&self) -> TranscriptSink<'_> {
        TranscriptSink(self)
    }

    // -- reset --------------------------------------------------------------

    /// Ask the worker to return to idle.
    pub fn request_reset(&self) {
        self.reset.signal(());
    }

    /// Consume a pending reset request.
    pub fn take_reset(&self) -> bool {
        self.reset.try_take().is_some()
    }

    /// Wait for the next reset request.
    pub async fn wait_reset(&self) {
        self.reset.wait().await;
    }

    /// Back to idle with an empty transcript.
    pub fn reset(&self) {
        self.clear_transcript();
        self.phase.store(Phase::Idle as u8, Ordering::Relaxed);
        self.percent.store(0, Ordering::Relaxed);
        self.current_hz.store(0, Ordering::Relaxed);
        self.complete.store(false, Ordering::Relaxed);
        self.running.store(false, Ordering::Release);
    }
}

impl Default for BenchStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// [`TextSink`] into a [`BenchStatus`] transcript.
pub struct TranscriptSink<'a>(&'a BenchStatus);

impl TextSink for TranscriptSink<'_> {
    fn write_text(&mut self, text: &str) {
        self.0.append(text);
    }
}

#[allow(clippy::cast_possible_truncation)] // min(100) fits u8
fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = u64::from(done)
        .saturating_mul(100)
        .checked_div(u64::from(total))
        .unwrap_or(100);
    pct.min(100) as u8
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use platform::sink_line;

    #[test]
    fn lifecycle() {
        let status = BenchStatus::new();
        assert_eq!(status.snapshot().phase, Phase::Idle);

        status.begin(Phase::Setup);
        status.set_phase(Phase::Benchmark);
        status.set_clock(24_000_000);
        status.set_progress(50, 200);
        let snap = status.snapshot();
        assert!(snap.running && !snap.complete);
        assert_eq!((snap.phase, snap.percent, snap.current_hz), (Phase::Benchmark, 25, 24_000_000));

        status.finish(true);
        let snap = status.snapshot();
        assert!(!snap.running && snap.complete);
        assert_eq!((snap.phase, snap.percent), (Phase::Done, 100));

        status.begin(Phase::Restore);
        status.finish(false);
        let snap = status.snapshot();
        assert_eq!(snap.phase, Phase::Failed);
        assert!(!snap.complete);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(3, 4), 75);
        assert_eq!(percent(9, 4), 100);
        assert_eq!(percent(u32::MAX, u32::MAX), 100);
    }

    #[test]
    fn transcript_collects_and_truncates() {
        let status = BenchStatus::new();
        let mut sink = status.sink();
        sink_line!(sink, "JEDEC ID: {:02X}", 0xEF);
        status.with_transcript(|t| assert_eq!(t, "JEDEC ID: EF\r\n"));

        let big = "x".repeat(TRANSCRIPT_CAPACITY);
        status.append(&big);
        assert!(status.transcript_truncated());
        status.with_transcript(|t| assert_eq!(t.len(), TRANSCRIPT_CAPACITY));

        status.begin(Phase::Identify);
        assert!(!status.transcript_truncated());
        status.with_transcript(|t| assert!(t.is_empty()));
    }

    #[test]
    fn reset_request_is_consumed_once() {
        let status = BenchStatus::new();
        assert!(!status.take_reset());
        status.request_reset();
        assert!(status.take_reset());
        assert!(!status.take_reset());
    }
}
