//! Timed flash operations.
//!
//! Each helper measures one operation with the monotonic clock, from the
//! first command byte until the chip is idle again (or the data is in).
//! Timeouts are reported in-band through a negative duration so a benchmark
//! sweep can count them and carry on.

// Throughput math is f64 and latency is i64 µs; the int->float casts lose
// nothing at the magnitudes involved (durations under a few hours).
#![allow(clippy::cast_precision_loss)]

use embassy_time::Instant;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;

use crate::command::{FlashAddress, StatusKind, StatusRegister, MAX_ADDRESS, PAGE_SIZE, SECTOR_SIZE};
use crate::error::{ConfigError, Error, Result, WaitError};
use crate::transport::SpiNor;
use crate::wait::WaitPolicy;

/// Sentinel duration for an operation that did not finish.
pub const TIMED_OUT_US: i64 = -1;

/// Seed substituted for zero, which would lock xorshift at zero forever.
pub const FALLBACK_SEED: u32 = 0x2545_F491;

/// Mixed into every per-trial seed.
pub const TRIAL_SEED_BASE: u32 = 0xC001_D00D;

/// Scratch buffer size for streamed reads.
const READ_CHUNK: usize = PAGE_SIZE;

// ---------------------------------------------------------------------------
// Results and math
// ---------------------------------------------------------------------------

/// Outcome of a timed erase or program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimedResult {
    /// Duration in µs; negative when the wait timed out.
    pub elapsed_us: i64,
    /// SR1 at the end of the operation.
    pub end_status: StatusRegister,
    /// Mismatching bytes after read-back. `None` for operations without verify.
    pub verify_mismatches: Option<u32>,
}

impl TimedResult {
    /// Operation did not finish before its deadline.
    pub const fn timed_out(&self) -> bool {
        self.elapsed_us < 0
    }

    /// Mismatch count, zero when not verified.
    pub fn mismatches(&self) -> u32 {
        self.verify_mismatches.unwrap_or(0)
    }
}

/// Throughput in MB/s (MiB, matching the CSV logs). `0.0` for non-positive durations.
pub fn mbps(bytes: u64, elapsed_us: i64) -> f64 {
    if elapsed_us <= 0 {
        return 0.0;
    }
    (bytes as f64 / 1_048_576.0) / (elapsed_us as f64 / 1e6)
}

/// Microseconds since `t0`, saturated into `i64`.
pub(crate) fn micros_since(t0: Instant) -> i64 {
    i64::try_from(t0.elapsed().as_micros()).unwrap_or(i64::MAX)
}

/// Ascending test page `0, 1, ..., 255`.
pub fn ascending_page() -> [u8; PAGE_SIZE] {
    let mut page = [0u8; PAGE_SIZE];
    for (b, v) in page.iter_mut().zip(0u8..=255) {
        *b = v;
    }
    page
}

// ---------------------------------------------------------------------------
// Xorshift32
// ---------------------------------------------------------------------------

/// Marsaglia xorshift32. Deterministic, so a run can be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xorshift32 {
    state: u32,
}

impl Xorshift32 {
    /// Seeded generator; zero is replaced by [`FALLBACK_SEED`].
    pub const fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { FALLBACK_SEED } else { seed },
        }
    }

    /// Seed for trial `trial` at clock `spi_hz`.
    pub const fn for_trial(trial: u32, spi_hz: u32) -> Self {
        Self::new(TRIAL_SEED_BASE ^ trial ^ spi_hz)
    }

    /// Advance and return the new state.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

// ---------------------------------------------------------------------------
// ScratchWindow
// ---------------------------------------------------------------------------

/// Flash region the bench may erase and overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScratchWindow {
    base: FlashAddress,
    size: u32,
}

impl ScratchWindow {
    /// The first 4 KB sector of the chip.
    pub const FIRST_SECTOR: Self = Self {
        base: FlashAddress::ZERO,
        size: SECTOR_SIZE as u32,
    };

    /// Validate and build a window.
    ///
    /// `base` must be sector aligned and `size` a non-zero multiple of 4096
    /// that keeps the window inside the 24-bit address space.
    pub fn new(base: u32, size: u32) -> core::result::Result<Self, ConfigError> {
        let sector = SECTOR_SIZE as u32;
        if base % sector != 0 {
            return Err(ConfigError::UnalignedBase(base));
        }
        if size == 0 || size % sector != 0 {
            return Err(ConfigError::BadSize(size));
        }
        let last = base
            .checked_add(size.saturating_sub(1))
            .ok_or(ConfigError::OutOfRange)?;
        if last > MAX_ADDRESS {
            return Err(ConfigError::OutOfRange);
        }
        let base = FlashAddress::new(base).map_err(|_| ConfigError::OutOfRange)?;
        Ok(Self { base, size })
    }

    /// First byte.
    pub const fn base(&self) -> FlashAddress {
        self.base
    }

    /// Length in bytes.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Number of 4 KB sectors.
    pub const fn sectors(&self) -> u32 {
        self.size / SECTOR_SIZE as u32
    }

    /// Sector used by 1-based trial `trial`, rotating through the window.
    #[allow(clippy::arithmetic_side_effects)] // sectors() >= 1 by construction
    pub fn sector_for_trial(&self, trial: u32) -> FlashAddress {
        let index = trial.saturating_sub(1) % self.sectors();
        self.sector(index)
    }

    /// Base address of sector `index` (wrapped into the window).
    #[allow(clippy::arithmetic_side_effects)]
    pub fn sector(&self, index: u32) -> FlashAddress {
        let index = index % self.sectors();
        // index < sectors, so the product stays below `size`
        self.base
            .offset(index.saturating_mul(SECTOR_SIZE as u32))
            .unwrap_or(self.base)
    }

    /// Page-aligned random read address for a 256-byte read.
    #[allow(clippy::arithmetic_side_effects)]
    pub fn random_page(&self, rng: &mut Xorshift32) -> FlashAddress {
        // size >= 4096, so the span is never zero
        let span = self.size.saturating_sub(PAGE_SIZE as u32).max(1);
        let offset = (rng.next_u32() % span) & !(PAGE_SIZE as u32 - 1);
        self.base.offset(offset).unwrap_or(self.base)
    }
}

// ---------------------------------------------------------------------------
// Timed operations
// ---------------------------------------------------------------------------

fn bus_only<E>(e: WaitError<E>) -> core::result::Result<StatusRegister, Error<E>> {
    match e {
        WaitError::Timeout { last_status } => Ok(last_status),
        WaitError::Spi(e) => Err(Error::Spi(e)),
    }
}

impl<SPI, D> SpiNor<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Erase one 4 KB sector and time it until WIP clears.
    pub async fn timed_erase_sector(
        &mut self,
        addr: FlashAddress,
        policy: &WaitPolicy,
    ) -> Result<TimedResult, SPI::Error> {
        let t0 = Instant::now();
        self.erase_sector_4k(addr).await?;
        let (elapsed_us, end_status) = match self.wait_ready(policy).await {
            Ok(sr) => (micros_since(t0), sr),
            Err(e) => {
                let sr = bus_only(e)?;
                warn!("erase at {:#x} timed out", addr.get());
                (TIMED_OUT_US, sr)
            }
        };
        Ok(TimedResult {
            elapsed_us,
            end_status,
            verify_mismatches: None,
        })
    }

    /// Program one full page, time it, then read it back and count mismatches.
    ///
    /// `addr` must be page aligned. A program timeout skips the read-back
    /// and reports one mismatch.
    pub async fn timed_program_page256(
        &mut self,
        addr: FlashAddress,
        page: &[u8; PAGE_SIZE],
        policy: &WaitPolicy,
    ) -> Result<TimedResult, SPI::Error> {
        let t0 = Instant::now();
        self.program_page(addr, page).await?;
        let end_status = match self.wait_ready(policy).await {
            Ok(sr) => sr,
            Err(e) => {
                let sr = bus_only(e)?;
                warn!("program at {:#x} timed out", addr.get());
                return Ok(TimedResult {
                    elapsed_us: TIMED_OUT_US,
                    end_status: sr,
                    verify_mismatches: Some(1),
                });
            }
        };
        let elapsed_us = micros_since(t0);

        let mut readback = [0u8; PAGE_SIZE];
        self.read_data(addr, &mut readback).await?;
        let mismatches = readback.iter().zip(page.iter()).filter(|(a, b)| a != b).count();
        let mismatches = u32::try_from(mismatches).unwrap_or(u32::MAX);
        if mismatches > 0 {
            debug!("program at {:#x}: {} bytes differ", addr.get(), mismatches);
        }
        Ok(TimedResult {
            elapsed_us,
            end_status,
            verify_mismatches: Some(mismatches),
        })
    }

    /// Read `len` bytes from `addr` through a 256-byte buffer; returns µs.
    pub async fn timed_read_sequential(&mut self, addr: FlashAddress, len: u32) -> Result<i64, SPI::Error> {
        let mut buf = [0u8; READ_CHUNK];
        let mut cursor = addr;
        let mut left = len;
        let t0 = Instant::now();
        while left > 0 {
            let n = left.min(READ_CHUNK as u32);
            let chunk = buf.get_mut(..n as usize).unwrap_or_default();
            self.read_data(cursor, chunk).await?;
            left = left.saturating_sub(n);
            if left > 0 {
                cursor = cursor
                    .offset(n)
                    .map_err(|_| Error::OutOfRange { addr: cursor.get() })?;
            }
        }
        Ok(micros_since(t0))
    }

    /// One 256-byte read at a random page of `window`; returns (µs, address).
    pub async fn timed_read_random256(
        &mut self,
        window: &ScratchWindow,
        rng: &mut Xorshift32,
    ) -> Result<(i64, FlashAddress), SPI::Error> {
        let addr = window.random_page(rng);
        let mut buf = [0u8; PAGE_SIZE];
        let t0 = Instant::now();
        self.read_data(addr, &mut buf).await?;
        Ok((micros_since(t0), addr))
    }

    /// Fresh SR1 for logging.
    pub async fn status1(&mut self) -> Result<StatusRegister, SPI::Error> {
        self.read_status(StatusKind::Primary).await
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::float_cmp,
    clippy::arithmetic_side_effects
)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use proptest::prelude::*;

    fn sim_nor() -> SpiNor<SimFlash, NoopDelay> {
        SpiNor::new(SimFlash::new(1 << 20), NoopDelay)
    }

    fn at(a: u32) -> FlashAddress {
        FlashAddress::new(a).unwrap()
    }

    #[test]
    fn mbps_math() {
        assert_eq!(mbps(1_048_576, 1_000_000), 1.0);
        assert_eq!(mbps(256, 0), 0.0);
        assert_eq!(mbps(256, -1), 0.0);
        assert!((mbps(262_144, 250_000) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn xorshift_reference_sequence() {
        let mut r = Xorshift32::new(1);
        assert_eq!(r.next_u32(), 270_369);
        assert_eq!(r.next_u32(), 67_634_689);
    }

    #[test]
    fn zero_seed_is_replaced() {
        assert_eq!(Xorshift32::new(0), Xorshift32::new(FALLBACK_SEED));
        let mut r = Xorshift32::new(0);
        assert_ne!(r.next_u32(), 0);
    }

    #[test]
    fn trial_seed_mixes_trial_and_clock() {
        assert_eq!(
            Xorshift32::for_trial(3, 12_000_000),
            Xorshift32::new(0xC001_D00D ^ 3 ^ 12_000_000)
        );
    }

    #[test]
    fn window_validation() {
        assert!(ScratchWindow::new(0, 4096).is_ok());
        assert_eq!(ScratchWindow::new(0x100, 4096), Err(ConfigError::UnalignedBase(0x100)));
        assert_eq!(ScratchWindow::new(0, 0), Err(ConfigError::BadSize(0)));
        assert_eq!(ScratchWindow::new(0, 2048), Err(ConfigError::BadSize(2048)));
        assert_eq!(ScratchWindow::new(0xFF_F000, 8192), Err(ConfigError::OutOfRange));
        assert!(ScratchWindow::new(0xFF_F000, 4096).is_ok());
    }

    #[test]
    fn trials_rotate_through_sectors() {
        let w = ScratchWindow::new(0x1_0000, 4 * 4096).unwrap();
        let got: Vec<u32> = (1..=6).map(|t| w.sector_for_trial(t).get()).collect();
        assert_eq!(got, [0x1_0000, 0x1_1000, 0x1_2000, 0x1_3000, 0x1_0000, 0x1_1000]);
    }

    proptest! {
        #[test]
        fn random_pages_stay_in_window(seed in any::<u32>(), sectors in 1u32..64) {
            let w = ScratchWindow::new(0x4_0000, sectors * 4096).unwrap();
            let mut rng = Xorshift32::new(seed);
            for _ in 0..32 {
                let a = w.random_page(&mut rng).get();
                prop_assert_eq!(a % 256, 0);
                prop_assert!(a >= 0x4_0000);
                prop_assert!(a + 256 <= 0x4_0000 + sectors * 4096);
            }
        }
    }

    #[tokio::test]
    async fn erase_then_program_verifies_clean() {
        let mut nor = sim_nor();
        let policy = WaitPolicy::cooperative(50);
        let e = nor.timed_erase_sector(at(0x2000), &policy).await.unwrap();
        assert!(!e.timed_out());
        assert_eq!(e.verify_mismatches, None);

        let p = nor
            .timed_program_page256(at(0x2000), &ascending_page(), &policy)
            .await
            .unwrap();
        assert!(p.elapsed_us >= 0);
        assert_eq!(p.verify_mismatches, Some(0));
        assert!(!p.end_status.is_busy());
    }

    #[tokio::test]
    async fn program_without_erase_reports_mismatches() {
        let mut nor = sim_nor();
        let policy = WaitPolicy::cooperative(50);
        nor.timed_erase_sector(at(0), &policy).await.unwrap();
        nor.timed_program_page256(at(0), &[0x00; PAGE_SIZE], &policy)
            .await
            .unwrap();
        // NOR can only clear bits: 0x00 cannot become 0..=255 again
        let p = nor
            .timed_program_page256(at(0), &ascending_page(), &policy)
            .await
            .unwrap();
        assert_eq!(p.verify_mismatches, Some(255));
    }

    #[tokio::test]
    async fn stuck_chip_times_out_in_band() {
        let mut nor = sim_nor();
        nor.device_mut().set_stuck_busy(true);
        let policy = WaitPolicy::cooperative(2);

        let e = nor.timed_erase_sector(at(0), &policy).await.unwrap();
        assert!(e.timed_out());
        assert!(e.end_status.is_busy());

        let p = nor
            .timed_program_page256(at(0), &ascending_page(), &policy)
            .await
            .unwrap();
        assert_eq!(p.elapsed_us, TIMED_OUT_US);
        assert_eq!(p.verify_mismatches, Some(1));
    }

    #[tokio::test]
    async fn stuck_chip_gives_up_one_poll_after_the_deadline() {
        // a yielded poll on the simulator is microseconds; 20 ms covers host scheduling
        const SLACK_MS: u64 = 20;
        let mut nor = sim_nor();
        nor.device_mut().set_stuck_busy(true);
        let policy = WaitPolicy::cooperative(5);

        let start = Instant::now();
        let e = nor.timed_erase_sector(at(0), &policy).await.unwrap();
        let elapsed = start.elapsed().as_millis();
        assert!(e.timed_out());
        assert!(elapsed >= 5, "gave up early after {elapsed} ms");
        assert!(elapsed <= 5 + SLACK_MS, "overran the deadline: {elapsed} ms");
    }

    #[tokio::test]
    async fn sequential_read_covers_length() {
        let mut nor = sim_nor();
        let us = nor.timed_read_sequential(at(0), 64 * 1024).await.unwrap();
        assert!(us >= 0);
        // 64 KB in 256-byte chunks
        assert_eq!(nor.device().reads(), 256);
    }

    #[tokio::test]
    async fn random_read_reports_its_address() {
        let mut nor = sim_nor();
        let w = ScratchWindow::new(0, 0x4_0000).unwrap();
        let mut rng = Xorshift32::for_trial(1, 12_000_000);
        let mut expect = rng;
        let (us, addr) = nor.timed_read_random256(&w, &mut rng).await.unwrap();
        assert!(us >= 0);
        assert_eq!(addr, w.random_page(&mut expect));
    }
}
