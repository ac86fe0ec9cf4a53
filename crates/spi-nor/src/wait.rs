//! Waiting for write-in-progress to clear.
//!
//! One loop serves both flavours the bench needs:
//!
//! - **blocking**: sleep a fixed interval between polls, no deadline. Used
//!   for pre-erase and other housekeeping where the caller just wants the
//!   chip idle.
//! - **cooperative**: yield to the executor between polls and give up at a
//!   deadline. Used while other tasks (console, status reporting) must keep
//!   running, and wherever a dead chip must not hang the worker.
//!
//! The deadline bookkeeping lives in [`BusyPoller`], a plain state machine
//! fed with status values and timestamps, so it can be tested without a bus.

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;

use crate::command::{StatusKind, StatusRegister};
use crate::error::WaitError;
use crate::transport::SpiNor;

/// Default poll interval for [`Pacing::Sleep`].
pub const DEFAULT_POLL_INTERVAL_US: u32 = 50;

/// What to do between two busy polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pacing {
    /// Sleep on the delay provider.
    Sleep {
        /// Gap between polls in microseconds.
        interval_us: u32,
    },
    /// Yield to the executor once and poll again.
    Yield,
}

/// How to wait for WIP to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WaitPolicy {
    /// Between-poll behaviour.
    pub pacing: Pacing,
    /// Give up this long after the first poll. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl WaitPolicy {
    /// Sleep [`DEFAULT_POLL_INTERVAL_US`] between polls, no deadline.
    pub const fn blocking() -> Self {
        Self {
            pacing: Pacing::Sleep {
                interval_us: DEFAULT_POLL_INTERVAL_US,
            },
            timeout: None,
        }
    }

    /// Yield between polls and give up after `timeout_ms`.
    pub const fn cooperative(timeout_ms: u64) -> Self {
        Self {
            pacing: Pacing::Yield,
            timeout: Some(Duration::from_millis(timeout_ms)),
        }
    }

    /// Same pacing, different deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same deadline, different pacing.
    #[must_use]
    pub const fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::blocking()
    }
}

// ---------------------------------------------------------------------------
// BusyPoller
// ---------------------------------------------------------------------------

/// Decision after one status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollStep {
    /// WIP is clear.
    Ready,
    /// Still busy, deadline not reached: pace and poll again.
    Pause,
    /// Still busy and the deadline has passed.
    Expired,
}

/// Deadline tracking for one wait.
#[derive(Debug, Clone, Copy)]
pub struct BusyPoller {
    started: Instant,
    deadline: Option<Instant>,
    polls: u32,
}

impl BusyPoller {
    /// Start a wait at `now`. The deadline is measured from here.
    pub fn start(policy: &WaitPolicy, now: Instant) -> Self {
        let deadline = policy
            .timeout
            .map(|t| now.checked_add(t).unwrap_or(Instant::MAX));
        Self {
            started: now,
            deadline,
            polls: 0,
        }
    }

    /// Feed one status value read at `now`.
    pub fn step(&mut self, status: StatusRegister, now: Instant) -> PollStep {
        self.polls = self.polls.saturating_add(1);
        if !status.is_busy() {
            return PollStep::Ready;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => PollStep::Expired,
            _ => PollStep::Pause,
        }
    }

    /// Status reads so far.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Time since [`BusyPoller::start`].
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.checked_duration_since(self.started).unwrap_or(Duration::MIN)
    }
}

// ---------------------------------------------------------------------------
// Driver integration
// ---------------------------------------------------------------------------

impl<SPI, D> SpiNor<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Poll SR1 until WIP clears or `policy` gives up.
    ///
    /// Returns the final status register (WIP clear). Every poll reads the
    /// register fresh.
    pub async fn wait_ready(
        &mut self,
        policy: &WaitPolicy,
    ) -> Result<StatusRegister, WaitError<SPI::Error>> {
        let mut poller = BusyPoller::start(policy, Instant::now());
        loop {
            let status = self
                .status_raw(StatusKind::Primary)
                .await
                .map_err(WaitError::Spi)?;
            match poller.step(status, Instant::now()) {
                PollStep::Ready => {
                    trace!("WIP clear after {} polls", poller.polls());
                    return Ok(status);
                }
                PollStep::Expired => {
                    warn!(
                        "WIP still set after {} ms, SR1={:#x}",
                        poller.elapsed(Instant::now()).as_millis(),
                        status.bits()
                    );
                    return Err(WaitError::Timeout {
                        last_status: status,
                    });
                }
                PollStep::Pause => match policy.pacing {
                    Pacing::Sleep { interval_us } => self.delay.delay_us(interval_us).await,
                    Pacing::Yield => embassy_futures::yield_now().await,
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::spi::{Mock as SpiMock, Transaction as SpiTransaction};

    const BUSY: StatusRegister = StatusRegister(0x03);
    const IDLE: StatusRegister = StatusRegister(0x00);

    fn t(us: u64) -> Instant {
        Instant::from_micros(us)
    }

    fn status_txn(value: u8) -> [SpiTransaction<u8>; 4] {
        [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x05]),
            SpiTransaction::read_vec(vec![value]),
            SpiTransaction::transaction_end(),
        ]
    }

    #[test]
    fn ready_as_soon_as_wip_clears() {
        let mut p = BusyPoller::start(&WaitPolicy::cooperative(10), t(0));
        assert_eq!(p.step(BUSY, t(100)), PollStep::Pause);
        assert_eq!(p.step(IDLE, t(200)), PollStep::Ready);
        assert_eq!(p.polls(), 2);
    }

    #[test]
    fn deadline_is_measured_from_start() {
        let mut p = BusyPoller::start(&WaitPolicy::cooperative(5), t(1_000));
        assert_eq!(p.step(BUSY, t(5_999)), PollStep::Pause);
        assert_eq!(p.step(BUSY, t(6_000)), PollStep::Expired);
        assert_eq!(p.elapsed(t(6_000)), Duration::from_millis(5));
    }

    #[test]
    fn idle_wins_over_expired_deadline() {
        let mut p = BusyPoller::start(&WaitPolicy::cooperative(1), t(0));
        assert_eq!(p.step(IDLE, t(1_000_000)), PollStep::Ready);
    }

    #[test]
    fn blocking_policy_never_expires() {
        let mut p = BusyPoller::start(&WaitPolicy::blocking(), t(0));
        assert_eq!(p.step(BUSY, Instant::MAX), PollStep::Pause);
    }

    #[test]
    fn builder_overrides() {
        let p = WaitPolicy::blocking()
            .with_timeout(Some(Duration::from_millis(3)))
            .with_pacing(Pacing::Sleep { interval_us: 10 });
        assert_eq!(p.timeout, Some(Duration::from_millis(3)));
        assert_eq!(p.pacing, Pacing::Sleep { interval_us: 10 });
        assert_eq!(WaitPolicy::default(), WaitPolicy::blocking());
    }

    #[tokio::test]
    async fn wait_ready_polls_until_idle() {
        let mut expect = Vec::new();
        expect.extend(status_txn(0x03));
        expect.extend(status_txn(0x01));
        expect.extend(status_txn(0x00));
        let mut spi = SpiMock::new(&expect);
        let mut nor = SpiNor::new(spi.clone(), NoopDelay);

        let sr = nor.wait_ready(&WaitPolicy::blocking()).await.unwrap();
        assert!(!sr.is_busy());
        spi.done();
    }

    #[tokio::test]
    async fn zero_timeout_expires_on_first_busy_poll() {
        let mut spi = SpiMock::new(&status_txn(0x01));
        let mut nor = SpiNor::new(spi.clone(), NoopDelay);

        let policy = WaitPolicy::cooperative(0);
        let err = nor.wait_ready(&policy).await.unwrap_err();
        assert_eq!(
            err,
            WaitError::Timeout {
                last_status: StatusRegister(0x01)
            }
        );
        spi.done();
    }
}
