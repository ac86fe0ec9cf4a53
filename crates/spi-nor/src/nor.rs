//! `embedded-storage-async` view of the chip.
//!
//! Lets generic storage code (key-value stores, bootloaders) use the bench's
//! flash handle. Writes are split at page boundaries and every erase and
//! program waits with the wrapped [`WaitPolicy`]; a wait timeout is an error
//! here, unlike in the benchmark.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;
use embedded_storage_async::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::command::{FlashAddress, PAGE_SIZE, SECTOR_SIZE};
use crate::error::{Error, WaitError};
use crate::transport::SpiNor;
use crate::wait::WaitPolicy;

/// Errors from [`NorStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NorStorageError<E> {
    /// Bus or argument error from the transport.
    Transport(Error<E>),
    /// WIP did not clear in time.
    Timeout,
    /// Offset or length outside the chip.
    OutOfBounds,
    /// Erase range not on sector boundaries.
    NotAligned,
}

impl<E> From<Error<E>> for NorStorageError<E> {
    fn from(e: Error<E>) -> Self {
        match e {
            Error::Unaligned { .. } => Self::NotAligned,
            Error::OutOfRange { .. } => Self::OutOfBounds,
            other => Self::Transport(other),
        }
    }
}

impl<E> From<WaitError<E>> for NorStorageError<E> {
    fn from(e: WaitError<E>) -> Self {
        match e {
            WaitError::Timeout { .. } => Self::Timeout,
            WaitError::Spi(e) => Self::Transport(Error::Spi(e)),
        }
    }
}

impl<E: core::fmt::Debug> NorFlashError for NorStorageError<E> {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Self::NotAligned => NorFlashErrorKind::NotAligned,
            Self::Transport(_) | Self::Timeout => NorFlashErrorKind::Other,
        }
    }
}

/// [`SpiNor`] with a known capacity and wait policy.
pub struct NorStorage<SPI, D> {
    nor: SpiNor<SPI, D>,
    capacity: u32,
    policy: WaitPolicy,
}

impl<SPI, D> NorStorage<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Wrap `nor`, exposing `capacity` bytes.
    pub fn new(nor: SpiNor<SPI, D>, capacity: u32, policy: WaitPolicy) -> Self {
        Self {
            nor,
            capacity,
            policy,
        }
    }

    /// Unwrap.
    pub fn into_inner(self) -> SpiNor<SPI, D> {
        self.nor
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), NorStorageError<SPI::Error>> {
        let len = u32::try_from(len).map_err(|_| NorStorageError::OutOfBounds)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(NorStorageError::OutOfBounds),
        }
    }
}

fn address<E>(raw: u32) -> Result<FlashAddress, NorStorageError<E>> {
    FlashAddress::new(raw).map_err(|_| NorStorageError::OutOfBounds)
}

impl<SPI, D> ErrorType for NorStorage<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    type Error = NorStorageError<SPI::Error>;
}

impl<SPI, D> ReadNorFlash for NorStorage<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check_range(offset, bytes.len())?;
        self.nor.read_data(address(offset)?, bytes).await?;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

impl<SPI, D> NorFlash for NorStorage<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to || to > self.capacity {
            return Err(NorStorageError::OutOfBounds);
        }
        let sector_size = SECTOR_SIZE as u32;
        if from % sector_size != 0 || to % sector_size != 0 {
            return Err(NorStorageError::NotAligned);
        }
        let mut sector = from;
        while sector < to {
            self.nor.erase_sector_4k(address(sector)?).await?;
            self.nor.wait_ready(&self.policy).await?;
            sector = sector.saturating_add(sector_size);
        }
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_range(offset, bytes.len())?;
        let mut addr = address(offset)?;
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = PAGE_SIZE.saturating_sub(addr.page_offset());
            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            self.nor.program_page(addr, chunk).await?;
            self.nor.wait_ready(&self.policy).await?;
            rest = tail;
            if !rest.is_empty() {
                let step = u32::try_from(chunk.len()).map_err(|_| NorStorageError::OutOfBounds)?;
                addr = addr.offset(step).map_err(|_| NorStorageError::OutOfBounds)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    fn storage() -> NorStorage<SimFlash, NoopDelay> {
        let nor = SpiNor::new(SimFlash::new(64 * 1024), NoopDelay);
        NorStorage::new(nor, 64 * 1024, WaitPolicy::cooperative(100))
    }

    #[tokio::test]
    async fn unaligned_write_is_split_at_pages() {
        let mut s = storage();
        s.erase(0, 4096).await.unwrap();
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        s.write(0xF0, &data).await.unwrap();

        let mut back = vec![0u8; 300];
        s.read(0xF0, &mut back).await.unwrap();
        assert_eq!(back, data);
        // 16 bytes in page 0, 256 in page 1, 28 in page 2
        assert_eq!(s.into_inner().device().programs(), 3);
    }

    #[tokio::test]
    async fn erase_range_must_be_sector_aligned() {
        let mut s = storage();
        assert_eq!(s.erase(0x100, 0x1000).await, Err(NorStorageError::NotAligned));
        assert_eq!(s.erase(0, 0x1800).await, Err(NorStorageError::NotAligned));
        assert_eq!(
            s.erase(0, 0x2_0000).await,
            Err(NorStorageError::OutOfBounds)
        );
    }

    #[tokio::test]
    async fn reads_past_capacity_fail() {
        let mut s = storage();
        let mut buf = [0u8; 8];
        let err = s.read(64 * 1024 - 4, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), NorFlashErrorKind::OutOfBounds);
        assert_eq!(s.capacity(), 64 * 1024);
    }

    #[tokio::test]
    async fn stuck_chip_is_a_timeout() {
        let mut sim = SimFlash::new(64 * 1024);
        sim.set_stuck_busy(true);
        let mut s = NorStorage::new(SpiNor::new(sim, NoopDelay), 64 * 1024, WaitPolicy::cooperative(1));
        assert_eq!(s.erase(0, 4096).await, Err(NorStorageError::Timeout));
    }
}
