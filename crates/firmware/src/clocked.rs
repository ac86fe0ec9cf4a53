//! Flash SPI device with a switchable clock
//!
//! [`ClockedSpi`] is an [`ExclusiveDevice`] plus a re-clock hook for the
//! underlying bus. The hook is a plain function so the same wrapper serves
//! the STM32 SPI peripheral (`Spi::set_config`) and host test buses.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::{ErrorType, Operation, SpiBus, SpiDevice};
use embedded_hal_bus::spi::{DeviceError, ExclusiveDevice};
use platform::SpiClock;

/// Applies a new SCK frequency to a bus.
pub type Reclock<BUS> = fn(&mut BUS, u32);

/// SPI device whose bus clock can be changed between transactions.
pub struct ClockedSpi<BUS, CS, D> {
    device: ExclusiveDevice<BUS, CS, D>,
    reclock: Reclock<BUS>,
    hz: u32,
}

impl<BUS, CS, D> ClockedSpi<BUS, CS, D> {
    /// Wrap `device` and apply `hz` straight away.
    pub fn new(mut device: ExclusiveDevice<BUS, CS, D>, reclock: Reclock<BUS>, hz: u32) -> Self {
        reclock(device.bus_mut(), hz);
        Self {
            device,
            reclock,
            hz,
        }
    }

    /// The wrapped bus.
    pub fn bus(&self) -> &BUS {
        self.device.bus()
    }
}

impl<BUS, CS, D> SpiClock for ClockedSpi<BUS, CS, D> {
    fn set_frequency(&mut self, hz: u32) {
        if hz == self.hz {
            return;
        }
        (self.reclock)(self.device.bus_mut(), hz);
        self.hz = hz;
        #[cfg(feature = "defmt")]
        defmt::debug!("flash SPI re-clocked to {=u32} Hz", hz);
    }

    fn frequency(&self) -> u32 {
        self.hz
    }
}

impl<BUS, CS, D> ErrorType for ClockedSpi<BUS, CS, D>
where
    BUS: ErrorType,
    CS: OutputPin,
{
    type Error = DeviceError<BUS::Error, CS::Error>;
}

impl<BUS, CS, D> SpiDevice for ClockedSpi<BUS, CS, D>
where
    BUS: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    async fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        self.device.transaction(operations).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    /// Bus that records the clock in effect for every write. MISO is held low.
    #[derive(Default)]
    struct RecordingBus {
        hz: u32,
        writes: Vec<u32>,
    }

    impl ErrorType for RecordingBus {
        type Error = Infallible;
    }

    impl SpiBus for RecordingBus {
        async fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
            words.fill(0x00);
            Ok(())
        }

        async fn write(&mut self, _words: &[u8]) -> Result<(), Infallible> {
            self.writes.push(self.hz);
            Ok(())
        }

        async fn transfer(&mut self, read: &mut [u8], _write: &[u8]) -> Result<(), Infallible> {
            read.fill(0x00);
            Ok(())
        }

        async fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
            words.fill(0x00);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    struct Pin;

    impl embedded_hal::digital::ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    fn set_hz(bus: &mut RecordingBus, hz: u32) {
        bus.hz = hz;
    }

    fn clocked(hz: u32) -> ClockedSpi<RecordingBus, Pin, NoopDelay> {
        let device = ExclusiveDevice::new(RecordingBus::default(), Pin, NoopDelay).unwrap();
        ClockedSpi::new(device, set_hz, hz)
    }

    #[tokio::test]
    async fn initial_clock_is_applied() {
        let spi = clocked(12_000_000);
        assert_eq!(spi.bus().hz, 12_000_000);
        assert_eq!(spi.frequency(), 12_000_000);
    }

    #[tokio::test]
    async fn writes_use_the_latest_clock() {
        let mut spi = clocked(12_000_000);
        spi.write(&[0x9F]).await.unwrap();
        spi.set_frequency(36_000_000);
        spi.write(&[0x03, 0, 0, 0]).await.unwrap();
        assert_eq!(spi.bus().writes, [12_000_000, 36_000_000]);
        assert_eq!(spi.frequency(), 36_000_000);
    }

    #[tokio::test]
    async fn drives_the_flash_transport() {
        let mut nor = spi_nor::SpiNor::new(clocked(12_000_000), NoopDelay);
        nor.set_clock(24_000_000);
        assert_eq!(nor.clock(), 24_000_000);
        // with no chip on the bus MISO stays low, which reads as an absent id
        assert!(nor.read_identity().await.unwrap().is_absent());
    }
}
