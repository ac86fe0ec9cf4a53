//! Peripheral abstraction layer
//!
//! The flash bus is an `embedded_hal_async::spi::SpiDevice`; the only thing
//! the bench needs beyond that trait is the ability to change the bus clock
//! between the erase/program phase and the read phase of a trial.

/// Re-clock the SPI bus that carries the flash chip.
///
/// Implementations apply the change to the next transaction. The achieved
/// frequency may be lower than requested when the peripheral only supports
/// power-of-two prescalers; [`SpiClock::frequency`] reports the request so
/// that logged rows stay comparable across boards.
pub trait SpiClock {
    /// Request a new SCK frequency in Hz.
    fn set_frequency(&mut self, hz: u32);

    /// Currently requested SCK frequency in Hz.
    fn frequency(&self) -> u32;
}

impl<T: SpiClock + ?Sized> SpiClock for &mut T {
    fn set_frequency(&mut self, hz: u32) {
        T::set_frequency(self, hz);
    }

    fn frequency(&self) -> u32 {
        T::frequency(self)
    }
}

/// SPI configuration
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiConfig {
    /// Clock frequency in Hz
    pub frequency: u32,
    /// SPI mode (CPOL, CPHA)
    pub mode: SpiMode,
    /// Bit order
    pub bit_order: BitOrder,
}

impl SpiConfig {
    /// Mode 0, MSB first: what every 25-series NOR chip accepts.
    pub const fn nor_flash(frequency: u32) -> Self {
        Self {
            frequency,
            mode: SpiMode::Mode0,
            bit_order: BitOrder::MsbFirst,
        }
    }
}

/// SPI modes (CPOL, CPHA)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiMode {
    /// Mode 0: CPOL=0, CPHA=0
    Mode0,
    /// Mode 1: CPOL=0, CPHA=1
    Mode1,
    /// Mode 2: CPOL=1, CPHA=0
    Mode2,
    /// Mode 3: CPOL=1, CPHA=1
    Mode3,
}

/// Bit order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitOrder {
    /// Most significant bit first
    MsbFirst,
    /// Least significant bit first
    LsbFirst,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    struct Fixed(u32);

    impl SpiClock for Fixed {
        fn set_frequency(&mut self, hz: u32) {
            self.0 = hz;
        }
        fn frequency(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn clock_through_mut_ref() {
        let mut clk = Fixed(1_000_000);
        {
            let mut r = &mut clk;
            r.set_frequency(12_000_000);
            assert_eq!(r.frequency(), 12_000_000);
        }
        assert_eq!(clk.frequency(), 12_000_000);
    }

    #[test]
    fn nor_flash_config_is_mode0_msb() {
        let cfg = SpiConfig::nor_flash(24_000_000);
        assert_eq!(cfg.mode, SpiMode::Mode0);
        assert_eq!(cfg.bit_order, BitOrder::MsbFirst);
        assert_eq!(cfg.frequency, 24_000_000);
    }
}
