//! Error types for the flash transport and the timed layer.

use core::fmt;

use crate::command::{FlashAddress, StatusRegister};

/// Transport error.
///
/// The chip itself never reports failure on the bus; everything here is
/// either an SPI error from the HAL or an argument the caller should not
/// have passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// Underlying SPI device error.
    Spi(E),
    /// Address is not aligned to the unit the command works on.
    Unaligned {
        /// Offending address.
        addr: u32,
    },
    /// `[addr, addr + len)` spans more than one 256-byte page, or is empty.
    PageCross {
        /// Start address.
        addr: u32,
        /// Payload length.
        len: usize,
    },
    /// Address (or address + length) leaves the 24-bit space.
    OutOfRange {
        /// Offending address.
        addr: u32,
    },
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Spi(e)
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    #[allow(clippy::use_debug)] // HAL error types rarely implement Display
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spi(e) => write!(f, "SPI error: {e:?}"),
            Self::Unaligned { addr } => write!(f, "address 0x{addr:06X} is not sector aligned"),
            Self::PageCross { addr, len } => {
                write!(f, "{len} bytes at 0x{addr:06X} do not fit in one page")
            }
            Self::OutOfRange { addr } => write!(f, "address 0x{addr:06X} is out of range"),
        }
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug> std::error::Error for Error<E> {}

/// Outcome of waiting for WIP to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitError<E> {
    /// The deadline passed while the chip still reported busy.
    Timeout {
        /// Status register from the final poll.
        last_status: StatusRegister,
    },
    /// Status poll failed on the bus.
    Spi(E),
}

impl<E> WaitError<E> {
    /// `true` for [`WaitError::Timeout`].
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl<E: fmt::Debug> fmt::Display for WaitError<E> {
    #[allow(clippy::use_debug)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { last_status } => {
                write!(f, "timed out waiting for WIP (SR1=0x{last_status})")
            }
            Self::Spi(e) => write!(f, "SPI error while polling status: {e:?}"),
        }
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug> std::error::Error for WaitError<E> {}

/// Scratch window rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Window base is not a multiple of 4096.
    #[error("window base {0:#x} is not sector aligned")]
    UnalignedBase(u32),
    /// Window size is zero or not a multiple of 4096.
    #[error("window size {0} is not a positive multiple of 4096")]
    BadSize(u32),
    /// Window end runs past the 24-bit address space.
    #[error("window ends past the 24-bit address space")]
    OutOfRange,
}

/// Convenience alias for transport results.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Check that `addr` is a 4 KB boundary.
pub(crate) fn require_sector_aligned<E>(addr: FlashAddress) -> Result<(), E> {
    if addr.is_sector_aligned() {
        Ok(())
    } else {
        Err(Error::Unaligned { addr: addr.get() })
    }
}

/// Check that `len` bytes at `addr` stay within one page.
pub(crate) fn require_single_page<E>(addr: FlashAddress, len: usize) -> Result<(), E> {
    let fits = len > 0 && addr.page_offset().saturating_add(len) <= crate::command::PAGE_SIZE;
    if fits {
        Ok(())
    } else {
        Err(Error::PageCross {
            addr: addr.get(),
            len,
        })
    }
}
