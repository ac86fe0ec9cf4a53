//! SPI NOR command set and wire-level value types.
//!
//! Every 25-series part understands this subset. Addresses are three bytes,
//! big-endian, sent straight after the opcode.

use core::fmt;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Largest unit a single page-program command may write.
pub const PAGE_SIZE: usize = 256;

/// Smallest erasable unit (`0x20` sector erase).
pub const SECTOR_SIZE: usize = 4096;

/// Highest address reachable with 3-byte addressing.
pub const MAX_ADDRESS: u32 = 0x00FF_FFFF;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Opcodes used by the bench.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    /// Manufacturer + 2-byte device id.
    ReadJedecId = 0x9F,
    /// Status register 1 (WIP, WEL, block protect).
    ReadStatus1 = 0x05,
    /// Status register 2 (QE, SUS, security bits).
    ReadStatus2 = 0x35,
    /// Serial Flash Discoverable Parameters, 3 address bytes + 1 dummy.
    ReadSfdp = 0x5A,
    /// Set the write enable latch.
    WriteEnable = 0x06,
    /// Normal read, no dummy cycles.
    Read = 0x03,
    /// Page program, up to 256 bytes within one page.
    PageProgram = 0x02,
    /// 4 KB sector erase.
    SectorErase4K = 0x20,
    /// First half of the soft reset pair.
    EnableReset = 0x66,
    /// Second half of the soft reset pair.
    Reset = 0x99,
    /// Enter deep power-down.
    DeepPowerDown = 0xB9,
    /// Release from deep power-down (also returns the legacy device id).
    ReleasePowerDown = 0xAB,
}

impl Opcode {
    /// Decode a raw opcode byte.
    pub const fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x9F => Self::ReadJedecId,
            0x05 => Self::ReadStatus1,
            0x35 => Self::ReadStatus2,
            0x5A => Self::ReadSfdp,
            0x06 => Self::WriteEnable,
            0x03 => Self::Read,
            0x02 => Self::PageProgram,
            0x20 => Self::SectorErase4K,
            0x66 => Self::EnableReset,
            0x99 => Self::Reset,
            0xB9 => Self::DeepPowerDown,
            0xAB => Self::ReleasePowerDown,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// FlashAddress
// ---------------------------------------------------------------------------

/// Address given to [`FlashAddress::new`] does not fit in 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror_no_std::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("address {0:#x} exceeds 24-bit range")]
pub struct AddressOutOfRange(pub u32);

/// 24-bit offset into the flash array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct FlashAddress(u32);

impl FlashAddress {
    /// Address zero.
    pub const ZERO: Self = Self(0);

    /// Create an address, rejecting values above [`MAX_ADDRESS`].
    pub const fn new(addr: u32) -> Result<Self, AddressOutOfRange> {
        if addr > MAX_ADDRESS {
            Err(AddressOutOfRange(addr))
        } else {
            Ok(Self(addr))
        }
    }

    /// Raw value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Multiple of [`PAGE_SIZE`].
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u32 == 0
    }

    /// Multiple of [`SECTOR_SIZE`].
    pub const fn is_sector_aligned(self) -> bool {
        self.0 % SECTOR_SIZE as u32 == 0
    }

    /// Offset within the containing page.
    pub const fn page_offset(self) -> usize {
        (self.0 % PAGE_SIZE as u32) as usize
    }

    /// Start of the containing sector.
    pub const fn sector_base(self) -> Self {
        Self(self.0 & !(SECTOR_SIZE as u32 - 1))
    }

    /// `self + delta`, still within 24 bits.
    pub fn offset(self, delta: u32) -> Result<Self, AddressOutOfRange> {
        let raw = self.0.checked_add(delta).ok_or(AddressOutOfRange(u32::MAX))?;
        Self::new(raw)
    }

    /// Big-endian wire form.
    pub const fn to_bytes(self) -> [u8; 3] {
        let b = self.0.to_be_bytes();
        [b[1], b[2], b[3]]
    }
}

impl TryFrom<u32> for FlashAddress {
    type Error = AddressOutOfRange;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FlashAddress> for u32 {
    fn from(a: FlashAddress) -> Self {
        a.0
    }
}

impl fmt::Display for FlashAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06X}", self.0)
    }
}

/// Opcode followed by a 3-byte address.
pub(crate) fn addressed(op: Opcode, addr: FlashAddress) -> [u8; 4] {
    let [a2, a1, a0] = addr.to_bytes();
    [op as u8, a2, a1, a0]
}

// ---------------------------------------------------------------------------
// StatusRegister
// ---------------------------------------------------------------------------

/// Which status register to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusKind {
    /// SR1, opcode `0x05`.
    Primary,
    /// SR2, opcode `0x35`.
    Secondary,
}

impl StatusKind {
    pub(crate) const fn opcode(self) -> Opcode {
        match self {
            Self::Primary => Opcode::ReadStatus1,
            Self::Secondary => Opcode::ReadStatus2,
        }
    }
}

/// Raw status register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct StatusRegister(pub u8);

impl StatusRegister {
    /// Write-in-progress.
    pub const WIP: u8 = 1 << 0;
    /// Write enable latch.
    pub const WEL: u8 = 1 << 1;

    /// Erase or program still running.
    pub const fn is_busy(self) -> bool {
        self.0 & Self::WIP != 0
    }

    /// Write enable latch set.
    pub const fn write_enabled(self) -> bool {
        self.0 & Self::WEL != 0
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Display for StatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

// ---------------------------------------------------------------------------
// JedecId
// ---------------------------------------------------------------------------

/// JEDEC manufacturer and device identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JedecId {
    /// Manufacturer code (`EF` Winbond, `C2` Macronix, `BF` SST, ...).
    pub manufacturer: u8,
    /// Memory type byte.
    pub memory_type: u8,
    /// Capacity / density byte.
    pub capacity: u8,
}

impl JedecId {
    /// Build from the three id bytes.
    pub const fn new(manufacturer: u8, memory_type: u8, capacity: u8) -> Self {
        Self {
            manufacturer,
            memory_type,
            capacity,
        }
    }

    /// Pack as `0xMMTTCC`.
    pub const fn to_u32(self) -> u32 {
        ((self.manufacturer as u32) << 16) | ((self.memory_type as u32) << 8) | self.capacity as u32
    }

    /// Unpack from `0xMMTTCC` (upper byte ignored).
    pub const fn from_u32(v: u32) -> Self {
        let b = v.to_be_bytes();
        Self::new(b[1], b[2], b[3])
    }

    /// The 2-byte device code (`memory_type << 8 | capacity`).
    pub const fn device(self) -> u16 {
        ((self.memory_type as u16) << 8) | self.capacity as u16
    }

    /// All-zero id: nothing drove MISO.
    pub const fn is_absent(self) -> bool {
        self.manufacturer == 0 && self.memory_type == 0 && self.capacity == 0
    }

    /// Chip size from the standard density code, when the code is one.
    ///
    /// Most vendors encode the size as `log2(bytes)` in the capacity byte
    /// (`0x16` = 4 MiB). SST and a few others use their own numbering and
    /// return `None`.
    pub const fn capacity_bytes(self) -> Option<u32> {
        if self.capacity >= 0x10 && self.capacity <= 0x1F {
            Some(1u32 << self.capacity)
        } else {
            None
        }
    }
}

impl fmt::Display for JedecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.manufacturer, self.memory_type, self.capacity)
    }
}

// ---------------------------------------------------------------------------
// SFDP
// ---------------------------------------------------------------------------

/// First 8 bytes of the SFDP table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SfdpHeader {
    /// Raw header bytes.
    pub bytes: [u8; 8],
}

impl SfdpHeader {
    /// ASCII signature at offset 0.
    pub const SIGNATURE: [u8; 4] = *b"SFDP";

    /// Signature matches.
    pub fn is_valid(&self) -> bool {
        self.bytes.get(..4) == Some(&Self::SIGNATURE[..])
    }

    /// `(major, minor)` revision of the SFDP standard.
    pub fn revision(&self) -> (u8, u8) {
        let [_, _, _, _, minor, major, _, _] = self.bytes;
        (major, minor)
    }

    /// Number of parameter headers (the field stores N-1).
    pub fn parameter_headers(&self) -> u16 {
        u16::from(self.bytes[6]).saturating_add(1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn address_range_is_24_bit() {
        assert!(FlashAddress::new(MAX_ADDRESS).is_ok());
        assert_eq!(
            FlashAddress::new(0x0100_0000),
            Err(AddressOutOfRange(0x0100_0000))
        );
        assert!(FlashAddress::new(MAX_ADDRESS).unwrap().offset(1).is_err());
    }

    #[test]
    fn address_alignment_and_wire_form() {
        let a = FlashAddress::new(0x01_2300).unwrap();
        assert!(a.is_page_aligned());
        assert!(!a.is_sector_aligned());
        assert_eq!(a.sector_base().get(), 0x01_2000);
        assert_eq!(a.to_bytes(), [0x01, 0x23, 0x00]);
        assert_eq!(addressed(Opcode::Read, a), [0x03, 0x01, 0x23, 0x00]);
        assert_eq!(a.to_string(), "0x012300");
    }

    #[test]
    fn page_offset() {
        assert_eq!(FlashAddress::new(0x1F0).unwrap().page_offset(), 0xF0);
    }

    #[test]
    fn status_bits() {
        let s = StatusRegister(0x03);
        assert!(s.is_busy());
        assert!(s.write_enabled());
        assert!(!StatusRegister(0x00).is_busy());
        assert_eq!(StatusRegister(0x0A).to_string(), "0A");
    }

    #[test]
    fn jedec_round_trip_and_capacity() {
        let id = JedecId::new(0xEF, 0x40, 0x16);
        assert_eq!(id.to_u32(), 0xEF4016);
        assert_eq!(JedecId::from_u32(0xEF4016), id);
        assert_eq!(id.device(), 0x4016);
        assert_eq!(id.to_string(), "EF4016");
        assert_eq!(id.capacity_bytes(), Some(4 * 1024 * 1024));
        assert_eq!(JedecId::new(0xBF, 0x26, 0x41).capacity_bytes(), None);
        assert!(JedecId::default().is_absent());
    }

    #[test]
    fn sfdp_header_fields() {
        let h = SfdpHeader {
            bytes: [b'S', b'F', b'D', b'P', 0x06, 0x01, 0x01, 0xFF],
        };
        assert!(h.is_valid());
        assert_eq!(h.revision(), (1, 6));
        assert_eq!(h.parameter_headers(), 2);
        assert!(!SfdpHeader::default().is_valid());
    }

    #[test]
    fn opcode_decode() {
        for op in [Opcode::ReadJedecId, Opcode::PageProgram, Opcode::SectorErase4K, Opcode::Reset] {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0xEB), None);
    }
}
