//! In-memory SPI NOR chip.
//!
//! [`SimFlash`] sits behind the same [`SpiDevice`] trait as the real bus and
//! decodes the command stream byte by byte, so the transport, the timed
//! layer and everything above it run unmodified in host tests and in the
//! desktop emulator.
//!
//! Modelled behaviour:
//! - program can only clear bits (new = old AND data) and wraps inside the page
//! - sector erase sets 4 KB to `0xFF`
//! - program and erase need WEL, which they clear
//! - WIP stays set for a configurable number of SR1 polls
//! - commands other than status reads are ignored while busy
//! - `0x66` + `0x99` reset; `0xB9` / `0xAB` deep power-down
//!
//! Fault injection: a chip stuck busy, bits stuck at zero, programs that
//! drop a bit above a clock threshold, and a failing bus.

// Address arithmetic is modulo the array size and every index is bounds
// checked through `get`/`get_mut`.
#![allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation)]

use embedded_hal::spi::ErrorKind;
use embedded_hal_async::spi::{Operation, SpiDevice};
use platform::SpiClock;

use crate::command::{JedecId, Opcode, StatusRegister, PAGE_SIZE, SECTOR_SIZE};

/// SR1 polls a sector erase stays busy for, by default.
pub const DEFAULT_ERASE_POLLS: u32 = 4;
/// SR1 polls a page program stays busy for, by default.
pub const DEFAULT_PROGRAM_POLLS: u32 = 2;

const SFDP_TABLE: [u8; 16] = [
    b'S', b'F', b'D', b'P', 0x06, 0x01, 0x00, 0xFF, // header: rev 1.6, 1 parameter header
    0x00, 0x06, 0x01, 0x10, 0x80, 0x00, 0x00, 0xFF, // basic flash parameter table header
];

/// Per-transaction decode state.
#[derive(Debug, Default)]
struct Frame {
    pos: usize,
    opcode: Option<u8>,
    addr: u32,
    /// Bytes latched by a page program, applied when CS rises.
    latch: Vec<u8>,
}

/// Simulated 25-series NOR flash.
#[derive(Debug)]
pub struct SimFlash {
    mem: Vec<u8>,
    jedec: JedecId,
    sfdp: bool,
    wel: bool,
    busy_polls: u32,
    erase_polls: u32,
    program_polls: u32,
    stuck_busy: bool,
    powered_down: bool,
    reset_armed: bool,
    bus_fault: bool,
    clock_hz: u32,
    program_fault_above_hz: Option<u32>,
    stuck_zero: Vec<(u32, u8)>,
    frame: Frame,
    reads: u32,
    programs: u32,
    erases: u32,
}

impl SimFlash {
    /// Blank chip of `size` bytes (power of two, at least one sector).
    ///
    /// The JEDEC id is Winbond-style (`EF 40 nn`) with the density code
    /// derived from the size.
    pub fn new(size: usize) -> Self {
        let size = size.max(SECTOR_SIZE).next_power_of_two();
        let density = size.trailing_zeros() as u8;
        Self {
            mem: vec![0xFF; size],
            jedec: JedecId::new(0xEF, 0x40, density),
            sfdp: true,
            wel: false,
            busy_polls: 0,
            erase_polls: DEFAULT_ERASE_POLLS,
            program_polls: DEFAULT_PROGRAM_POLLS,
            stuck_busy: false,
            powered_down: false,
            reset_armed: false,
            bus_fault: false,
            clock_hz: 12_000_000,
            program_fault_above_hz: None,
            stuck_zero: Vec::new(),
            frame: Frame::default(),
            reads: 0,
            programs: 0,
            erases: 0,
        }
    }

    /// 4 MiB Winbond W25Q32 (`EF 40 16`).
    pub fn w25q32() -> Self {
        Self::new(4 * 1024 * 1024)
    }

    /// 2 MiB SST26VF016B (`BF 26 41`, no standard density code).
    pub fn sst26vf016b() -> Self {
        Self::new(2 * 1024 * 1024).with_jedec(JedecId::new(0xBF, 0x26, 0x41))
    }

    /// Override the JEDEC id.
    #[must_use]
    pub fn with_jedec(mut self, id: JedecId) -> Self {
        self.jedec = id;
        self
    }

    /// Answer SFDP reads with zeros instead of a table.
    #[must_use]
    pub fn without_sfdp(mut self) -> Self {
        self.sfdp = false;
        self
    }

    /// How many SR1 polls erase and program stay busy.
    #[must_use]
    pub fn with_busy_polls(mut self, erase: u32, program: u32) -> Self {
        self.erase_polls = erase;
        self.program_polls = program;
        self
    }

    // ── Fault injection ────────────────────────────────────────────────────

    /// Report WIP forever.
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Bit `bit` of byte `addr` always reads as zero.
    pub fn set_stuck_bit(&mut self, addr: u32, bit: u8) {
        self.stuck_zero.push((addr, 1u8 << (bit & 7)));
    }

    /// Programs issued while the clock is above `hz` lose bit 0 of every
    /// 16th byte.
    pub fn set_program_fault_above(&mut self, hz: Option<u32>) {
        self.program_fault_above_hz = hz;
    }

    /// Every transaction fails with [`ErrorKind::Other`].
    pub fn set_bus_fault(&mut self, fault: bool) {
        self.bus_fault = fault;
    }

    /// Enter deep power-down without going through the bus.
    pub fn force_power_down(&mut self) {
        self.powered_down = true;
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    /// Array contents.
    pub fn contents(&self) -> &[u8] {
        &self.mem
    }

    /// Overwrite array contents at `addr` (no NOR semantics).
    pub fn load(&mut self, addr: usize, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            let idx = (addr + i) % self.mem.len();
            if let Some(slot) = self.mem.get_mut(idx) {
                *slot = *b;
            }
        }
    }

    /// Array size in bytes.
    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    /// The id this chip answers `0x9F` with.
    pub fn jedec(&self) -> JedecId {
        self.jedec
    }

    /// `0x03` commands served.
    pub fn reads(&self) -> u32 {
        self.reads
    }

    /// Page programs executed.
    pub fn programs(&self) -> u32 {
        self.programs
    }

    /// Sector erases executed.
    pub fn erases(&self) -> u32 {
        self.erases
    }

    /// Deep power-down active.
    pub fn is_powered_down(&self) -> bool {
        self.powered_down
    }

    /// WEL currently set.
    pub fn write_enabled(&self) -> bool {
        self.wel
    }

    // ── Command decoding ───────────────────────────────────────────────────

    fn busy(&self) -> bool {
        self.stuck_busy || self.busy_polls > 0
    }

    fn status1(&self) -> u8 {
        let mut sr = 0u8;
        if self.busy() {
            sr |= StatusRegister::WIP;
        }
        if self.wel {
            sr |= StatusRegister::WEL;
        }
        sr
    }

    fn index(&self, addr: u32) -> usize {
        addr as usize % self.mem.len()
    }

    fn read_byte(&self, addr: u32) -> u8 {
        let mut b = self.mem.get(self.index(addr)).copied().unwrap_or(0xFF);
        for &(a, mask) in &self.stuck_zero {
            if self.index(a) == self.index(addr) {
                b &= !mask;
            }
        }
        b
    }

    /// One byte on the wire: MOSI in, MISO out.
    fn exchange(&mut self, mosi: u8) -> u8 {
        let pos = self.frame.pos;
        self.frame.pos += 1;

        if pos == 0 {
            self.frame.opcode = Some(mosi);
            if mosi != Opcode::Reset as u8 && mosi != Opcode::EnableReset as u8 {
                self.reset_armed = false;
            }
            return 0xFF;
        }
        let Some(op) = self.frame.opcode else {
            return 0xFF;
        };
        if self.powered_down {
            return 0x00;
        }

        // Status reads are the only thing a busy chip answers.
        if op == Opcode::ReadStatus1 as u8 {
            let sr = self.status1();
            if !self.stuck_busy {
                self.busy_polls = self.busy_polls.saturating_sub(1);
            }
            return sr;
        }
        if op == Opcode::ReadStatus2 as u8 {
            return 0x00;
        }
        if self.busy() {
            return 0xFF;
        }

        match Opcode::from_u8(op) {
            Some(Opcode::ReadJedecId) => match pos {
                1 => self.jedec.manufacturer,
                2 => self.jedec.memory_type,
                3 => self.jedec.capacity,
                _ => 0x00,
            },
            Some(Opcode::ReadSfdp) => {
                if pos <= 3 {
                    self.frame.addr = (self.frame.addr << 8) | u32::from(mosi);
                    0xFF
                } else if pos == 4 || !self.sfdp {
                    0x00
                } else {
                    let offset = self.frame.addr as usize + (pos - 5);
                    SFDP_TABLE.get(offset).copied().unwrap_or(0xFF)
                }
            }
            Some(Opcode::Read) => {
                if pos <= 3 {
                    self.frame.addr = (self.frame.addr << 8) | u32::from(mosi);
                    if pos == 3 {
                        self.reads = self.reads.saturating_add(1);
                    }
                    0xFF
                } else {
                    self.read_byte(self.frame.addr.wrapping_add((pos - 4) as u32))
                }
            }
            Some(Opcode::PageProgram) => {
                if pos <= 3 {
                    self.frame.addr = (self.frame.addr << 8) | u32::from(mosi);
                } else {
                    self.frame.latch.push(mosi);
                }
                0xFF
            }
            Some(Opcode::SectorErase4K) => {
                if pos <= 3 {
                    self.frame.addr = (self.frame.addr << 8) | u32::from(mosi);
                }
                0xFF
            }
            _ => 0xFF,
        }
    }

    /// CS rises: commit whatever the frame asked for.
    fn end_frame(&mut self) {
        let frame = core::mem::take(&mut self.frame);
        let Some(op) = frame.opcode else {
            return;
        };

        if self.powered_down {
            if op == Opcode::ReleasePowerDown as u8 {
                self.powered_down = false;
            }
            return;
        }
        if self.busy() {
            return;
        }

        match Opcode::from_u8(op) {
            Some(Opcode::WriteEnable) => self.wel = true,
            Some(Opcode::EnableReset) => self.reset_armed = true,
            Some(Opcode::Reset) if self.reset_armed => {
                self.reset_armed = false;
                self.wel = false;
                self.busy_polls = 0;
            }
            Some(Opcode::DeepPowerDown) => self.powered_down = true,
            Some(Opcode::PageProgram) if self.wel && frame.pos > 4 => {
                self.commit_program(frame.addr, &frame.latch);
                self.wel = false;
                self.busy_polls = self.program_polls;
            }
            Some(Opcode::SectorErase4K) if self.wel && frame.pos >= 4 => {
                let base = frame.addr & !(SECTOR_SIZE as u32 - 1);
                for i in 0..SECTOR_SIZE as u32 {
                    let idx = self.index(base + i);
                    if let Some(b) = self.mem.get_mut(idx) {
                        *b = 0xFF;
                    }
                }
                self.erases = self.erases.saturating_add(1);
                self.wel = false;
                self.busy_polls = self.erase_polls;
            }
            _ => {}
        }
    }

    fn commit_program(&mut self, addr: u32, data: &[u8]) {
        let page_base = addr & !(PAGE_SIZE as u32 - 1);
        let start = addr as usize % PAGE_SIZE;
        // only the last 256 bytes clocked in are kept, like the real latch
        let skip = data.len().saturating_sub(PAGE_SIZE);
        let faulty = self
            .program_fault_above_hz
            .is_some_and(|limit| self.clock_hz > limit);
        for (i, &b) in data.iter().enumerate().skip(skip) {
            let offset = (start + i) % PAGE_SIZE;
            let b = if faulty && i % 16 == 0 { b & !0x01 } else { b };
            let idx = self.index(page_base + offset as u32);
            if let Some(cell) = self.mem.get_mut(idx) {
                *cell &= b;
            }
        }
        self.programs = self.programs.saturating_add(1);
    }
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::w25q32()
    }
}

impl embedded_hal::spi::ErrorType for SimFlash {
    type Error = ErrorKind;
}

impl SpiDevice for SimFlash {
    async fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), ErrorKind> {
        if self.bus_fault {
            return Err(ErrorKind::Other);
        }
        self.frame = Frame::default();
        for op in operations.iter_mut() {
            match op {
                Operation::Read(buf) => {
                    for b in buf.iter_mut() {
                        *b = self.exchange(0x00);
                    }
                }
                Operation::Write(data) => {
                    for &b in data.iter() {
                        self.exchange(b);
                    }
                }
                Operation::Transfer(read, write) => {
                    for i in 0..read.len().max(write.len()) {
                        let out = self.exchange(write.get(i).copied().unwrap_or(0x00));
                        if let Some(r) = read.get_mut(i) {
                            *r = out;
                        }
                    }
                }
                Operation::TransferInPlace(buf) => {
                    for b in buf.iter_mut() {
                        *b = self.exchange(*b);
                    }
                }
                Operation::DelayNs(_) => {}
            }
        }
        self.end_frame();
        Ok(())
    }
}

impl SpiClock for SimFlash {
    fn set_frequency(&mut self, hz: u32) {
        self.clock_hz = hz;
    }

    fn frequency(&self) -> u32 {
        self.clock_hz
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::command::{FlashAddress, StatusKind};
    use crate::transport::SpiNor;
    use crate::wait::WaitPolicy;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    fn at(a: u32) -> FlashAddress {
        FlashAddress::new(a).unwrap()
    }

    fn nor(sim: SimFlash) -> SpiNor<SimFlash, NoopDelay> {
        SpiNor::new(sim, NoopDelay)
    }

    #[tokio::test]
    async fn identifies_itself() {
        let mut n = nor(SimFlash::w25q32());
        assert_eq!(n.read_identity().await.unwrap(), JedecId::new(0xEF, 0x40, 0x16));
        assert!(n.read_sfdp_header().await.unwrap().is_valid());

        let mut n = nor(SimFlash::sst26vf016b().without_sfdp());
        assert_eq!(n.read_identity().await.unwrap().to_u32(), 0xBF2641);
        assert!(!n.read_sfdp_header().await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn program_needs_write_enable() {
        let mut sim = SimFlash::new(64 * 1024);
        // raw 0x02 without WREN
        sim.transaction(&mut [Operation::Write(&[0x02, 0, 0, 0, 0x12])])
            .await
            .unwrap();
        assert_eq!(sim.contents()[0], 0xFF);
        assert_eq!(sim.programs(), 0);
    }

    #[tokio::test]
    async fn program_and_erase_follow_nor_rules() {
        let mut n = nor(SimFlash::new(64 * 1024));
        let policy = WaitPolicy::blocking();
        n.program_page(at(0x1000), &[0xF0, 0x0F]).await.unwrap();
        n.wait_ready(&policy).await.unwrap();
        n.program_page(at(0x1000), &[0x3C, 0x3C]).await.unwrap();
        n.wait_ready(&policy).await.unwrap();
        assert_eq!(&n.device().contents()[0x1000..0x1002], &[0x30, 0x0C]);

        n.erase_sector_4k(at(0x1000)).await.unwrap();
        n.wait_ready(&policy).await.unwrap();
        assert!(n.device().contents()[0x1000..0x2000].iter().all(|&b| b == 0xFF));
        assert_eq!(n.device().erases(), 1);
    }

    #[tokio::test]
    async fn busy_for_configured_polls_and_ignores_reads() {
        let mut n = nor(SimFlash::new(64 * 1024).with_busy_polls(3, 1));
        n.erase_sector_4k(at(0)).await.unwrap();
        let mut buf = [0u8; 4];
        n.read_data(at(0), &mut buf).await.unwrap();
        assert_eq!(n.device().reads(), 0);

        let mut busy = 0;
        while n.read_status(StatusKind::Primary).await.unwrap().is_busy() {
            busy += 1;
        }
        assert_eq!(busy, 3);
    }

    #[tokio::test]
    async fn deep_power_down_silences_the_chip() {
        let mut n = nor(SimFlash::w25q32());
        n.deep_power_down().await.unwrap();
        assert!(n.read_identity().await.unwrap().is_absent());
        n.recover().await.unwrap();
        assert!(!n.device().is_powered_down());
        assert_eq!(n.read_identity().await.unwrap().to_u32(), 0xEF4016);
    }

    #[tokio::test]
    async fn reset_clears_write_enable() {
        let mut n = nor(SimFlash::w25q32());
        n.write_enable().await.unwrap();
        assert!(n.device().write_enabled());
        n.soft_reset().await.unwrap();
        assert!(!n.device().write_enabled());
    }

    #[tokio::test]
    async fn stuck_bit_reads_zero() {
        let mut sim = SimFlash::new(64 * 1024);
        sim.set_stuck_bit(0x10, 7);
        let mut n = nor(sim);
        let mut buf = [0u8; 1];
        n.read_data(at(0x10), &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x7F);
    }

    #[tokio::test]
    async fn program_fault_above_clock() {
        let mut sim = SimFlash::new(64 * 1024);
        sim.set_program_fault_above(Some(20_000_000));
        let mut n = nor(sim);
        let policy = WaitPolicy::blocking();

        n.set_clock(12_000_000);
        n.program_page(at(0), &[0xFF; 1]).await.unwrap();
        n.wait_ready(&policy).await.unwrap();
        assert_eq!(n.device().contents()[0], 0xFF);

        n.set_clock(24_000_000);
        n.program_page(at(0x100), &[0xFF; 1]).await.unwrap();
        n.wait_ready(&policy).await.unwrap();
        assert_eq!(n.device().contents()[0x100], 0xFE);
    }

    #[tokio::test]
    async fn bus_fault_surfaces_as_spi_error() {
        let mut sim = SimFlash::new(64 * 1024);
        sim.set_bus_fault(true);
        let mut n = nor(sim);
        let r = n.read_identity().await;
        assert_eq!(r, Err(crate::Error::Spi(ErrorKind::Other)));
    }
}
