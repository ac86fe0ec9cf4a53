//! SPI NOR flash transport.
//!
//! Thin command layer over an [`SpiDevice`]. Each command is one SPI
//! transaction; the device asserts chip-select for its duration, which is
//! exactly the framing the NOR protocol needs.
//!
//! Program and erase only *start* the operation. Callers poll WIP through
//! [`SpiNor::wait_ready`](crate::wait) or use the `timed_*` helpers.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::{Operation, SpiDevice};
use platform::SpiClock;

use crate::command::{
    addressed, FlashAddress, JedecId, Opcode, SfdpHeader, StatusKind, StatusRegister, MAX_ADDRESS,
};
use crate::error::{require_sector_aligned, require_single_page, Error, Result};

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Gap between Enable Reset and Reset (tSHSL is 30-50 ns; 2 µs covers every part seen).
const RESET_GAP_US: u32 = 2;
/// Reset recovery before the next command (tRST, W25Q worst case 30 µs; SST 1 ms).
const RESET_RECOVERY_MS: u32 = 1;
/// Release from deep power-down (tRES1).
const RELEASE_DP_US: u32 = 50;
/// Enter deep power-down (tDP).
const ENTER_DP_US: u32 = 3;

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// SPI NOR flash handle.
///
/// Owns the bus device and a delay provider. Generic so the same code runs
/// against the STM32 SPI peripheral, `embedded-hal-mock`, and the in-memory
/// [`SimFlash`](crate::sim::SimFlash).
pub struct SpiNor<SPI, D> {
    pub(crate) spi: SPI,
    pub(crate) delay: D,
}

impl<SPI, D> SpiNor<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    /// Wrap a bus device and a delay.
    pub fn new(spi: SPI, delay: D) -> Self {
        Self { spi, delay }
    }

    /// Give the bus device and delay back.
    pub fn release(self) -> (SPI, D) {
        (self.spi, self.delay)
    }

    /// Borrow the bus device.
    pub fn device(&self) -> &SPI {
        &self.spi
    }

    /// Mutably borrow the bus device.
    pub fn device_mut(&mut self) -> &mut SPI {
        &mut self.spi
    }

    async fn command(&mut self, op: Opcode) -> Result<(), SPI::Error> {
        self.spi.write(&[op as u8]).await?;
        Ok(())
    }

    // ── Identification ─────────────────────────────────────────────────────

    /// Read the 3-byte JEDEC id.
    ///
    /// Full-duplex: the byte clocked in while the opcode goes out is junk.
    pub async fn read_identity(&mut self) -> Result<JedecId, SPI::Error> {
        let mut buf = [Opcode::ReadJedecId as u8, 0, 0, 0];
        self.spi.transfer_in_place(&mut buf).await?;
        let [_, mfg, ty, cap] = buf;
        let id = JedecId::new(mfg, ty, cap);
        trace!("JEDEC id {}", id);
        Ok(id)
    }

    /// Read status register 1 or 2.
    pub async fn read_status(&mut self, kind: StatusKind) -> Result<StatusRegister, SPI::Error> {
        Ok(self.status_raw(kind).await?)
    }

    /// Status read that can only fail on the bus.
    pub(crate) async fn status_raw(
        &mut self,
        kind: StatusKind,
    ) -> core::result::Result<StatusRegister, SPI::Error> {
        let mut value = [0u8; 1];
        self.spi
            .transaction(&mut [
                Operation::Write(&[kind.opcode() as u8]),
                Operation::Read(&mut value),
            ])
            .await?;
        let [bits] = value;
        Ok(StatusRegister(bits))
    }

    /// Read the first 8 bytes of the SFDP table.
    pub async fn read_sfdp_header(&mut self) -> Result<SfdpHeader, SPI::Error> {
        let mut header = SfdpHeader::default();
        // opcode, 3 address bytes, 1 dummy
        let cmd = [Opcode::ReadSfdp as u8, 0, 0, 0, 0];
        self.spi
            .transaction(&mut [Operation::Write(&cmd), Operation::Read(&mut header.bytes)])
            .await?;
        Ok(header)
    }

    // ── Data path ──────────────────────────────────────────────────────────

    /// Set the write enable latch.
    pub async fn write_enable(&mut self) -> Result<(), SPI::Error> {
        self.command(Opcode::WriteEnable).await
    }

    /// Normal read (`0x03`) of `buf.len()` bytes starting at `addr`.
    pub async fn read_data(&mut self, addr: FlashAddress, buf: &mut [u8]) -> Result<(), SPI::Error> {
        if buf.is_empty() {
            return Ok(());
        }
        let last = u32::try_from(buf.len())
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| addr.get().checked_add(n))
            .filter(|&end| end <= MAX_ADDRESS);
        if last.is_none() {
            return Err(Error::OutOfRange { addr: addr.get() });
        }
        let header = addressed(Opcode::Read, addr);
        self.spi
            .transaction(&mut [Operation::Write(&header), Operation::Read(buf)])
            .await?;
        Ok(())
    }

    /// Start a page program.
    ///
    /// Sets WEL first. `data` must be non-empty and stay inside the page
    /// that contains `addr`; the chip would otherwise wrap to the page start.
    pub async fn program_page(&mut self, addr: FlashAddress, data: &[u8]) -> Result<(), SPI::Error> {
        require_single_page(addr, data.len())?;
        self.write_enable().await?;
        let header = addressed(Opcode::PageProgram, addr);
        self.spi
            .transaction(&mut [Operation::Write(&header), Operation::Write(data)])
            .await?;
        Ok(())
    }

    /// Start a 4 KB sector erase. `addr` must be sector aligned.
    pub async fn erase_sector_4k(&mut self, addr: FlashAddress) -> Result<(), SPI::Error> {
        require_sector_aligned(addr)?;
        self.write_enable().await?;
        self.spi.write(&addressed(Opcode::SectorErase4K, addr)).await?;
        Ok(())
    }

    // ── Power and reset ────────────────────────────────────────────────────

    /// Enable Reset + Reset, then wait out the recovery time.
    pub async fn soft_reset(&mut self) -> Result<(), SPI::Error> {
        self.command(Opcode::EnableReset).await?;
        self.delay.delay_us(RESET_GAP_US).await;
        self.command(Opcode::Reset).await?;
        self.delay.delay_ms(RESET_RECOVERY_MS).await;
        debug!("flash soft reset");
        Ok(())
    }

    /// Wake the chip from deep power-down.
    pub async fn release_from_deep_power_down(&mut self) -> Result<(), SPI::Error> {
        self.command(Opcode::ReleasePowerDown).await?;
        self.delay.delay_us(RELEASE_DP_US).await;
        Ok(())
    }

    /// Put the chip into deep power-down. Only `0xAB` is accepted afterwards.
    pub async fn deep_power_down(&mut self) -> Result<(), SPI::Error> {
        self.command(Opcode::DeepPowerDown).await?;
        self.delay.delay_us(ENTER_DP_US).await;
        Ok(())
    }

    /// Bring a chip in an unknown state back to defaults.
    ///
    /// Wakes it in case it was powered down, then soft-resets, which also
    /// abandons any half-issued command sequence.
    pub async fn recover(&mut self) -> Result<(), SPI::Error> {
        self.release_from_deep_power_down().await?;
        self.soft_reset().await
    }
}

impl<SPI, D> SpiNor<SPI, D>
where
    SPI: SpiDevice + SpiClock,
    D: DelayNs,
{
    /// Re-clock the bus. Takes effect from the next transaction.
    pub fn set_clock(&mut self, hz: u32) {
        if self.spi.frequency() != hz {
            debug!("SPI clock -> {} Hz", hz);
            self.spi.set_frequency(hz);
        }
    }

    /// Current bus clock.
    pub fn clock(&self) -> u32 {
        self.spi.frequency()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::spi::{Mock as SpiMock, Transaction as SpiTransaction};

    type TestNor = SpiNor<SpiMock<u8>, NoopDelay>;

    fn nor(expectations: &[SpiTransaction<u8>]) -> (TestNor, SpiMock<u8>) {
        let spi = SpiMock::new(expectations);
        (SpiNor::new(spi.clone(), NoopDelay), spi)
    }

    fn at(a: u32) -> FlashAddress {
        FlashAddress::new(a).unwrap()
    }

    /// One `SpiDevice::write()` as the mock sees it.
    fn write_txn(data: &[u8]) -> [SpiTransaction<u8>; 3] {
        [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(data.to_vec()),
            SpiTransaction::transaction_end(),
        ]
    }

    #[tokio::test]
    async fn jedec_discards_the_opcode_byte() {
        let (mut dev, mut spi) = nor(&[
            SpiTransaction::transaction_start(),
            SpiTransaction::transfer_in_place(vec![0x9F, 0, 0, 0], vec![0xFF, 0xEF, 0x40, 0x16]),
            SpiTransaction::transaction_end(),
        ]);
        let id = dev.read_identity().await.unwrap();
        assert_eq!(id, JedecId::new(0xEF, 0x40, 0x16));
        spi.done();
    }

    #[tokio::test]
    async fn status_registers_use_their_opcodes() {
        let (mut dev, mut spi) = nor(&[
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x05]),
            SpiTransaction::read_vec(vec![0x03]),
            SpiTransaction::transaction_end(),
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x35]),
            SpiTransaction::read_vec(vec![0x02]),
            SpiTransaction::transaction_end(),
        ]);
        let sr1 = dev.read_status(StatusKind::Primary).await.unwrap();
        let sr2 = dev.read_status(StatusKind::Secondary).await.unwrap();
        assert!(sr1.is_busy());
        assert_eq!(sr2.bits(), 0x02);
        spi.done();
    }

    #[tokio::test]
    async fn sfdp_sends_address_and_dummy() {
        let (mut dev, mut spi) = nor(&[
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x5A, 0, 0, 0, 0]),
            SpiTransaction::read_vec(b"SFDP\x06\x01\x00\xFF".to_vec()),
            SpiTransaction::transaction_end(),
        ]);
        let h = dev.read_sfdp_header().await.unwrap();
        assert!(h.is_valid());
        spi.done();
    }

    #[tokio::test]
    async fn read_data_frames_address_big_endian() {
        let (mut dev, mut spi) = nor(&[
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x03, 0x12, 0x34, 0x56]),
            SpiTransaction::read_vec(vec![1, 2, 3]),
            SpiTransaction::transaction_end(),
        ]);
        let mut buf = [0u8; 3];
        dev.read_data(at(0x12_3456), &mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);
        spi.done();
    }

    #[tokio::test]
    async fn read_past_end_of_address_space_is_rejected() {
        let (mut dev, mut spi) = nor(&[]);
        let mut buf = [0u8; 2];
        let r = dev.read_data(at(MAX_ADDRESS), &mut buf).await;
        assert_eq!(r, Err(Error::OutOfRange { addr: MAX_ADDRESS }));
        spi.done();
    }

    #[tokio::test]
    async fn program_sets_wel_then_sends_payload() {
        let mut expect = Vec::new();
        expect.extend(write_txn(&[0x06]));
        expect.extend([
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![0x02, 0x00, 0x01, 0x00]),
            SpiTransaction::write_vec(vec![0xAA, 0x55]),
            SpiTransaction::transaction_end(),
        ]);
        let (mut dev, mut spi) = nor(&expect);
        dev.program_page(at(0x100), &[0xAA, 0x55]).await.unwrap();
        spi.done();
    }

    #[tokio::test]
    async fn program_across_page_boundary_sends_nothing() {
        let (mut dev, mut spi) = nor(&[]);
        let r = dev.program_page(at(0x1F0), &[0u8; 32]).await;
        assert_eq!(r, Err(Error::PageCross { addr: 0x1F0, len: 32 }));
        let r = dev.program_page(at(0x100), &[]).await;
        assert!(matches!(r, Err(Error::PageCross { .. })));
        spi.done();
    }

    #[tokio::test]
    async fn erase_rejects_unaligned_address() {
        let (mut dev, mut spi) = nor(&[]);
        let r = dev.erase_sector_4k(at(0x1100)).await;
        assert_eq!(r, Err(Error::Unaligned { addr: 0x1100 }));
        spi.done();
    }

    #[tokio::test]
    async fn erase_sets_wel_then_sends_command() {
        let mut expect = Vec::new();
        expect.extend(write_txn(&[0x06]));
        expect.extend(write_txn(&[0x20, 0x00, 0x30, 0x00]));
        let (mut dev, mut spi) = nor(&expect);
        dev.erase_sector_4k(at(0x3000)).await.unwrap();
        spi.done();
    }

    #[tokio::test]
    async fn recover_wakes_then_resets() {
        let mut expect = Vec::new();
        expect.extend(write_txn(&[0xAB]));
        expect.extend(write_txn(&[0x66]));
        expect.extend(write_txn(&[0x99]));
        let (mut dev, mut spi) = nor(&expect);
        dev.recover().await.unwrap();
        spi.done();
    }
}
