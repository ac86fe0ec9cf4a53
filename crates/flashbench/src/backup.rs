//! Whole-chip backup to a file and restore from it
//!
//! Both directions move one 4 KB sector at a time through caller-owned
//! buffers ([`TransferBuffers`], a `StaticCell` on hardware). Unlike the
//! benchmark, every failure here is fatal: the operation stops at once and
//! the error names the byte offset it reached. Nothing already written is
//! rolled back.

use core::fmt;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;
use platform::{sink_line, File, OpenMode, Storage, TextSink};
use spi_nor::{Error, FlashAddress, JedecId, SpiNor, StatusRegister, WaitError, WaitPolicy, PAGE_SIZE, SECTOR_SIZE};

use crate::config::{DEFAULT_CHIP_BYTES, RESTORE_ERASE_TIMEOUT_MS, RESTORE_PROGRAM_TIMEOUT_MS};
use crate::status::BenchStatus;

/// Bytes moved per step.
pub const CHUNK: usize = SECTOR_SIZE;

/// Largest image 24-bit addressing reaches.
pub const MAX_IMAGE_BYTES: u32 = 0x100_0000;

/// Backup syncs the file whenever the offset crosses a 64 KB boundary.
const SYNC_MASK: u32 = 0xFFFF;

/// Progress is reported every 256 KB.
const PROGRESS_MASK: u32 = 0x3_FFFF;

/// Scratch memory for one sector and its read-back.
pub struct TransferBuffers {
    /// Data on its way between flash and file.
    pub data: [u8; CHUNK],
    /// Read-back for restore verification.
    pub readback: [u8; CHUNK],
}

impl TransferBuffers {
    /// Zeroed buffers. Usable in a `StaticCell` initializer.
    pub const fn new() -> Self {
        Self {
            data: [0; CHUNK],
            readback: [0; CHUNK],
        }
    }
}

impl Default for TransferBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits used while restoring. Timeouts are fatal here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferPolicy {
    /// After each sector erase.
    pub erase: WaitPolicy,
    /// After each page program.
    pub program: WaitPolicy,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            erase: WaitPolicy::cooperative(RESTORE_ERASE_TIMEOUT_MS),
            program: WaitPolicy::cooperative(RESTORE_PROGRAM_TIMEOUT_MS),
        }
    }
}

/// Image size for a chip: the density from the JEDEC id when it is a
/// standard code within 24-bit addressing, else [`DEFAULT_CHIP_BYTES`].
pub fn default_total_bytes(id: JedecId) -> u32 {
    id.capacity_bytes()
        .filter(|&bytes| bytes <= MAX_IMAGE_BYTES)
        .unwrap_or(DEFAULT_CHIP_BYTES)
}

/// Backup or restore failure. `S` is the SPI error, `F` the file error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BackupError<S, F> {
    /// Bus or argument error from the flash transport.
    Flash {
        /// Chip offset being processed.
        offset: u32,
        /// Transport error.
        error: Error<S>,
    },
    /// WIP did not clear in time.
    Timeout {
        /// Chip offset being processed.
        offset: u32,
        /// SR1 at the last poll.
        status: StatusRegister,
    },
    /// The file layer failed.
    Storage {
        /// Chip offset being processed.
        offset: u32,
        /// File error.
        error: F,
    },
    /// The file took fewer bytes than offered.
    ShortWrite {
        /// Chip offset of the chunk.
        offset: u32,
    },
    /// The image ended before the expected size.
    ShortRead {
        /// Chip offset where data ran out.
        offset: u32,
    },
    /// The image file is empty.
    EmptySource,
    /// Read-back differs from the image.
    VerifyFailed {
        /// First differing byte.
        addr: u32,
    },
}

impl<S, F> BackupError<S, F> {
    /// Chip offset the operation reached, when there is one.
    pub const fn offset(&self) -> Option<u32> {
        match self {
            Self::Flash { offset, .. }
            | Self::Timeout { offset, .. }
            | Self::Storage { offset, .. }
            | Self::ShortWrite { offset }
            | Self::ShortRead { offset } => Some(*offset),
            Self::VerifyFailed { addr } => Some(*addr),
            Self::EmptySource => None,
        }
    }

    fn wait(offset: u32, e: WaitError<S>) -> Self {
        match e {
            WaitError::Timeout { last_status } => Self::Timeout {
                offset,
                status: last_status,
            },
            WaitError::Spi(e) => Self::Flash {
                offset,
                error: Error::Spi(e),
            },
        }
    }
}

impl<S: fmt::Debug, F: fmt::Debug> fmt::Display for BackupError<S, F> {
    #[allow(clippy::use_debug)] // file error types only promise Debug
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash { offset, error } => write!(f, "flash error at 0x{offset:06X}: {error}"),
            Self::Timeout { offset, status } => {
                write!(f, "flash still busy at 0x{offset:06X} (SR1={status})")
            }
            Self::Storage { offset, error } => write!(f, "storage error at 0x{offset:06X}: {error:?}"),
            Self::ShortWrite { offset } => write!(f, "short write at 0x{offset:06X}"),
            Self::ShortRead { offset } => write!(f, "unexpected end of image at 0x{offset:06X}"),
            Self::EmptySource => f.write_str("file size is 0"),
            Self::VerifyFailed { addr } => write!(f, "VERIFY FAILED at 0x{addr:06X}"),
        }
    }
}

/// Result alias for this module.
pub type BackupResult<T, S, F> = Result<T, BackupError<S, F>>;

fn address<S, F>(offset: u32) -> BackupResult<FlashAddress, S, F> {
    FlashAddress::new(offset).map_err(|_| BackupError::Flash {
        offset,
        error: Error::OutOfRange { addr: offset },
    })
}

#[allow(clippy::cast_possible_truncation)] // CHUNK is 4096
fn chunk_len(total: u32, offset: u32) -> u32 {
    total.saturating_sub(offset).min(CHUNK as u32)
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

/// Copy `total_bytes` of the chip, from address 0, into `file`.
pub async fn backup<SPI, D, F, T>(
    nor: &mut SpiNor<SPI, D>,
    file: &mut F,
    total_bytes: u32,
    buf: &mut [u8; CHUNK],
    status: &BenchStatus,
    sink: &mut T,
) -> BackupResult<u32, SPI::Error, F::Error>
where
    SPI: SpiDevice,
    D: DelayNs,
    F: File,
    T: TextSink,
{
    let mut offset = 0u32;
    while offset < total_bytes {
        let len = chunk_len(total_bytes, offset);
        let chunk = buf.get_mut(..len as usize).unwrap_or_default();
        nor.read_data(address(offset)?, chunk)
            .await
            .map_err(|error| BackupError::Flash { offset, error })?;
        let complete = platform::storage::write_all(file, chunk)
            .await
            .map_err(|error| BackupError::Storage { offset, error })?;
        if !complete {
            return Err(BackupError::ShortWrite { offset });
        }

        offset = offset.saturating_add(len);
        if offset & SYNC_MASK == 0 {
            file.flush()
                .await
                .map_err(|error| BackupError::Storage { offset, error })?;
        }
        if offset & PROGRESS_MASK == 0 {
            sink_line!(sink, "Backup progress: {}/{} bytes", offset, total_bytes);
        }
        status.set_progress(offset, total_bytes);
    }
    file.flush()
        .await
        .map_err(|error| BackupError::Storage { offset, error })?;
    Ok(offset)
}

/// Back up into `path` (replaced if present) with start and end messages.
pub async fn backup_to_storage<SPI, D, S, T>(
    nor: &mut SpiNor<SPI, D>,
    storage: &S,
    path: &str,
    total_bytes: u32,
    buf: &mut [u8; CHUNK],
    status: &BenchStatus,
    sink: &mut T,
) -> BackupResult<u32, SPI::Error, S::Error>
where
    SPI: SpiDevice,
    D: DelayNs,
    S: Storage,
    T: TextSink,
{
    let mut file = storage
        .open(path, OpenMode::Truncate)
        .await
        .map_err(|error| BackupError::Storage { offset: 0, error })?;
    sink_line!(sink, "Backing up {} bytes to {} ...", total_bytes, path);
    match backup(nor, &mut file, total_bytes, buf, status, sink).await {
        Ok(bytes) => {
            sink_line!(sink, "Backup complete.");
            info!("backup: {} bytes", bytes);
            Ok(bytes)
        }
        Err(e) => {
            sink_line!(sink, "Backup failed at address 0x{:06X}: {}", e.offset().unwrap_or(0), e);
            error!("backup failed at {:#x}", e.offset().unwrap_or(0));
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// What a restore wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RestoreReport {
    /// Size of the image file.
    pub source_bytes: u64,
    /// Bytes programmed.
    pub written: u32,
    /// Every sector was read back and compared.
    pub verified: bool,
}

/// Fill `buf` from `file`, looping over short reads. Returns bytes read.
async fn read_full<F: File>(file: &mut F, buf: &mut [u8]) -> Result<usize, F::Error> {
    let mut filled = 0usize;
    while let Some(rest) = buf.get_mut(filled..).filter(|r| !r.is_empty()) {
        let n = file.read(rest).await?;
        if n == 0 {
            break;
        }
        filled = filled.saturating_add(n);
    }
    Ok(filled)
}

/// Write the image in `file` to the chip from address 0.
///
/// Writes `min(file size, total_bytes)` bytes: per sector, erase, program
/// in pages, and with `verify` read back and compare.
#[allow(clippy::too_many_arguments, clippy::cast_possible_truncation)] // PAGE_SIZE fits u32
pub async fn restore<SPI, D, F, T>(
    nor: &mut SpiNor<SPI, D>,
    file: &mut F,
    total_bytes: u32,
    verify: bool,
    policy: &TransferPolicy,
    bufs: &mut TransferBuffers,
    status: &BenchStatus,
    sink: &mut T,
) -> BackupResult<RestoreReport, SPI::Error, F::Error>
where
    SPI: SpiDevice,
    D: DelayNs,
    F: File,
    T: TextSink,
{
    let source_bytes = file.size();
    if source_bytes == 0 {
        sink_line!(sink, "RESTORE: file size is 0, aborting.");
        return Err(BackupError::EmptySource);
    }
    let length = u32::try_from(source_bytes).unwrap_or(u32::MAX).min(total_bytes);
    if source_bytes > u64::from(total_bytes) {
        sink_line!(
            sink,
            "RESTORE: image is larger than the chip; writing the first {} bytes.",
            length
        );
        warn!("restore: image {} bytes, chip {}", source_bytes, total_bytes);
    } else if source_bytes < u64::from(total_bytes) {
        sink_line!(
            sink,
            "RESTORE: image is smaller than the chip; bytes past {} are left as they are.",
            length
        );
    }
    sink_line!(sink, "RESTORE: writing {} bytes to flash", length);
    file.seek(0)
        .await
        .map_err(|error| BackupError::Storage { offset: 0, error })?;

    let mut offset = 0u32;
    while offset < length {
        let len = chunk_len(length, offset);
        let want = len as usize;
        let data = bufs.data.get_mut(..want).unwrap_or_default();
        let got = read_full(file, data)
            .await
            .map_err(|error| BackupError::Storage { offset, error })?;
        if got < want {
            let at = offset.saturating_add(u32::try_from(got).unwrap_or(u32::MAX));
            return Err(BackupError::ShortRead { offset: at });
        }

        let sector = address(offset)?;
        nor.erase_sector_4k(sector)
            .await
            .map_err(|error| BackupError::Flash { offset, error })?;
        nor.wait_ready(&policy.erase)
            .await
            .map_err(|e| BackupError::wait(offset, e))?;

        let mut page_offset = offset;
        for page in data.chunks(PAGE_SIZE) {
            nor.program_page(address(page_offset)?, page)
                .await
                .map_err(|error| BackupError::Flash {
                    offset: page_offset,
                    error,
                })?;
            nor.wait_ready(&policy.program)
                .await
                .map_err(|e| BackupError::wait(page_offset, e))?;
            page_offset = page_offset.saturating_add(PAGE_SIZE as u32);
        }

        if verify {
            let readback = bufs.readback.get_mut(..want).unwrap_or_default();
            nor.read_data(sector, readback)
                .await
                .map_err(|error| BackupError::Flash { offset, error })?;
            if let Some(i) = data.iter().zip(readback.iter()).position(|(a, b)| a != b) {
                let addr = offset.saturating_add(u32::try_from(i).unwrap_or(u32::MAX));
                sink_line!(sink, "RESTORE: VERIFY FAILED at 0x{:06X}", addr);
                error!("restore verify failed at {:#x}", addr);
                return Err(BackupError::VerifyFailed { addr });
            }
        }

        offset = offset.saturating_add(len);
        if offset & PROGRESS_MASK == 0 {
            sink_line!(sink, "Restore progress: {}/{} bytes", offset, length);
        }
        status.set_progress(offset, length);
    }

    let suffix = if verify { " (verified)" } else { "" };
    sink_line!(sink, "RESTORE: done{}.", suffix);
    info!("restore: {} bytes", offset);
    Ok(RestoreReport {
        source_bytes,
        written: offset,
        verified: verify,
    })
}

/// Restore from `path`, reporting a missing image in the transcript.
#[allow(clippy::too_many_arguments)]
pub async fn restore_from_storage<SPI, D, S, T>(
    nor: &mut SpiNor<SPI, D>,
    storage: &S,
    path: &str,
    total_bytes: u32,
    verify: bool,
    policy: &TransferPolicy,
    bufs: &mut TransferBuffers,
    status: &BenchStatus,
    sink: &mut T,
) -> BackupResult<RestoreReport, SPI::Error, S::Error>
where
    SPI: SpiDevice,
    D: DelayNs,
    S: Storage,
    T: TextSink,
{
    let mut file = match storage.open(path, OpenMode::Read).await {
        Ok(file) => file,
        Err(error) => {
            sink_line!(sink, "RESTORE: file not found: {}", path);
            return Err(BackupError::Storage { offset: 0, error });
        }
    };
    sink_line!(sink, "RESTORE: {} size={} bytes", path, file.size());
    restore(nor, &mut file, total_bytes, verify, policy, bufs, status, sink).await
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation
)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use platform::mocks::MemStorage;
    use platform::BufferSink;
    use spi_nor::sim::SimFlash;

    const CHIP: usize = 64 * 1024;

    fn nor_with(pattern: impl Fn(usize) -> u8) -> SpiNor<SimFlash, NoopDelay> {
        let mut sim = SimFlash::new(CHIP);
        let image: Vec<u8> = (0..CHIP).map(pattern).collect();
        sim.load(0, &image);
        SpiNor::new(sim, NoopDelay)
    }

    #[test]
    fn default_size_from_density_code() {
        assert_eq!(default_total_bytes(JedecId::new(0xEF, 0x40, 0x16)), 4 * 1024 * 1024);
        assert_eq!(default_total_bytes(JedecId::new(0xBF, 0x26, 0x41)), DEFAULT_CHIP_BYTES);
        assert_eq!(default_total_bytes(JedecId::new(0xEF, 0x40, 0x19)), DEFAULT_CHIP_BYTES);
        assert_eq!(default_total_bytes(JedecId::new(0xEF, 0x40, 0x18)), MAX_IMAGE_BYTES);
    }

    #[tokio::test]
    async fn backup_copies_chip() {
        let mut nor = nor_with(|i| (i % 251) as u8);
        let storage = MemStorage::new();
        let mut bufs = Box::new(TransferBuffers::new());
        let status = BenchStatus::new();
        let mut sink = BufferSink::<512>::new();
        let n = backup_to_storage(&mut nor, &storage, "BACKUP.BIN", CHIP as u32, &mut bufs.data, &status, &mut sink)
            .await
            .unwrap();
        assert_eq!(n, CHIP as u32);
        let image = storage.contents("BACKUP.BIN").unwrap();
        assert_eq!(image.as_slice(), nor.device().contents());
        assert!(sink.as_str().starts_with("Backing up 65536 bytes to BACKUP.BIN ...\r\n"));
        assert!(sink.as_str().ends_with("Backup complete.\r\n"));
        assert_eq!(status.snapshot().percent, 100);
    }

    #[tokio::test]
    async fn backup_short_write_reports_offset() {
        let mut nor = nor_with(|_| 0xA5);
        let storage = MemStorage::new().with_capacity_limit(10_000);
        let mut bufs = Box::new(TransferBuffers::new());
        let mut sink = BufferSink::<512>::new();
        let err = backup_to_storage(
            &mut nor,
            &storage,
            "BACKUP.BIN",
            CHIP as u32,
            &mut bufs.data,
            &BenchStatus::new(),
            &mut sink,
        )
        .await
        .unwrap_err();
        assert_eq!(err, BackupError::ShortWrite { offset: 8192 });
        assert!(sink.as_str().contains("Backup failed at address 0x002000"));
    }

    #[tokio::test]
    async fn restore_writes_and_verifies() {
        let mut nor = nor_with(|_| 0x00);
        let storage = MemStorage::new();
        let image: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
        storage.insert("BACKUP.BIN", image.clone());
        let mut bufs = Box::new(TransferBuffers::new());
        let mut sink = BufferSink::<1024>::new();
        let report = restore_from_storage(
            &mut nor,
            &storage,
            "BACKUP.BIN",
            CHIP as u32,
            true,
            &TransferPolicy::default(),
            &mut bufs,
            &BenchStatus::new(),
            &mut sink,
        )
        .await
        .unwrap();
        assert_eq!(report.written, 10_000);
        assert!(report.verified);
        let chip = nor.device().contents();
        assert_eq!(&chip[..10_000], image.as_slice());
        // tail of the last sector was erased, the rest untouched
        assert!(chip[10_000..12_288].iter().all(|&b| b == 0xFF));
        assert!(chip[12_288..].iter().all(|&b| b == 0x00));
        assert!(sink.as_str().contains("RESTORE: writing 10000 bytes to flash"));
        assert!(sink.as_str().contains("smaller than the chip"));
        assert!(sink.as_str().ends_with("RESTORE: done (verified).\r\n"));
    }

    #[tokio::test]
    async fn restore_reports_first_bad_byte() {
        let mut nor = nor_with(|_| 0xFF);
        nor.device_mut().set_stuck_bit(0x1234, 3);
        let storage = MemStorage::new();
        storage.insert("BACKUP.BIN", vec![0xFFu8; 8192]);
        let mut bufs = Box::new(TransferBuffers::new());
        let mut sink = BufferSink::<1024>::new();
        let err = restore_from_storage(
            &mut nor,
            &storage,
            "BACKUP.BIN",
            CHIP as u32,
            true,
            &TransferPolicy::default(),
            &mut bufs,
            &BenchStatus::new(),
            &mut sink,
        )
        .await
        .unwrap_err();
        assert_eq!(err, BackupError::VerifyFailed { addr: 0x1234 });
        assert!(sink.as_str().contains("RESTORE: VERIFY FAILED at 0x001234"));
    }

    #[tokio::test]
    async fn restore_rejects_empty_and_missing_images() {
        let mut nor = nor_with(|_| 0xFF);
        let storage = MemStorage::new();
        storage.insert("EMPTY.BIN", Vec::new());
        let mut bufs = Box::new(TransferBuffers::new());
        let mut sink = BufferSink::<512>::new();
        let status = BenchStatus::new();
        let policy = TransferPolicy::default();
        let err = restore_from_storage(&mut nor, &storage, "EMPTY.BIN", CHIP as u32, false, &policy, &mut bufs, &status, &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err, BackupError::EmptySource);
        let err = restore_from_storage(&mut nor, &storage, "NONE.BIN", CHIP as u32, false, &policy, &mut bufs, &status, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Storage { offset: 0, .. }));
        assert!(sink.as_str().contains("RESTORE: file not found: NONE.BIN"));
    }

    #[tokio::test]
    async fn restore_timeout_is_fatal() {
        let mut nor = nor_with(|_| 0xFF);
        nor.device_mut().set_stuck_busy(true);
        let storage = MemStorage::new();
        storage.insert("BACKUP.BIN", vec![0u8; 4096]);
        let mut bufs = Box::new(TransferBuffers::new());
        let policy = TransferPolicy {
            erase: WaitPolicy::cooperative(5),
            program: WaitPolicy::cooperative(5),
        };
        let err = restore_from_storage(
            &mut nor,
            &storage,
            "BACKUP.BIN",
            CHIP as u32,
            false,
            &policy,
            &mut bufs,
            &BenchStatus::new(),
            &mut BufferSink::<512>::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::Timeout { offset: 0, .. }));
    }
}
