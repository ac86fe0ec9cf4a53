//! microSD-backed Storage for the hardware target.
//!
//! Wraps an `embedded_sdmmc::VolumeManager` and exposes the first FAT
//! volume's root directory through [`Storage`]. File names must be 8.3.
//!
//! FAT has no in-place truncate in `embedded-sdmmc`, so [`File::truncate`]
//! rewrites the kept prefix through a scratch file (`TRUNC.TMP`). That is
//! O(kept bytes) and only used by "erase last session".

use embedded_sdmmc::{
    BlockDevice, Mode, RawDirectory, RawFile, RawVolume, TimeSource, Timestamp, VolumeIdx,
    VolumeManager,
};

use crate::storage::{File, OpenMode, Storage};

const SCRATCH_NAME: &str = "TRUNC.TMP";
const COPY_CHUNK: usize = 512;

/// Error type for microSD storage operations.
#[derive(Debug)]
pub enum SdCardError<E: core::fmt::Debug> {
    /// Error from the FAT layer or the card itself.
    Fs(embedded_sdmmc::Error<E>),
    /// File names longer than this are rejected before touching the card.
    NameTooLong,
    /// Offsets past 4 GiB cannot exist on FAT32.
    TooLarge,
}

impl<E: core::fmt::Debug> From<embedded_sdmmc::Error<E>> for SdCardError<E> {
    fn from(e: embedded_sdmmc::Error<E>) -> Self {
        Self::Fs(e)
    }
}

impl<E: core::fmt::Debug> core::fmt::Display for SdCardError<E> {
    #[allow(clippy::use_debug)] // embedded_sdmmc::Error has no Display
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Fs(e) => write!(f, "SD card error: {e:?}"),
            Self::NameTooLong => f.write_str("SD card error: file name too long"),
            Self::TooLarge => f.write_str("SD card error: offset beyond FAT32 limit"),
        }
    }
}

/// Fixed timestamp for boards without an RTC.
///
/// Every file gets the same creation/modification time; the benchmark
/// rows carry their own `timestamp_ms` column.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTime;

impl TimeSource for FixedTime {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 55,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

/// FAT volume 0 of a microSD card.
///
/// `VolumeManager` serializes access internally, so several [`SdFile`]
/// handles may be open at once.
pub struct SdCardStorage<D: BlockDevice, T: TimeSource> {
    mgr: VolumeManager<D, T>,
    volume: RawVolume,
    root: RawDirectory,
}

impl<D: BlockDevice, T: TimeSource> SdCardStorage<D, T>
where
    D::Error: core::fmt::Debug,
{
    /// Mount volume 0 and open its root directory.
    pub fn mount(device: D, time: T) -> Result<Self, SdCardError<D::Error>> {
        let mgr = VolumeManager::new(device, time);
        let volume = mgr.open_raw_volume(VolumeIdx(0))?;
        let root = mgr.open_root_dir(volume)?;
        Ok(Self { mgr, volume, root })
    }

    /// Close the root directory and the volume.
    pub fn unmount(self) -> Result<(), SdCardError<D::Error>> {
        self.mgr.close_dir(self.root)?;
        self.mgr.close_volume(self.volume)?;
        Ok(())
    }
}

/// Handle into a file on the card.
pub struct SdFile<'a, D: BlockDevice, T: TimeSource>
where
    D::Error: core::fmt::Debug,
{
    storage: &'a SdCardStorage<D, T>,
    file: Option<RawFile>,
    name: heapless::String<12>,
    read_pos: u32,
}

impl<D: BlockDevice, T: TimeSource> SdFile<'_, D, T>
where
    D::Error: core::fmt::Debug,
{
    fn raw(&self) -> Result<RawFile, SdCardError<D::Error>> {
        self.file.ok_or(SdCardError::Fs(embedded_sdmmc::Error::BadHandle))
    }

    fn len(&self) -> u32 {
        self.file
            .and_then(|f| self.storage.mgr.file_length(f).ok())
            .unwrap_or(0)
    }

    /// Copy `len` bytes from the start of `from` into `to`.
    fn copy_prefix(&mut self, from: RawFile, to: RawFile, len: u32) -> Result<(), SdCardError<D::Error>> {
        let mgr = &self.storage.mgr;
        mgr.file_seek_from_start(from, 0)?;
        let mut remaining = len;
        let mut buf = [0u8; COPY_CHUNK];
        while remaining > 0 {
            let want = (remaining as usize).min(COPY_CHUNK);
            let chunk = buf.get_mut(..want).ok_or(SdCardError::TooLarge)?;
            let n = mgr.read(from, chunk)?;
            if n == 0 {
                break;
            }
            mgr.write(to, chunk.get(..n).unwrap_or_default())?;
            remaining = remaining.saturating_sub(n as u32);
        }
        Ok(())
    }
}

impl<D: BlockDevice, T: TimeSource> File for SdFile<'_, D, T>
where
    D::Error: core::fmt::Debug,
{
    type Error = SdCardError<D::Error>;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let f = self.raw()?;
        self.storage.mgr.file_seek_from_start(f, self.read_pos)?;
        if self.storage.mgr.file_eof(f)? {
            return Ok(0);
        }
        let n = self.storage.mgr.read(f, buf)?;
        self.read_pos = self.read_pos.saturating_add(n as u32);
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        let f = self.raw()?;
        self.storage.mgr.file_seek_from_end(f, 0)?;
        self.storage.mgr.write(f, data)?;
        Ok(data.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        let f = self.raw()?;
        self.storage.mgr.flush_file(f)?;
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<(), Self::Error> {
        let len = u32::try_from(len).map_err(|_| SdCardError::TooLarge)?;
        if len >= self.len() {
            return Ok(());
        }
        let original = self.raw()?;
        let root = self.storage.root;
        let scratch = self
            .storage
            .mgr
            .open_file_in_dir(root, SCRATCH_NAME, Mode::ReadWriteCreateOrTruncate)?;
        self.copy_prefix(original, scratch, len)?;
        self.storage.mgr.close_file(original)?;
        self.file = None;

        let rewritten = self
            .storage
            .mgr
            .open_file_in_dir(root, self.name.as_str(), Mode::ReadWriteTruncate)?;
        self.file = Some(rewritten);
        self.copy_prefix(scratch, rewritten, len)?;
        self.storage.mgr.close_file(scratch)?;
        self.storage.mgr.delete_file_in_dir(root, SCRATCH_NAME)?;
        self.storage.mgr.flush_file(rewritten)?;
        self.read_pos = self.read_pos.min(len);
        Ok(())
    }

    async fn seek(&mut self, pos: u64) -> Result<u64, Self::Error> {
        let pos = u32::try_from(pos).unwrap_or(u32::MAX).min(self.len());
        self.read_pos = pos;
        Ok(u64::from(pos))
    }

    fn size(&self) -> u64 {
        u64::from(self.len())
    }
}

impl<D: BlockDevice, T: TimeSource> Drop for SdFile<'_, D, T>
where
    D::Error: core::fmt::Debug,
{
    fn drop(&mut self) {
        if let Some(f) = self.file.take() {
            let _ = self.storage.mgr.close_file(f);
        }
    }
}

impl<D: BlockDevice, T: TimeSource> Storage for SdCardStorage<D, T>
where
    D::Error: core::fmt::Debug,
{
    type Error = SdCardError<D::Error>;
    type File<'a> = SdFile<'a, D, T> where Self: 'a;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error> {
        let name: heapless::String<12> =
            heapless::String::try_from(path).map_err(|_| SdCardError::NameTooLong)?;
        let fat_mode = match mode {
            OpenMode::Read => Mode::ReadOnly,
            OpenMode::Append => Mode::ReadWriteCreateOrAppend,
            OpenMode::Truncate => Mode::ReadWriteCreateOrTruncate,
        };
        let file = self.mgr.open_file_in_dir(self.root, path, fat_mode)?;
        Ok(SdFile {
            storage: self,
            file: Some(file),
            name,
            read_pos: 0,
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, Self::Error> {
        match self.mgr.find_directory_entry(self.root, path) {
            Ok(_) => Ok(true),
            Err(embedded_sdmmc::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn fixed_time_is_stable() {
        let a = FixedTime.get_timestamp();
        let b = FixedTime.get_timestamp();
        assert_eq!(a.year_since_1970, b.year_since_1970);
        assert_eq!(a.seconds, 0);
    }

    #[test]
    fn error_display_names_the_problem() {
        let e: SdCardError<()> = SdCardError::NameTooLong;
        assert!(format!("{e}").contains("too long"));
        let e: SdCardError<()> = SdCardError::Fs(embedded_sdmmc::Error::NotFound);
        assert!(format!("{e}").contains("NotFound"));
    }
}
