//! Local filesystem Storage implementation for the desktop emulator.
//!
//! `LocalFileStorage` implements `platform::Storage` using `std::fs`.
//! Used when the `std` feature is enabled (emulator and xtask builds).
//! All paths are resolved relative to the root provided at construction,
//! which plays the role of the SD card's root directory.

extern crate std;

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::storage::{File, OpenMode, Storage};

/// Error type for local filesystem operations.
#[derive(Debug)]
pub struct LocalStorageError(pub std::io::Error);

impl core::fmt::Display for LocalStorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "local storage error: {}", self.0)
    }
}

impl std::error::Error for LocalStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// An open file on the local filesystem.
pub struct LocalFile {
    inner: fs::File,
    size: u64,
    read_pos: u64,
}

impl File for LocalFile {
    type Error = LocalStorageError;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Seek::seek(&mut self.inner, SeekFrom::Start(self.read_pos)).map_err(LocalStorageError)?;
        let n = Read::read(&mut self.inner, buf).map_err(LocalStorageError)?;
        self.read_pos = self.read_pos.saturating_add(n as u64);
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        Seek::seek(&mut self.inner, SeekFrom::End(0)).map_err(LocalStorageError)?;
        let n = Write::write(&mut self.inner, data).map_err(LocalStorageError)?;
        self.size = self.size.saturating_add(n as u64);
        Ok(n)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Write::flush(&mut self.inner).map_err(LocalStorageError)?;
        self.inner.sync_data().map_err(LocalStorageError)
    }

    async fn truncate(&mut self, len: u64) -> Result<(), Self::Error> {
        self.inner.set_len(len).map_err(LocalStorageError)?;
        self.size = len;
        self.read_pos = self.read_pos.min(len);
        Ok(())
    }

    async fn seek(&mut self, pos: u64) -> Result<u64, Self::Error> {
        self.read_pos = pos.min(self.size);
        Ok(self.read_pos)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// A `platform::Storage` implementation backed by `std::fs`.
///
/// # Example
/// ```no_run
/// # async fn example() {
/// use platform::storage_local::LocalFileStorage;
/// use platform::{OpenMode, Storage};
/// let storage = LocalFileStorage::new("/tmp/flash-bench");
/// let file = storage.open("BENCH.CSV", OpenMode::Append).await.unwrap();
/// # }
/// ```
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    /// Create a new storage rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create from the `FLASH_BENCH_ROOT` environment variable.
    ///
    /// Returns `None` if `FLASH_BENCH_ROOT` is not set or is not valid UTF-8.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var("FLASH_BENCH_ROOT").ok().map(Self::new)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Storage for LocalFileStorage {
    type Error = LocalStorageError;
    type File<'a> = LocalFile;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error> {
        let full = self.resolve(path);
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Append => options.read(true).write(true).create(true),
            OpenMode::Truncate => options.read(true).write(true).create(true).truncate(true),
        };
        let file = options.open(&full).map_err(LocalStorageError)?;
        let meta = file.metadata().map_err(LocalStorageError)?;
        Ok(LocalFile {
            inner: file,
            size: meta.len(),
            read_pos: 0,
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, Self::Error> {
        Ok(self.resolve(path).exists())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::storage::{File, Storage};
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_storage_read_full_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("TEST.BIN"), b"hello world").unwrap();
        let storage = LocalFileStorage::new(tmp.path());
        let mut file = storage.open("TEST.BIN", OpenMode::Read).await.unwrap();
        let mut buf = [0u8; 11];
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn local_storage_append_keeps_existing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("LOG.CSV"), b"a\n").unwrap();
        let storage = LocalFileStorage::new(tmp.path());
        let mut file = storage.open("LOG.CSV", OpenMode::Append).await.unwrap();
        assert_eq!(file.size(), 2);
        file.write(b"b\n").await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(file.size(), 4);
        assert_eq!(fs::read(tmp.path().join("LOG.CSV")).unwrap(), b"a\nb\n");
    }

    #[tokio::test]
    async fn local_storage_truncate_mode_discards() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("IMG.BIN"), [0xAAu8; 64]).unwrap();
        let storage = LocalFileStorage::new(tmp.path());
        let file = storage.open("IMG.BIN", OpenMode::Truncate).await.unwrap();
        assert_eq!(file.size(), 0);
    }

    #[tokio::test]
    async fn local_storage_seek_and_read() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("SEEK.BIN"), b"ABCDEFGH").unwrap();
        let storage = LocalFileStorage::new(tmp.path());
        let mut file = storage.open("SEEK.BIN", OpenMode::Read).await.unwrap();
        file.seek(4).await.unwrap();
        let mut buf = [0u8; 4];
        file.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"EFGH");
    }

    #[tokio::test]
    async fn local_storage_truncate_to_offset() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("CUT.CSV"), b"keep\ndrop\n").unwrap();
        let storage = LocalFileStorage::new(tmp.path());
        let mut file = storage.open("CUT.CSV", OpenMode::Append).await.unwrap();
        file.truncate(5).await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(fs::read(tmp.path().join("CUT.CSV")).unwrap(), b"keep\n");
    }

    #[tokio::test]
    async fn local_storage_exists() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("EXISTS.BIN"), b"x").unwrap();
        let storage = LocalFileStorage::new(tmp.path());
        assert!(storage.exists("EXISTS.BIN").await.unwrap());
        assert!(!storage.exists("MISSING.BIN").await.unwrap());
    }

    #[tokio::test]
    async fn local_storage_read_missing_fails() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalFileStorage::new(tmp.path());
        assert!(storage.open("MISSING.BIN", OpenMode::Read).await.is_err());
    }
}
