//! Mock implementations for testing
//!
//! In-memory [`Storage`] with fault injection, used by the unit and
//! integration tests of every crate above `platform`, and by the desktop
//! emulator when no results directory is given.

#![cfg(any(test, feature = "std"))]

extern crate std;

use core::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::string::{String, ToString};
use std::vec::Vec;

use crate::storage::{File, OpenMode, Storage};

/// Errors produced by [`MemStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemStorageError {
    /// `open` in [`OpenMode::Read`] on a missing file.
    NotFound,
    /// Injected failure (see [`MemStorage::fail_open`] / [`MemStorage::fail_writes`]).
    Injected,
    /// Write through a read-only handle.
    ReadOnly,
}

impl core::fmt::Display for MemStorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => f.write_str("file not found"),
            Self::Injected => f.write_str("injected storage fault"),
            Self::ReadOnly => f.write_str("file opened read-only"),
        }
    }
}

impl std::error::Error for MemStorageError {}

/// In-memory file system keyed by path.
///
/// Interior-mutable so several [`MemFile`] handles can be open at once, the
/// way FAT and host files allow.
#[derive(Debug, Default)]
pub struct MemStorage {
    files: RefCell<BTreeMap<String, Vec<u8>>>,
    capacity_limit: Option<usize>,
    fail_open: Vec<String>,
    fail_writes: Cell<bool>,
    flushes: Cell<usize>,
}

impl MemStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap every file at `bytes`; writes past the cap are short.
    pub fn with_capacity_limit(mut self, bytes: usize) -> Self {
        self.capacity_limit = Some(bytes);
        self
    }

    /// Make every `open` of `path` fail.
    pub fn fail_open(&mut self, path: &str) {
        self.fail_open.push(path.to_string());
    }

    /// Make every subsequent `write` fail, including on open handles.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Replace the content of `path`.
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.files.borrow_mut().insert(path.to_string(), data.into());
    }

    /// Copy of the raw content of `path`.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).cloned()
    }

    /// Content of `path` as UTF-8 text (lossy).
    pub fn text(&self, path: &str) -> String {
        self.contents(path)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }

    /// Number of `flush` calls seen across all handles.
    pub fn flush_count(&self) -> usize {
        self.flushes.get()
    }
}

/// Handle into a [`MemStorage`] file.
///
/// Borrows the backing map only for the duration of each call.
#[derive(Debug)]
pub struct MemFile<'a> {
    storage: &'a MemStorage,
    path: String,
    cursor: usize,
    mode: OpenMode,
}

impl MemFile<'_> {
    fn with_data<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut files = self.storage.files.borrow_mut();
        let data = files.entry(self.path.clone()).or_default();
        f(data)
    }
}

impl File for MemFile<'_> {
    type Error = MemStorageError;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let cursor = self.cursor;
        let n = self.with_data(|data| {
            let rest = data.get(cursor..).unwrap_or_default();
            let n = rest.len().min(buf.len());
            if let (Some(dst), Some(src)) = (buf.get_mut(..n), rest.get(..n)) {
                dst.copy_from_slice(src);
            }
            n
        });
        self.cursor = self.cursor.saturating_add(n);
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        if !self.mode.writable() {
            return Err(MemStorageError::ReadOnly);
        }
        if self.storage.fail_writes.get() {
            return Err(MemStorageError::Injected);
        }
        let limit = self.storage.capacity_limit;
        Ok(self.with_data(|file| {
            let room = limit.map_or(usize::MAX, |cap| cap.saturating_sub(file.len()));
            let n = room.min(data.len());
            file.extend_from_slice(data.get(..n).unwrap_or_default());
            n
        }))
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        let flushes = &self.storage.flushes;
        flushes.set(flushes.get().saturating_add(1));
        Ok(())
    }

    async fn truncate(&mut self, len: u64) -> Result<(), Self::Error> {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        let size = self.with_data(|data| {
            data.truncate(len);
            data.len()
        });
        self.cursor = self.cursor.min(size);
        Ok(())
    }

    async fn seek(&mut self, pos: u64) -> Result<u64, Self::Error> {
        let size = self.with_data(|data| data.len());
        let pos = usize::try_from(pos).unwrap_or(usize::MAX).min(size);
        self.cursor = pos;
        Ok(pos as u64)
    }

    fn size(&self) -> u64 {
        self.with_data(|data| data.len() as u64)
    }
}

impl Storage for MemStorage {
    type Error = MemStorageError;
    type File<'a> = MemFile<'a>;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error> {
        if self.fail_open.iter().any(|p| p == path) {
            return Err(MemStorageError::Injected);
        }
        {
            let mut files = self.files.borrow_mut();
            match mode {
                OpenMode::Read if !files.contains_key(path) => {
                    return Err(MemStorageError::NotFound)
                }
                OpenMode::Read => {}
                OpenMode::Append => {
                    files.entry(path.to_string()).or_default();
                }
                OpenMode::Truncate => files.entry(path.to_string()).or_default().clear(),
            }
        }
        Ok(MemFile {
            storage: self,
            path: path.to_string(),
            cursor: 0,
            mode,
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, Self::Error> {
        Ok(self.files.borrow().contains_key(path))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_read_back() {
        let storage = MemStorage::new();
        {
            let mut f = storage.open("A.CSV", OpenMode::Append).await.unwrap();
            f.write(b"hello ").await.unwrap();
        }
        {
            let mut f = storage.open("A.CSV", OpenMode::Append).await.unwrap();
            f.write(b"world").await.unwrap();
        }
        let mut f = storage.open("A.CSV", OpenMode::Read).await.unwrap();
        let mut buf = [0u8; 32];
        let n = f.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let storage = MemStorage::new();
        assert_eq!(
            storage.open("NOPE.CSV", OpenMode::Read).await.err(),
            Some(MemStorageError::NotFound)
        );
        assert!(!storage.exists("NOPE.CSV").await.unwrap());
    }

    #[tokio::test]
    async fn truncate_clamps_cursor() {
        let storage = MemStorage::new();
        storage.insert("T.CSV", b"0123456789".to_vec());
        let mut f = storage.open("T.CSV", OpenMode::Append).await.unwrap();
        f.seek(8).await.unwrap();
        f.truncate(4).await.unwrap();
        assert_eq!(f.size(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).await.unwrap(), 0);
        drop(f);
        assert_eq!(storage.contents("T.CSV").unwrap(), b"0123".to_vec());
    }

    #[tokio::test]
    async fn injected_faults() {
        let mut storage = MemStorage::new();
        storage.fail_open("BAD.CSV");
        assert!(storage.open("BAD.CSV", OpenMode::Append).await.is_err());
        storage.fail_writes(true);
        let mut f = storage.open("OK.CSV", OpenMode::Append).await.unwrap();
        assert_eq!(f.write(b"x").await.err(), Some(MemStorageError::Injected));
    }

    #[tokio::test]
    async fn two_handles_open_at_once() {
        let storage = MemStorage::new();
        let mut a = storage.open("A.CSV", OpenMode::Append).await.unwrap();
        let mut b = storage.open("B.CSV", OpenMode::Append).await.unwrap();
        a.write(b"aa").await.unwrap();
        b.write(b"b").await.unwrap();
        a.flush().await.unwrap();
        b.flush().await.unwrap();
        assert_eq!(storage.text("A.CSV"), "aa");
        assert_eq!(storage.text("B.CSV"), "b");
        assert_eq!(storage.flush_count(), 2);
    }

    #[tokio::test]
    async fn read_only_handle_rejects_write() {
        let storage = MemStorage::new();
        storage.insert("R.BIN", vec![1, 2, 3]);
        let mut f = storage.open("R.BIN", OpenMode::Read).await.unwrap();
        assert_eq!(f.write(b"x").await.err(), Some(MemStorageError::ReadOnly));
    }
}
