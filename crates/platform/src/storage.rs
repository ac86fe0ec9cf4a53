//! Storage abstraction for append-only logs and backup images
//!
//! The bench core never edits files in place. It appends rows, flushes,
//! reads lines back, and truncates to a recorded offset. Backup and restore
//! stream raw images through the same [`File`] handle.

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenMode {
    /// Read from the start; the file must exist.
    Read,
    /// Create if missing, position at the end for appending.
    Append,
    /// Create if missing, discard any existing content.
    Truncate,
}

impl OpenMode {
    /// Whether the handle may be written through.
    pub const fn writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Storage trait for file system access
pub trait Storage {
    /// Error type
    type Error: core::fmt::Debug;
    /// File type
    type File<'a>: File<Error = Self::Error>
    where
        Self: 'a;

    /// Open `path` with the given mode.
    ///
    /// Takes `&self` so several handles (sample log, aggregate log) can be
    /// open at once; implementations serialize access internally.
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
    ) -> impl core::future::Future<Output = Result<Self::File<'_>, Self::Error>>;

    /// Check if path exists
    fn exists(
        &self,
        path: &str,
    ) -> impl core::future::Future<Output = Result<bool, Self::Error>>;
}

/// An open file handle.
///
/// Writes always land at the end of the file for [`OpenMode::Append`]
/// handles. Reads advance an internal cursor that [`File::seek`] moves.
pub trait File {
    /// Error type
    type Error: core::fmt::Debug;

    /// Read from current position. Returns 0 at end of file.
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> impl core::future::Future<Output = Result<usize, Self::Error>>;

    /// Write `data`, returning how many bytes were accepted.
    ///
    /// A short count means the medium is full or failing; callers that need
    /// the whole buffer persisted treat it as an error.
    fn write(
        &mut self,
        data: &[u8],
    ) -> impl core::future::Future<Output = Result<usize, Self::Error>>;

    /// Push buffered data down to the medium (fsync / FAT directory update).
    fn flush(&mut self) -> impl core::future::Future<Output = Result<(), Self::Error>>;

    /// Cut the file to `len` bytes. The cursor is clamped to the new size.
    fn truncate(&mut self, len: u64)
        -> impl core::future::Future<Output = Result<(), Self::Error>>;

    /// Seek to position
    fn seek(&mut self, pos: u64) -> impl core::future::Future<Output = Result<u64, Self::Error>>;

    /// Get file size
    fn size(&self) -> u64;
}

/// Write all of `data`, mapping a short write to `Ok(false)`.
///
/// Loops because some media accept a buffer in several pieces.
pub async fn write_all<F: File>(file: &mut F, mut data: &[u8]) -> Result<bool, F::Error> {
    while !data.is_empty() {
        let n = file.write(data).await?;
        if n == 0 {
            return Ok(false);
        }
        data = data.get(n..).unwrap_or_default();
    }
    Ok(true)
}

/// Storage whose medium may be missing, such as a microSD slot.
///
/// Every operation on an empty slot fails with
/// [`RemovableError::NotMounted`], so callers degrade the same way they do
/// for any other storage failure.
pub struct Removable<S> {
    inner: Option<S>,
}

impl<S> Removable<S> {
    /// A mounted medium.
    pub const fn mounted(storage: S) -> Self {
        Self {
            inner: Some(storage),
        }
    }

    /// An empty slot.
    pub const fn empty() -> Self {
        Self { inner: None }
    }

    /// Whether a medium is present.
    pub const fn is_mounted(&self) -> bool {
        self.inner.is_some()
    }
}

impl<S> From<Option<S>> for Removable<S> {
    fn from(inner: Option<S>) -> Self {
        Self { inner }
    }
}

/// Error from [`Removable`] storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovableError<E> {
    /// No medium in the slot.
    NotMounted,
    /// Error from the mounted medium.
    Storage(E),
}

impl<E: core::fmt::Debug> core::fmt::Display for RemovableError<E> {
    #[allow(clippy::use_debug)] // storage error types only promise Debug
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotMounted => f.write_str("no card mounted"),
            Self::Storage(e) => write!(f, "{e:?}"),
        }
    }
}

/// File handle from [`Removable`] storage.
pub struct RemovableFile<F>(F);

impl<F: File> File for RemovableFile<F> {
    type Error = RemovableError<F::Error>;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf).await.map_err(RemovableError::Storage)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(data).await.map_err(RemovableError::Storage)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush().await.map_err(RemovableError::Storage)
    }

    async fn truncate(&mut self, len: u64) -> Result<(), Self::Error> {
        self.0.truncate(len).await.map_err(RemovableError::Storage)
    }

    async fn seek(&mut self, pos: u64) -> Result<u64, Self::Error> {
        self.0.seek(pos).await.map_err(RemovableError::Storage)
    }

    fn size(&self) -> u64 {
        self.0.size()
    }
}

impl<S: Storage> Storage for Removable<S> {
    type Error = RemovableError<S::Error>;
    type File<'a> = RemovableFile<S::File<'a>> where Self: 'a;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Self::File<'_>, Self::Error> {
        let storage = self.inner.as_ref().ok_or(RemovableError::NotMounted)?;
        let file = storage.open(path, mode).await.map_err(RemovableError::Storage)?;
        Ok(RemovableFile(file))
    }

    async fn exists(&self, path: &str) -> Result<bool, Self::Error> {
        let storage = self.inner.as_ref().ok_or(RemovableError::NotMounted)?;
        storage.exists(path).await.map_err(RemovableError::Storage)
    }
}
