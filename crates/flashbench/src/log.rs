//! Append-only CSV logs over [`platform::Storage`]
//!
//! The bench only ever appends rows, appends session markers, reads lines
//! back, and truncates to the last marker. Every line ends in `\r\n` so the
//! files open cleanly on the PC the SD card ends up in.

use core::fmt;

use platform::{File, OpenMode, Storage};

use crate::record::{self, Row};

/// Prefix of the marker written before each saved run.
pub const SESSION_MARKER: &str = "# SESSION_START";

/// Longest line [`LineReader`] returns.
pub const LINE_CAPACITY: usize = 512;

const EOL: &str = "\r\n";

/// Log access failure. Offsets are byte positions in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LogError<E> {
    /// Error from the storage layer.
    Storage(E),
    /// The medium accepted only part of a line.
    ShortWrite {
        /// Where the line should have started.
        offset: u64,
    },
    /// A line does not fit the reader's buffer.
    LineTooLong {
        /// Start of the line.
        offset: u64,
    },
    /// A line is not UTF-8.
    Encoding {
        /// Start of the line.
        offset: u64,
    },
    /// A row rendered longer than [`record::ROW_CAPACITY`].
    RowTooLong,
}

impl<E> From<E> for LogError<E> {
    fn from(e: E) -> Self {
        Self::Storage(e)
    }
}

impl<E: fmt::Debug> fmt::Display for LogError<E> {
    #[allow(clippy::use_debug)] // storage error types only promise Debug
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e:?}"),
            Self::ShortWrite { offset } => write!(f, "short write at byte {offset}"),
            Self::LineTooLong { offset } => write!(f, "line at byte {offset} is too long"),
            Self::Encoding { offset } => write!(f, "line at byte {offset} is not UTF-8"),
            Self::RowTooLong => f.write_str("row does not fit the line buffer"),
        }
    }
}

/// An open log file.
pub struct CsvLog<F> {
    file: F,
    rows: u32,
}

/// Open `path` for appending; write `header` first if the file is empty.
pub async fn open_log<'s, S: Storage>(
    storage: &'s S,
    path: &str,
    header: &str,
) -> Result<CsvLog<S::File<'s>>, LogError<S::Error>> {
    let file = storage.open(path, OpenMode::Append).await?;
    let mut log = CsvLog { file, rows: 0 };
    if log.file.size() == 0 {
        log.append_line(header).await?;
        log.file.flush().await?;
    }
    Ok(log)
}

impl<F: File> CsvLog<F> {
    /// Append `line` and a line terminator.
    pub async fn append_line(&mut self, line: &str) -> Result<(), LogError<F::Error>> {
        let offset = self.file.size();
        for part in [line, EOL] {
            if !platform::storage::write_all(&mut self.file, part.as_bytes()).await? {
                return Err(LogError::ShortWrite { offset });
            }
        }
        Ok(())
    }

    /// Render and append one data row.
    pub async fn append<T: fmt::Display>(&mut self, row: &T) -> Result<(), LogError<F::Error>> {
        let line: Row = record::render(row).ok_or(LogError::RowTooLong)?;
        self.append_line(&line).await?;
        self.rows = self.rows.saturating_add(1);
        Ok(())
    }

    /// Append a session marker and sync.
    ///
    /// Returns the file size before the marker, which is where
    /// [`erase_last_session`] will cut.
    pub async fn begin_session(&mut self, timestamp_ms: u64) -> Result<u64, LogError<F::Error>> {
        let offset = self.file.size();
        let mut line = Row::new();
        fmt::Write::write_fmt(&mut line, format_args!("{SESSION_MARKER} {timestamp_ms}"))
            .map_err(|_| LogError::RowTooLong)?;
        self.append_line(&line).await?;
        self.file.flush().await?;
        Ok(offset)
    }

    /// Sync to the medium.
    pub async fn flush(&mut self) -> Result<(), LogError<F::Error>> {
        self.file.flush().await?;
        Ok(())
    }

    /// Data rows appended through this handle.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.file.size()
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// One line and where it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line<'a> {
    /// Byte offset of the first character.
    pub offset: u64,
    /// Text without the terminator.
    pub text: &'a str,
}

/// Streams lines out of a file through a fixed buffer.
pub struct LineReader<'f, F> {
    file: &'f mut F,
    buf: [u8; LINE_CAPACITY],
    start: usize,
    end: usize,
    offset: u64,
    eof: bool,
}

impl<'f, F: File> LineReader<'f, F> {
    /// Read `file` from the beginning.
    pub async fn new(file: &'f mut F) -> Result<Self, LogError<F::Error>> {
        file.seek(0).await?;
        Ok(Self {
            file,
            buf: [0; LINE_CAPACITY],
            start: 0,
            end: 0,
            offset: 0,
            eof: false,
        })
    }

    /// Next line, or `None` at end of file.
    pub async fn next_line(&mut self) -> Result<Option<Line<'_>>, LogError<F::Error>> {
        loop {
            let pending = self.buf.get(self.start..self.end).unwrap_or_default();
            let newline = pending.iter().position(|&b| b == b'\n');
            if newline.is_some() || (self.eof && !pending.is_empty()) {
                let len = newline.unwrap_or(pending.len());
                let consumed = newline.map_or(len, |n| n.saturating_add(1));
                let (from, to) = (self.start, self.start.saturating_add(len));
                let offset = self.offset;
                self.start = self.start.saturating_add(consumed);
                self.offset = self.offset.saturating_add(consumed as u64);

                let raw = self.buf.get(from..to).unwrap_or_default();
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                let text = core::str::from_utf8(raw).map_err(|_| LogError::Encoding { offset })?;
                return Ok(Some(Line { offset, text }));
            }
            if self.eof {
                return Ok(None);
            }
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end = self.end.saturating_sub(self.start);
                self.start = 0;
            }
            let Some(space) = self.buf.get_mut(self.end..).filter(|s| !s.is_empty()) else {
                return Err(LogError::LineTooLong {
                    offset: self.offset,
                });
            };
            let n = self.file.read(space).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.end = self.end.saturating_add(n);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session erase
// ---------------------------------------------------------------------------

/// What "erase last session" did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionErase {
    /// The log does not exist.
    NoLog,
    /// No marker after the header; the file is unchanged.
    NoMarker,
    /// The file was cut at `offset`.
    Erased {
        /// New file size.
        offset: u64,
    },
}

/// Truncate `path` to the start of its last session marker.
pub async fn erase_last_session<S: Storage>(
    storage: &S,
    path: &str,
) -> Result<SessionErase, LogError<S::Error>> {
    if !storage.exists(path).await? {
        return Ok(SessionErase::NoLog);
    }
    let mut file = storage.open(path, OpenMode::Append).await?;
    let mut last = None;
    {
        let mut lines = LineReader::new(&mut file).await?;
        // the header is never a session
        let _ = lines.next_line().await?;
        while let Some(line) = lines.next_line().await? {
            if line.text.starts_with('#') && line.text.contains("SESSION_START") {
                last = Some(line.offset);
            }
        }
    }
    let Some(offset) = last else {
        return Ok(SessionErase::NoMarker);
    };
    file.truncate(offset).await?;
    file.flush().await?;
    info!("erased {} from byte {}", path, offset);
    Ok(SessionErase::Erased { offset })
}
