//! Text sinks for human-readable transcripts
//!
//! Every report the bench produces goes through a [`TextSink`] passed in by
//! the caller. The console build hands in a [`ConsoleSink`]; the service
//! side hands in a [`BufferSink`] and renders the captured text later.

use core::fmt;

/// Destination for transcript text.
pub trait TextSink {
    /// Append `text` verbatim. Line breaks are part of the text.
    fn write_text(&mut self, text: &str);

    /// Append formatted text.
    fn write_args(&mut self, args: fmt::Arguments<'_>) {
        let _ = fmt::write(&mut Adapter(self), args);
    }
}

impl<T: TextSink + ?Sized> TextSink for &mut T {
    fn write_text(&mut self, text: &str) {
        T::write_text(self, text);
    }
}

struct Adapter<'a, S: ?Sized>(&'a mut S);

impl<S: TextSink + ?Sized> fmt::Write for Adapter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_text(s);
        Ok(())
    }
}

/// Write one line (`\r\n` terminated, as serial terminals expect).
#[macro_export]
macro_rules! sink_line {
    ($sink:expr) => {{
        use $crate::sink::TextSink as _;
        $sink.write_text("\r\n");
    }};
    ($sink:expr, $($arg:tt)*) => {{
        use $crate::sink::TextSink as _;
        $sink.write_args(format_args!($($arg)*));
        $sink.write_text("\r\n");
    }};
}

// ---------------------------------------------------------------------------
// ConsoleSink
// ---------------------------------------------------------------------------

/// Longest line the console forwards in one log record.
pub const CONSOLE_LINE: usize = 160;

/// Forwards complete lines to the active logger.
///
/// Text is collected until a newline, then emitted as one `info` record
/// (defmt on hardware, tracing on the desktop). Lines longer than
/// [`CONSOLE_LINE`] are split. Without a logging feature the text is dropped.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    line: heapless::String<CONSOLE_LINE>,
}

impl ConsoleSink {
    /// Create an empty console sink.
    pub const fn new() -> Self {
        Self {
            line: heapless::String::new(),
        }
    }

    /// Emit any partially collected line.
    pub fn flush(&mut self) {
        if !self.line.is_empty() {
            emit(&self.line);
            self.line.clear();
        }
    }
}

impl TextSink for ConsoleSink {
    fn write_text(&mut self, text: &str) {
        for ch in text.chars() {
            match ch {
                '\r' => {}
                '\n' => {
                    emit(&self.line);
                    self.line.clear();
                }
                c => {
                    if self.line.push(c).is_err() {
                        emit(&self.line);
                        self.line.clear();
                        let _ = self.line.push(c);
                    }
                }
            }
        }
    }
}

impl Drop for ConsoleSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[allow(unused_variables)]
fn emit(line: &str) {
    #[cfg(feature = "defmt")]
    defmt::info!("{=str}", line);
    #[cfg(feature = "tracing")]
    tracing::info!("{}", line);
}

// ---------------------------------------------------------------------------
// BufferSink
// ---------------------------------------------------------------------------

/// Captures text into a fixed-capacity buffer.
///
/// Text that does not fit is dropped at a character boundary and
/// [`BufferSink::truncated`] turns true, so a transcript viewer can say the
/// output was cut instead of silently showing a partial report.
#[derive(Debug, Default, Clone)]
pub struct BufferSink<const N: usize> {
    text: heapless::String<N>,
    truncated: bool,
}

impl<const N: usize> BufferSink<N> {
    /// Create an empty buffer.
    pub const fn new() -> Self {
        Self {
            text: heapless::String::new(),
            truncated: false,
        }
    }

    /// Captured text.
    pub fn as_str(&self) -> &str {
        self.text.as_str()
    }

    /// Whether any text was dropped for lack of room.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Forget everything captured so far.
    pub fn clear(&mut self) {
        self.text.clear();
        self.truncated = false;
    }
}

impl<const N: usize> TextSink for BufferSink<N> {
    fn write_text(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        if self.text.push_str(text).is_ok() {
            return;
        }
        for ch in text.chars() {
            if self.text.push(ch).is_err() {
                break;
            }
        }
        self.truncated = true;
    }
}

impl<const N: usize> fmt::Display for BufferSink<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn buffer_collects_formatted_lines() {
        let mut sink = BufferSink::<64>::new();
        crate::sink_line!(sink, "JEDEC ID: {:02X} {:02X} {:02X}", 0xEF, 0x40, 0x16);
        crate::sink_line!(sink);
        assert_eq!(sink.as_str(), "JEDEC ID: EF 40 16\r\n\r\n");
        assert!(!sink.truncated());
    }

    #[test]
    fn buffer_truncates_at_char_boundary() {
        let mut sink = BufferSink::<8>::new();
        sink.write_text("µµµµµ"); // 10 bytes
        assert_eq!(sink.as_str(), "µµµµ");
        assert!(sink.truncated());
        sink.write_text("x");
        assert_eq!(sink.as_str(), "µµµµ", "nothing appended after truncation");
    }

    #[test]
    fn buffer_clear_resets_truncation() {
        let mut sink = BufferSink::<4>::new();
        sink.write_text("12345");
        sink.clear();
        assert!(!sink.truncated());
        sink.write_text("ab");
        assert_eq!(sink.as_str(), "ab");
    }

    #[test]
    fn sink_through_dyn_and_mut_ref() {
        fn report(sink: &mut dyn TextSink) {
            crate::sink_line!(sink, "Result: {}", "PASSED");
        }
        let mut sink = BufferSink::<32>::new();
        report(&mut sink);
        assert_eq!(sink.as_str(), "Result: PASSED\r\n");
    }

    #[test]
    fn console_sink_accepts_long_lines() {
        let mut console = ConsoleSink::new();
        let long = "x".repeat(CONSOLE_LINE * 2 + 3);
        console.write_text(&long);
        console.write_text("\r\n");
        assert!(console.line.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn buffer_never_exceeds_capacity(chunks in proptest::collection::vec(".{0,12}", 0..20)) {
            let mut sink = BufferSink::<32>::new();
            for c in &chunks {
                sink.write_text(c);
            }
            proptest::prop_assert!(sink.as_str().len() <= 32);
            let joined: String = chunks.concat();
            proptest::prop_assert!(joined.starts_with(sink.as_str()));
            proptest::prop_assert_eq!(sink.truncated(), joined.len() > sink.as_str().len());
        }
    }
}
