//! Sample and aggregate rows, as written to `RESULTS.CSV` and `BENCH.CSV`.

use core::fmt::{self, Write as _};

use spi_nor::{FlashAddress, JedecId, StatusRegister};

use crate::csv;

/// Header of the per-measurement log.
pub const SAMPLE_HEADER: &str = "run,op,spi_hz,addr,bytes,duration_us,mbps,verify_errors,status1_end";

/// Header of the per-clock aggregate log.
pub const AGGREGATE_HEADER: &str = "timestamp_ms,jedec_hex,spi_hz,avg_erase_ms,avg_write256_kBps,avg_readseq_kBps,avg_readrand_MBps,verify_errors";

/// Longest rendered row.
pub const ROW_CAPACITY: usize = 192;

/// A rendered row, without line terminator.
pub type Row = heapless::String<ROW_CAPACITY>;

/// Measured operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpKind {
    /// 4 KB sector erase.
    Erase4k,
    /// 256-byte page program.
    Program256,
    /// Sequential read of the configured block.
    ReadSeq,
    /// One 256-byte read at a random page.
    ReadRand,
}

impl OpKind {
    /// Name used in the `op` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Erase4k => "ERASE_4K",
            Self::Program256 => "PROG_256B",
            Self::ReadSeq => "READ_SEQ",
            Self::ReadRand => "READ_RAND",
        }
    }

    /// Inverse of [`OpKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        [Self::Erase4k, Self::Program256, Self::ReadSeq, Self::ReadRand]
            .into_iter()
            .find(|op| op.as_str() == s)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkSample {
    /// 1-based trial number.
    pub trial: u32,
    /// What was measured.
    pub op: OpKind,
    /// Clock the operation ran at.
    pub spi_hz: u32,
    /// Start address.
    pub addr: FlashAddress,
    /// Bytes moved or erased.
    pub bytes: u32,
    /// Duration; negative on timeout.
    pub duration_us: i64,
    /// Throughput (0 for erase rows).
    pub mbps: f64,
    /// Mismatching bytes after read-back.
    pub verify_errors: u32,
    /// SR1 at the end of the operation.
    pub status1_end: StatusRegister,
}

impl fmt::Display for BenchmarkSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},0x{:06X},{},{},{:.6},{},{:02X}",
            self.trial,
            self.op,
            self.spi_hz,
            self.addr.get(),
            self.bytes,
            self.duration_us,
            self.mbps,
            self.verify_errors,
            self.status1_end.bits()
        )
    }
}

/// Averages for one completed clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkAggregate {
    /// Uptime when the clock finished.
    pub timestamp_ms: u64,
    /// Chip under test (all zero when unknown).
    pub jedec: JedecId,
    /// Read clock.
    pub spi_hz: u32,
    /// Mean sector erase time.
    pub avg_erase_ms: f64,
    /// Mean page program throughput, KB/s.
    pub avg_write256_kbps: f64,
    /// Mean sequential read throughput, KB/s.
    pub avg_readseq_kbps: f64,
    /// Mean random 256-byte read throughput, MB/s.
    pub avg_readrand_mbps: f64,
    /// Total mismatching bytes across all trials.
    pub verify_errors: u32,
    /// Trials that contributed. Not persisted.
    pub trials: u32,
}

impl BenchmarkAggregate {
    /// Aggregate for a clock that ran no trials.
    pub const fn no_data(timestamp_ms: u64, jedec: JedecId, spi_hz: u32) -> Self {
        Self {
            timestamp_ms,
            jedec,
            spi_hz,
            avg_erase_ms: 0.0,
            avg_write256_kbps: 0.0,
            avg_readseq_kbps: 0.0,
            avg_readrand_mbps: 0.0,
            verify_errors: 0,
            trials: 0,
        }
    }
}

impl fmt::Display for BenchmarkAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{:.3},{:.3},{:.3},{:.3},{}",
            self.timestamp_ms,
            self.jedec,
            self.spi_hz,
            self.avg_erase_ms,
            self.avg_write256_kbps,
            self.avg_readseq_kbps,
            self.avg_readrand_mbps,
            self.verify_errors
        )
    }
}

/// Render any row into a fixed buffer. `None` if it does not fit.
pub fn render<T: fmt::Display>(row: &T) -> Option<Row> {
    let mut out = Row::new();
    write!(out, "{row}").ok()?;
    Some(out)
}

// ---------------------------------------------------------------------------
// Reading aggregates back
// ---------------------------------------------------------------------------

/// Values the identifier needs from one aggregate row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateValues {
    /// Read clock.
    pub spi_hz: u32,
    /// Mean sector erase time.
    pub erase_ms: f64,
    /// Page program throughput, KB/s.
    pub write_kbps: f64,
    /// Sequential read throughput, KB/s.
    pub readseq_kbps: f64,
    /// Verify error count.
    pub verify_errors: u32,
    /// JEDEC column, when the log has one and it parses.
    pub jedec: Option<JedecId>,
}

impl AggregateValues {
    /// Row with no measurements (a run with zero trials).
    pub fn is_no_data(&self) -> bool {
        self.erase_ms <= 0.0 && self.write_kbps <= 0.0 && self.readseq_kbps <= 0.0
    }
}

/// Column positions bound from an aggregate header.
///
/// Older logs used different names and orders; binding by name with
/// aliases keeps them readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateColumns {
    hz: usize,
    erase: usize,
    write: usize,
    readseq: usize,
    verify: usize,
    jedec: Option<usize>,
}

impl AggregateColumns {
    /// Bind from a header line. `None` if a required column is missing.
    pub fn bind(header_line: &str) -> Option<Self> {
        let header = csv::split_into::<24>(header_line);
        Some(Self {
            hz: csv::find_column(&header, &["spi_hz", "hz"])?,
            erase: csv::find_column(&header, &["avg_erase_ms", "erase_ms"])?,
            write: csv::find_column(&header, &["avg_write256_kbps", "avg_write_kbps"])?,
            readseq: csv::find_column(&header, &["avg_readseq_kbps", "avg_read_kbps"])?,
            verify: csv::find_column(
                &header,
                &["verify_errors", "total_verify_errors", "total_verify_errs"],
            )?,
            jedec: csv::find_column(&header, &["jedec_hex", "jedec"]),
        })
    }

    /// Extract values from a data line. `None` if the line is too short.
    pub fn parse(&self, line: &str) -> Option<AggregateValues> {
        let fields = csv::split_into::<24>(line);
        let get = |i: usize| fields.get(i).copied();
        Some(AggregateValues {
            spi_hz: csv::unsigned(get(self.hz)?),
            erase_ms: csv::number(get(self.erase)?),
            write_kbps: csv::number(get(self.write)?),
            readseq_kbps: csv::number(get(self.readseq)?),
            verify_errors: csv::unsigned(get(self.verify)?),
            jedec: self
                .jedec
                .and_then(get)
                .and_then(crate::identify::parse_jedec)
                .map(|(mfg, dev)| {
                    let [hi, lo] = dev.to_be_bytes();
                    JedecId::new(mfg, hi, lo)
                }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn sample_row_format() {
        let s = BenchmarkSample {
            trial: 3,
            op: OpKind::Program256,
            spi_hz: 12_000_000,
            addr: FlashAddress::new(0x2000).unwrap(),
            bytes: 256,
            duration_us: 420,
            mbps: 0.581_282,
            verify_errors: 0,
            status1_end: StatusRegister(0x00),
        };
        assert_eq!(
            render(&s).unwrap().as_str(),
            "3,PROG_256B,12000000,0x002000,256,420,0.581282,0,00"
        );
    }

    #[test]
    fn timeout_sample_keeps_negative_duration() {
        let s = BenchmarkSample {
            trial: 1,
            op: OpKind::Erase4k,
            spi_hz: 12_000_000,
            addr: FlashAddress::ZERO,
            bytes: 4096,
            duration_us: -1,
            mbps: 0.0,
            verify_errors: 0,
            status1_end: StatusRegister(0x03),
        };
        assert_eq!(
            render(&s).unwrap().as_str(),
            "1,ERASE_4K,12000000,0x000000,4096,-1,0.000000,0,03"
        );
    }

    #[test]
    fn aggregate_row_format() {
        let a = BenchmarkAggregate {
            timestamp_ms: 123_456,
            jedec: JedecId::new(0xEF, 0x40, 0x16),
            spi_hz: 24_000_000,
            avg_erase_ms: 45.123_4,
            avg_write256_kbps: 612.5,
            avg_readseq_kbps: 2048.0,
            avg_readrand_mbps: 1.25,
            verify_errors: 0,
            trials: 100,
        };
        assert_eq!(
            render(&a).unwrap().as_str(),
            "123456,EF4016,24000000,45.123,612.500,2048.000,1.250,0"
        );
        let unknown = BenchmarkAggregate::no_data(1, JedecId::new(0, 0, 0), 12_000_000);
        assert_eq!(
            render(&unknown).unwrap().as_str(),
            "1,000000,12000000,0.000,0.000,0.000,0.000,0"
        );
    }

    #[test]
    fn headers_match_rows() {
        assert_eq!(SAMPLE_HEADER.split(',').count(), 9);
        assert_eq!(AGGREGATE_HEADER.split(',').count(), 8);
    }

    #[test]
    fn op_names_round_trip() {
        for op in [OpKind::Erase4k, OpKind::Program256, OpKind::ReadSeq, OpKind::ReadRand] {
            assert_eq!(OpKind::parse(op.as_str()), Some(op));
        }
        assert_eq!(OpKind::parse("ERASE_64K"), None);
    }

    #[test]
    fn bind_current_header() {
        let cols = AggregateColumns::bind(AGGREGATE_HEADER).unwrap();
        let v = cols
            .parse("99,EF4016,12000000,45.000,600.000,1800.000,1.100,2")
            .unwrap();
        assert_eq!(v.spi_hz, 12_000_000);
        assert_eq!(v.erase_ms, 45.0);
        assert_eq!(v.write_kbps, 600.0);
        assert_eq!(v.readseq_kbps, 1800.0);
        assert_eq!(v.verify_errors, 2);
        assert_eq!(v.jedec, Some(JedecId::new(0xEF, 0x40, 0x16)));
    }

    #[test]
    fn bind_legacy_header_with_aliases() {
        let cols =
            AggregateColumns::bind("\u{FEFF}HZ,Erase_ms,avg_write_kBps,avg_read_kBps,total_verify_errs")
                .unwrap();
        let v = cols.parse("12000000,50,500,1500,0").unwrap();
        assert_eq!(v.erase_ms, 50.0);
        assert_eq!(v.jedec, None);
        assert!(cols.parse("12000000,50").is_none());
    }

    #[test]
    fn bind_rejects_missing_columns() {
        assert!(AggregateColumns::bind("spi_hz,avg_erase_ms").is_none());
    }
}
