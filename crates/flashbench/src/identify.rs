//! Chip identification from measured timings
//!
//! Takes the last aggregate row measured at the reference clock, converts
//! it to the units a datasheet uses (program time per page, read throughput
//! at 50 MHz), and scores every row of the reference catalog with a
//! weighted L1 distance. The live JEDEC id turns a plausible guess into a
//! near-certain one: a match earns a small bonus, a mismatch a penalty
//! large enough to push the row below every compatible part.
//!
//! # Catalog format
//!
//! One header line, then one part per line:
//!
//! ```text
//! chip_model,company,chip_family,capacity_mbit,jedec_id,
//! typ_4kb_sector_erase_ms,max_4kb_sector_erase_ms,
//! typ_32kb_block_erase_ms,max_32kb_block_erase_ms,
//! typ_64kb_block_erase_ms,max_64kb_block_erase_ms,
//! max_clock_read_mhz,typ_page_program_ms,max_page_program_ms,
//! read_speed_50mhz_mb_s[,operating_voltage_range[,endurance_cycles]]
//! ```
//!
//! Rows with fewer than 15 fields, blank lines, and `#` comments are
//! skipped.

use core::fmt;

use platform::{config as paths, sink_line, OpenMode, Storage, TextSink};
use spi_nor::JedecId;

use crate::config::{whole_mhz, IDENTIFY_REF_HZ, MHZ};
use crate::csv;
use crate::log::{LineReader, LogError};
use crate::record::{AggregateColumns, AggregateValues};

/// Longest model/company/family name kept.
pub const NAME_CAPACITY: usize = 48;

/// Longest raw JEDEC / voltage text kept.
pub const SHORT_CAPACITY: usize = 24;

/// Catalog rows need at least this many fields.
pub const MIN_CATALOG_FIELDS: usize = 15;

/// Matches reported.
pub const TOP_N: usize = 3;

/// Program time reported for a zero or negative write throughput.
pub const UNMEASURED_PROG_MS: f64 = 1e9;

/// Scoring weights.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IdentifyWeights {
    /// Relative 4 KB erase time error.
    pub erase: f64,
    /// Relative page program time error.
    pub prog: f64,
    /// Relative 50 MHz read throughput error.
    pub read: f64,
    /// Added when both JEDEC ids are known and equal (negative).
    pub jedec_match_bonus: f64,
    /// Added when both JEDEC ids are known and differ.
    pub jedec_mismatch_penalty: f64,
    /// Replaces `prog` when the averages recorded verify errors.
    pub unreliable_prog: f64,
    /// Clock whose aggregate row is used.
    pub reference_hz: u32,
}

impl Default for IdentifyWeights {
    fn default() -> Self {
        Self {
            erase: 1.0,
            prog: 1.0,
            read: 0.7,
            jedec_match_bonus: -0.25,
            jedec_mismatch_penalty: 100.0,
            unreliable_prog: 0.15,
            reference_hz: IDENTIFY_REF_HZ,
        }
    }
}

// ---------------------------------------------------------------------------
// JEDEC text
// ---------------------------------------------------------------------------

/// Parse catalog JEDEC text into (manufacturer, device code).
///
/// Accepts `EF4016`, `EF:4016`, `EF 40 16`, `EF-40-16`, `0xEF4016`, with
/// an optional `JEDEC=` prefix. Anything but exactly six hex digits after
/// the separators are removed is rejected.
///
/// ```
/// use flashbench::identify::parse_jedec;
///
/// assert_eq!(parse_jedec("JEDEC=EF:4016"), Some((0xEF, 0x4016)));
/// assert_eq!(parse_jedec("BF 26 41"), Some((0xBF, 0x2641)));
/// assert_eq!(parse_jedec("n/a"), None);
/// ```
pub fn parse_jedec(text: &str) -> Option<(u8, u16)> {
    let mut s = text.trim();
    if s.len() >= 5 && s.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("jedec")) {
        s = s.get(5..).unwrap_or_default().trim_start_matches([' ', '=', '-', ':']);
    }
    if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        s = rest;
    }
    let mut digits = heapless::String::<6>::new();
    for ch in s.chars() {
        match ch {
            ' ' | ':' | '-' => {}
            c if c.is_ascii_hexdigit() => digits.push(c).ok()?,
            _ => return None,
        }
    }
    if digits.len() != 6 {
        return None;
    }
    let [_, mfg, hi, lo] = u32::from_str_radix(&digits, 16).ok()?.to_be_bytes();
    Some((mfg, u16::from_be_bytes([hi, lo])))
}

fn known((mfg, dev): (u8, u16)) -> Option<(u8, u16)> {
    (mfg != 0 || dev != 0).then_some((mfg, dev))
}

fn jedec_pair(id: JedecId) -> (u8, u16) {
    (id.manufacturer, id.device())
}

// ---------------------------------------------------------------------------
// Catalog rows
// ---------------------------------------------------------------------------

/// One datasheet entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChipReference {
    /// Part number.
    pub model: heapless::String<NAME_CAPACITY>,
    /// Vendor.
    pub company: heapless::String<NAME_CAPACITY>,
    /// Product family.
    pub family: heapless::String<NAME_CAPACITY>,
    /// Density in Mbit.
    pub capacity_mbit: f64,
    /// JEDEC column as written.
    pub jedec_text: heapless::String<SHORT_CAPACITY>,
    /// Parsed JEDEC, `None` when absent, unparsable, or all zero.
    pub jedec: Option<(u8, u16)>,
    /// Typical / max 4 KB erase, ms.
    pub erase_4k_ms: (f64, f64),
    /// Typical / max 32 KB erase, ms.
    pub erase_32k_ms: (f64, f64),
    /// Typical / max 64 KB erase, ms.
    pub erase_64k_ms: (f64, f64),
    /// Highest read clock, MHz.
    pub max_read_mhz: f64,
    /// Typical / max page program, ms.
    pub prog_ms: (f64, f64),
    /// Sequential read throughput at 50 MHz, MB/s.
    pub read_mbps_50mhz: f64,
    /// Supply range, when given.
    pub voltage: Option<heapless::String<SHORT_CAPACITY>>,
    /// Rated erase cycles, when given.
    pub endurance_cycles: Option<f64>,
}

impl ChipReference {
    /// Parse one catalog line. `None` for short rows.
    pub fn parse(line: &str) -> Option<Self> {
        let f = csv::split_into::<20>(line);
        if f.len() < MIN_CATALOG_FIELDS {
            return None;
        }
        let field = |i: usize| f.get(i).copied().unwrap_or_default();
        let num = |i: usize| csv::number(field(i));
        let jedec_text: heapless::String<SHORT_CAPACITY> = clipped(field(4));
        Some(Self {
            model: clipped(field(0)),
            company: clipped(field(1)),
            family: clipped(field(2)),
            capacity_mbit: num(3),
            jedec: parse_jedec(&jedec_text).and_then(known),
            jedec_text,
            erase_4k_ms: (num(5), num(6)),
            erase_32k_ms: (num(7), num(8)),
            erase_64k_ms: (num(9), num(10)),
            max_read_mhz: num(11),
            prog_ms: (num(12), num(13)),
            read_mbps_50mhz: num(14),
            voltage: f.get(15).filter(|v| !v.is_empty()).map(|v| clipped(v)),
            endurance_cycles: f.get(16).filter(|v| !v.is_empty()).map(|v| csv::number(v)),
        })
    }

    /// Distance from `measured`; lower is closer.
    pub fn score(&self, measured: &Measurement, weights: &IdentifyWeights) -> f64 {
        let (typ_erase, _) = self.erase_4k_ms;
        let (typ_prog, _) = self.prog_ms;
        let d_erase = libm::fabs(measured.erase_ms - typ_erase) / typ_erase.max(1.0);
        let d_prog = libm::fabs(measured.prog_ms - typ_prog) / typ_prog.max(0.1);
        let d_read = if self.read_mbps_50mhz > 0.01 {
            libm::fabs(measured.read50_mbps - self.read_mbps_50mhz) / self.read_mbps_50mhz
        } else {
            0.0
        };
        let w_prog = if measured.verify_errors > 0 {
            weights.unreliable_prog
        } else {
            weights.prog
        };
        let mut score = weights.erase * d_erase + w_prog * d_prog + weights.read * d_read;
        if let (Some(live), Some(reference)) = (measured.jedec, self.jedec) {
            score += if live == reference {
                weights.jedec_match_bonus
            } else {
                weights.jedec_mismatch_penalty
            };
        }
        score
    }
}

fn clipped<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for ch in s.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// Aggregate values converted to catalog units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Mean 4 KB erase, ms.
    pub erase_ms: f64,
    /// Page program time, ms.
    pub prog_ms: f64,
    /// Estimated sequential read at 50 MHz, MB/s.
    pub read50_mbps: f64,
    /// Verify errors recorded with the averages.
    pub verify_errors: u32,
    /// JEDEC used for the bonus/penalty.
    pub jedec: Option<(u8, u16)>,
}

impl Measurement {
    /// Convert an aggregate row measured at `reference_hz`.
    ///
    /// `live` is the id read from the chip now; when the chip does not
    /// answer, the id logged with the row is used instead.
    pub fn from_aggregate(values: &AggregateValues, reference_hz: u32, live: Option<JedecId>) -> Self {
        let ref_mhz = f64::from(reference_hz) / f64::from(MHZ);
        let scale = if ref_mhz > 0.0 { 50.0 / ref_mhz } else { 0.0 };
        let jedec = live
            .filter(|id| !id.is_absent())
            .or(values.jedec)
            .map(jedec_pair)
            .and_then(known);
        Self {
            erase_ms: values.erase_ms,
            prog_ms: prog_ms_from_kbps(values.write_kbps),
            read50_mbps: values.readseq_kbps / 1024.0 * scale,
            verify_errors: values.verify_errors,
            jedec,
        }
    }
}

/// Time to program one 256-byte page at `kbps` KB/s, in ms.
pub fn prog_ms_from_kbps(kbps: f64) -> f64 {
    if kbps <= 0.0 {
        UNMEASURED_PROG_MS
    } else {
        256.0 / (kbps * 1024.0) * 1000.0
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// The [`TOP_N`] lowest scores seen so far, ascending.
#[derive(Debug, Clone, Default)]
pub struct TopMatches {
    slots: heapless::Vec<(ChipReference, f64), TOP_N>,
}

impl TopMatches {
    /// Empty ranking.
    pub const fn new() -> Self {
        Self {
            slots: heapless::Vec::new(),
        }
    }

    /// Offer a candidate. Equal scores keep the earlier row ahead.
    pub fn offer(&mut self, row: ChipReference, score: f64) {
        let pos = self
            .slots
            .iter()
            .position(|(_, s)| score < *s)
            .unwrap_or(self.slots.len());
        if pos >= TOP_N {
            return;
        }
        if self.slots.is_full() {
            let _ = self.slots.pop();
        }
        let _ = self.slots.insert(pos, (row, score));
    }

    /// Ranked matches, best first.
    pub fn as_slice(&self) -> &[(ChipReference, f64)] {
        &self.slots
    }

    /// Best match.
    pub fn best(&self) -> Option<&(ChipReference, f64)> {
        self.slots.first()
    }
}

/// Outcome of a completed identification.
#[derive(Debug, Clone)]
pub struct IdentificationResult {
    /// What was compared.
    pub measured: Measurement,
    /// Catalog rows scored.
    pub accepted: u32,
    /// Best matches.
    pub matches: TopMatches,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Identification failure.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdentifyError<E> {
    /// Reading a log or the catalog failed.
    Log(LogError<E>),
    /// The aggregate log lacks a required column.
    MissingColumns,
    /// The catalog could not be opened.
    NoCatalog,
}

impl<E> From<LogError<E>> for IdentifyError<E> {
    fn from(e: LogError<E>) -> Self {
        Self::Log(e)
    }
}

impl<E: fmt::Debug> fmt::Display for IdentifyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(e) => write!(f, "{e}"),
            Self::MissingColumns => {
                write!(f, "{} header missing required columns.", paths::AGGREGATES_PATH)
            }
            Self::NoCatalog => write!(f, "open {} failed.", paths::CATALOG_PATH),
        }
    }
}

/// Last aggregate row at `reference_hz`, or `None` when the log is missing
/// or has no such row.
pub async fn load_measured<S: Storage>(
    storage: &S,
    reference_hz: u32,
) -> Result<Option<AggregateValues>, IdentifyError<S::Error>> {
    if !storage.exists(paths::AGGREGATES_PATH).await.map_err(LogError::Storage)? {
        return Ok(None);
    }
    let mut file = storage
        .open(paths::AGGREGATES_PATH, OpenMode::Read)
        .await
        .map_err(LogError::Storage)?;
    let mut lines = LineReader::new(&mut file).await?;
    let Some(header) = lines.next_line().await? else {
        return Ok(None);
    };
    let columns = AggregateColumns::bind(header.text).ok_or(IdentifyError::MissingColumns)?;

    let mut last = None;
    while let Some(line) = lines.next_line().await? {
        if csv::is_comment(line.text) || csv::is_blank(line.text) {
            continue;
        }
        if let Some(values) = columns.parse(line.text) {
            if values.spi_hz == reference_hz && !values.is_no_data() {
                last = Some(values);
            }
        }
    }
    Ok(last)
}

/// Score every catalog row against `measured`.
pub async fn rank_catalog<S: Storage>(
    storage: &S,
    measured: &Measurement,
    weights: &IdentifyWeights,
) -> Result<(TopMatches, u32), IdentifyError<S::Error>> {
    let mut file = storage
        .open(paths::CATALOG_PATH, OpenMode::Read)
        .await
        .map_err(|_| IdentifyError::NoCatalog)?;
    let mut lines = LineReader::new(&mut file).await?;
    let mut top = TopMatches::new();
    let mut accepted = 0u32;

    // header
    let _ = lines.next_line().await?;
    while let Some(line) = lines.next_line().await? {
        if csv::is_comment(line.text) || csv::is_blank(line.text) {
            continue;
        }
        let Some(row) = ChipReference::parse(line.text) else {
            continue;
        };
        accepted = accepted.saturating_add(1);
        let score = row.score(measured, weights);
        top.offer(row, score);
    }
    Ok((top, accepted))
}

/// Identify the chip and write the report to `sink`.
///
/// `Ok(None)` when there is nothing to compare (no averages at the
/// reference clock); the sink explains why.
pub async fn identify<S: Storage, T: TextSink>(
    storage: &S,
    live: Option<JedecId>,
    weights: &IdentifyWeights,
    sink: &mut T,
) -> Result<Option<IdentificationResult>, IdentifyError<S::Error>> {
    let Some(values) = load_measured(storage, weights.reference_hz).await? else {
        sink_line!(
            sink,
            "No {}MHz averages found in {}.",
            whole_mhz(weights.reference_hz),
            paths::AGGREGATES_PATH
        );
        return Ok(None);
    };
    if values.verify_errors > 0 {
        sink_line!(
            sink,
            "NOTE: verify_errors={} in averages; write metric may be unreliable.",
            values.verify_errors
        );
    }
    let measured = Measurement::from_aggregate(&values, weights.reference_hz, live);
    let (matches, accepted) = rank_catalog(storage, &measured, weights).await?;
    let result = IdentificationResult {
        measured,
        accepted,
        matches,
    };
    write_report(&result, weights.reference_hz, sink);
    if let Some((best, score)) = result.matches.best() {
        info!("best match {} (score {})", best.model.as_str(), score);
    }
    Ok(Some(result))
}

/// Render an identification report.
pub fn write_report<T: TextSink>(result: &IdentificationResult, reference_hz: u32, sink: &mut T) {
    let m = &result.measured;
    sink_line!(sink);
    sink_line!(sink, "=== Chip Identification ({} MHz) ===", whole_mhz(reference_hz));
    sink_line!(
        sink,
        "Measured: erase={:.2} ms, prog256={:.3} ms, read50~={:.2} MB/s",
        m.erase_ms,
        m.prog_ms,
        m.read50_mbps
    );
    sink_line!(sink, "Reference rows accepted: {}", result.accepted);
    sink_line!(sink, "Top matches:");
    for (rank, (row, score)) in (1..).zip(result.matches.as_slice()) {
        sink_line!(
            sink,
            "{}) {}  [{}, {}]  JEDEC={}  score={:.3}",
            rank,
            row.model,
            row.company,
            row.family,
            row.jedec_text,
            score
        );
    }
    sink_line!(sink, "(Lower score = closer match)");
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::float_cmp,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    const W25Q32: &str = "W25Q32FV,Winbond,SpiFlash,32,EF 40 16,45,400,120,1600,150,2000,104,0.7,3,6.25,2.7-3.6V,100000";
    const SST26: &str = "SST26VF016B,Microchip,SST26,16,BF2641,18,25,18,25,18,25,104,1.0,1.5,6.0";

    fn measured(erase: f64, prog: f64, read: f64, verr: u32, jedec: Option<(u8, u16)>) -> Measurement {
        Measurement {
            erase_ms: erase,
            prog_ms: prog,
            read50_mbps: read,
            verify_errors: verr,
            jedec,
        }
    }

    #[test]
    fn jedec_variants() {
        for text in ["EF4016", "EF:4016", "EF 40 16", "0xEF4016", "JEDEC=EF4016", "jedec-EF 40 16", " ef4016 "] {
            assert_eq!(parse_jedec(text), Some((0xEF, 0x4016)), "{text}");
        }
        for text in ["", "EF40", "EF401600", "EF40G6", "unknown"] {
            assert_eq!(parse_jedec(text), None, "{text}");
        }
    }

    #[test]
    fn parse_full_row() {
        let r = ChipReference::parse(W25Q32).unwrap();
        assert_eq!(r.model.as_str(), "W25Q32FV");
        assert_eq!(r.jedec, Some((0xEF, 0x4016)));
        assert_eq!(r.jedec_text.as_str(), "EF 40 16");
        assert_eq!(r.erase_4k_ms, (45.0, 400.0));
        assert_eq!(r.prog_ms, (0.7, 3.0));
        assert_eq!(r.read_mbps_50mhz, 6.25);
        assert_eq!(r.voltage.as_deref(), Some("2.7-3.6V"));
        assert_eq!(r.endurance_cycles, Some(100_000.0));
    }

    #[test]
    fn parse_optional_columns_and_short_rows() {
        let r = ChipReference::parse(SST26).unwrap();
        assert_eq!(r.voltage, None);
        assert_eq!(r.endurance_cycles, None);
        assert!(ChipReference::parse("A,B,C,1,EF4016,1,2,3,4,5,6,7,8,9").is_none());
        let zero = ChipReference::parse("X,Y,Z,1,000000,1,2,3,4,5,6,7,8,9,10").unwrap();
        assert_eq!(zero.jedec, None);
    }

    #[test]
    fn prog_time_conversion() {
        assert_eq!(prog_ms_from_kbps(0.0), UNMEASURED_PROG_MS);
        assert_eq!(prog_ms_from_kbps(-5.0), UNMEASURED_PROG_MS);
        // 256 bytes at 250 KB/s = 1 ms
        assert!((prog_ms_from_kbps(250.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn measurement_scales_read_to_50mhz() {
        let values = AggregateValues {
            spi_hz: 12_000_000,
            erase_ms: 45.0,
            write_kbps: 250.0,
            readseq_kbps: 1228.8,
            verify_errors: 0,
            jedec: Some(JedecId::new(0xEF, 0x40, 0x16)),
        };
        let m = Measurement::from_aggregate(&values, 12_000_000, None);
        assert!((m.read50_mbps - 5.0).abs() < 1e-9);
        assert_eq!(m.jedec, Some((0xEF, 0x4016)));

        let live = Measurement::from_aggregate(&values, 12_000_000, Some(JedecId::new(0xC2, 0x20, 0x16)));
        assert_eq!(live.jedec, Some((0xC2, 0x2016)));

        let absent = Measurement::from_aggregate(&values, 12_000_000, Some(JedecId::new(0, 0, 0)));
        assert_eq!(absent.jedec, Some((0xEF, 0x4016)));
    }

    #[test]
    fn score_terms() {
        let w = IdentifyWeights::default();
        let r = ChipReference::parse(W25Q32).unwrap();
        let exact = measured(45.0, 0.7, 6.25, 0, None);
        assert!(r.score(&exact, &w).abs() < 1e-12);

        let matched = measured(45.0, 0.7, 6.25, 0, Some((0xEF, 0x4016)));
        assert!((r.score(&matched, &w) + 0.25).abs() < 1e-12);

        let other = measured(45.0, 0.7, 6.25, 0, Some((0xC2, 0x2016)));
        assert!((r.score(&other, &w) - 100.0).abs() < 1e-12);

        // 1.4 ms vs 0.7 typical: relative error 1.0
        let slow = measured(45.0, 1.4, 6.25, 0, None);
        assert!((r.score(&slow, &w) - 1.0).abs() < 1e-9);
        let unreliable = measured(45.0, 1.4, 6.25, 3, None);
        assert!((r.score(&unreliable, &w) - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_data_rows_are_not_measurements() {
        use platform::mocks::MemStorage;

        let storage = MemStorage::new();
        storage.insert(
            paths::AGGREGATES_PATH,
            "timestamp_ms,jedec_hex,spi_hz,avg_erase_ms,avg_write256_kBps,avg_readseq_kBps,avg_readrand_MBps,verify_errors\r\n\
             10,EF4016,12000000,45.000,250.000,1228.800,4.000,0\r\n\
             20,EF4016,12000000,0.000,0.000,0.000,0.000,0\r\n",
        );
        let values = load_measured(&storage, 12_000_000).await.unwrap().unwrap();
        assert_eq!(values.erase_ms, 45.0);

        storage.insert(
            paths::AGGREGATES_PATH,
            "timestamp_ms,jedec_hex,spi_hz,avg_erase_ms,avg_write256_kBps,avg_readseq_kBps,avg_readrand_MBps,verify_errors\r\n\
             20,EF4016,12000000,0.000,0.000,0.000,0.000,0\r\n",
        );
        assert!(load_measured(&storage, 12_000_000).await.unwrap().is_none());
    }

    #[test]
    fn top_matches_keep_earlier_on_ties() {
        let row = |name: &str| ChipReference::parse(&format!("{name},C,F,1,,1,2,3,4,5,6,7,8,9,10")).unwrap();
        let mut top = TopMatches::new();
        top.offer(row("a"), 2.0);
        top.offer(row("b"), 1.0);
        top.offer(row("c"), 2.0);
        top.offer(row("d"), 3.0);
        top.offer(row("e"), 0.5);
        let names: Vec<&str> = top.as_slice().iter().map(|(r, _)| r.model.as_str()).collect();
        assert_eq!(names, ["e", "b", "a"]);
        top.offer(row("f"), 9.0);
        assert_eq!(top.as_slice().len(), TOP_N);
        assert_eq!(top.best().unwrap().0.model.as_str(), "e");
    }
}
