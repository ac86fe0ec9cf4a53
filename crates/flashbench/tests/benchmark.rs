//! End-to-end benchmark runs against the simulated chip and in-memory storage.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

use embedded_hal_mock::eh1::delay::NoopDelay;
use flashbench::actions::erase_sessions;
use flashbench::orchestrator::run_benchmark;
use flashbench::{BenchConfig, BenchStatus, Phase};
use platform::config::{AGGREGATES_PATH, SAMPLES_PATH};
use platform::mocks::MemStorage;
use platform::{BufferSink, SpiClock};
use spi_nor::sim::SimFlash;
use spi_nor::{JedecId, ScratchWindow, SpiNor};

const MHZ12: u32 = 12_000_000;
const MHZ24: u32 = 24_000_000;

fn four_sector_config(trials: u32) -> BenchConfig {
    let mut cfg = BenchConfig::default()
        .with_trials(trials)
        .with_window(ScratchWindow::new(0, 4 * 4096).unwrap())
        .with_clocks(&[MHZ12])
        .unwrap()
        .saving(true);
    cfg.read_seq_bytes = 16 * 1024;
    cfg.rand_iters = 3;
    cfg.breather_every = 0;
    cfg
}

fn rows(text: &str) -> Vec<Vec<String>> {
    text.split("\r\n")
        .skip(1)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.split(',').map(str::to_owned).collect())
        .collect()
}

#[tokio::test]
async fn four_sector_scenario_logs_every_operation() {
    let mut nor = SpiNor::new(SimFlash::w25q32(), NoopDelay);
    let storage = MemStorage::new();
    let status = BenchStatus::new();
    let mut sink = BufferSink::<8192>::new();
    let cfg = four_sector_config(4);

    status.begin(Phase::Setup);
    let report = run_benchmark(&mut nor, &storage, &cfg, &status, &mut sink)
        .await
        .unwrap();

    let text = storage.text(SAMPLES_PATH);
    assert!(text.starts_with("run,op,spi_hz,addr,bytes,duration_us,mbps,verify_errors,status1_end\r\n# SESSION_START "));
    let samples = rows(&text);
    let count = |op: &str| samples.iter().filter(|r| r[1] == op).count();
    assert_eq!(count("ERASE_4K"), 4);
    assert_eq!(count("PROG_256B"), 4);
    assert_eq!(count("READ_SEQ"), 4);
    assert_eq!(count("READ_RAND"), 4 * 3);
    assert_eq!(samples.len(), 24);

    let erased: Vec<&str> = samples
        .iter()
        .filter(|r| r[1] == "ERASE_4K")
        .map(|r| r[3].as_str())
        .collect();
    assert_eq!(erased, ["0x000000", "0x001000", "0x002000", "0x003000"]);
    for row in samples.iter().filter(|r| r[1] == "PROG_256B") {
        assert_eq!(row[2], "12000000");
        assert_eq!(row[4], "256");
        assert_eq!(row[7], "0");
    }

    let sim = nor.device();
    for sector in 0..4usize {
        let page = &sim.contents()[sector * 4096..sector * 4096 + 256];
        assert!(page.iter().enumerate().all(|(i, &b)| b == i as u8));
    }
    assert_eq!(sim.erases(), 4);

    let aggregates = rows(&storage.text(AGGREGATES_PATH));
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0][1], "EF4016");
    assert_eq!(aggregates[0][2], "12000000");
    assert_eq!(aggregates[0][7], "0");

    assert_eq!(report.clocks.len(), 1);
    assert_eq!(report.clocks[0].stats.trials, 4);
    assert_eq!(report.verify_errors(), 0);
    assert_eq!((report.samples_saved, report.aggregates_saved), (24, 1));
    assert_eq!(status.snapshot().percent, 100);

    let out = sink.as_str();
    assert!(out.contains("Detected: Winbond W25Q32FV (JEDEC EF 40 16)"));
    assert!(out.contains("# JEDEC=EF 40 16  SFDP=OK"));
    assert!(out.contains("=== Benchmark (avg over 4 runs) ==="));
    assert!(out.contains("--- Read 16KB (sequential) ---"));
    assert!(out.contains("Saved averages to BENCH.CSV"));
    assert!(!out.contains("ERROR: Verify failed"));
}

#[tokio::test]
async fn clocks_above_envelope_are_skipped() {
    let sim = SimFlash::new(1 << 20).with_jedec(JedecId::new(0xC2, 0x20, 0x14));
    let mut nor = SpiNor::new(sim, NoopDelay);
    let storage = MemStorage::new();
    let status = BenchStatus::new();
    let mut sink = BufferSink::<4096>::new();
    let cfg = four_sector_config(1)
        .with_clocks(&[MHZ12, MHZ24])
        .unwrap()
        .saving(false);

    let report = run_benchmark(&mut nor, &storage, &cfg, &status, &mut sink)
        .await
        .unwrap();

    assert_eq!(report.skipped.as_slice(), &[MHZ24]);
    assert_eq!(report.clocks.len(), 1);
    assert_eq!(report.prog_clock_hz, 8_000_000);
    assert_eq!(nor.device().frequency(), 8_000_000);
    let out = sink.as_str();
    assert!(out.contains("Unknown JEDEC: C2 20 14, using conservative limits."));
    assert!(out.contains("[SKIP] 24000000 Hz is above safe read clock (12000000 Hz) for this chip."));
    assert!(storage.contents(SAMPLES_PATH).is_none());
}

#[tokio::test]
async fn stuck_bit_shows_up_as_verify_errors() {
    let mut sim = SimFlash::w25q32();
    sim.set_stuck_bit(0x0001, 0);
    let mut nor = SpiNor::new(sim, NoopDelay);
    let storage = MemStorage::new();
    let status = BenchStatus::new();
    let mut sink = BufferSink::<8192>::new();

    let report = run_benchmark(&mut nor, &storage, &four_sector_config(4), &status, &mut sink)
        .await
        .unwrap();

    assert_eq!(report.verify_errors(), 1);
    let prog: Vec<_> = rows(&storage.text(SAMPLES_PATH))
        .into_iter()
        .filter(|r| r[1] == "PROG_256B")
        .map(|r| r[7].clone())
        .collect();
    assert_eq!(prog, ["1", "0", "0", "0"]);
    assert!(sink
        .as_str()
        .contains("ERROR: Verify failed - 1 mismatched byte(s) across 4 run(s)."));
}

#[tokio::test]
async fn unwritable_storage_degrades_to_summary_only() {
    let mut nor = SpiNor::new(SimFlash::w25q32(), NoopDelay);
    let storage = MemStorage::new();
    storage.fail_writes(true);
    let status = BenchStatus::new();
    let mut sink = BufferSink::<8192>::new();

    let report = run_benchmark(&mut nor, &storage, &four_sector_config(2), &status, &mut sink)
        .await
        .unwrap();

    assert_eq!((report.samples_saved, report.aggregates_saved), (0, 0));
    assert_eq!(report.clocks[0].stats.trials, 2);
    let out = sink.as_str();
    assert!(out.contains("WARNING: BENCH.CSV not opened"));
    assert!(out.contains("WARNING: RESULTS.CSV not opened"));
    assert!(out.contains("=== Benchmark (avg over 2 runs) ==="));
    assert!(!out.contains("Saved averages"));
}

#[tokio::test]
async fn zero_trial_run_saves_no_averages() {
    let mut nor = SpiNor::new(SimFlash::w25q32(), NoopDelay);
    let storage = MemStorage::new();
    let status = BenchStatus::new();
    let mut sink = BufferSink::<4096>::new();

    let report = run_benchmark(&mut nor, &storage, &four_sector_config(0), &status, &mut sink)
        .await
        .unwrap();

    assert_eq!(report.clocks[0].stats.trials, 0);
    assert_eq!(report.aggregates_saved, 0);
    assert!(rows(&storage.text(AGGREGATES_PATH)).is_empty());
    assert!(sink.as_str().contains("No trials run at 12000000 Hz; nothing to average."));
}

#[tokio::test]
async fn bus_error_aborts_without_logging() {
    let mut nor = SpiNor::new(SimFlash::w25q32(), NoopDelay);
    let storage = MemStorage::new();
    let status = BenchStatus::new();
    let mut sink = BufferSink::<4096>::new();
    let cfg = four_sector_config(2);

    nor.device_mut().set_bus_fault(true);
    let err = run_benchmark(&mut nor, &storage, &cfg, &status, &mut sink).await;
    assert!(matches!(err, Err(spi_nor::Error::Spi(_))));
    assert!(storage.contents(SAMPLES_PATH).is_none());
}

#[tokio::test]
async fn erase_last_session_removes_only_the_latest_run() {
    let mut nor = SpiNor::new(SimFlash::w25q32(), NoopDelay);
    let storage = MemStorage::new();
    let status = BenchStatus::new();
    let mut sink = BufferSink::<8192>::new();
    let cfg = four_sector_config(1);

    run_benchmark(&mut nor, &storage, &cfg, &status, &mut sink).await.unwrap();
    let first_samples = storage.contents(SAMPLES_PATH).unwrap();
    let first_aggregates = storage.contents(AGGREGATES_PATH).unwrap();

    run_benchmark(&mut nor, &storage, &cfg, &status, &mut sink).await.unwrap();
    assert!(storage.contents(SAMPLES_PATH).unwrap().len() > first_samples.len());

    // the second run's marker and rows go; the first run's marker stays
    let mut out = BufferSink::<512>::new();
    assert_eq!(erase_sessions(&storage, &mut out).await.unwrap(), 2);
    assert_eq!(storage.contents(SAMPLES_PATH).unwrap(), first_samples);
    assert_eq!(storage.contents(AGGREGATES_PATH).unwrap(), first_aggregates);
}

#[tokio::test]
async fn erase_last_session_rows_a_b_m_c_d_e() {
    let storage = MemStorage::new();
    storage.insert(SAMPLES_PATH, "run,op\r\nA\r\nB\r\n# SESSION_START 42\r\nC\r\nD\r\nE\r\n");
    let mut out = BufferSink::<512>::new();

    erase_sessions(&storage, &mut out).await.unwrap();
    assert_eq!(storage.text(SAMPLES_PATH), "run,op\r\nA\r\nB\r\n");
    assert!(out.as_str().contains("RESULTS.CSV: erased last session starting at byte 14."));
    assert!(out.as_str().contains("BENCH.CSV: no log file."));

    // a second erase finds no marker and changes nothing
    let mut out = BufferSink::<512>::new();
    erase_sessions(&storage, &mut out).await.unwrap();
    assert_eq!(storage.text(SAMPLES_PATH), "run,op\r\nA\r\nB\r\n");
    assert!(out.as_str().contains("no session marker found; nothing to erase."));
}
