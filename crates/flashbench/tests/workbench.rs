//! Actions driven through the workbench: backup/restore and identification.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation
)]

use embedded_hal_mock::eh1::delay::NoopDelay;
use flashbench::{Action, ActionError, BackupError, BenchConfig, BenchStatus, Phase, TransferBuffers, Workbench};
use platform::config::{BACKUP_PATH, CATALOG_PATH};
use platform::mocks::MemStorage;
use platform::BufferSink;
use proptest::prelude::*;
use spi_nor::sim::SimFlash;
use spi_nor::{ScratchWindow, SpiNor};

const IMAGE: u32 = 0x1_0000;

const CATALOG: &str = "\
Model,Company,Family,Mbit,JEDEC,e4k_typ,e4k_max,e32k_typ,e32k_max,e64k_typ,e64k_max,max_mhz,prog_typ,prog_max,read50\r\n\
# comment rows are skipped\r\n\
MX25L3233F,Macronix,MX25L,32,C2 20 16,40,200,150,1000,250,2000,133,0.5,3,6.25\r\n\
W25Q32FV,Winbond,SpiFlash,32,EF 40 16,45,400,120,1600,150,2000,104,0.7,3,6.25,2.7-3.6V,100000\r\n\
SST26VF016B,Microchip,SST26,16,BF2641,18,25,18,25,18,25,104,1.0,1.5,6.0\r\n";

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn small_config() -> BenchConfig {
    let mut cfg = BenchConfig::default()
        .with_window(ScratchWindow::new(0, 4 * 4096).unwrap())
        .with_clocks(&[12_000_000, 24_000_000])
        .unwrap();
    cfg.read_seq_bytes = 8 * 1024;
    cfg.rand_iters = 2;
    cfg.breather_every = 0;
    cfg
}

#[tokio::test]
async fn backup_then_restore_onto_a_blank_chip() {
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let data = pattern(IMAGE as usize, 7);

    let mut sim = SimFlash::w25q32();
    sim.load(0, &data);
    let mut bench = Workbench::new(SpiNor::new(sim, NoopDelay), MemStorage::new(), &status, &mut buffers);
    bench.image_bytes = Some(IMAGE);
    let mut console = BufferSink::<4096>::new();
    assert!(bench.run(Action::Backup, &mut console).await.unwrap());
    assert!(console.as_str().contains("Backing up 65536 bytes to BACKUP.BIN ..."));
    assert!(console.as_str().contains("Backup complete."));
    let (_, storage) = bench.into_parts();
    assert_eq!(storage.contents(BACKUP_PATH).unwrap(), data);

    let mut bench = Workbench::new(SpiNor::new(SimFlash::w25q32(), NoopDelay), storage, &status, &mut buffers);
    bench.image_bytes = Some(IMAGE);
    let mut console = BufferSink::<4096>::new();
    assert!(bench.run(Action::Restore { verify: true }, &mut console).await.unwrap());
    assert!(console.as_str().contains("RESTORE: BACKUP.BIN size=65536 bytes"));
    assert!(console.as_str().contains("RESTORE: done (verified)."));
    assert_eq!(&bench.nor().device().contents()[..IMAGE as usize], &data[..]);
    assert_eq!(status.snapshot().phase, Phase::Done);
}

#[tokio::test]
async fn restore_reports_the_first_bad_byte() {
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let storage = MemStorage::new();
    storage.insert(BACKUP_PATH, vec![0xA5u8; 0x3000]);

    let mut sim = SimFlash::w25q32();
    sim.set_stuck_bit(0x1234, 0);
    let mut bench = Workbench::new(SpiNor::new(sim, NoopDelay), storage, &status, &mut buffers);
    bench.image_bytes = Some(IMAGE);
    let mut console = BufferSink::<4096>::new();

    let err = bench
        .run(Action::Restore { verify: true }, &mut console)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ActionError::Transfer(BackupError::VerifyFailed { addr: 0x1234 })
    );
    assert!(console.as_str().contains("RESTORE: VERIFY FAILED at 0x001234"));
    assert_eq!(status.snapshot().phase, Phase::Failed);
    status.with_transcript(|t| assert!(t.contains("VERIFY FAILED")));
}

#[tokio::test]
async fn restore_without_image_fails_cleanly() {
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let mut bench = Workbench::new(
        SpiNor::new(SimFlash::w25q32(), NoopDelay),
        MemStorage::new(),
        &status,
        &mut buffers,
    );
    let mut console = BufferSink::<1024>::new();
    let err = bench.run(Action::Restore { verify: false }, &mut console).await;
    assert!(matches!(err, Err(ActionError::Transfer(BackupError::Storage { offset: 0, .. }))));
    assert!(console.as_str().contains("RESTORE: file not found: BACKUP.BIN"));
    assert_eq!(bench.nor().device().erases(), 0);
}

#[tokio::test]
async fn saved_benchmark_identifies_the_chip() {
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let storage = MemStorage::new();
    storage.insert(CATALOG_PATH, CATALOG);
    let mut bench = Workbench::new(SpiNor::new(SimFlash::w25q32(), NoopDelay), storage, &status, &mut buffers);
    bench.config = small_config();

    let mut console = BufferSink::<8192>::new();
    let saved = Action::RunBenchmark { trials: 2, save: true };
    assert!(bench.run(saved, &mut console).await.unwrap());
    assert!(console.as_str().contains("=== Benchmark Complete ==="));

    let mut console = BufferSink::<2048>::new();
    assert!(bench.run(Action::Identify, &mut console).await.unwrap());
    let out = console.as_str();
    assert!(out.contains("=== Chip Identification (12 MHz) ==="));
    assert!(out.contains("Reference rows accepted: 3"));
    assert!(out.contains("1) W25Q32FV  [Winbond, SpiFlash]  JEDEC=EF 40 16  score="));
    assert!(out.contains("(Lower score = closer match)"));
    let first = out.find("1) ").unwrap();
    assert!(out[first..].find("W25Q32FV").unwrap() < out[first..].find("MX25L3233F").unwrap());
}

#[tokio::test]
async fn identify_uses_the_logged_jedec_when_the_chip_is_silent() {
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let storage = MemStorage::new();
    storage.insert(CATALOG_PATH, CATALOG);
    let mut bench = Workbench::new(SpiNor::new(SimFlash::w25q32(), NoopDelay), storage, &status, &mut buffers);
    bench.config = small_config();

    let mut console = BufferSink::<8192>::new();
    let saved = Action::RunBenchmark { trials: 2, save: true };
    assert!(bench.run(saved, &mut console).await.unwrap());

    bench.nor_mut().device_mut().set_bus_fault(true);
    let mut console = BufferSink::<2048>::new();
    assert!(bench.run(Action::Identify, &mut console).await.unwrap());
    let out = console.as_str();
    assert!(!out.contains("ERROR"));
    assert!(out.contains("1) W25Q32FV  [Winbond, SpiFlash]  JEDEC=EF 40 16  score="));
}

#[tokio::test]
async fn default_sweep_transcript_fits() {
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let mut bench = Workbench::new(
        SpiNor::new(SimFlash::w25q32(), NoopDelay),
        MemStorage::new(),
        &status,
        &mut buffers,
    );
    // default clocks, window and trial count; shorter reads keep the run quick
    bench.config.read_seq_bytes = 16 * 1024;
    bench.config.breather_every = 0;

    let mut console = BufferSink::<16384>::new();
    let full = Action::RunBenchmark { trials: 100, save: true };
    assert!(bench.run(full, &mut console).await.unwrap());
    assert!(!console.truncated());
    assert_eq!(console.as_str().matches("=== Benchmark (avg over 100 runs) ===").count(), 3);
    assert!(!status.transcript_truncated());
    status.with_transcript(|t| assert_eq!(t, console.as_str()));
}

#[tokio::test]
async fn quick_benchmark_saves_nothing() {
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let mut bench = Workbench::new(
        SpiNor::new(SimFlash::w25q32(), NoopDelay),
        MemStorage::new(),
        &status,
        &mut buffers,
    );
    bench.config = small_config();
    let mut console = BufferSink::<8192>::new();
    assert!(bench.run(Action::QuickBenchmark, &mut console).await.unwrap());
    let out = console.as_str();
    assert_eq!(out.matches("=== Benchmark (avg over 2 runs) ===").count(), 2);
    assert!(bench.storage().contents("RESULTS.CSV").is_none());
    assert!(bench.storage().contents("BENCH.CSV").is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever is on the chip comes back after backup and restore.
    #[test]
    fn backup_restore_round_trip(
        sectors in 1u32..4,
        tail in 0u32..4096,
        seed in any::<u8>(),
    ) {
        let len = (sectors - 1) * 4096 + tail.max(1);
        let data = pattern(len as usize, seed);
        let status = BenchStatus::new();
        let mut buffers = TransferBuffers::new();

        let mut sim = SimFlash::new(IMAGE as usize);
        sim.load(0, &data);
        let storage = MemStorage::new();
        let mut bench = Workbench::new(SpiNor::new(sim, NoopDelay), storage, &status, &mut buffers);
        bench.image_bytes = Some(len);
        let mut console = BufferSink::<1024>::new();
        let ok = embassy_futures::block_on(bench.run(Action::Backup, &mut console)).unwrap();
        prop_assert!(ok);
        let (_, storage) = bench.into_parts();

        let mut bench = Workbench::new(SpiNor::new(SimFlash::new(IMAGE as usize), NoopDelay), storage, &status, &mut buffers);
        bench.image_bytes = Some(IMAGE);
        let ok = embassy_futures::block_on(bench.run(Action::Restore { verify: true }, &mut console)).unwrap();
        prop_assert!(ok);
        let chip = bench.nor().device().contents();
        prop_assert_eq!(&chip[..len as usize], &data[..]);
        prop_assert!(chip[len as usize..].iter().all(|&b| b == 0xFF));
    }
}
