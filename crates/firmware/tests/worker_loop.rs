//! The worker loop driven through a command channel, as the console task does.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embedded_hal_mock::eh1::delay::NoopDelay;
use firmware::console::{parse_line, Command};
use firmware::worker::{self, CommandChannel};
use flashbench::{BenchStatus, Phase, TransferBuffers, Workbench};
use platform::mocks::MemStorage;
use platform::{BufferSink, Removable};
use spi_nor::sim::SimFlash;
use spi_nor::SpiNor;

fn queue(channel: &Channel<CriticalSectionRawMutex, Command, 8>, keys: &str) {
    for command in parse_line(keys) {
        channel.try_send(command).unwrap();
    }
}

#[tokio::test]
async fn connection_test_then_quit() {
    let channel = Channel::<CriticalSectionRawMutex, Command, 8>::new();
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let mut bench = Workbench::new(
        SpiNor::new(SimFlash::w25q32(), NoopDelay),
        MemStorage::new(),
        &status,
        &mut buffers,
    );
    let mut console = BufferSink::<8192>::new();

    queue(&channel, "2\r\nx\r\nq\r\n");
    worker::serve(&mut bench, channel.receiver(), &status, &mut console).await;

    let out = console.as_str();
    assert!(out.starts_with("\r\n\r\n=== Flash Bench ==="));
    assert!(out.contains("JEDEC ID: EF 40 16"));
    assert!(out.contains("=== Done ==="));
    assert!(out.contains("Unknown choice. Try again."));
    assert!(out.ends_with("Exiting menu. Reset board to reopen.\r\n"));
    assert_eq!(status.snapshot().phase, Phase::Done);
}

#[tokio::test]
async fn reset_returns_to_idle() {
    let channel = Channel::<CriticalSectionRawMutex, Command, 8>::new();
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let mut bench = Workbench::new(
        SpiNor::new(SimFlash::w25q32(), NoopDelay),
        MemStorage::new(),
        &status,
        &mut buffers,
    );
    let mut console = BufferSink::<8192>::new();

    queue(&channel, "s r q");
    worker::serve(&mut bench, channel.receiver(), &status, &mut console).await;

    assert!(console.as_str().contains("=== System Status ==="));
    assert!(console.as_str().contains("Status reset."));
    let snap = status.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    status.with_transcript(|t| assert!(t.is_empty()));
}

#[tokio::test]
async fn missing_card_still_runs_the_benchmark() {
    let channel = Channel::<CriticalSectionRawMutex, Command, 8>::new();
    let status = BenchStatus::new();
    let mut buffers = TransferBuffers::new();
    let storage: Removable<MemStorage> = Removable::empty();
    let mut bench = Workbench::new(SpiNor::new(SimFlash::w25q32(), NoopDelay), storage, &status, &mut buffers);
    bench.config = bench
        .config
        .clone()
        .with_window(spi_nor::ScratchWindow::new(0, 2 * 4096).unwrap());
    bench.config.read_seq_bytes = 4096;
    bench.config.rand_iters = 1;
    let mut console = BufferSink::<16384>::new();

    queue(&channel, "5 s q");
    worker::serve(&mut bench, channel.receiver(), &status, &mut console).await;

    let out = console.as_str();
    assert!(out.contains("=== Quick Benchmark Complete ==="));
    assert!(out.contains("SD Card: Not Connected"));
    assert!(out.contains("  RESULTS.CSV: absent"));
}

#[test]
fn full_queue_drops_keys() {
    let channel = CommandChannel::new();
    for _ in 0..worker::COMMAND_DEPTH {
        assert!(worker::try_send_command(&channel, Command::Menu));
    }
    assert!(!worker::try_send_command(&channel, Command::Menu));
}
