//! Flash worker loop
//!
//! The console task turns keys into [`Command`]s and pushes them into
//! [`COMMANDS`]; the worker owns the [`Workbench`] and runs them one at a
//! time. A reset request on [`STATUS`] is honoured between actions.
//!
//! # Overflow handling
//!
//! [`try_send_command`] never blocks the console. Keys typed while the
//! queue is full are dropped with a warning, so holding a key down during a
//! long benchmark does not queue a hundred more.

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, TrySendError};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;
use flashbench::actions::write_menu;
use flashbench::{BenchStatus, Workbench};
use platform::{sink_line, SpiClock, Storage, TextSink};

use crate::console::Command;

/// Depth of the command queue.
pub const COMMAND_DEPTH: usize = 4;

/// Command queue type shared by the console and the worker.
pub type CommandChannel = Channel<CriticalSectionRawMutex, Command, COMMAND_DEPTH>;

/// Commands from the console task to the worker.
pub static COMMANDS: CommandChannel = Channel::new();

/// Advisory state of the running action, readable from any task.
pub static STATUS: BenchStatus = BenchStatus::new();

/// Queue `command` without waiting.
///
/// Returns `false` when the queue was full and the command was dropped.
pub fn try_send_command(channel: &CommandChannel, command: Command) -> bool {
    match channel.try_send(command) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            #[cfg(feature = "defmt")]
            defmt::warn!("command queue full, dropping {}", command);
            #[cfg(feature = "emulator")]
            tracing::warn!("command queue full, dropping key");
            false
        }
    }
}

/// Run one command. Returns `false` for [`Command::Quit`].
pub async fn handle<SPI, D, S, T>(
    bench: &mut Workbench<'_, SPI, D, S>,
    status: &BenchStatus,
    command: Command,
    console: &mut T,
) -> bool
where
    SPI: SpiDevice + SpiClock,
    D: DelayNs,
    S: Storage,
    T: TextSink,
{
    match command {
        Command::Run(action) => {
            sink_line!(console);
            // the transcript already carries the failure line
            let _ = bench.run(action, console).await;
            write_menu(console);
        }
        Command::Menu => write_menu(console),
        Command::Reset => {
            status.reset();
            sink_line!(console, "Status reset.");
            console.write_text("> ");
        }
        Command::Quit => {
            sink_line!(console, "Exiting menu. Reset board to reopen.");
            return false;
        }
        Command::Unknown(_) => {
            sink_line!(console, "Unknown choice. Try again.");
            console.write_text("> ");
        }
    }
    true
}

/// Serve commands until [`Command::Quit`].
///
/// `status` must be the same [`BenchStatus`] the workbench reports into.
pub async fn serve<SPI, D, S, T, const N: usize>(
    bench: &mut Workbench<'_, SPI, D, S>,
    commands: Receiver<'_, CriticalSectionRawMutex, Command, N>,
    status: &BenchStatus,
    console: &mut T,
) where
    SPI: SpiDevice + SpiClock,
    D: DelayNs,
    S: Storage,
    T: TextSink,
{
    write_menu(console);
    loop {
        match select(commands.receive(), status.wait_reset()).await {
            Either::First(command) => {
                if !handle(bench, status, command, console).await {
                    return;
                }
            }
            Either::Second(()) => {
                status.reset();
                #[cfg(feature = "defmt")]
                defmt::info!("worker reset to idle");
            }
        }
    }
}
