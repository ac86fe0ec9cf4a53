//! xtask emulate - run the desktop emulator
//!
//! Without `--watch` the emulator runs once in the foreground, reading keys
//! from the terminal (or from `--keys`). With `--watch` the key script is
//! re-run on every source change, which is the quick way to iterate on
//! report formatting: edit, save, read the new transcript.

use anyhow::{Context, Result};
use colored::Colorize;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use platform::config;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

/// Emulator command-line options forwarded by xtask.
pub struct Options {
    pub dir: PathBuf,
    pub chip: String,
    pub keys: Option<String>,
}

const WATCH_PATHS: &[&str] = &[
    "crates/firmware/src",
    "crates/firmware/Cargo.toml",
    "crates/flashbench/src",
    "crates/spi-nor/src",
    "crates/platform/src",
];

pub fn run(options: &Options, watch: bool) -> Result<()> {
    print_banner();
    if !watch {
        return run_emulator(options);
    }

    if let Err(e) = run_emulator(options) {
        eprintln!("{}", format!("Run failed: {}", e).red().bold());
    }

    let (tx, rx) = channel();
    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    && event.paths.iter().any(|p| {
                        p.extension()
                            .is_some_and(|ext| ext == "rs" || ext == "toml")
                    })
                {
                    let _ = tx.send(());
                }
            }
        },
        notify::Config::default(),
    )?;

    for path in WATCH_PATHS.iter().map(Path::new) {
        if path.exists() {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch path: {}", path.display()))?;
        }
    }

    println!();
    println!("{}", "Watching for changes".green().bold());
    println!("{}", "Save any .rs or .toml file to re-run the key script".dimmed());
    println!("{}", "Press Ctrl+C to stop".dimmed());

    while rx.recv().is_ok() {
        // Debounce - editors write several events per save
        std::thread::sleep(Duration::from_millis(300));
        while rx.try_recv().is_ok() {}

        clear_screen();
        print_banner();
        println!("{}", "Changes detected - re-running...".yellow().bold());
        println!();

        match run_emulator(options) {
            Ok(()) => {
                #[cfg(feature = "notifications")]
                {
                    let _ = notify_rust::Notification::new()
                        .summary(config::APP_NAME)
                        .body("Emulator run complete")
                        .timeout(2000)
                        .show();
                }
            }
            Err(e) => {
                eprintln!("{}", format!("Run failed: {}", e).red().bold());
                println!("{}", "Fix errors and save to trigger a re-run".dimmed());
            }
        }
    }

    Ok(())
}

fn run_emulator(options: &Options) -> Result<()> {
    let start = Instant::now();

    let mut cmd = Command::new("cargo");
    cmd.args(["run", "-p", "firmware", "--bin", "emulator", "--features", "emulator", "--"])
        .arg("--dir")
        .arg(&options.dir)
        .arg("--chip")
        .arg(&options.chip);
    if let Some(keys) = &options.keys {
        cmd.arg("--keys").arg(keys);
    }
    // Emulator diagnostics go to stderr; default to warnings only
    if std::env::var("RUST_LOG").is_err() {
        cmd.env("RUST_LOG", "warn");
    }

    let status = cmd.status().context("Failed to run cargo")?;
    if !status.success() {
        anyhow::bail!("emulator exited with {}", status);
    }

    println!();
    println!(
        "{}",
        format!("Completed in {:.1}s", start.elapsed().as_secs_f64()).green()
    );
    Ok(())
}

fn clear_screen() {
    // ANSI escape code to clear screen and move cursor to top-left
    print!("\x1B[2J\x1B[1;1H");
    io::stdout().flush().ok();
}

fn print_banner() {
    let banner_text = format!("     {} - Emulator       ", config::APP_NAME);
    println!("{}", "═════════════════════════════════════════════".cyan());
    println!("{}", banner_text.cyan().bold());
    println!("{}", "═════════════════════════════════════════════".cyan());
    println!();
}
