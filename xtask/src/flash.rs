use anyhow::{Context, Result};
use colored::Colorize;
use std::process::Command;
use std::time::Instant;

const TARGET: &str = "thumbv7em-none-eabihf";
const CHIP: &str = "STM32H743ZITx";

fn binary_path(release: bool) -> String {
    let profile = if release { "release" } else { "debug" };
    format!("target/{TARGET}/{profile}/firmware")
}

pub fn run(release: bool) -> Result<()> {
    let mode = if release { "release" } else { "debug" };

    println!();
    println!(
        "{}",
        format!("🔨 Building firmware ({} mode)...", mode)
            .cyan()
            .bold()
    );
    println!();

    let build_start = Instant::now();
    let mut build_cmd = Command::new("cargo");
    build_cmd.args(["build", "-p", "firmware", "--bin", "firmware", "--target", TARGET, "--features", "hardware"]);
    if release {
        build_cmd.arg("--release");
    }
    // DEFMT_LOG comes from .cargo/config.toml unless the caller overrides it
    let build_output = build_cmd.output().context("Failed to run cargo build")?;

    if !build_output.status.success() {
        eprintln!("{}", "✗ Build failed".red().bold());
        eprintln!();
        eprintln!("{}", String::from_utf8_lossy(&build_output.stderr));
        anyhow::bail!("Build failed");
    }
    println!(
        "{}",
        format!("✓ Build successful in {:.2}s", build_start.elapsed().as_secs_f64()).green()
    );
    println!();

    show_binary_size(release);
    println!();

    println!("{}", format!("📡 Flashing to {CHIP}...").cyan().bold());
    println!("   {}", "Connecting to probe...".dimmed());

    let flash_start = Instant::now();
    let flash_output = Command::new("probe-rs")
        .args(["download", "--chip", CHIP])
        .arg(binary_path(release))
        .output()
        .context("Failed to run probe-rs. Is probe-rs installed? (cargo install probe-rs-tools)")?;

    if !flash_output.status.success() {
        eprintln!("{}", "✗ Flash failed".red().bold());
        eprintln!();
        eprintln!("{}", String::from_utf8_lossy(&flash_output.stderr));
        anyhow::bail!("Flash failed - check that the probe is connected and the board is powered");
    }

    // Reset so the new image starts without a power cycle
    let reset = Command::new("probe-rs")
        .args(["reset", "--chip", CHIP])
        .status()
        .context("Failed to reset target")?;
    if !reset.success() {
        eprintln!("{}", "⚠ Reset failed; press the reset button".yellow());
    }

    println!(
        "{}",
        format!("✓ Flash successful in {:.2}s", flash_start.elapsed().as_secs_f64()).green()
    );
    println!();
    println!("{}", "⚡ Flash Bench is running on hardware!".bold());
    println!(
        "   {}",
        format!("Use 'probe-rs attach --chip {CHIP} {}' to view RTT logs", binary_path(release)).dimmed()
    );
    println!(
        "   {}",
        "Open the ST-LINK virtual COM port at 115200 baud for the menu".dimmed()
    );
    println!();

    Ok(())
}

/// Section sizes via cargo-binutils; silently skipped when it is missing.
fn show_binary_size(release: bool) {
    let mut cmd = Command::new("cargo");
    cmd.args(["size", "-p", "firmware", "--bin", "firmware", "--target", TARGET, "--features", "hardware"]);
    if release {
        cmd.arg("--release");
    }
    cmd.args(["--", "-A"]);

    match cmd.output() {
        Ok(out) if out.status.success() => {
            println!("{}", "📊 Binary size:".cyan());
            for line in String::from_utf8_lossy(&out.stdout).lines().skip(1) {
                println!("   {}", line.dimmed());
            }
        }
        _ => println!("   {}", "cargo size unavailable (cargo install cargo-binutils)".dimmed()),
    }
}
