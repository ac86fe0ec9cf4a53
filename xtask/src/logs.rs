//! Host-side tools for logs copied off the card
//!
//! These run the same code the firmware runs, against a directory instead
//! of the microSD card, so a card pulled from the bench can be scored or
//! cleaned on a PC.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use embassy_futures::block_on;
use flashbench::actions::{erase_sessions, read_results};
use flashbench::identify;
use flashbench::IdentifyWeights;
use platform::config;
use platform::storage_local::LocalFileStorage;
use platform::TextSink;

/// Transcript straight to stdout.
struct Stdout;

impl TextSink for Stdout {
    fn write_text(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        out.write_all(text.as_bytes()).ok();
        out.flush().ok();
    }
}

fn open(dir: &Path) -> Result<LocalFileStorage> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    Ok(LocalFileStorage::new(dir))
}

pub fn identify(dir: &Path) -> Result<()> {
    let storage = open(dir)?;
    println!();
    println!(
        "{}",
        format!("🔎 Identifying chip from {}", dir.join(config::AGGREGATES_PATH).display())
            .cyan()
            .bold()
    );
    println!();

    let found = block_on(identify::identify(
        &storage,
        None,
        &IdentifyWeights::default(),
        &mut Stdout,
    ))
    .map_err(|e| anyhow::anyhow!("{e}"))
    .context("identification failed")?;

    println!();
    match found.as_ref().and_then(|r| r.matches.best()) {
        Some((best, _)) => println!("{}", format!("✓ Best match: {}", best.model.as_str()).green()),
        None => println!("{}", "⚠ No match".yellow()),
    }
    Ok(())
}

pub fn erase_session(dir: &Path) -> Result<()> {
    let storage = open(dir)?;
    println!();
    let erased = block_on(erase_sessions(&storage, &mut Stdout))
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("erase failed")?;
    println!();
    if erased == 0 {
        println!("{}", "⚠ Nothing erased".yellow());
    } else {
        println!("{}", format!("✓ Erased the last session from {erased} log(s)").green());
    }
    Ok(())
}

pub fn results(dir: &Path) -> Result<()> {
    let storage = open(dir)?;
    let found = block_on(read_results(&storage, config::SAMPLES_PATH, &mut Stdout))
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("read failed")?;
    if !found {
        bail!("{} not found in {}", config::SAMPLES_PATH, dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_session_cuts_the_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let samples = dir.path().join(config::SAMPLES_PATH);
        std::fs::write(&samples, "run,op\r\n# SESSION_START 1\r\nA\r\n# SESSION_START 2\r\nB\r\n").unwrap();

        erase_session(dir.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&samples).unwrap(),
            "run,op\r\n# SESSION_START 1\r\nA\r\n"
        );
    }

    #[test]
    fn identify_without_averages_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        identify(dir.path()).unwrap();
    }

    #[test]
    fn missing_results_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(results(dir.path()).is_err());
        assert!(results(&dir.path().join("nope")).is_err());
    }
}
