use anyhow::{Context, Result};
use colored::Colorize;
use std::process::Command;
use std::time::Instant;

/// Host-buildable crates and the features that document their std backends.
const DOC_CRATES: &[(&str, &str)] = &[
    ("platform", "std"),
    ("spi-nor", "sim"),
    ("flashbench", "std"),
    ("firmware", ""),
];

pub fn run(open: bool) -> Result<()> {
    println!();
    println!("{}", "📚 Building documentation...".cyan().bold());
    println!();

    let start = Instant::now();

    let mut cmd = Command::new("cargo");
    cmd.args(["doc", "--no-deps", "--document-private-items"]);
    for (krate, features) in DOC_CRATES {
        cmd.args(["-p", krate]);
        if !features.is_empty() {
            cmd.args(["--features", &format!("{krate}/{features}")]);
        }
    }
    if open {
        cmd.arg("--open");
    }

    let output = cmd.output().context("Failed to build documentation")?;

    if !output.status.success() {
        eprintln!("{}", "✗ Documentation build failed".red().bold());
        eprintln!();
        eprintln!("{}", String::from_utf8_lossy(&output.stderr));
        anyhow::bail!("Documentation build failed");
    }

    println!(
        "{}",
        format!("✓ Documentation built in {:.2}s", start.elapsed().as_secs_f64()).green()
    );

    if !open {
        println!();
        println!(
            "   {}",
            "Open target/doc/flashbench/index.html in your browser".dimmed()
        );
        println!("   {}", "Or run 'cargo xtask doc --open'".dimmed());
    }

    println!();

    Ok(())
}
