use anyhow::{Context, Result};
use colored::Colorize;
use std::process::Command;
use std::time::Instant;

/// One `cargo` invocation and its label.
struct Step {
    label: &'static str,
    args: &'static [&'static str],
    /// Failure aborts the check run; otherwise it is only reported.
    required: bool,
}

const EMBEDDED_TARGET: &str = "thumbv7em-none-eabihf";

const STEPS: &[Step] = &[
    Step {
        label: "hardware target (STM32H7)",
        args: &["check", "-p", "firmware", "--target", EMBEDDED_TARGET, "--features", "hardware"],
        required: true,
    },
    Step {
        label: "emulator target (host)",
        args: &["check", "-p", "firmware", "--features", "emulator"],
        required: true,
    },
    // The core crates must stay no_std so the firmware can use them.
    Step {
        label: "platform (no_std)",
        args: &["check", "-p", "platform", "--target", EMBEDDED_TARGET, "--no-default-features"],
        required: true,
    },
    Step {
        label: "spi-nor (no_std)",
        args: &["check", "-p", "spi-nor", "--target", EMBEDDED_TARGET, "--no-default-features"],
        required: true,
    },
    Step {
        label: "flashbench (no_std)",
        args: &["check", "-p", "flashbench", "--target", EMBEDDED_TARGET, "--no-default-features"],
        required: true,
    },
    Step {
        label: "clippy lints",
        args: &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
        required: false,
    },
    Step {
        label: "code formatting",
        args: &["fmt", "--all", "--check"],
        required: false,
    },
];

pub fn run() -> Result<()> {
    println!();
    println!("{}", "🔍 Checking firmware builds...".cyan().bold());
    println!();

    let total_start = Instant::now();

    for step in STEPS {
        println!("{}", format!("  Checking {}...", step.label).cyan());
        let start = Instant::now();

        let output = Command::new("cargo")
            .args(step.args)
            .output()
            .with_context(|| format!("Failed to run cargo for {}", step.label))?;

        if output.status.success() {
            println!(
                "{}",
                format!("  ✓ {} passed in {:.2}s", step.label, start.elapsed().as_secs_f64()).green()
            );
        } else if step.required {
            eprintln!("{}", format!("  ✗ {} failed", step.label).red().bold());
            eprintln!();
            eprintln!("{}", String::from_utf8_lossy(&output.stderr));
            anyhow::bail!("{} failed", step.label);
        } else {
            // Don't fail on lint or format findings, just show them
            eprintln!("{}", format!("  ⚠ {} reported issues", step.label).yellow().bold());
            eprintln!();
            eprintln!("{}", String::from_utf8_lossy(&output.stderr));
        }
        println!();
    }

    println!(
        "{}",
        format!(
            "✓ All checks completed in {:.2}s",
            total_start.elapsed().as_secs_f64()
        )
        .green()
        .bold()
    );
    println!();

    Ok(())
}
