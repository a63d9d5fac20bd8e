//! xtask: Development tasks for carousel
//!
//! Run with: `cargo xtask <command>`

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for carousel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all workspace tests, fuzz harnesses included (test mode)
    Test,
    /// Run fuzz harnesses with bolero
    Fuzz {
        /// Harness to fuzz (e.g. "wheel"). Without one, runs all harnesses
        /// in quick test mode.
        target: Option<String>,
    },
    /// Run the two-process soak demo
    Soak {
        /// Waiting discipline: "spin" or "evented"
        #[arg(long, default_value = "evented")]
        mode: String,
        /// Messages to push through the wheel
        #[arg(long, default_value_t = 1_000_000)]
        count: u64,
    },
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // Find workspace root (where Cargo.toml with [workspace] lives)
    let workspace_root = std::env::var("CARGO_MANIFEST_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap())
        .parent()
        .unwrap()
        .to_path_buf();
    sh.change_dir(&workspace_root);

    match cli.command {
        Commands::Test => {
            println!("=== Running workspace tests ===");
            cmd!(sh, "cargo test --workspace").run()?;
            println!("\n=== All tests passed ===");
        }
        Commands::Fuzz { target } => {
            if let Some(t) = target {
                println!("=== Fuzzing harness: {t} ===");
                println!("Press Ctrl+C to stop.\n");

                if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                    eprintln!("cargo-bolero not found. Install with:");
                    eprintln!("  cargo install cargo-bolero");
                    return Err("cargo-bolero not installed".into());
                }

                cmd!(sh, "cargo bolero test -p carousel-fuzz {t}").run()?;
            } else {
                println!("=== Running fuzz harnesses in test mode ===");
                println!("(For real fuzzing, specify a harness: cargo xtask fuzz wheel)\n");
                cmd!(sh, "cargo test -p carousel-fuzz").run()?;
            }
        }
        Commands::Soak { mode, count } => {
            println!("=== Two-process soak ({mode}, {count} messages) ===");
            let count = count.to_string();
            cmd!(
                sh,
                "cargo run --release -p carousel-demo -- --mode {mode} --count {count}"
            )
            .run()?;
        }
        Commands::Clippy => {
            println!("=== Running clippy ===");
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            if fix {
                println!("=== Fixing formatting ===");
                cmd!(sh, "cargo fmt --all").run()?;
            } else {
                println!("=== Checking formatting ===");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
            }
        }
    }

    Ok(())
}
