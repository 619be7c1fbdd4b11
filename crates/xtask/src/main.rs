use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Kestrel build and test tasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Formatting check, clippy and the full test suite
    Ci,
    /// Run every synchronization self-test under each scheduler policy
    Synchtest {
        /// Worker threads per test
        #[arg(long, default_value_t = 8)]
        threads: usize,

        /// Seed for the random scheduler run
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// Clean build artifacts
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let project_root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .ok_or_else(|| anyhow!("xtask is not inside the workspace"))?;
    sh.change_dir(project_root);

    match cli.command {
        Commands::Ci => {
            cmd!(sh, "cargo fmt --all -- --check").run()?;
            cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
            cmd!(sh, "cargo test --workspace").run()?;
        }
        Commands::Synchtest { threads, seed } => {
            cmd!(sh, "cargo build -p kestrel-cli --release").run()?;
            let threads = threads.to_string();
            let seed = seed.to_string();
            for scheduler in ["fifo", "lifo", "random"] {
                println!("Running synchtest with {} scheduling...", scheduler);
                cmd!(
                    sh,
                    "cargo run -q -p kestrel-cli --release -- all --threads {threads} --scheduler {scheduler} --seed {seed}"
                )
                .run()?;
            }
        }
        Commands::Clean => {
            cmd!(sh, "cargo clean").run()?;
        }
    }

    Ok(())
}
