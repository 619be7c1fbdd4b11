use clap::{Parser, Subcommand, ValueEnum};
use kestrel_kernel::memory::DEFAULT_HEAP_BYTES;
use kestrel_kernel::synchtest::{self, SynchParams, SynchReport};
use kestrel_kernel::{Context, Kernel, KernelConfig, KernelError, SchedPolicy};
use log::error;
use std::error::Error;
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Number of worker threads per test
    #[arg(long, global = true, default_value_t = 8)]
    threads: usize,

    /// Iterations per worker thread
    #[arg(long, global = true, default_value_t = 32)]
    iterations: usize,

    /// Order in which ready threads are picked
    #[arg(long, global = true, value_enum, default_value_t = Scheduler::Fifo)]
    scheduler: Scheduler,

    /// Seed for the random scheduler
    #[arg(long, global = true, default_value_t = 0)]
    seed: u64,

    /// Kernel heap size in bytes
    #[arg(long, global = true, default_value_t = DEFAULT_HEAP_BYTES)]
    heap: usize,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Semaphore test
    Sem,
    /// Lock test
    Lock,
    /// Condition variable test
    Cv,
    /// All of the above, in order
    All,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Scheduler {
    Fifo,
    Lifo,
    Random,
}

impl Cli {
    fn kernel_config(&self) -> KernelConfig {
        let scheduler = match self.scheduler {
            Scheduler::Fifo => SchedPolicy::Fifo,
            Scheduler::Lifo => SchedPolicy::Lifo,
            Scheduler::Random => SchedPolicy::Random { seed: self.seed },
        };
        KernelConfig {
            heap_bytes: self.heap,
            scheduler,
            ..KernelConfig::default()
        }
    }
}

fn run_tests(
    ctx: &Context,
    command: Commands,
    params: SynchParams,
) -> Result<Vec<SynchReport>, KernelError> {
    match command {
        Commands::Sem => Ok(vec![synchtest::semaphore_test(ctx, params)?]),
        Commands::Lock => Ok(vec![synchtest::lock_test(ctx, params)?]),
        Commands::Cv => Ok(vec![synchtest::cv_test(ctx, params)?]),
        Commands::All => synchtest::run_all(ctx, params),
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.kernel_config();
    let params = SynchParams {
        threads: cli.threads,
        iterations: cli.iterations,
    };
    let command = cli.command;

    println!(
        "Booting Kestrel with {} bytes of heap, {:?} scheduling...",
        config.heap_bytes, config.scheduler
    );
    let kernel = Kernel::boot(config);
    let reports = kernel.run(move |ctx| run_tests(ctx, command, params))??;

    for report in &reports {
        println!(
            "{:<10} ok  {} threads, {} operations",
            report.test, report.threads, report.operations
        );
    }
    println!(
        "Heap in use after tests: {} of {} bytes",
        kernel.heap().in_use(),
        kernel.heap().capacity()
    );

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("kestrel: {}", e);
            ExitCode::FAILURE
        }
    }
}
