use crate::bench::Control;
use crate::stores::registered;
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use log::{debug, error, warn};
use std::fs::read_to_string;
use std::sync::Arc;

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(short = 's')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the key-value store's TOML config file")]
    store_config: String,

    #[arg(short = 'b')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the benchmark's TOML config file")]
    benchmark_config: String,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a benchmark")]
    Bench(BenchArgs),
    #[command(about = "List all registered key-value stores")]
    List,
}

fn bench_cli(args: &BenchArgs) -> crate::Result<()> {
    let opt: String = read_to_string(&args.store_config)?
        + "\n"
        + &read_to_string(&args.benchmark_config)?;

    let (store, benchmark) = crate::bench::init(&opt)?;

    let control = Arc::new(Control::new());
    let c = control.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        debug!("SIGINT received, stopping all workers");
        c.fail();
    }) {
        warn!("Error setting Ctrl-C handler: {}", e);
    }

    store.bench(&benchmark, &control)?;
    Ok(())
}

fn list_cli() {
    for name in registered() {
        println!("Registered store: {}", name);
    }
}

/// The default command line interface.
///
/// This function is public and can be called in a different crate. For example, one can integrate
/// their own key-value stores by registering the constructor function. Then, adding this function
/// will produce a benchmark binary the has the same usage as the one in this crate.
///
/// ## Usage
///
/// To get the usage of the command line interface, users can run:
///
/// ```bash
/// ordbench -h
/// ```
///
/// The interface supports two modes, `bench` and `list`.
///
/// ### Benchmark Mode
///
/// Usage:
///
/// ```bash
/// ordbench bench -s <STORE_CONFIG> -b <BENCH_CONFIG>
/// ```
///
/// Where `STORE_CONFIG` and `BENCH_CONFIG` are the paths to the key-value store and benchmark
/// configuration files, respectively. They are concatenated and parsed as one document. For their
/// format, you can refer to the documentations of [`crate::stores`] and [`crate::bench`].
///
/// Ctrl-C stops all workers after their current operation. Results collected so far are still
/// written, and the process exits with a non-zero status.
///
/// ### List mode
///
/// Usage:
/// ``` bash
/// ordbench list
/// ```
///
/// This command lists all registered key-value stores' names.
pub fn cmdline() {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting ordbench with args: {:?}", cli);
    match cli.command {
        Commands::Bench(args) => {
            if let Err(e) = bench_cli(&args) {
                error!("{}", e);
                eprintln!("ordbench: {}", e);
                std::process::exit(1);
            }
        }
        Commands::List => list_cli(),
    }
}
