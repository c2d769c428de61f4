use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use harvest_cli::commands;
use harvest_cli::commands::check::CheckArgs;
use harvest_cli::commands::validate::ValidateArgs;

/// Harvest Command Line Interface
///
/// Validates the backend configuration and checks that every backend pool
/// can be warmed and used.
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Log level or filter directive (e.g. `debug`, `harvest_pool=trace`)
    #[clap(long, global = true, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration file
    Validate(ValidateArgs),

    /// Warm every pool, check out one handle per label, then drain
    Check(CheckArgs),
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    // The default features also forward `log` records from the library crates
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match &cli.command {
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Check(args) => commands::check::execute(args),
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
