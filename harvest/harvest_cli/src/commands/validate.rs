//! Configuration validation

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::config::HarvestConfig;

/// Arguments for the validate command
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the configuration file
    #[clap(long, short)]
    pub config: PathBuf,
}

/// Parse and validate the configuration, then print a summary of its backends
pub fn execute(args: &ValidateArgs) -> Result<()> {
    let config = HarvestConfig::load(&args.config)?;
    let backends = config.backends();
    info!("Configuration {} is valid", args.config.display());

    println!("Configuration OK: {} backend(s)", backends.len());
    for (kind, name, pool_size) in backends {
        println!("  {:<12} {:<20} pool_size={}", kind, name, pool_size);
    }
    Ok(())
}
