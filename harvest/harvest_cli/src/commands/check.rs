//! Backend connectivity check

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use harvest_pool::PoolStatus;
use tracing::{error, info};

use crate::config::HarvestConfig;
use crate::context::{AppContext, ManagedBackend};

/// Arguments for the check command
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the configuration file
    #[clap(long, short)]
    pub config: PathBuf,

    /// Only check the backend with this name
    #[clap(long, short)]
    pub backend: Option<String>,
}

fn status_line(status: &PoolStatus) -> String {
    format!(
        "resident={} checked_out={} created={} failures={}",
        status.resident, status.checked_out, status.counters.created, status.counters.factory_failures
    )
}

fn check_backend(backend: &dyn ManagedBackend) -> Result<()> {
    let name = backend.pool().name().to_string();

    let created = backend.warm()?;
    info!(
        "Backend '{}' warmed with {} handle(s) across {} label(s)",
        name,
        created,
        backend.labels().len().max(1)
    );

    let exercised = backend.exercise()?;
    info!("Backend '{}': checked out {} label(s)", name, exercised);
    Ok(())
}

/// Warm every selected pool, check out one handle per label, then drain
pub fn execute(args: &CheckArgs) -> Result<()> {
    let config = HarvestConfig::load(&args.config)?;
    let context = AppContext::build(&config, args.backend.as_deref())?;

    let mut failed = 0;
    for backend in context.backends() {
        let name = backend.pool().name().to_string();
        match check_backend(backend.as_ref()) {
            Ok(()) => {
                println!(
                    "OK     {} {}: {}",
                    backend.kind(),
                    name,
                    status_line(&backend.pool().status())
                );
            }
            Err(e) => {
                failed += 1;
                error!("Backend '{}' failed: {:#}", name, e);
                println!("FAILED {} {}: {:#}", backend.kind(), name, e);
            }
        }
    }

    let closed = context.drain_all();
    info!("Closed {} handle(s)", closed);

    if failed > 0 {
        bail!("{} of {} backend(s) failed", failed, context.backends().len());
    }
    println!("All {} backend(s) reachable", context.backends().len());
    Ok(())
}
