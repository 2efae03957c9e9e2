use clap::Parser;
use tracing_subscriber::EnvFilter;

use starmeasure::cli::{Cli, Commands};
use starmeasure::commands::{coadd_psf, measure_synthetic};
use starmeasure::registry::Registries;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Registrations complete before any lookup
    if Registries::install(Registries::with_builtins()).is_err() {
        tracing::warn!("Registries were already initialized");
    }

    match cli.command {
        Commands::MeasureSynthetic {
            stars,
            size,
            seed,
            pixel_type,
            pool,
        } => {
            measure_synthetic(stars, size, seed, &pixel_type, pool)?;
        }
        Commands::CoaddPsf {
            exposures,
            sigma,
            x,
            y,
            weighted,
            output,
        } => {
            coadd_psf(exposures, sigma, x, y, weighted, output)?;
        }
    }

    Ok(())
}
