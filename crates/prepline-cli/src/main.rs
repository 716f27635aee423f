//! Prepline CLI - manifest-driven dataset preparation

mod logging;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use prepline::{LoaderRegistry, PrepService};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "prepline")]
#[command(about = "Manifest-driven dataset preparation", long_about = None)]
struct Cli {
    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a manifest and execute its pipeline
    Run {
        /// Manifest file (YAML or JSON)
        manifest: PathBuf,
        /// Override the manifest's simulated flag
        #[arg(long)]
        simulated: Option<bool>,
    },

    /// Resolve a manifest and dry-run it in simulated mode
    Validate {
        /// Manifest file (YAML or JSON)
        manifest: PathBuf,
    },

    /// Print the pre-execution schema of one source
    Columns {
        /// Manifest file (YAML or JSON)
        manifest: PathBuf,
        /// Source name declared in the manifest
        source: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "info" });

    let registry = LoaderRegistry::with_builtins();

    match cli.command {
        Commands::Run {
            manifest,
            simulated,
        } => cmd_run(&registry, &manifest, simulated),
        Commands::Validate { manifest } => cmd_validate(&registry, &manifest),
        Commands::Columns { manifest, source } => cmd_columns(&registry, &manifest, &source),
    }
}

fn load_service(registry: &LoaderRegistry, manifest: &PathBuf) -> Result<PrepService> {
    PrepService::from_path(manifest, registry)
        .with_context(|| format!("failed to load manifest {}", manifest.display()))
}

fn cmd_run(registry: &LoaderRegistry, manifest: &PathBuf, simulated: Option<bool>) -> Result<()> {
    let mut service = load_service(registry, manifest)?;
    if let Some(simulated) = simulated {
        service.set_simulated(simulated);
    }

    let steps = service.steps_remaining();
    service.run().context("pipeline failed")?;

    println!(
        "Completed {} step(s){}",
        steps,
        if service.is_simulated() {
            " (simulated)"
        } else {
            ""
        }
    );
    Ok(())
}

fn cmd_validate(registry: &LoaderRegistry, manifest: &PathBuf) -> Result<()> {
    let mut service = load_service(registry, manifest)?;
    service.set_simulated(true);

    let steps = service.steps_remaining();
    service.run().context("dry run failed")?;

    println!("Manifest OK: {} source(s), {} step(s)", service.sources().len(), steps);
    for (name, source) in service.sources() {
        println!("  {}: {} column(s)", name, source.column_names().len());
    }
    Ok(())
}

fn cmd_columns(registry: &LoaderRegistry, manifest: &PathBuf, source: &str) -> Result<()> {
    let service = load_service(registry, manifest)?;
    let Some(columns) = service.get_source_columns(source) else {
        bail!("no source named '{}' in {}", source, manifest.display());
    };
    for column in columns {
        println!("{}", column);
    }
    Ok(())
}
