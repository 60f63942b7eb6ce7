//! ttt CLI

mod config;
mod driver;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ttt_core::parse_years;

use crate::config::read_run_config;
use crate::driver::{DriverOptions, PipelineDriver};

#[derive(Parser)]
#[command(name = "ttt")]
#[command(about = "Three-top histograms, shape templates and model cards")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill histograms, write shape artifacts and cards, combine and fit
    Run {
        /// Run configuration (YAML, or JSON by extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Comma separated eras, or `all`
        #[arg(long, default_value = "all")]
        years: String,

        /// Root of the written artifacts and cards
        #[arg(long, default_value = "ttt_output")]
        workdir: PathBuf,

        /// Ntuple descriptor; required when the config lists several
        #[arg(long)]
        ntuple: Option<String>,

        /// Nominal only, with a placeholder lnN nuisance in the cards
        #[arg(long = "no_systs")]
        no_systs: bool,

        /// Use collision data for `data_obs` instead of the background sum
        #[arg(long)]
        unblind: bool,

        /// Worker threads
        #[arg(long, default_value = "1")]
        cores: usize,

        /// Do not run the fitter on the final card
        #[arg(long)]
        skip_fit: bool,
    },

    /// Validate a run configuration and print the nuisances per era
    Check {
        /// Run configuration (YAML, or JSON by extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Comma separated eras, or `all`
        #[arg(long, default_value = "all")]
        years: String,

        /// Ntuple descriptor; required when the config lists several
        #[arg(long)]
        ntuple: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str().to_ascii_lowercase())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run { config, years, workdir, ntuple, no_systs, unblind, cores, skip_fit } => {
            cmd_run(&config, &years, workdir, ntuple.as_deref(), !no_systs, !unblind, cores, !skip_fit)
        }
        Commands::Check { config, years, ntuple } => cmd_check(&config, &years, ntuple.as_deref()),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    config: &Path,
    years: &str,
    workdir: PathBuf,
    ntuple: Option<&str>,
    systematics: bool,
    blinded: bool,
    cores: usize,
    fit: bool,
) -> Result<()> {
    let cfg = read_run_config(config)?;
    let options = DriverOptions {
        years: parse_years(years)?,
        workdir,
        ntuple: cfg.ntuple_name(ntuple)?.to_string(),
        systematics,
        blinded,
        cores,
        fit,
    };
    let driver = PipelineDriver::new(&cfg, options)?;
    let summary = driver.run()?;
    tracing::info!(cards = summary.cards.len(), records = summary.diagnostics.len(), "run finished");

    for r in summary.diagnostics.records() {
        eprintln!("{}", r.to_line());
    }
    eprintln!("{}", summary.diagnostics.summary());
    if let Some(card) = &summary.final_card {
        println!("{}", card.display());
    }
    if summary.diagnostics.has_failures() {
        anyhow::bail!(
            "run finished with failures, see {}",
            summary.failures_log.display()
        );
    }
    Ok(())
}

fn cmd_check(config: &Path, years: &str, ntuple: Option<&str>) -> Result<()> {
    let cfg = read_run_config(config)?;
    let years = parse_years(years)?;
    let ntuple = cfg.ntuple_name(ntuple)?;
    cfg.validate(ntuple)?;
    let catalog = cfg.catalog()?;
    let graphs = cfg.graph_specs()?;
    cfg.scale_chain()?;

    let mut out = serde_json::Map::new();
    out.insert("ntuple".into(), ntuple.into());
    out.insert("regions".into(), cfg.regions.iter().map(|r| r.name.clone()).collect::<Vec<_>>().into());
    out.insert("graphs".into(), graphs.iter().map(|g| g.name.clone()).collect::<Vec<_>>().into());
    for era in years {
        let names: Vec<String> =
            catalog.iter().map(|s| catalog.render_name(s, era).output().to_string()).collect();
        out.insert(era.to_string(), names.into());
    }
    println!("{}", serde_json::to_string_pretty(&serde_json::Value::Object(out))?);
    Ok(())
}
