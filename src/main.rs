use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, warn};

use district_geocache::{
    init_tracing, join_map_points, read_demand, reconciler_from_config, write_map_points_csv,
    write_map_points_json, AppConfig, CancelSignal, CoordinateStore, DistrictName,
    ReconcileReport,
};

#[derive(Parser)]
#[command(name = "district-geocache", version, about = "Resolve and cache district coordinates")]
struct Cli {
    /// Coordinate snapshot to read and update
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Minimum delay between lookups, in milliseconds
    #[arg(long, global = true)]
    min_delay_ms: Option<u64>,
    #[arg(long, global = true)]
    region: Option<String>,
    #[arg(long, global = true)]
    country: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve every district of a dataset and export weighted map points
    Report {
        /// Semicolon-delimited incident dataset
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long, default_value = "Buenos Aires")]
        province: String,
        /// Write points here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
    },
    /// Resolve the given district names
    Resolve {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Validate the snapshot and print its records
    Inspect,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(delay) = cli.min_delay_ms {
        config.min_delay_ms = delay;
    }
    if let Some(region) = cli.region {
        config.region = region;
    }
    if let Some(country) = cli.country {
        config.country = country;
    }

    match cli.command {
        Command::Report {
            dataset,
            province,
            output,
            format,
        } => {
            let file = File::open(&dataset)
                .with_context(|| format!("opening dataset {}", dataset.display()))?;
            let demand = read_demand(BufReader::new(file), &province)?;
            if demand.is_empty() {
                bail!("no rows for province {province:?} in {}", dataset.display());
            }
            let required: Vec<DistrictName> = demand.iter().map(|d| d.name.clone()).collect();
            let report = run_reconcile(&config, &required).await?;
            let points = join_map_points(&demand, &report.records);

            let sink: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(
                    File::create(path)
                        .with_context(|| format!("creating output {}", path.display()))?,
                )),
                None => Box::new(io::stdout().lock()),
            };
            match format {
                OutputFormat::Csv => write_map_points_csv(sink, &points)?,
                OutputFormat::Json => write_map_points_json(sink, &points)?,
            }
        }
        Command::Resolve { names } => {
            let required = names
                .into_iter()
                .map(DistrictName::new)
                .collect::<Result<Vec<_>, _>>()?;
            let report = run_reconcile(&config, &required).await?;
            let mut stdout = io::stdout().lock();
            for record in &report.records {
                writeln!(
                    stdout,
                    "{}\t{}\t{}",
                    record.name,
                    record.coordinate.lat(),
                    record.coordinate.lon()
                )?;
            }
            for (name, failure) in &report.failures {
                writeln!(stdout, "{name}\tunresolved ({failure})")?;
            }
        }
        Command::Inspect => {
            let store = CoordinateStore::new(config.store_path.clone(), config.store_lock_timeout());
            let records = store.load()?;
            let mut stdout = io::stdout().lock();
            for record in &records {
                writeln!(
                    stdout,
                    "{}\t{}\t{}",
                    record.name,
                    record.coordinate.lat(),
                    record.coordinate.lon()
                )?;
            }
            writeln!(stdout, "{} districts in {}", records.len(), store.path().display())?;
        }
    }
    Ok(())
}

async fn run_reconcile(
    config: &AppConfig,
    required: &[DistrictName],
) -> anyhow::Result<ReconcileReport> {
    let reconciler = reconciler_from_config(config)?;
    let cancel = CancelSignal::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; saving districts resolved so far");
                cancel.cancel();
            }
        })
    };

    let report = reconciler.reconcile(required, Some(&cancel)).await;
    interrupt.abort();
    let report = report?;

    if let Some(err) = &report.persist_error {
        error!(%err, "coordinate cache was not updated");
    }
    if report.cancelled {
        warn!(
            resolved = report.stats.resolved,
            "run interrupted; some districts were not attempted"
        );
    }
    Ok(report)
}
