use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sodp_sync::{env_lookup, CountCheckMode, JobRegistry, JobRunner, RunSettings};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sodp")]
#[command(about = "Swiss open-data pipelines: fetch public datasets and upsert them into PostgREST destinations")]
struct Cli {
    /// Job registry file.
    #[arg(long, global = true, default_value = "jobs.yaml")]
    registry: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the jobs declared in the registry.
    List,
    /// Fetch every dataset of a job and upsert it into each destination.
    Run {
        job: String,
        /// Fail when a destination row count cannot be determined.
        #[arg(long)]
        strict_counts: bool,
        /// Write `<dir>/<run_id>/summary.json`.
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Print the current row count of every table a job writes.
    Counts { job: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let registry = JobRegistry::load(&cli.registry).await?;

    match cli.command {
        Commands::List => {
            for job in &registry.jobs {
                let tables: Vec<_> = job.datasets.iter().map(|d| d.table.as_str()).collect();
                let destinations: Vec<_> = job
                    .destinations
                    .iter()
                    .map(|d| {
                        if d.required {
                            format!("{} (required)", d.name)
                        } else {
                            d.name.clone()
                        }
                    })
                    .collect();
                println!(
                    "{}: tables=[{}] destinations=[{}]{}",
                    job.name,
                    tables.join(", "),
                    destinations.join(", "),
                    job.description
                        .as_deref()
                        .map(|d| format!(" - {d}"))
                        .unwrap_or_default()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            job,
            strict_counts,
            reports_dir,
        } => {
            let job = registry.job(&job)?;
            let runner = JobRunner::new(RunSettings {
                count_mode: if strict_counts {
                    CountCheckMode::Strict
                } else {
                    CountCheckMode::Lenient
                },
                reports_dir,
                ..RunSettings::default()
            });
            let summary = runner.run(job, env_lookup).await?;
            println!(
                "run complete: run_id={} job={} success={}",
                summary.run_id, summary.job, summary.success
            );
            Ok(ExitCode::from(summary.exit_code() as u8))
        }
        Commands::Counts { job } => {
            let job = registry.job(&job)?;
            let runner = JobRunner::default();
            let (targets, unconfigured) = runner.connect(job, env_lookup)?;
            for count in runner.counts(job, &targets).await {
                println!("{}\t{}\t{}", count.destination, count.table, count.rows);
            }
            for spec in unconfigured {
                println!("{}\t-\tnot configured", spec.name);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
