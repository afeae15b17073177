use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clg_engine::{write_reports, EngineConfig};
use clg_store::{AmsIdStore, LookupTables};

#[derive(Debug, Parser)]
#[command(name = "clg-cli")]
#[command(about = "Campaign Link Generator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate tracking links from campaign descriptions (one per line),
    /// read from a file or stdin.
    Generate {
        /// Input file; stdin when omitted.
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Show AMS-ID pool occupancy per partition.
    Pool,
    /// Verify the lookup tables and pool file load cleanly.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Generate { input: None }) {
        Commands::Generate { input } => {
            let text = match input {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("reading stdin")?;
                    buf
                }
            };
            let lines: Vec<String> = text.lines().map(str::to_string).collect();

            let pipeline = config.build_pipeline()?;
            let report = pipeline.run_batch(&lines).await;
            let run_dir = write_reports(&report, &config.reports_dir).await?;

            let errored = report.rows.iter().filter(|r| r.error.is_some()).count();
            println!(
                "generate complete: run_id={} rows={} errored={} reports={}",
                report.run_id,
                report.rows.len(),
                errored,
                run_dir.display()
            );
            if let Some(batch_error) = &report.batch_error {
                anyhow::bail!("batch aborted: {batch_error}");
            }
        }
        Commands::Pool => {
            let store = AmsIdStore::new(&config.pool_path);
            for status in store.partition_status().await? {
                println!(
                    "{}: {} unused of {}",
                    status.partition, status.unused, status.total
                );
            }
        }
        Commands::Check => {
            let tables = LookupTables::load(&config.network_index, &config.app_index)?;
            let pool = AmsIdStore::new(&config.pool_path).load().await?;
            println!(
                "ok: {} network entries, {} app entries, {} pool partitions",
                tables.network_len(),
                tables.app_len(),
                pool.len()
            );
        }
    }

    Ok(())
}
