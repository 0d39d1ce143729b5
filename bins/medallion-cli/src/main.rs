use anyhow::Result;
use clap::Parser;
use medallion_cli::run;
use medallion_core::PipelineSpec;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Consolidate the raw customer sources into the silver table
#[derive(Parser, Debug)]
#[command(name = "medallion")]
struct Args {
    /// Pipeline YAML; the built-in customer pipeline when omitted
    #[arg(short, long)]
    pipeline: Option<PathBuf>,
    /// Directory holding the raw source files
    #[arg(long)]
    raw_dir: Option<PathBuf>,
    #[arg(long)]
    bronze_dir: Option<PathBuf>,
    #[arg(long)]
    silver_dir: Option<PathBuf>,
    /// Rows printed after the run; 0 disables the preview
    #[arg(long)]
    preview_rows: Option<usize>,
    /// Bounded channel capacity between operators
    #[arg(long)]
    channel_capacity: Option<usize>,
}

impl Args {
    fn into_spec(self) -> Result<PipelineSpec> {
        let mut spec = match &self.pipeline {
            Some(path) => PipelineSpec::from_path(path)?,
            None => PipelineSpec::clientes("."),
        };
        if let Some(dir) = self.raw_dir {
            spec.raw_dir = dir;
        }
        if let Some(dir) = self.bronze_dir {
            spec.bronze_dir = dir;
        }
        if let Some(dir) = self.silver_dir {
            spec.silver_dir = dir;
        }
        if let Some(rows) = self.preview_rows {
            spec.preview_rows = rows;
        }
        if let Some(capacity) = self.channel_capacity {
            spec.channel_capacity = capacity;
        }
        spec.validate()?;
        Ok(spec)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let spec = Args::parse().into_spec()?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling run");
            on_interrupt.cancel();
        }
    });

    let summary = run(&spec, cancel).await?;
    info!(
        silver_rows = summary.silver_rows,
        dropped = summary.rows_dropped(),
        skipped = summary.skipped.len(),
        "run complete: {}",
        summary.silver_path.display()
    );
    Ok(())
}
