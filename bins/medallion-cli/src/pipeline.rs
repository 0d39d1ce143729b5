use anyhow::{bail, Context, Result};
use datafusion::arrow::array::RecordBatch;
use medallion_core::{
    tables, IngestStats, Message, Operator, PipelineError, PipelineSpec, Sink, Source, SourceSpec,
};
use medallion_io::build_source;
use medallion_io::sink_parquet::ParquetTableSink;
use medallion_io::sink_stdout::PreviewSink;
use medallion_tx::{BronzeTables, KeyStats, Normalizer, Unifier};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What a completed run did
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Row accounting of every ingested source, in ingestion order
    pub sources: Vec<(String, IngestStats)>,
    /// Sources skipped because their raw file was missing
    pub skipped: Vec<String>,
    pub key_stats: Vec<(String, KeyStats)>,
    pub silver_rows: usize,
    pub silver_path: PathBuf,
}

impl RunSummary {
    pub fn rows_dropped(&self) -> u64 {
        self.sources.iter().map(|(_, s)| s.rows_dropped).sum()
    }
}

/// Run every stage of `spec` once
///
/// Bronze tables are rewritten source by source, then joined, cleaned and
/// committed as the silver table. Any error after the bronze stage leaves the
/// previous silver file untouched.
pub async fn run(spec: &PipelineSpec, cancel: CancellationToken) -> Result<RunSummary> {
    spec.validate()?;
    info!(pipeline = %spec.name, sources = spec.sources.len(), "starting run");

    let mut summary = RunSummary {
        silver_path: spec.silver_path(),
        ..Default::default()
    };

    let mut produced = HashSet::new();
    for source in &spec.sources {
        if cancel.is_cancelled() {
            bail!("run cancelled during bronze ingestion");
        }
        match ingest(spec, source, cancel.child_token()).await {
            Ok(stats) => {
                info!(source = %source.id(), %stats, "bronze table written");
                produced.insert(source.id().to_string());
                summary.sources.push((source.id().to_string(), stats));
            }
            Err(e) if is_missing_source(&e) => {
                warn!(source = %source.id(), error = %e, "skipping source");
                summary.skipped.push(source.id().to_string());
            }
            Err(e) => return Err(e.context(format!("ingesting source `{}`", source.id()))),
        }
    }

    if cancel.is_cancelled() {
        bail!("run cancelled during bronze ingestion");
    }

    // A bronze file left over from an earlier run does not count
    for table in [tables::ANCHOR_TABLE, tables::INFO_TABLE, tables::EXTRA_TABLE] {
        if !produced.contains(table) {
            return Err(PipelineError::BronzeReadFailure {
                table: table.to_string(),
                reason: "not produced by this run".to_string(),
            }
            .into());
        }
    }

    let bronze = BronzeTables {
        anchor: spec.bronze_path(tables::ANCHOR_TABLE),
        info: spec.bronze_path(tables::INFO_TABLE),
        extra: spec.bronze_path(tables::EXTRA_TABLE),
    };
    let unified = Unifier::new().unify(&bronze).await?;
    summary.key_stats = unified.key_stats.clone();

    let (schema, batches) = Normalizer::silver()
        .normalize_table(&unified.schema, &unified.batches)
        .context("normalizing unified table")?;
    summary.silver_rows = batches.iter().map(|b| b.num_rows()).sum();

    let silver = ParquetTableSink::new(
        spec.silver_table.clone(),
        summary.silver_path.clone(),
        schema.clone(),
    );
    publish(Box::new(silver), batches.clone(), spec.channel_capacity, cancel.child_token())
        .await
        .context("writing silver table")?;
    info!(
        rows = summary.silver_rows,
        path = %summary.silver_path.display(),
        "silver table committed"
    );

    if spec.preview_rows > 0 {
        let preview = PreviewSink::new(spec.silver_table.clone(), schema, spec.preview_rows);
        publish(Box::new(preview), batches, spec.channel_capacity, cancel.child_token()).await?;
    }

    Ok(summary)
}

fn is_missing_source(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::SourceMissing { .. })
    )
}

/// Stream one raw source into its bronze table
async fn ingest(
    spec: &PipelineSpec,
    source: &SourceSpec,
    cancel: CancellationToken,
) -> Result<IngestStats> {
    let mut source = build_source(&source.resolved(&spec.raw_dir))?;
    let mut sink = ParquetTableSink::new(
        source.name().to_string(),
        spec.bronze_path(source.name()),
        source.schema(),
    );

    let (tx, rx) = mpsc::channel(spec.channel_capacity);
    let source_cancel = cancel.clone();
    let source_handle = tokio::spawn(async move { source.run(tx, source_cancel).await });
    let sink_handle = tokio::spawn(async move { sink.run(rx, cancel).await });

    let (stats, written) = tokio::join!(source_handle, sink_handle);
    let stats = stats??;
    written??;
    Ok(stats)
}

/// Feed an in-memory table to a sink and wait for it to finish
async fn publish(
    mut sink: Box<dyn Sink>,
    batches: Vec<RecordBatch>,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(capacity);
    let sink_cancel = cancel.clone();
    let handle = tokio::spawn(async move { sink.run(rx, sink_cancel).await });

    for batch in batches {
        if cancel.is_cancelled() {
            break;
        }
        tx.send(Message::Batch(batch))
            .await
            .map_err(|_| PipelineError::ChannelClosed("table sink"))?;
    }
    if !cancel.is_cancelled() {
        tx.send(Message::Eos)
            .await
            .map_err(|_| PipelineError::ChannelClosed("table sink"))?;
    }
    drop(tx);
    handle.await??;

    if cancel.is_cancelled() {
        bail!("run cancelled; table not committed");
    }
    Ok(())
}
