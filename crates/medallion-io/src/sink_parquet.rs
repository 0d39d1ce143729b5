use anyhow::Result;
use async_trait::async_trait;
use datafusion::arrow::array::{Array, RecordBatch};
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::parquet::arrow::arrow_writer::ArrowWriter;
use datafusion::parquet::file::properties::WriterProperties;
use medallion_core::{BatchRx, Message, Operator, PipelineError, Sink};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Whole-table Parquet sink
///
/// Buffers every batch until end-of-stream, then replaces the target file in
/// one rename. A stream that ends without [`Message::Eos`] commits nothing.
pub struct ParquetTableSink {
    id: String,
    path: PathBuf,
    schema: SchemaRef,
}

impl ParquetTableSink {
    pub fn new(id: String, path: PathBuf, schema: SchemaRef) -> Self {
        Self { id, path, schema }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Operator for ParquetTableSink {
    fn name(&self) -> &str {
        &self.id
    }
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Sink for ParquetTableSink {
    async fn run(&mut self, mut rx: BatchRx, cancel: CancellationToken) -> Result<()> {
        let mut batches = Vec::new();
        let mut complete = false;
        while let Some(msg) = rx.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            match msg {
                Message::Batch(b) => batches.push(b),
                Message::Eos => {
                    complete = true;
                    break;
                }
            }
        }

        if !complete {
            warn!(
                table = %self.id,
                "stream ended without EOS; keeping previous contents of {}",
                self.path.display()
            );
            return Ok(());
        }

        let rows = write_parquet_atomic(&self.path, self.schema.clone(), &batches)?;
        info!(table = %self.id, rows, "wrote {}", self.path.display());
        Ok(())
    }
}

/// Write `batches` to `path`, replacing any previous file atomically
///
/// The table is written to a temporary file in the target directory and
/// renamed over `path`, so readers see either the old or the new table.
pub fn write_parquet_atomic(
    path: &Path,
    schema: SchemaRef,
    batches: &[RecordBatch],
) -> Result<usize, PipelineError> {
    let failure = |reason: String| PipelineError::WriteFailure {
        path: path.to_path_buf(),
        reason,
    };

    for batch in batches {
        let matches = batch.num_columns() == schema.fields().len()
            && batch
                .columns()
                .iter()
                .zip(schema.fields())
                .all(|(column, field)| column.data_type() == field.data_type());
        if !matches {
            return Err(failure(format!(
                "batch schema {:?} does not match table schema {:?}",
                batch.schema(),
                schema
            )));
        }
    }

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| failure(e.to_string()))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| failure(e.to_string()))?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(tmp.as_file_mut(), schema, Some(props))
        .map_err(|e| failure(e.to_string()))?;

    let mut rows = 0;
    for batch in batches {
        writer.write(batch).map_err(|e| failure(e.to_string()))?;
        rows += batch.num_rows();
    }
    writer.close().map_err(|e| failure(e.to_string()))?;

    tmp.as_file()
        .sync_all()
        .map_err(|e| failure(e.to_string()))?;
    tmp.persist(path).map_err(|e| failure(e.error.to_string()))?;
    Ok(rows)
}
