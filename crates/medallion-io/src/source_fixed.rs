use crate::rows::{self, RowBuffer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use medallion_core::{
    fields_to_schema, tables, BatchTx, FixedSchemaSourceSpec, IngestStats, Message, Operator,
    PipelineError, Source,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Headerless delimited file mapped positionally onto a declared schema
///
/// Leading whitespace of each field is ignored, so `5, APP, XMOR99, 2025-02-01`
/// reads the same as `5,APP,XMOR99,2025-02-01`.
pub struct FixedSchemaSource {
    pub id: String,
    pub schema: SchemaRef,
    pub spec: FixedSchemaSourceSpec,
}

impl FixedSchemaSource {
    pub fn try_new(spec: FixedSchemaSourceSpec) -> Result<Self> {
        crate::ensure_exists(&spec.id, &spec.path)?;
        let schema = fields_to_schema(&spec.fields)?;
        Ok(Self {
            id: spec.id.clone(),
            schema,
            spec,
        })
    }

    fn key_column(&self) -> Option<&str> {
        self.spec
            .fields
            .iter()
            .find(|f| f.name == tables::OPTIONAL_KEY)
            .map(|f| f.name.as_str())
    }
}

#[async_trait]
impl Operator for FixedSchemaSource {
    fn name(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Source for FixedSchemaSource {
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> Result<IngestStats> {
        let path = &self.spec.path;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(crate::delimiter_byte(&self.id, self.spec.delimiter)?)
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("open {}", path.display()))?;

        let width = self.schema.fields().len();
        let key_column = self.key_column();
        let mut buffer = RowBuffer::new(self.schema.clone());
        let mut stats = IngestStats::default();

        for result in reader.records() {
            if cancel.is_cancelled() {
                info!(source = %self.id, "cancelled");
                return Ok(stats);
            }

            let record = match result {
                Ok(record) => record,
                Err(e) if e.is_io_error() => {
                    return Err(e).with_context(|| format!("read {}", path.display()));
                }
                Err(e) => {
                    stats.rows_read += 1;
                    stats.rows_dropped += 1;
                    debug!(source = %self.id, error = %e, "unreadable record dropped");
                    continue;
                }
            };

            if record.iter().all(|f| f.trim().is_empty()) {
                stats.lines_ignored += 1;
                continue;
            }
            stats.rows_read += 1;

            if record.len() != width {
                stats.rows_dropped += 1;
                let err = PipelineError::MalformedRow {
                    source_id: self.id.clone(),
                    line: record.position().map(|p| p.line()).unwrap_or_default(),
                    expected: width,
                    found: record.len(),
                };
                debug!(error = %err, "row dropped");
                continue;
            }

            buffer.push(record.iter().map(|f| rows::non_empty(f.trim_start())).collect());
            if buffer.len() >= self.spec.batch_rows {
                rows::flush(&self.id, key_column, &mut buffer, &tx, &mut stats).await?;
            }
        }
        rows::flush(&self.id, key_column, &mut buffer, &tx, &mut stats).await?;

        if stats.rows_dropped > 0 {
            warn!(source = %self.id, dropped = stats.rows_dropped, "malformed rows dropped");
        }
        if stats.cells_nulled > 0 {
            warn!(source = %self.id, nulled = stats.cells_nulled, "unparseable cells stored as null");
        }
        info!(source = %self.id, %stats, "source finished");

        tx.send(Message::Eos)
            .await
            .map_err(|_| PipelineError::ChannelClosed("bronze sink dropped its receiver"))?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Array, Int32Array, StringArray};
    use datafusion::arrow::datatypes::DataType;
    use tokio::sync::mpsc;

    async fn ingest(contents: &str) -> Result<(IngestStats, Vec<medallion_core::Batch>)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clientes_extra.txt");
        std::fs::write(&path, contents)?;

        let mut source = FixedSchemaSource::try_new(FixedSchemaSourceSpec {
            id: tables::EXTRA_TABLE.into(),
            path,
            delimiter: ',',
            fields: tables::extra_fields(),
            batch_rows: 1024,
        })?;
        let (tx, mut rx) = mpsc::channel(8);
        let stats = source.run(tx, CancellationToken::new()).await?;

        let mut batches = Vec::new();
        while let Some(Message::Batch(b)) = rx.recv().await {
            batches.push(b);
        }
        Ok((stats, batches))
    }

    #[tokio::test]
    async fn maps_positions_without_header() -> Result<()> {
        let (stats, batches) = ingest("5, APP, XMOR99, 2025-02-01\n").await?;
        assert_eq!(stats.rows_emitted, 1);
        let batch = &batches[0];
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Int32);

        let ids = batch.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(ids.value(0), 5);
        let text = |i: usize| {
            batch
                .column(i)
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .value(0)
                .to_string()
        };
        assert_eq!(text(1), "APP");
        assert_eq!(text(2), "XMOR99");
        assert_eq!(text(3), "2025-02-01");
        Ok(())
    }

    #[tokio::test]
    async fn rejects_width_mismatch_and_nulls_bad_keys() -> Result<()> {
        let (stats, batches) = ingest(
            "1, APP, XMOR34, 2025-01-06\n\
             2, WEB, XMOR35\n\
             \n\
             x9, WEB, XMOR36, 2025-01-07\n\
             3, TIENDA, XMOR37, 2025-01-08, extra\n",
        )
        .await?;
        assert_eq!(stats.rows_read, 4);
        assert_eq!(stats.rows_emitted, 2);
        assert_eq!(stats.rows_dropped, 2);
        assert_eq!(stats.cells_nulled, 1);

        let ids = batches[0].column(0).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(ids.value(0), 1);
        assert!(ids.is_null(1));
        Ok(())
    }
}
