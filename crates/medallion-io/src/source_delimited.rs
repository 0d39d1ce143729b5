use crate::rows::{self, RowBuffer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use medallion_core::{
    BatchTx, DelimitedSourceSpec, IngestStats, Message, Operator, PipelineError, Source,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delimited file whose first line names the columns
///
/// All values are kept as text. Rows whose field count differs from the
/// header are dropped and counted.
pub struct DelimitedHeaderSource {
    pub id: String,
    pub schema: SchemaRef,
    pub spec: DelimitedSourceSpec,
}

impl DelimitedHeaderSource {
    /// Read the header line to derive the schema
    pub fn try_new(spec: DelimitedSourceSpec) -> Result<Self> {
        crate::ensure_exists(&spec.id, &spec.path)?;

        let mut reader = reader_builder(&spec)?
            .from_path(&spec.path)
            .with_context(|| format!("open {}", spec.path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("read header of {}", spec.path.display()))?;
        if headers.is_empty() || headers.iter().all(str::is_empty) {
            anyhow::bail!("{} has no header line", spec.path.display());
        }

        let fields: Vec<Field> = headers
            .iter()
            .map(|name| Field::new(name, DataType::Utf8, true))
            .collect();
        let schema = Arc::new(Schema::new(fields));
        info!(source = %spec.id, columns = schema.fields().len(), "header read");

        Ok(Self {
            id: spec.id.clone(),
            schema,
            spec,
        })
    }
}

fn reader_builder(spec: &DelimitedSourceSpec) -> Result<csv::ReaderBuilder> {
    let mut builder = csv::ReaderBuilder::new();
    builder
        .delimiter(crate::delimiter_byte(&spec.id, spec.delimiter)?)
        .has_headers(true)
        .flexible(true);
    Ok(builder)
}

#[async_trait]
impl Operator for DelimitedHeaderSource {
    fn name(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Source for DelimitedHeaderSource {
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> Result<IngestStats> {
        let path = &self.spec.path;
        let mut reader = reader_builder(&self.spec)?
            .from_path(path)
            .with_context(|| format!("open {}", path.display()))?;

        let width = self.schema.fields().len();
        let mut buffer = RowBuffer::new(self.schema.clone());
        let mut stats = IngestStats::default();

        for result in reader.records() {
            if cancel.is_cancelled() {
                info!(source = %self.id, "cancelled");
                return Ok(stats);
            }
            stats.rows_read += 1;

            let record = match result {
                Ok(record) => record,
                Err(e) if e.is_io_error() => {
                    return Err(e).with_context(|| format!("read {}", path.display()));
                }
                Err(e) => {
                    stats.rows_dropped += 1;
                    debug!(source = %self.id, error = %e, "unreadable record dropped");
                    continue;
                }
            };

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

            buffer.push(record.iter().map(rows::non_empty).collect());
            if buffer.len() >= self.spec.batch_rows {
                rows::flush(&self.id, None, &mut buffer, &tx, &mut stats).await?;
            }
        }
        rows::flush(&self.id, None, &mut buffer, &tx, &mut stats).await?;

        if stats.rows_dropped > 0 {
            warn!(source = %self.id, dropped = stats.rows_dropped, "malformed rows dropped");
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
    use datafusion::arrow::array::{Array, StringArray};
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn spec(path: PathBuf) -> DelimitedSourceSpec {
        DelimitedSourceSpec {
            id: "clientes_info".into(),
            path,
            delimiter: ',',
            batch_rows: 2,
        }
    }

    #[test]
    fn missing_file_is_source_missing() {
        let err = DelimitedHeaderSource::try_new(spec(PathBuf::from("/nonexistent/info.csv")))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::SourceMissing { .. })
        ));
    }

    #[tokio::test]
    async fn reads_text_columns_and_drops_ragged_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clientes_info.csv");
        std::fs::write(
            &path,
            "codigo_cliente,tipo_cliente,promedio_compras\n\
             1,premium,10.5\n\
             2,regular\n\
             3,regular,\n\
             4,nuevo,3,extra\n\
             5,premium,7\n",
        )?;

        let mut source = DelimitedHeaderSource::try_new(spec(path))?;
        let names: Vec<_> = source.schema().fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, ["codigo_cliente", "tipo_cliente", "promedio_compras"]);
        assert!(source
            .schema()
            .fields()
            .iter()
            .all(|f| f.data_type() == &DataType::Utf8));

        let (tx, mut rx) = mpsc::channel(8);
        let stats = source.run(tx, CancellationToken::new()).await?;
        assert_eq!(stats.rows_read, 5);
        assert_eq!(stats.rows_emitted, 3);
        assert_eq!(stats.rows_dropped, 2);

        let mut batches = Vec::new();
        let mut saw_eos = false;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(b) => batches.push(b),
                Message::Eos => saw_eos = true,
            }
        }
        assert!(saw_eos);
        // batch_rows = 2 splits the three accepted rows
        assert_eq!(batches.len(), 2);

        let codes = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(codes.value(0), "1");
        assert_eq!(codes.value(1), "3");
        // trailing empty field is null
        assert!(batches[0].column(2).is_null(1));
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_record_is_dropped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clientes_info.csv");
        let mut contents = b"codigo_cliente,comuna\n1,Macul\n".to_vec();
        // 'Ñuñoa' encoded as Latin-1
        contents.extend_from_slice(b"2,\xd1u\xf1oa\n");
        contents.extend_from_slice(b"3,Maipu\n");
        std::fs::write(&path, contents)?;

        let mut source = DelimitedHeaderSource::try_new(spec(path))?;
        let (tx, mut rx) = mpsc::channel(8);
        let stats = source.run(tx, CancellationToken::new()).await?;
        assert_eq!(stats.rows_read, 3);
        assert_eq!(stats.rows_emitted, 2);
        assert_eq!(stats.rows_dropped, 1);

        let mut codes = Vec::new();
        while let Some(Message::Batch(b)) = rx.recv().await {
            let column = b.column(0).as_any().downcast_ref::<StringArray>().unwrap();
            codes.extend(column.iter().map(|v| v.map(str::to_string)));
        }
        assert_eq!(codes, vec![Some("1".to_string()), Some("3".to_string())]);
        Ok(())
    }
}
