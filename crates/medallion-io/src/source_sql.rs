use crate::rows::{self, RowBuffer};
use crate::statement;
use anyhow::{Context, Result};
use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use medallion_core::{
    fields_to_schema, tables, BatchTx, IngestStats, Message, Operator, PipelineError, Source,
    SqlInsertSourceSpec,
};
use std::fs::File;
use std::io::{BufRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Text file of insertion statements
///
/// Only lines of the shape `INSERT INTO <table> VALUES (...);` are data;
/// everything else is skipped. Statements whose literal count differs from
/// the declared schema are dropped whole.
pub struct SqlInsertSource {
    pub id: String,
    pub schema: SchemaRef,
    pub spec: SqlInsertSourceSpec,
}

impl SqlInsertSource {
    pub fn try_new(spec: SqlInsertSourceSpec) -> Result<Self> {
        crate::ensure_exists(&spec.id, &spec.path)?;
        let schema = fields_to_schema(&spec.fields)?;
        Ok(Self {
            id: spec.id.clone(),
            schema,
            spec,
        })
    }

    fn accepts_table(&self, table: &str) -> bool {
        match &self.spec.table {
            // schema-qualified names match on their last segment
            Some(wanted) => {
                let name = table.rsplit('.').next().unwrap_or(table);
                name.eq_ignore_ascii_case(wanted) || table.eq_ignore_ascii_case(wanted)
            }
            None => true,
        }
    }
}

#[async_trait]
impl Operator for SqlInsertSource {
    fn name(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Source for SqlInsertSource {
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> Result<IngestStats> {
        let path = &self.spec.path;
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let width = self.schema.fields().len();
        let key_column = self
            .spec
            .fields
            .iter()
            .find(|f| f.name == tables::ANCHOR_KEY)
            .map(|f| f.name.as_str());
        let mut buffer = RowBuffer::new(self.schema.clone());
        let mut stats = IngestStats::default();

        let mut raw = Vec::new();
        let mut line_no = 0u64;
        loop {
            if cancel.is_cancelled() {
                info!(source = %self.id, "cancelled");
                return Ok(stats);
            }
            raw.clear();
            let read = reader
                .read_until(b'\n', &mut raw)
                .with_context(|| format!("read {}", path.display()))?;
            if read == 0 {
                break;
            }
            line_no += 1;

            // undecodable bytes only lose this line
            let line = match std::str::from_utf8(trim_line_end(&raw)) {
                Ok(line) => line,
                Err(e) => {
                    stats.rows_read += 1;
                    stats.rows_dropped += 1;
                    debug!(source = %self.id, line = line_no, error = %e, "line is not valid UTF-8");
                    continue;
                }
            };

            let insert = match statement::parse_line(line) {
                Ok(Some(insert)) => insert,
                Ok(None) => {
                    stats.lines_ignored += 1;
                    continue;
                }
                Err(e) => {
                    stats.rows_read += 1;
                    stats.rows_dropped += 1;
                    debug!(source = %self.id, line = line_no, error = %e, "statement dropped");
                    continue;
                }
            };

            if !self.accepts_table(&insert.table) {
                stats.lines_ignored += 1;
                continue;
            }
            stats.rows_read += 1;

            if insert.values.len() != width {
                stats.rows_dropped += 1;
                let err = PipelineError::MalformedRow {
                    source_id: self.id.clone(),
                    line: line_no,
                    expected: width,
                    found: insert.values.len(),
                };
                debug!(error = %err, "statement dropped");
                continue;
            }

            buffer.push(insert.values);
            if buffer.len() >= self.spec.batch_rows {
                rows::flush(&self.id, key_column, &mut buffer, &tx, &mut stats).await?;
            }
        }
        rows::flush(&self.id, key_column, &mut buffer, &tx, &mut stats).await?;

        if stats.rows_dropped > 0 {
            warn!(source = %self.id, dropped = stats.rows_dropped, "malformed statements dropped");
        }
        info!(source = %self.id, %stats, "source finished");

        tx.send(Message::Eos)
            .await
            .map_err(|_| PipelineError::ChannelClosed("bronze sink dropped its receiver"))?;
        Ok(stats)
    }
}

fn trim_line_end(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Array, StringArray};
    use tokio::sync::mpsc;

    const DUMP: &str = "\
-- clientes dump
CREATE TABLE clientes (codigo INT, nombre TEXT);

INSERT INTO clientes VALUES (1, 'Ana', 'Soto', 'Ñuñoa', '11.111.111-1', '1990-05-01', 'catolico');
INSERT INTO clientes VALUES (2, 'Luis', 'Rojas', 'Maipú', '22.222.222-2', '1985-13-40');
INSERT INTO clientes VALUES (3, 'Eva', 'Díaz', 'La Florida', '33.333.333-3', NULL, 'EVANGELICO');
INSERT INTO auditoria VALUES (9, 'x', 'x', 'x', 'x', 'x', 'x');
INSERT INTO clientes VALUES (4, 'Broken);
";

    async fn ingest(table: Option<&str>) -> Result<(IngestStats, Vec<medallion_core::Batch>)> {
        ingest_bytes(DUMP.as_bytes(), table).await
    }

    async fn ingest_bytes(
        contents: &[u8],
        table: Option<&str>,
    ) -> Result<(IngestStats, Vec<medallion_core::Batch>)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clientes.sql");
        std::fs::write(&path, contents)?;

        let mut source = SqlInsertSource::try_new(SqlInsertSourceSpec {
            id: tables::ANCHOR_TABLE.into(),
            path,
            table: table.map(str::to_string),
            fields: tables::statement_fields(),
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
    async fn keeps_only_full_width_statements() -> Result<()> {
        let (stats, batches) = ingest(Some("clientes")).await?;
        assert_eq!(stats.rows_read, 4);
        assert_eq!(stats.rows_emitted, 2);
        assert_eq!(stats.rows_dropped, 2);
        // comment, DDL, blank line and the other table
        assert_eq!(stats.lines_ignored, 4);

        let batch = &batches[0];
        assert_eq!(batch.num_columns(), 7);
        let codes = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(codes.value(0), "1");
        assert_eq!(codes.value(1), "3");
        let comuna = batch.column(3).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(comuna.value(0), "Ñuñoa");
        assert!(batch.column(5).is_null(1));
        Ok(())
    }

    #[tokio::test]
    async fn without_table_filter_every_insert_counts() -> Result<()> {
        let (stats, _) = ingest(None).await?;
        assert_eq!(stats.rows_emitted, 3);
        assert_eq!(stats.lines_ignored, 3);
        Ok(())
    }

    #[tokio::test]
    async fn latin1_line_is_dropped_not_fatal() -> Result<()> {
        let mut dump = Vec::new();
        dump.extend_from_slice(
            b"INSERT INTO clientes VALUES (1, 'Ana', 'Soto', 'Maipu', '1-1', '1990-05-01', 'catolico');\r\n",
        );
        // 'Ñuñoa' encoded as Latin-1
        dump.extend_from_slice(
            b"INSERT INTO clientes VALUES (2, 'Luis', 'Rojas', '\xd1u\xf1oa', '2-2', '1985-01-01', 'ateo');\r\n",
        );
        dump.extend_from_slice(
            b"INSERT INTO clientes VALUES (3, 'Eva', 'Diaz', 'Macul', '3-3', NULL, 'evangelico');",
        );

        let (stats, batches) = ingest_bytes(&dump, None).await?;
        assert_eq!(stats.rows_read, 3);
        assert_eq!(stats.rows_emitted, 2);
        assert_eq!(stats.rows_dropped, 1);

        let codes = batches[0].column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(codes.value(0), "1");
        assert_eq!(codes.value(1), "3");
        let religion = batches[0].column(6).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(religion.value(1), "evangelico");
        Ok(())
    }
}
