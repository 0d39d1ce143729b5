use anyhow::{Context, Result};
use datafusion::arrow::array::{Array, ArrayRef, RecordBatch, StringArray};
use datafusion::arrow::compute::{cast_with_options, CastOptions};
use datafusion::arrow::datatypes::{DataType, SchemaRef};
use datafusion::arrow::util::display::FormatOptions;
use medallion_core::{BatchTx, IngestStats, Message, PipelineError};
use std::sync::Arc;
use tracing::debug;

/// Unparseable text becomes null instead of failing the batch
const SAFE_CAST: CastOptions<'static> = CastOptions {
    safe: true,
    format_options: FormatOptions::new(),
};

/// A typed cell whose text did not parse; it is stored as null
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellFailure {
    /// Row index within the batch
    pub row: usize,
    pub column: String,
    pub value: String,
}

/// Column-oriented buffer of raw text rows for one schema
pub struct RowBuffer {
    schema: SchemaRef,
    columns: Vec<Vec<Option<String>>>,
    rows: usize,
}

impl RowBuffer {
    pub fn new(schema: SchemaRef) -> Self {
        let columns = vec![Vec::new(); schema.fields().len()];
        Self {
            schema,
            columns,
            rows: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Append one row; callers reject rows of the wrong width beforehand
    pub fn push(&mut self, values: Vec<Option<String>>) {
        debug_assert_eq!(values.len(), self.width());
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.push(value);
        }
        self.rows += 1;
    }

    /// Convert the buffered rows into a batch and reset the buffer
    ///
    /// Typed columns go through Arrow's safe cast; a cell that was present as
    /// text but came out null is reported as a failure.
    pub fn finish(&mut self) -> Result<(RecordBatch, Vec<CellFailure>)> {
        let mut failures = Vec::new();
        let mut arrays = Vec::with_capacity(self.width());

        for (field, column) in self.schema.fields().iter().zip(self.columns.iter_mut()) {
            let values = std::mem::take(column);
            if field.data_type() == &DataType::Utf8 {
                arrays.push(Arc::new(StringArray::from(values)) as ArrayRef);
                continue;
            }

            let text: StringArray = values.iter().map(|v| v.as_deref().map(str::trim)).collect();
            let typed = cast_with_options(&text, field.data_type(), &SAFE_CAST)
                .with_context(|| format!("column `{}`", field.name()))?;
            for (row, value) in values.into_iter().enumerate() {
                if let Some(value) = value {
                    if typed.is_null(row) {
                        failures.push(CellFailure {
                            row,
                            column: field.name().clone(),
                            value,
                        });
                    }
                }
            }
            arrays.push(typed);
        }
        self.rows = 0;

        let batch = RecordBatch::try_new(self.schema.clone(), arrays)?;
        Ok((batch, failures))
    }
}

/// Empty delimited fields are nulls
pub(crate) fn non_empty(field: &str) -> Option<String> {
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

/// Send the buffered rows downstream and account for them
///
/// Cells of `key_column` that fail to parse are reported as join key cast
/// failures; the row is kept with a null key.
pub(crate) async fn flush(
    source_id: &str,
    key_column: Option<&str>,
    buffer: &mut RowBuffer,
    tx: &BatchTx,
    stats: &mut IngestStats,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let (batch, failures) = buffer.finish()?;

    for failure in &failures {
        if key_column == Some(failure.column.as_str()) {
            let err = PipelineError::JoinKeyCastFailure {
                table: source_id.to_string(),
                column: failure.column.clone(),
                value: failure.value.clone(),
            };
            debug!(source = %source_id, error = %err, "key stored as null");
        } else {
            debug!(
                source = %source_id,
                column = %failure.column,
                value = %failure.value,
                "unparseable cell stored as null"
            );
        }
    }
    stats.cells_nulled += failures.len() as u64;
    stats.rows_emitted += batch.num_rows() as u64;

    debug!(source = %source_id, rows = batch.num_rows(), "emitting batch");
    tx.send(Message::Batch(batch))
        .await
        .map_err(|_| PipelineError::ChannelClosed("bronze sink dropped its receiver"))?;
    Ok(())
}
