use anyhow::Result;
use async_trait::async_trait;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::util::pretty::pretty_format_batches;
use medallion_core::{BatchRx, Message, Operator, Sink};
use std::fmt::Write;
use tokio_util::sync::CancellationToken;

/// Prints the schema and the first rows of a table to stdout
pub struct PreviewSink {
    id: String,
    schema: SchemaRef,
    limit: usize,
}

impl PreviewSink {
    pub fn new(id: String, schema: SchemaRef, limit: usize) -> Self {
        Self { id, schema, limit }
    }
}

#[async_trait]
impl Operator for PreviewSink {
    fn name(&self) -> &str {
        &self.id
    }
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Sink for PreviewSink {
    async fn run(&mut self, mut rx: BatchRx, _cancel: CancellationToken) -> Result<()> {
        let mut kept = Vec::new();
        let mut remaining = self.limit;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(b) => {
                    if remaining > 0 {
                        let take = remaining.min(b.num_rows());
                        kept.push(b.slice(0, take));
                        remaining -= take;
                    }
                }
                Message::Eos => break,
            }
        }
        println!("{}", render(&self.id, &self.schema, &kept)?);
        Ok(())
    }
}

/// Text rendering of the schema followed by the rows as a table
pub fn render(title: &str, schema: &SchemaRef, batches: &[RecordBatch]) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "--- {title} ---")?;
    writeln!(out, "root")?;
    for field in schema.fields() {
        writeln!(
            out,
            " |-- {}: {} (nullable = {})",
            field.name(),
            field.data_type(),
            field.is_nullable()
        )?;
    }
    if batches.iter().all(|b| b.num_rows() == 0) {
        writeln!(out, "(no rows)")?;
    } else {
        writeln!(out, "{}", pretty_format_batches(batches)?)?;
    }
    Ok(out)
}
