//! # Medallion Core
//!
//! Foundational types, traits, and configuration shared by every crate of the
//! customer consolidation pipeline. Raw sources are ingested into *bronze*
//! Parquet tables, joined and cleaned, and persisted as a single *silver*
//! table.
//!
//! ## Key Components
//!
//! - **Message System**: batches flow from a source to a sink over a bounded channel,
//!   terminated by an explicit end-of-stream marker
//! - **Operator Traits**: [`Source`] and [`Sink`] abstractions for the bronze and silver stages
//! - **Configuration**: YAML-based [`PipelineSpec`] with one [`SourceSpec`] per raw input
//! - **Error Handling**: the [`PipelineError`] taxonomy used to decide what is fatal
//!
//! ## Example Usage
//!
//! ```rust
//! use medallion_core::{PipelineSpec, SourceSpec};
//!
//! let spec = PipelineSpec::clientes("raw");
//! assert_eq!(spec.sources.len(), 3);
//! assert!(matches!(spec.sources[2], SourceSpec::SqlInserts(_)));
//! ```

use async_trait::async_trait;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod tables;

/// Type alias for Apache Arrow RecordBatch, representing a batch of columnar data
pub type Batch = RecordBatch;

/// Sender side of the channel between a source and its sink
pub type BatchTx = mpsc::Sender<Message>;

/// Receiver side of the channel between a source and its sink
pub type BatchRx = mpsc::Receiver<Message>;

/// Messages passed between pipeline operators
#[derive(Debug, Clone)]
pub enum Message {
    /// A batch of rows in Apache Arrow format
    Batch(Batch),

    /// End-of-stream marker
    ///
    /// A sink only commits its output once this has been received. A stream
    /// that closes without it (failed or cancelled producer) leaves the
    /// previous output in place.
    Eos,
}

/// Error taxonomy of the pipeline
///
/// Operators return `anyhow::Result`; where the orchestrator needs to tell
/// recoverable faults from fatal ones, the underlying error is one of these
/// variants and is recovered with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A declared raw input file does not exist
    ///
    /// Not fatal for the bronze stage: remaining sources are still ingested.
    #[error("source `{source_id}` is missing: {} does not exist", path.display())]
    SourceMissing { source_id: String, path: PathBuf },

    /// A line did not fit the declared schema width; the row is dropped
    #[error("malformed row in `{source_id}` at line {line}: expected {expected} fields, found {found}")]
    MalformedRow {
        source_id: String,
        line: u64,
        expected: usize,
        found: usize,
    },

    /// A join key is not representable as an integer; the row never matches
    #[error("join key `{column}` of `{table}` is not an integer: {value:?}")]
    JoinKeyCastFailure {
        table: String,
        column: String,
        value: String,
    },

    /// A bronze table required by unification cannot be read
    #[error("cannot read bronze table `{table}`: {reason}")]
    BronzeReadFailure { table: String, reason: String },

    /// The storage layer could not complete an overwrite
    #[error("cannot write table to {}: {reason}", path.display())]
    WriteFailure { path: PathBuf, reason: String },

    /// A channel between operators was closed unexpectedly
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// The pipeline specification is inconsistent
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Faults that are handled at the adapter boundary and must not abort the run
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceMissing { .. }
                | PipelineError::MalformedRow { .. }
                | PipelineError::JoinKeyCastFailure { .. }
        )
    }
}

/// Row accounting reported by every source
///
/// Dropped rows are a silent data-loss point in the raw formats; counting them
/// here is what makes the loss observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Candidate data rows seen (header and ignored lines excluded)
    pub rows_read: u64,
    /// Rows forwarded to the sink
    pub rows_emitted: u64,
    /// Rows rejected as malformed
    pub rows_dropped: u64,
    /// Typed cells that failed to parse and were stored as null
    pub cells_nulled: u64,
    /// Lines that were not data at all (comments, DDL, blank lines)
    pub lines_ignored: u64,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read={} emitted={} dropped={} nulled={} ignored={}",
            self.rows_read, self.rows_emitted, self.rows_dropped, self.cells_nulled, self.lines_ignored
        )
    }
}

/// Base trait for all pipeline operators
#[async_trait]
pub trait Operator: Send + Sync {
    /// Unique name of the operator, used for logging and output naming
    fn name(&self) -> &str;

    /// Arrow schema of the data this operator produces or consumes
    fn schema(&self) -> SchemaRef;
}

/// Trait for raw source adapters
///
/// Every adapter turns one raw file into a stream of record batches matching
/// [`Operator::schema`]. The adapter is chosen from configuration, never by
/// inspecting file contents.
#[async_trait]
pub trait Source: Operator {
    /// Read the source and publish its rows
    ///
    /// # Arguments
    /// * `tx` - Channel sender for publishing batches to the sink
    /// * `cancel` - Cancellation token; a cancelled source returns without sending [`Message::Eos`]
    ///
    /// # Returns
    /// Row accounting for this invocation
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> anyhow::Result<IngestStats>;
}

/// Trait for sinks that persist or display a table
#[async_trait]
pub trait Sink: Operator {
    /// Consume batches until [`Message::Eos`] and commit them
    async fn run(&mut self, rx: BatchRx, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Complete pipeline specification loaded from YAML configuration
///
/// # Example YAML Configuration
///
/// ```yaml
/// name: "clientes"
/// raw_dir: "lidl_project_source"
/// sources:
///   - type: delimited_header
///     id: "clientes_info"
///     path: "clientes_info.csv"
///   - type: fixed_schema
///     id: "clientes_extra"
///     path: "clientes_extra.txt"
///   - type: sql_inserts
///     id: "clientes_sql"
///     path: "clientes.sql"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Human-readable name of the pipeline
    pub name: String,

    /// Directory the relative source paths are resolved against
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,

    /// Directory holding one Parquet file per source
    #[serde(default = "default_bronze_dir")]
    pub bronze_dir: PathBuf,

    /// Directory holding the consolidated table
    #[serde(default = "default_silver_dir")]
    pub silver_dir: PathBuf,

    /// File stem of the consolidated table
    #[serde(default = "default_silver_table")]
    pub silver_table: String,

    /// Rows printed after a successful run; zero disables the preview
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,

    /// Bounded channel capacity between a source and its sink
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Raw inputs, ingested in order
    pub sources: Vec<SourceSpec>,
}

/// Configuration for a delimited file whose first line names the columns
///
/// Every column is read as text; no type inference happens at this stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelimitedSourceSpec {
    /// Source identifier, also the bronze table name
    pub id: String,

    /// File path, relative to `raw_dir` unless absolute
    pub path: PathBuf,

    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

/// Configuration for a headerless delimited file mapped positionally onto a schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedSchemaSourceSpec {
    pub id: String,
    pub path: PathBuf,

    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Declared columns, in file order
    #[serde(default = "tables::extra_fields")]
    pub fields: Vec<FieldConfig>,

    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

/// Configuration for a text file of `INSERT INTO ... VALUES (...);` statements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlInsertSourceSpec {
    pub id: String,
    pub path: PathBuf,

    /// Only accept inserts into this table (case-insensitive); any table when unset
    #[serde(default)]
    pub table: Option<String>,

    /// Declared columns; statements with a different literal count are dropped
    #[serde(default = "tables::statement_fields")]
    pub fields: Vec<FieldConfig>,

    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    pub data_type: String, // "int32", "int64", "float64", "string"
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

impl FieldConfig {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
        }
    }

    /// Map the configured type name onto an Arrow type
    pub fn arrow_type(&self) -> Result<DataType, PipelineError> {
        match self.data_type.to_ascii_lowercase().as_str() {
            "int" | "int32" | "integer" => Ok(DataType::Int32),
            "long" | "int64" | "bigint" => Ok(DataType::Int64),
            "double" | "float64" => Ok(DataType::Float64),
            "string" | "utf8" | "text" => Ok(DataType::Utf8),
            other => Err(PipelineError::InvalidConfig(format!(
                "field `{}` has unsupported type `{}`",
                self.name, other
            ))),
        }
    }
}

/// Build an Arrow schema from declared fields
pub fn fields_to_schema(fields: &[FieldConfig]) -> Result<SchemaRef, PipelineError> {
    let fields = fields
        .iter()
        .map(|f| Ok(Field::new(&f.name, f.arrow_type()?, f.nullable)))
        .collect::<Result<Vec<_>, PipelineError>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "delimited_header")]
    Delimited(DelimitedSourceSpec),
    #[serde(rename = "fixed_schema")]
    FixedSchema(FixedSchemaSourceSpec),
    #[serde(rename = "sql_inserts")]
    SqlInserts(SqlInsertSourceSpec),
}

impl SourceSpec {
    pub fn id(&self) -> &str {
        match self {
            SourceSpec::Delimited(s) => &s.id,
            SourceSpec::FixedSchema(s) => &s.id,
            SourceSpec::SqlInserts(s) => &s.id,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            SourceSpec::Delimited(s) => &s.path,
            SourceSpec::FixedSchema(s) => &s.path,
            SourceSpec::SqlInserts(s) => &s.path,
        }
    }

    fn batch_rows(&self) -> usize {
        match self {
            SourceSpec::Delimited(s) => s.batch_rows,
            SourceSpec::FixedSchema(s) => s.batch_rows,
            SourceSpec::SqlInserts(s) => s.batch_rows,
        }
    }

    /// Same source with its path resolved against `raw_dir`
    pub fn resolved(&self, raw_dir: &Path) -> SourceSpec {
        let mut spec = self.clone();
        let path = match &mut spec {
            SourceSpec::Delimited(s) => &mut s.path,
            SourceSpec::FixedSchema(s) => &mut s.path,
            SourceSpec::SqlInserts(s) => &mut s.path,
        };
        *path = raw_dir.join(&*path);
        spec
    }
}

impl PipelineSpec {
    /// The three-source customer pipeline with default locations
    pub fn clientes(raw_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "clientes".to_string(),
            raw_dir: raw_dir.into(),
            bronze_dir: default_bronze_dir(),
            silver_dir: default_silver_dir(),
            silver_table: default_silver_table(),
            preview_rows: default_preview_rows(),
            channel_capacity: default_channel_capacity(),
            sources: vec![
                SourceSpec::Delimited(DelimitedSourceSpec {
                    id: tables::INFO_TABLE.to_string(),
                    path: PathBuf::from("clientes_info.csv"),
                    delimiter: default_delimiter(),
                    batch_rows: default_batch_rows(),
                }),
                SourceSpec::FixedSchema(FixedSchemaSourceSpec {
                    id: tables::EXTRA_TABLE.to_string(),
                    path: PathBuf::from("clientes_extra.txt"),
                    delimiter: default_delimiter(),
                    fields: tables::extra_fields(),
                    batch_rows: default_batch_rows(),
                }),
                SourceSpec::SqlInserts(SqlInsertSourceSpec {
                    id: tables::ANCHOR_TABLE.to_string(),
                    path: PathBuf::from("clientes.sql"),
                    table: None,
                    fields: tables::statement_fields(),
                    batch_rows: default_batch_rows(),
                }),
            ],
        }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let spec: PipelineSpec = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject specifications that cannot produce a consistent run
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sources.is_empty() {
            return Err(PipelineError::InvalidConfig("no sources declared".into()));
        }
        if self.channel_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "channel_capacity must be positive".into(),
            ));
        }
        if self.silver_table.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("silver_table is empty".into()));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let id = source.id();
            if id.trim().is_empty() {
                return Err(PipelineError::InvalidConfig("source with empty id".into()));
            }
            if !seen.insert(id) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate source id `{id}`"
                )));
            }
            if source.batch_rows() == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "source `{id}`: batch_rows must be positive"
                )));
            }
            match source {
                SourceSpec::FixedSchema(s) => {
                    if s.fields.is_empty() {
                        return Err(PipelineError::InvalidConfig(format!(
                            "source `{id}` declares no fields"
                        )));
                    }
                    fields_to_schema(&s.fields)?;
                }
                SourceSpec::SqlInserts(s) => {
                    if s.fields.is_empty() {
                        return Err(PipelineError::InvalidConfig(format!(
                            "source `{id}` declares no fields"
                        )));
                    }
                    fields_to_schema(&s.fields)?;
                }
                SourceSpec::Delimited(_) => {}
            }
        }
        Ok(())
    }

    /// Location of the bronze table produced by `source_id`
    pub fn bronze_path(&self, source_id: &str) -> PathBuf {
        self.bronze_dir.join(format!("{source_id}.parquet"))
    }

    /// Location of the consolidated table
    pub fn silver_path(&self) -> PathBuf {
        self.silver_dir.join(format!("{}.parquet", self.silver_table))
    }
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_bronze_dir() -> PathBuf {
    PathBuf::from("bronze").join("ventas")
}

fn default_silver_dir() -> PathBuf {
    PathBuf::from("silver").join("ventas")
}

fn default_silver_table() -> String {
    tables::SILVER_TABLE.to_string()
}

fn default_preview_rows() -> usize {
    5
}

fn default_channel_capacity() -> usize {
    8
}

fn default_delimiter() -> char {
    ','
}

fn default_nullable() -> bool {
    true
}

/// Default batch size for source operators
fn default_batch_rows() -> usize {
    65536
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml_with_defaults() -> anyhow::Result<()> {
        let yaml = r#"
name: "clientes"
raw_dir: "raw"
sources:
  - type: delimited_header
    id: "clientes_info"
    path: "clientes_info.csv"
  - type: fixed_schema
    id: "clientes_extra"
    path: "clientes_extra.txt"
  - type: sql_inserts
    id: "clientes_sql"
    path: "clientes.sql"
    table: "clientes"
"#;
        let spec = PipelineSpec::from_yaml_str(yaml)?;
        assert_eq!(spec.raw_dir, PathBuf::from("raw"));
        assert_eq!(spec.preview_rows, 5);
        assert_eq!(spec.channel_capacity, 8);
        assert_eq!(
            spec.silver_path(),
            PathBuf::from("silver/ventas/clientes_consolidado.parquet")
        );

        match &spec.sources[1] {
            SourceSpec::FixedSchema(s) => {
                assert_eq!(s.delimiter, ',');
                assert_eq!(s.fields, tables::extra_fields());
            }
            other => panic!("unexpected source {other:?}"),
        }
        match &spec.sources[2] {
            SourceSpec::SqlInserts(s) => {
                assert_eq!(s.table.as_deref(), Some("clientes"));
                assert_eq!(s.fields.len(), 7);
            }
            other => panic!("unexpected source {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut spec = PipelineSpec::clientes(".");
        let dup = spec.sources[0].clone();
        spec.sources.push(dup);
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate source id"));
    }

    #[test]
    fn rejects_unknown_field_type() {
        let mut spec = PipelineSpec::clientes(".");
        if let SourceSpec::FixedSchema(s) = &mut spec.sources[1] {
            s.fields[0].data_type = "decimal".into();
        }
        assert!(matches!(
            spec.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn resolves_relative_paths_only() {
        let spec = PipelineSpec::clientes("/data/raw");
        let resolved = spec.sources[0].resolved(&spec.raw_dir);
        assert_eq!(resolved.path(), Path::new("/data/raw/clientes_info.csv"));

        let absolute = SourceSpec::Delimited(DelimitedSourceSpec {
            id: "x".into(),
            path: PathBuf::from("/elsewhere/x.csv"),
            delimiter: ';',
            batch_rows: 10,
        });
        assert_eq!(
            absolute.resolved(Path::new("/data/raw")).path(),
            Path::new("/elsewhere/x.csv")
        );
    }

    #[test]
    fn recoverable_errors_are_adapter_local() {
        let missing = PipelineError::SourceMissing {
            source_id: "clientes_sql".into(),
            path: PathBuf::from("clientes.sql"),
        };
        assert!(missing.is_recoverable());
        let read = PipelineError::BronzeReadFailure {
            table: "clientes_sql".into(),
            reason: "not produced".into(),
        };
        assert!(!read.is_recoverable());
    }
}
