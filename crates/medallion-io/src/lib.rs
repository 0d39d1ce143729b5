//! # Medallion I/O - Source Adapters and Table Sinks
//!
//! Concrete operators for the bronze and silver stages.
//!
//! ### Data Sources
//! - **Delimited with header**: every column read as text, header names the columns
//! - **Fixed schema**: headerless delimited file mapped positionally onto declared types
//! - **SQL inserts**: `INSERT INTO ... VALUES (...);` lines parsed by a dedicated tokenizer
//!
//! ### Data Sinks
//! - **Parquet table**: whole-table overwrite through a temporary file and an atomic rename
//! - **Preview**: schema and first rows printed to stdout
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use medallion_core::{Operator, PipelineSpec};
//! use medallion_io::{build_source, sink_parquet::ParquetTableSink};
//!
//! # fn example() -> anyhow::Result<()> {
//! let spec = PipelineSpec::clientes("raw");
//! let source = build_source(&spec.sources[0].resolved(&spec.raw_dir))?;
//! let sink = ParquetTableSink::new(
//!     source.name().to_string(),
//!     spec.bronze_path(source.name()),
//!     source.schema(),
//! );
//! # Ok(())
//! # }
//! ```

use medallion_core::{PipelineError, Source, SourceSpec};
use std::path::Path;

/// Shared text-rows to Arrow batch conversion
pub mod rows;

/// Headed delimited file source
pub mod source_delimited;

/// Headerless positional file source
pub mod source_fixed;

/// Insertion statement source
pub mod source_sql;

/// Tokenizer for the supported insertion statement shape
pub mod statement;

/// Atomic Parquet table sink
pub mod sink_parquet;

/// Standard output preview sink
pub mod sink_stdout;

/// Instantiate the adapter selected by the configuration variant
pub fn build_source(spec: &SourceSpec) -> anyhow::Result<Box<dyn Source>> {
    let source: Box<dyn Source> = match spec {
        SourceSpec::Delimited(s) => {
            Box::new(source_delimited::DelimitedHeaderSource::try_new(s.clone())?)
        }
        SourceSpec::FixedSchema(s) => Box::new(source_fixed::FixedSchemaSource::try_new(s.clone())?),
        SourceSpec::SqlInserts(s) => Box::new(source_sql::SqlInsertSource::try_new(s.clone())?),
    };
    Ok(source)
}

pub(crate) fn ensure_exists(source_id: &str, path: &Path) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::SourceMissing {
            source_id: source_id.to_string(),
            path: path.to_path_buf(),
        })
    }
}

pub(crate) fn delimiter_byte(source_id: &str, delimiter: char) -> Result<u8, PipelineError> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        Err(PipelineError::InvalidConfig(format!(
            "source `{source_id}`: delimiter {delimiter:?} is not a single-byte character"
        )))
    }
}
