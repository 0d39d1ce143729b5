use anyhow::{Context, Result};
use datafusion::arrow::array::{AsArray, RecordBatch};
use datafusion::arrow::datatypes::{Int64Type, SchemaRef};
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use medallion_core::{tables, PipelineError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One side of the join: a bronze table, its key and the columns it contributes
struct JoinSide {
    table: &'static str,
    key: &'static str,
    columns: &'static [&'static str],
}

const ANCHOR: JoinSide = JoinSide {
    table: tables::ANCHOR_TABLE,
    key: tables::ANCHOR_KEY,
    columns: &[
        "nombre",
        "apellido",
        "rut",
        "comuna",
        "fecha_nacimiento",
        "religion",
    ],
};

const INFO: JoinSide = JoinSide {
    table: tables::INFO_TABLE,
    key: tables::OPTIONAL_KEY,
    columns: &[
        "tipo_cliente",
        "promedio_compras",
        "tipo_alimentacion",
        "tiempo_permanencia_min",
    ],
};

const EXTRA: JoinSide = JoinSide {
    table: tables::EXTRA_TABLE,
    key: tables::OPTIONAL_KEY,
    columns: &["canal_registro", "fecha_registro"],
};

/// Info columns that arrive as text and are numeric in the joined table
const NUMERIC_COLUMNS: &[(&str, &str)] = &[
    ("promedio_compras", "DOUBLE"),
    ("tiempo_permanencia_min", "BIGINT"),
];

/// Locations of the three bronze tables
#[derive(Debug, Clone)]
pub struct BronzeTables {
    pub anchor: PathBuf,
    pub info: PathBuf,
    pub extra: PathBuf,
}

impl BronzeTables {
    /// Default file names under one bronze directory
    pub fn in_dir(dir: &Path) -> Self {
        let file = |table: &str| dir.join(format!("{table}.parquet"));
        Self {
            anchor: file(tables::ANCHOR_TABLE),
            info: file(tables::INFO_TABLE),
            extra: file(tables::EXTRA_TABLE),
        }
    }
}

/// Key quality of one bronze table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStats {
    pub rows: u64,
    /// Rows whose key is null or not an integer; they never match
    pub key_cast_failures: u64,
    /// Rows collapsed because another row has the same key
    pub duplicate_keys: u64,
}

/// Result of the join, one row per anchor key, ordered by `id_cliente`
pub struct UnifiedTable {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub key_stats: Vec<(String, KeyStats)>,
}

impl UnifiedTable {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

/// Joins the bronze tables through DataFusion
///
/// The statement-derived table is the anchor: every anchor key yields exactly
/// one row, with the info and extra columns null when the key has no match.
pub struct Unifier {
    ctx: SessionContext,
}

impl Default for Unifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Unifier {
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
        }
    }

    pub async fn unify(&self, bronze: &BronzeTables) -> Result<UnifiedTable> {
        for (side, path) in [
            (&ANCHOR, &bronze.anchor),
            (&INFO, &bronze.info),
            (&EXTRA, &bronze.extra),
        ] {
            self.register(side, path).await?;
        }

        let mut key_stats = Vec::with_capacity(3);
        for side in [&ANCHOR, &INFO, &EXTRA] {
            let stats = self.key_stats(side).await?;
            if stats.key_cast_failures > 0 {
                warn!(
                    table = side.table,
                    failures = stats.key_cast_failures,
                    "keys not castable to integer; rows cannot join"
                );
            }
            if stats.duplicate_keys > 0 {
                warn!(
                    table = side.table,
                    duplicates = stats.duplicate_keys,
                    "duplicate keys collapsed to one row"
                );
            }
            key_stats.push((side.table.to_string(), stats));
        }

        let sql = join_sql();
        debug!(%sql, "unification query");
        let df = self
            .ctx
            .sql(&sql)
            .await
            .context("planning unification query")?;
        let schema: SchemaRef = Arc::new(df.schema().as_arrow().clone());
        let batches = df.collect().await.context("executing unification query")?;

        let table = UnifiedTable {
            schema,
            batches,
            key_stats,
        };
        info!(rows = table.num_rows(), "bronze tables unified");
        Ok(table)
    }

    async fn register(&self, side: &JoinSide, path: &Path) -> Result<(), PipelineError> {
        let failure = |reason: String| PipelineError::BronzeReadFailure {
            table: side.table.to_string(),
            reason,
        };

        if !path.is_file() {
            return Err(failure(format!("{} does not exist", path.display())));
        }
        let location = path
            .to_str()
            .ok_or_else(|| failure(format!("{} is not valid UTF-8", path.display())))?;

        self.ctx
            .deregister_table(side.table)
            .map_err(|e| failure(e.to_string()))?;
        self.ctx
            .register_parquet(side.table, location, ParquetReadOptions::default())
            .await
            .map_err(|e| failure(e.to_string()))?;

        let df = self
            .ctx
            .table(side.table)
            .await
            .map_err(|e| failure(e.to_string()))?;
        let schema = df.schema().as_arrow();
        for column in std::iter::once(&side.key).chain(side.columns) {
            if schema.column_with_name(column).is_none() {
                return Err(failure(format!("missing column `{column}`")));
            }
        }

        // read every joined column once so corrupt pages surface here, per table
        let columns = std::iter::once(&side.key)
            .chain(side.columns)
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        self.ctx
            .sql(&format!("SELECT {columns} FROM {}", side.table))
            .await
            .map_err(|e| failure(e.to_string()))?
            .collect()
            .await
            .map_err(|e| failure(e.to_string()))?;
        debug!(table = side.table, path = %path.display(), "bronze table registered");
        Ok(())
    }

    async fn key_stats(&self, side: &JoinSide) -> Result<KeyStats> {
        let sql = format!(
            "SELECT COUNT(*) AS total, COUNT(k) AS keyed, COUNT(DISTINCT k) AS distinct_keys \
             FROM (SELECT {} AS k FROM {}) keys",
            key_expr(side.key),
            side.table
        );
        let failure = |e: datafusion::error::DataFusionError| PipelineError::BronzeReadFailure {
            table: side.table.to_string(),
            reason: e.to_string(),
        };
        let batches = self
            .ctx
            .sql(&sql)
            .await
            .map_err(failure)?
            .collect()
            .await
            .map_err(failure)?;
        let batch = batches
            .iter()
            .find(|b| b.num_rows() > 0)
            .with_context(|| format!("no key statistics for `{}`", side.table))?;
        let count = |idx: usize| batch.column(idx).as_primitive::<Int64Type>().value(0) as u64;

        let (total, keyed, distinct) = (count(0), count(1), count(2));
        Ok(KeyStats {
            rows: total,
            key_cast_failures: total - keyed,
            duplicate_keys: keyed - distinct,
        })
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Integer key of any bronze column; non-numeric text becomes null
fn key_expr(column: &str) -> String {
    format!("TRY_CAST(TRIM(CAST({} AS VARCHAR)) AS INT)", quote(column))
}

/// One row per castable key; ties broken on the contributed columns
fn deduplicated(side: &JoinSide) -> String {
    let columns = side
        .columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT k, {columns} FROM (\
            SELECT k, {columns}, ROW_NUMBER() OVER (PARTITION BY k ORDER BY {columns}) AS rn \
            FROM (SELECT {key} AS k, {columns} FROM {table}) keyed\
         ) ranked WHERE rn = 1 AND k IS NOT NULL",
        key = key_expr(side.key),
        table = side.table,
    )
}

fn join_sql() -> String {
    let mut select = vec!["a.k AS id_cliente".to_string()];
    select.extend(ANCHOR.columns.iter().map(|c| format!("a.{0} AS {0}", quote(c))));
    select.extend(INFO.columns.iter().map(|c| {
        match NUMERIC_COLUMNS.iter().find(|(name, _)| name == c) {
            Some((_, sql_type)) => format!(
                "TRY_CAST(TRIM(CAST(i.{0} AS VARCHAR)) AS {1}) AS {0}",
                quote(c),
                sql_type
            ),
            None => format!("i.{0} AS {0}", quote(c)),
        }
    }));
    select.extend(EXTRA.columns.iter().map(|c| format!("e.{0} AS {0}", quote(c))));

    format!(
        "WITH anchor_rows AS ({}), info_rows AS ({}), extra_rows AS ({}) \
         SELECT {} \
         FROM anchor_rows a \
         LEFT JOIN info_rows i ON a.k = i.k \
         LEFT JOIN extra_rows e ON a.k = e.k \
         ORDER BY id_cliente",
        deduplicated(&ANCHOR),
        deduplicated(&INFO),
        deduplicated(&EXTRA),
        select.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{ArrayRef, Int32Array, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use medallion_io::sink_parquet::write_parquet_atomic;

    fn text_table(path: &Path, columns: &[(&str, Vec<Option<&str>>)]) -> Result<()> {
        let schema = Arc::new(Schema::new(
            columns
                .iter()
                .map(|(name, _)| Field::new(*name, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ));
        let arrays = columns
            .iter()
            .map(|(_, values)| Arc::new(StringArray::from(values.clone())) as ArrayRef)
            .collect();
        let batch = RecordBatch::try_new(schema.clone(), arrays)?;
        write_parquet_atomic(path, schema, &[batch])?;
        Ok(())
    }

    fn write_bronze(dir: &Path) -> Result<BronzeTables> {
        let bronze = BronzeTables::in_dir(dir);
        text_table(
            &bronze.anchor,
            &[
                ("codigo", vec![Some("1"), Some("2"), Some("3"), Some("x"), Some("2")]),
                ("nombre", vec![Some("ana"), Some("luis"), Some("eva"), Some("bad"), Some("luis")]),
                ("apellido", vec![Some("soto"), Some("rojas"), Some("diaz"), None, Some("rojas")]),
                ("comuna", vec![Some("ñuñoa"), None, None, None, None]),
                ("rut", vec![Some("1-1"), Some("2-2"), Some("3-3"), None, Some("2-2")]),
                ("fecha_nacimiento", vec![Some("1990-05-01"), None, None, None, None]),
                ("religion", vec![Some("CATOLICO"), None, None, None, None]),
            ],
        )?;
        text_table(
            &bronze.info,
            &[
                ("codigo_cliente", vec![Some(" 1"), Some("3"), Some("99")]),
                ("tipo_cliente", vec![Some("premium"), Some("regular"), Some("nuevo")]),
                ("promedio_compras", vec![Some("10.5"), Some("n/a"), Some("1")]),
                ("tipo_alimentacion", vec![Some("VEGANO"), None, None]),
                ("tiempo_permanencia_min", vec![Some("45"), Some("12"), Some("3")]),
                ("edad", vec![Some("30"), Some("40"), Some("50")]),
            ],
        )?;

        let extra_schema = Arc::new(Schema::new(vec![
            Field::new("codigo_cliente", DataType::Int32, true),
            Field::new("canal_registro", DataType::Utf8, true),
            Field::new("codigo_interno", DataType::Utf8, true),
            Field::new("fecha_registro", DataType::Utf8, true),
        ]));
        let extra = RecordBatch::try_new(
            extra_schema.clone(),
            vec![
                Arc::new(Int32Array::from(vec![Some(2), None])),
                Arc::new(StringArray::from(vec![Some("APP"), Some("WEB")])),
                Arc::new(StringArray::from(vec![Some("XMOR2"), Some("XMOR0")])),
                Arc::new(StringArray::from(vec![Some("2025-01-06"), Some("2025-01-07")])),
            ],
        )?;
        write_parquet_atomic(&bronze.extra, extra_schema, &[extra])?;
        Ok(bronze)
    }

    fn column_strings(table: &UnifiedTable, name: &str) -> Vec<Option<String>> {
        let mut out = Vec::new();
        for batch in &table.batches {
            let idx = batch.schema().index_of(name).unwrap();
            let utf8 = datafusion::arrow::compute::cast(batch.column(idx), &DataType::Utf8).unwrap();
            let strings = utf8.as_string::<i32>();
            out.extend(strings.iter().map(|v| v.map(str::to_string)));
        }
        out
    }

    #[tokio::test]
    async fn left_joins_on_the_anchor_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bronze = write_bronze(dir.path())?;

        let table = Unifier::new().unify(&bronze).await?;
        let names: Vec<_> = table.schema.fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(
            names,
            [
                "id_cliente",
                "nombre",
                "apellido",
                "rut",
                "comuna",
                "fecha_nacimiento",
                "religion",
                "tipo_cliente",
                "promedio_compras",
                "tipo_alimentacion",
                "tiempo_permanencia_min",
                "canal_registro",
                "fecha_registro",
            ]
        );

        // "x" cannot be cast and the duplicate 2 collapses
        assert_eq!(
            column_strings(&table, "id_cliente"),
            vec![Some("1".into()), Some("2".into()), Some("3".into())]
        );
        assert_eq!(
            column_strings(&table, "tipo_cliente"),
            vec![Some("premium".into()), None, Some("regular".into())]
        );
        assert_eq!(
            column_strings(&table, "canal_registro"),
            vec![None, Some("APP".into()), None]
        );

        let idx = table.schema.index_of("promedio_compras")?;
        assert_eq!(table.schema.field(idx).data_type(), &DataType::Float64);
        assert_eq!(
            column_strings(&table, "promedio_compras"),
            vec![Some("10.5".into()), None, None]
        );

        let anchor = &table.key_stats[0].1;
        assert_eq!(anchor.rows, 5);
        assert_eq!(anchor.key_cast_failures, 1);
        assert_eq!(anchor.duplicate_keys, 1);
        assert_eq!(table.key_stats[2].1.key_cast_failures, 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_bronze_table_is_a_read_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bronze = write_bronze(dir.path())?;
        std::fs::remove_file(&bronze.info)?;

        let err = Unifier::new().unify(&bronze).await.err().unwrap();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::BronzeReadFailure { table, .. }) => {
                assert_eq!(table, tables::INFO_TABLE)
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_projected_column_is_a_read_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bronze = write_bronze(dir.path())?;
        text_table(&bronze.info, &[("codigo_cliente", vec![Some("1")])])?;

        let err = Unifier::new().unify(&bronze).await.err().unwrap();
        assert!(err.to_string().contains("missing column `tipo_cliente`"));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_bronze_pages_are_a_read_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bronze = write_bronze(dir.path())?;

        // footer intact, first page header overwritten
        let mut bytes = std::fs::read(&bronze.info)?;
        bytes[4..20].fill(0xFF);
        std::fs::write(&bronze.info, bytes)?;

        let err = Unifier::new().unify(&bronze).await.err().unwrap();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::BronzeReadFailure { table, .. }) => {
                assert_eq!(table, tables::INFO_TABLE)
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }
}
