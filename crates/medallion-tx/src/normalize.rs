use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use datafusion::arrow::array::{
    Array, ArrayRef, AsArray, Date32Array, Float64Array, Int32Array, Int64Array, RecordBatch,
    StringArray,
};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{
    DataType, Date32Type, Field, Float64Type, Int32Type, Int64Type, Schema, SchemaRef,
};
use medallion_core::tables::MISSING_TEXT;
use std::collections::HashMap;
use std::sync::Arc;

static VERBATIM: ColumnRule = ColumnRule::Verbatim;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetterCase {
    Title,
    Lower,
    Keep,
}

/// Cleaning rule of one column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRule {
    /// Trim, fold case, then replace nulls with `default` when set
    Text {
        case: LetterCase,
        default: Option<&'static str>,
    },
    /// `YYYY-MM-DD` to Date32; anything else is null
    Date,
    /// Cast to the numeric type and replace nulls with zero
    ZeroFilled(DataType),
    /// Values untouched, column declared non-nullable
    Identifier,
    /// Values untouched; string encodings are emitted as Utf8
    Verbatim,
}

/// Rule table of the consolidated customer table
pub fn silver_rules() -> Vec<(&'static str, ColumnRule)> {
    let title = ColumnRule::Text {
        case: LetterCase::Title,
        default: None,
    };
    let category = ColumnRule::Text {
        case: LetterCase::Lower,
        default: Some(MISSING_TEXT),
    };
    vec![
        ("id_cliente", ColumnRule::Identifier),
        ("nombre", title.clone()),
        ("apellido", title.clone()),
        ("comuna", title),
        (
            "rut",
            ColumnRule::Text {
                case: LetterCase::Keep,
                default: None,
            },
        ),
        ("fecha_nacimiento", ColumnRule::Date),
        ("religion", category.clone()),
        ("tipo_cliente", ColumnRule::Verbatim),
        ("promedio_compras", ColumnRule::ZeroFilled(DataType::Float64)),
        ("tipo_alimentacion", category.clone()),
        ("tiempo_permanencia_min", ColumnRule::ZeroFilled(DataType::Int64)),
        ("canal_registro", category),
        ("fecha_registro", ColumnRule::Date),
    ]
}

/// Applies a column rule table to whole batches
///
/// Rules are pure per-column transforms; columns without a rule pass through
/// as [`ColumnRule::Verbatim`].
pub struct Normalizer {
    rules: HashMap<String, ColumnRule>,
}

impl Normalizer {
    pub fn new<'a>(rules: impl IntoIterator<Item = (&'a str, ColumnRule)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(name, rule)| (name.to_string(), rule))
                .collect(),
        }
    }

    pub fn silver() -> Self {
        Self::new(silver_rules())
    }

    pub fn rule_for(&self, column: &str) -> &ColumnRule {
        self.rules.get(column).unwrap_or(&VERBATIM)
    }

    /// Schema produced for an input schema
    pub fn output_schema(&self, input: &Schema) -> SchemaRef {
        let fields: Vec<Field> = input
            .fields()
            .iter()
            .map(|f| {
                let (data_type, nullable) = match self.rule_for(f.name()) {
                    ColumnRule::Text { default, .. } => (DataType::Utf8, default.is_none()),
                    ColumnRule::Date => (DataType::Date32, true),
                    ColumnRule::ZeroFilled(t) => (t.clone(), false),
                    ColumnRule::Identifier => (f.data_type().clone(), false),
                    ColumnRule::Verbatim if is_string(f.data_type()) => {
                        (DataType::Utf8, f.is_nullable())
                    }
                    ColumnRule::Verbatim => (f.data_type().clone(), f.is_nullable()),
                };
                Field::new(f.name(), data_type, nullable)
            })
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// Normalize every batch of a table against one output schema
    pub fn normalize_table(
        &self,
        input: &Schema,
        batches: &[RecordBatch],
    ) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let schema = self.output_schema(input);
        let batches = batches
            .iter()
            .map(|b| self.normalize_batch(b, schema.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok((schema, batches))
    }

    fn normalize_batch(&self, batch: &RecordBatch, schema: SchemaRef) -> Result<RecordBatch> {
        let columns = batch
            .schema()
            .fields()
            .iter()
            .zip(batch.columns())
            .map(|(field, array)| {
                self.rule_for(field.name())
                    .apply(array)
                    .with_context(|| format!("normalizing column `{}`", field.name()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordBatch::try_new(schema, columns)?)
    }
}

impl ColumnRule {
    pub fn apply(&self, array: &ArrayRef) -> Result<ArrayRef> {
        match self {
            ColumnRule::Text { case, default } => {
                let utf8 = cast(array, &DataType::Utf8)?;
                let out: StringArray = utf8
                    .as_string::<i32>()
                    .iter()
                    .map(|v| {
                        v.map(|s| fold_case(s.trim(), *case))
                            .or_else(|| default.map(str::to_string))
                    })
                    .collect();
                Ok(Arc::new(out))
            }
            ColumnRule::Date => {
                let utf8 = cast(array, &DataType::Utf8)?;
                let out: Date32Array = utf8
                    .as_string::<i32>()
                    .iter()
                    .map(|v| v.and_then(parse_date))
                    .collect();
                Ok(Arc::new(out))
            }
            ColumnRule::ZeroFilled(data_type) => {
                let typed = cast(array, data_type)?;
                let out: ArrayRef = match data_type {
                    DataType::Float64 => Arc::new(
                        typed
                            .as_primitive::<Float64Type>()
                            .iter()
                            .map(|v| Some(v.unwrap_or(0.0)))
                            .collect::<Float64Array>(),
                    ),
                    DataType::Int64 => Arc::new(
                        typed
                            .as_primitive::<Int64Type>()
                            .iter()
                            .map(|v| Some(v.unwrap_or(0)))
                            .collect::<Int64Array>(),
                    ),
                    DataType::Int32 => Arc::new(
                        typed
                            .as_primitive::<Int32Type>()
                            .iter()
                            .map(|v| Some(v.unwrap_or(0)))
                            .collect::<Int32Array>(),
                    ),
                    other => bail!("zero filling is not defined for {other}"),
                };
                Ok(out)
            }
            ColumnRule::Identifier => Ok(array.clone()),
            ColumnRule::Verbatim if is_string(array.data_type()) => {
                Ok(cast(array, &DataType::Utf8)?)
            }
            ColumnRule::Verbatim => Ok(array.clone()),
        }
    }
}

fn is_string(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
    )
}

fn fold_case(s: &str, case: LetterCase) -> String {
    match case {
        LetterCase::Title => title_case(s),
        LetterCase::Lower => s.to_lowercase(),
        LetterCase::Keep => s.to_string(),
    }
}

/// Upper-case the first letter of every whitespace-separated word, lower-case the rest
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut word_start = true;
    for c in s.chars() {
        if c.is_whitespace() {
            word_start = true;
            out.push(c);
        } else if word_start {
            word_start = false;
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Days since the Unix epoch for a strict `YYYY-MM-DD` date
pub fn parse_date(s: &str) -> Option<i32> {
    let s = s.trim();
    let b = s.as_bytes();
    let shaped = b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit());
    if !shaped {
        return None;
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(Date32Type::from_naive_date(date))
}
