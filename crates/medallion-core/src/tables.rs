//! Canonical table names and declared raw schemas of the customer pipeline.

use crate::FieldConfig;

/// Bronze table fed by the headed CSV file
pub const INFO_TABLE: &str = "clientes_info";

/// Bronze table fed by the headerless positional file
pub const EXTRA_TABLE: &str = "clientes_extra";

/// Bronze table fed by the insertion statements; anchor of every join
pub const ANCHOR_TABLE: &str = "clientes_sql";

/// Consolidated silver table
pub const SILVER_TABLE: &str = "clientes_consolidado";

/// Join key column of the anchor table
pub const ANCHOR_KEY: &str = "codigo";

/// Join key column of both optional tables
pub const OPTIONAL_KEY: &str = "codigo_cliente";

/// Value substituted for missing categorical text
pub const MISSING_TEXT: &str = "sin_dato";

/// Positional schema of `clientes_extra.txt`
pub fn extra_fields() -> Vec<FieldConfig> {
    vec![
        FieldConfig::new(OPTIONAL_KEY, "int32"),
        FieldConfig::new("canal_registro", "string"),
        FieldConfig::new("codigo_interno", "string"),
        // kept as text; parsed during normalization
        FieldConfig::new("fecha_registro", "string"),
    ]
}

/// Literal order of the `INSERT INTO clientes VALUES (...)` statements
pub fn statement_fields() -> Vec<FieldConfig> {
    [
        ANCHOR_KEY,
        "nombre",
        "apellido",
        "comuna",
        "rut",
        "fecha_nacimiento",
        "religion",
    ]
    .into_iter()
    .map(|name| FieldConfig::new(name, "string"))
    .collect()
}
