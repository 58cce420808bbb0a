//! View definitions and generated DDL
//!
//! A view definition declares source filters, tables, columns, and indexes.
//! Each view owns a physical schema `view_<name>` with one table per logical
//! table; every table carries the auto columns `_id`, `_block_height`,
//! `_tx_id`, `_created_at` ahead of the user columns.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use secondlayer_core::filters::StreamFilters;
use secondlayer_core::{Error, Result};
use secondlayer_storage::views::safe_ident;

/// Column types a view table may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Bigint,
    Boolean,
    Numeric,
    Jsonb,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Bigint => "BIGINT",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Numeric => "NUMERIC",
            ColumnType::Jsonb => "JSONB",
            ColumnType::Timestamp => "TIMESTAMPTZ",
        }
    }
}

/// One user column
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub column_type: ColumnType,

    /// Whether a single-column index is created
    #[serde(default)]
    pub indexed: bool,

    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// One logical table inside the view schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,

    /// Declared composite indexes (each a list of column names)
    #[serde(default)]
    pub composite_indexes: Vec<Vec<String>>,

    /// Unique constraints; these are the upsert conflict targets
    #[serde(default)]
    pub unique_constraints: Vec<Vec<String>>,

    /// Event type the generic table-mapping handler feeds this table from;
    /// the literal "transactions" maps matched transactions instead.
    #[serde(default)]
    pub source: Option<String>,
}

/// A complete view definition as stored in the registry row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewDefinition {
    /// Which transactions/events feed the view
    #[serde(default)]
    pub sources: StreamFilters,

    pub tables: Vec<TableDefinition>,
}

impl ViewDefinition {
    /// Parse a stored definition, refusing unknown shapes
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let definition: ViewDefinition = serde_json::from_value(value.clone())
            .map_err(|e| Error::validation(format!("invalid view definition: {}", e)))?;
        if definition.tables.is_empty() {
            return Err(Error::validation("view definition declares no tables"));
        }
        Ok(definition)
    }

    /// Stable hash over the definition. A stored hash differing from this is
    /// a migration event: the processor records it and pauses the view.
    pub fn definition_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Names of the tables, for rewind deletes
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Physical schema name for a view
pub fn schema_name_for(view_name: &str) -> String {
    format!("view_{}", view_name)
}

/// Generate all DDL for a view's tables inside its schema. Identifiers are
/// validated before interpolation.
pub fn generate_ddl(schema_name: &str, definition: &ViewDefinition) -> Result<Vec<String>> {
    let schema = safe_ident(schema_name)?;
    let mut statements = Vec::new();

    for table in &definition.tables {
        let table_name = safe_ident(&table.name)?;

        let mut columns = vec![
            "_id BIGSERIAL PRIMARY KEY".to_string(),
            "_block_height BIGINT NOT NULL".to_string(),
            "_tx_id TEXT NOT NULL".to_string(),
            "_created_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string(),
        ];
        for column in &table.columns {
            let name = safe_ident(&column.name)?;
            if name.starts_with('_') {
                return Err(Error::validation(format!(
                    "column {:?} collides with auto columns",
                    column.name
                )));
            }
            let nullable = if column.nullable { "" } else { " NOT NULL" };
            columns.push(format!("\"{}\" {}{}", name, column.column_type.sql_type(), nullable));
        }

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS \"{}\".\"{}\" ({})",
            schema,
            table_name,
            columns.join(", ")
        ));

        // Auto-column indexes every table gets
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{t}__block_height\" ON \"{s}\".\"{t}\" (_block_height)",
            s = schema,
            t = table_name
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{t}__tx_id\" ON \"{s}\".\"{t}\" (_tx_id)",
            s = schema,
            t = table_name
        ));

        for column in table.columns.iter().filter(|c| c.indexed) {
            let name = safe_ident(&column.name)?;
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{t}_{c}\" ON \"{s}\".\"{t}\" (\"{c}\")",
                s = schema,
                t = table_name,
                c = name
            ));
        }

        for (i, composite) in table.composite_indexes.iter().enumerate() {
            let cols = quoted_columns(composite)?;
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{t}_composite_{i}\" ON \"{s}\".\"{t}\" ({cols})",
                s = schema,
                t = table_name,
                i = i,
                cols = cols
            ));
        }

        for (i, unique) in table.unique_constraints.iter().enumerate() {
            let cols = quoted_columns(unique)?;
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS \"uq_{t}_{i}\" ON \"{s}\".\"{t}\" ({cols})",
                s = schema,
                t = table_name,
                i = i,
                cols = cols
            ));
        }
    }

    Ok(statements)
}

fn quoted_columns(names: &[String]) -> Result<String> {
    if names.is_empty() {
        return Err(Error::validation("index declares no columns"));
    }
    let quoted: Result<Vec<String>> = names
        .iter()
        .map(|n| safe_ident(n).map(|n| format!("\"{}\"", n)))
        .collect();
    Ok(quoted?.join(", "))
}
