//! View handlers: the capability interface user transformations run behind
//!
//! A handler receives one block's matched data and a context scoped to its
//! view's schema. Handlers are compiled in and resolved by identifier
//! through the registry; the generic table-mapping handler ships as the
//! default binding.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{PgConnection, QueryBuilder};
use tracing::debug;

use secondlayer_core::types::{BlockRecord, EventRecord, TransactionRecord};
use secondlayer_core::{Error, Result};
use secondlayer_storage::views::safe_ident;

use crate::schema::ViewDefinition;

/// Insert/upsert API scoped to one view's physical schema, valid for the
/// duration of one block transaction.
pub struct ViewContext<'a> {
    conn: &'a mut PgConnection,
    schema_name: &'a str,
    definition: &'a ViewDefinition,
    block_height: i64,
}

impl<'a> ViewContext<'a> {
    pub fn new(
        conn: &'a mut PgConnection,
        schema_name: &'a str,
        definition: &'a ViewDefinition,
        block_height: i64,
    ) -> Self {
        Self {
            conn,
            schema_name,
            definition,
            block_height,
        }
    }

    pub fn definition(&self) -> &ViewDefinition {
        self.definition
    }

    /// Insert one row. `values` maps user column names to JSON values.
    pub async fn insert(
        &mut self,
        table: &str,
        tx_id: &str,
        values: &Map<String, Value>,
    ) -> Result<()> {
        self.write(table, tx_id, values, None).await
    }

    /// Upsert one row on the given conflict columns, which must be covered
    /// by one of the table's declared unique constraints.
    pub async fn upsert(
        &mut self,
        table: &str,
        tx_id: &str,
        values: &Map<String, Value>,
        conflict_columns: &[&str],
    ) -> Result<()> {
        if conflict_columns.is_empty() {
            return Err(Error::validation("upsert requires conflict columns"));
        }
        self.write(table, tx_id, values, Some(conflict_columns)).await
    }

    async fn write(
        &mut self,
        table: &str,
        tx_id: &str,
        values: &Map<String, Value>,
        conflict_columns: Option<&[&str]>,
    ) -> Result<()> {
        let schema = safe_ident(self.schema_name)?;
        let table = safe_ident(table)?;

        let mut columns = vec!["_block_height".to_string(), "_tx_id".to_string()];
        for name in values.keys() {
            columns.push(format!("\"{}\"", safe_ident(name)?));
        }

        let mut qb = QueryBuilder::new(format!(
            "INSERT INTO \"{}\".\"{}\" ({}) VALUES (",
            schema,
            table,
            columns.join(", ")
        ));

        let mut separated = qb.separated(", ");
        separated.push_bind(self.block_height);
        separated.push_bind(tx_id.to_string());
        for value in values.values() {
            push_json_value(&mut separated, value);
        }
        qb.push(")");

        if let Some(conflict) = conflict_columns {
            let conflict_list: Result<Vec<String>> = conflict
                .iter()
                .map(|c| safe_ident(c).map(|c| format!("\"{}\"", c)))
                .collect();
            qb.push(format!(" ON CONFLICT ({}) DO UPDATE SET ", conflict_list?.join(", ")));

            let mut first = true;
            for name in values.keys() {
                if conflict.contains(&name.as_str()) {
                    continue;
                }
                let name = safe_ident(name)?;
                if !first {
                    qb.push(", ");
                }
                qb.push(format!("\"{n}\" = EXCLUDED.\"{n}\"", n = name));
                first = false;
            }
            // Conflicting rows from a later block refresh the height marker
            // so rewinds remove the re-written state.
            if !first {
                qb.push(", ");
            }
            qb.push("_block_height = EXCLUDED._block_height, _tx_id = EXCLUDED._tx_id");
        }

        qb.build().execute(&mut *self.conn).await?;
        Ok(())
    }
}

fn push_json_value<'qb, 'args>(
    separated: &mut sqlx::query_builder::Separated<'qb, 'args, sqlx::Postgres, &'static str>,
    value: &Value,
) {
    match value {
        Value::String(s) => {
            separated.push_bind(s.clone());
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                separated.push_bind(i);
            } else {
                separated.push_bind(n.as_f64().unwrap_or(0.0));
            }
        }
        Value::Bool(b) => {
            separated.push_bind(*b);
        }
        Value::Null => {
            // A literal NULL takes the column's own type
            separated.push("NULL");
        }
        other => {
            separated.push_bind(other.clone());
        }
    }
}

/// A compiled-in view transformation
#[async_trait]
pub trait ViewHandler: Send + Sync {
    /// Apply one block's matched data to the view's tables. Any error rolls
    /// back the whole block transaction.
    async fn handle(
        &self,
        ctx: &mut ViewContext<'_>,
        block: &BlockRecord,
        transactions: &[TransactionRecord],
        events: &[EventRecord],
    ) -> Result<()>;
}

/// Maps handler identifiers to bound handlers
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ViewHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the built-in bindings
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("tables", Arc::new(TableMapperHandler));
        registry.register("event_log", Arc::new(EventLogHandler));
        registry
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn ViewHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ViewHandler>> {
        self.handlers.get(name).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Generic handler: each table with a `source` receives one row per matched
/// event of that type (or per matched transaction for the literal
/// "transactions"), with columns drawn from same-named payload fields.
pub struct TableMapperHandler;

impl TableMapperHandler {
    fn row_from_event(table_columns: &[String], event: &EventRecord) -> Map<String, Value> {
        let mut values = Map::new();
        if let Value::Object(payload) = &event.payload {
            for column in table_columns {
                if let Some(value) = payload.get(column) {
                    values.insert(column.clone(), value.clone());
                }
            }
        }
        // The type tag is not part of the payload; fill it only when the
        // table actually declares the column.
        if table_columns.iter().any(|c| c == "event_type") {
            values
                .entry("event_type".to_string())
                .or_insert_with(|| Value::String(event.event_type.clone()));
        }
        values
    }

    fn row_from_tx(table_columns: &[String], tx: &TransactionRecord) -> Map<String, Value> {
        let fields: Map<String, Value> =
            serde_json::to_value(tx).ok().and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        let mut values = Map::new();
        for column in table_columns {
            if let Some(value) = fields.get(column) {
                values.insert(column.clone(), value.clone());
            }
        }
        values
    }
}

#[async_trait]
impl ViewHandler for TableMapperHandler {
    async fn handle(
        &self,
        ctx: &mut ViewContext<'_>,
        block: &BlockRecord,
        transactions: &[TransactionRecord],
        events: &[EventRecord],
    ) -> Result<()> {
        let definition = ctx.definition().clone();
        for table in &definition.tables {
            let Some(source) = table.source.as_deref() else {
                continue;
            };
            let column_names: Vec<String> =
                table.columns.iter().map(|c| c.name.clone()).collect();

            if source == "transactions" {
                for tx in transactions {
                    let values = Self::row_from_tx(&column_names, tx);
                    ctx.insert(&table.name, &tx.tx_id, &values).await?;
                }
            } else {
                for event in events.iter().filter(|e| e.event_type == source) {
                    let values = Self::row_from_event(&column_names, event);
                    ctx.insert(&table.name, &event.tx_id, &values).await?;
                }
            }
        }
        debug!(block_height = block.height, "Table mapper applied block");
        Ok(())
    }
}

/// Audit-style handler: every matched event becomes one row in the view's
/// first declared table, with the type tag and the whole payload preserved.
pub struct EventLogHandler;

#[async_trait]
impl ViewHandler for EventLogHandler {
    async fn handle(
        &self,
        ctx: &mut ViewContext<'_>,
        block: &BlockRecord,
        _transactions: &[TransactionRecord],
        events: &[EventRecord],
    ) -> Result<()> {
        let Some(table) = ctx.definition().tables.first().map(|t| t.name.clone()) else {
            return Err(Error::validation("event_log view declares no tables"));
        };

        for event in events {
            let mut values = Map::new();
            values.insert(
                "event_type".to_string(),
                Value::String(event.event_type.clone()),
            );
            values.insert(
                "event_index".to_string(),
                Value::Number(event.event_index.into()),
            );
            values.insert("payload".to_string(), event.payload.clone());
            ctx.insert(&table, &event.tx_id, &values).await?;
        }
        debug!(
            block_height = block.height,
            events = events.len(),
            "Event log applied block"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: Value) -> EventRecord {
        EventRecord {
            id: 1,
            tx_id: "0xabc".to_string(),
            block_height: 100,
            block_hash: "A".to_string(),
            event_index: 0,
            event_type: event_type.to_string(),
            payload,
        }
    }

    #[test]
    fn event_row_projects_declared_columns() {
        let columns = vec![
            "sender".to_string(),
            "amount".to_string(),
            "event_type".to_string(),
        ];
        let row = TableMapperHandler::row_from_event(
            &columns,
            &event(
                "ft_transfer_event",
                json!({"sender": "SP1", "amount": "42", "extra": true}),
            ),
        );
        assert_eq!(row["sender"], "SP1");
        assert_eq!(row["amount"], "42");
        assert_eq!(row["event_type"], "ft_transfer_event");
        assert!(!row.contains_key("extra"));
    }

    #[test]
    fn event_type_stays_out_of_undeclared_tables() {
        // A table without an event_type column must not receive one: the
        // generated DDL never creates it, so the INSERT would fail.
        let columns = vec!["sender".to_string(), "amount".to_string()];
        let row = TableMapperHandler::row_from_event(
            &columns,
            &event("ft_transfer_event", json!({"sender": "SP1", "amount": "42"})),
        );
        assert_eq!(row["sender"], "SP1");
        assert!(!row.contains_key("event_type"));
    }

    #[test]
    fn tx_row_projects_record_fields() {
        let tx = TransactionRecord {
            tx_id: "0x1".to_string(),
            block_height: 100,
            block_hash: "A".to_string(),
            tx_index: 0,
            tx_type: "contract_call".to_string(),
            sender: "SP1".to_string(),
            status: "success".to_string(),
            contract_id: Some("SP1.counter".to_string()),
            function_name: Some("increment".to_string()),
            raw_tx: None,
        };
        let columns = vec!["sender".to_string(), "tx_type".to_string(), "missing".to_string()];
        let row = TableMapperHandler::row_from_tx(&columns, &tx);
        assert_eq!(row["sender"], "SP1");
        assert_eq!(row["tx_type"], "contract_call");
        assert!(!row.contains_key("missing"));
    }

    #[test]
    fn registry_resolves_default_bindings() {
        let registry = HandlerRegistry::with_defaults();
        assert!(registry.get("tables").is_some());
        assert!(registry.get("event_log").is_some());
        assert!(registry.get("missing").is_none());
    }
}
