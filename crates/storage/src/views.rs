//! View registry persistence and per-view schema operations
//!
//! The view processor owns `last_processed_block` and everything inside the
//! per-view physical schemas. DDL strings come from the views crate; this
//! module only executes them and handles the dynamic identifiers safely.

use sqlx::{PgConnection, PgExecutor};

use secondlayer_core::types::ViewRecord;
use secondlayer_core::{Error, Result};

const VIEW_COLUMNS: &str = "id, name, version, status, definition, schema_hash, handler, \
                            last_processed_block, error_count, last_error, owner_id, schema_name";

/// All registered views
pub async fn load_views<'e, E>(executor: E) -> Result<Vec<ViewRecord>>
where
    E: PgExecutor<'e>,
{
    let views = sqlx::query_as::<_, ViewRecord>(&format!(
        "SELECT {VIEW_COLUMNS} FROM views ORDER BY name"
    ))
    .fetch_all(executor)
    .await?;
    Ok(views)
}

/// Views that should currently be advancing
pub async fn load_active_views<'e, E>(executor: E) -> Result<Vec<ViewRecord>>
where
    E: PgExecutor<'e>,
{
    let views = sqlx::query_as::<_, ViewRecord>(&format!(
        "SELECT {VIEW_COLUMNS} FROM views WHERE status = 'active' ORDER BY name"
    ))
    .fetch_all(executor)
    .await?;
    Ok(views)
}

/// Set a view's status, recording the reason when pausing on error
pub async fn set_view_status<'e, E>(
    executor: E,
    view_id: uuid::Uuid,
    status: &str,
    reason: Option<&str>,
) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE views SET status = $2, last_error = COALESCE($3, last_error) WHERE id = $1")
        .bind(view_id)
        .bind(status)
        .bind(reason)
        .execute(executor)
        .await?;
    Ok(())
}

/// Record the definition hash the physical schema was built from
pub async fn set_schema_hash<'e, E>(executor: E, view_id: uuid::Uuid, hash: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE views SET schema_hash = $2 WHERE id = $1")
        .bind(view_id)
        .bind(hash)
        .execute(executor)
        .await?;
    Ok(())
}

/// Advance a view's progress watermark (inside the block transaction)
pub async fn set_view_progress<'e, E>(executor: E, view_id: uuid::Uuid, height: i64) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE views SET last_processed_block = $2, error_count = 0, last_error = NULL WHERE id = $1")
        .bind(view_id)
        .bind(height)
        .execute(executor)
        .await?;
    Ok(())
}

/// Record a handler failure without advancing
pub async fn record_view_error<'e, E>(executor: E, view_id: uuid::Uuid, error: &str) -> Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "UPDATE views SET error_count = error_count + 1, last_error = $2 WHERE id = $1",
    )
    .bind(view_id)
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

/// Validate an identifier destined for dynamic DDL/DML. Schema and table
/// names are machine-derived but cross a SQL boundary, so they are
/// restricted to lowercase alphanumerics and underscores.
pub fn safe_ident(name: &str) -> Result<&str> {
    if name.is_empty()
        || name.len() > 63
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        || name.starts_with(|c: char| c.is_ascii_digit())
    {
        return Err(Error::validation(format!("unsafe SQL identifier: {:?}", name)));
    }
    Ok(name)
}

/// Create the physical schema for a view if it is missing
pub async fn ensure_schema(conn: &mut PgConnection, schema_name: &str) -> Result<()> {
    let schema = safe_ident(schema_name)?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Execute generated DDL statements for a view's tables
pub async fn apply_view_ddl(conn: &mut PgConnection, statements: &[String]) -> Result<()> {
    for statement in statements {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Delete every row at or above a height from one view table. Used by the
/// reorg rewind before reprocessing.
pub async fn delete_rows_from(
    conn: &mut PgConnection,
    schema_name: &str,
    table: &str,
    height: i64,
) -> Result<u64> {
    let schema = safe_ident(schema_name)?;
    let table = safe_ident(table)?;
    let deleted = sqlx::query(&format!(
        "DELETE FROM \"{schema}\".\"{table}\" WHERE _block_height >= $1"
    ))
    .bind(height)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_ident_accepts_machine_names() {
        assert!(safe_ident("view_ft_transfers").is_ok());
        assert!(safe_ident("balances_2").is_ok());
    }

    #[test]
    fn safe_ident_rejects_injection_shapes() {
        assert!(safe_ident("").is_err());
        assert!(safe_ident("x\"; DROP TABLE blocks; --").is_err());
        assert!(safe_ident("UpperCase").is_err());
        assert!(safe_ident("1starts_with_digit").is_err());
        assert!(safe_ident(&"a".repeat(64)).is_err());
    }
}
