/// Relational store access
///
/// The schema is owned and migrated by the platform; the indexer only
/// asserts its presence at startup and fails fast when tables are absent.
/// Uniqueness constraints, not application locks, are the primary
/// concurrency control.

pub mod campaigns;
pub mod contributions;
pub mod cursor;
pub mod events;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DbSettings;
use crate::error::IndexerError;

pub const REQUIRED_TABLES: [&str; 4] = [
    "sync_cursors",
    "campaigns",
    "contributions",
    "blockchain_events",
];

/// Open a bounded connection pool.
pub async fn connect(settings: &DbSettings) -> Result<PgPool, IndexerError> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&settings.url)
        .await?;
    Ok(pool)
}

/// Fail fast when the relational schema has not been migrated.
pub async fn assert_schema(pool: &PgPool) -> Result<(), IndexerError> {
    let required: Vec<String> = REQUIRED_TABLES.iter().map(|t| t.to_string()).collect();
    let present: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name = ANY($1)",
    )
    .bind(&required)
    .fetch_all(pool)
    .await?;

    let missing: Vec<String> = required
        .into_iter()
        .filter(|t| !present.contains(t))
        .collect();
    if !missing.is_empty() {
        return Err(IndexerError::SchemaMissing { tables: missing });
    }
    Ok(())
}

/// Serialize control-plane work (rollback, reconciliation) across any
/// number of competing consumers. Advisory, transaction-scoped, keyed by
/// chain id; released automatically on commit or rollback.
pub async fn acquire_control_lock(
    tx: &mut sqlx::PgConnection,
    chain_id: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(chain_id as i64)
        .execute(tx)
        .await?;
    Ok(())
}

/// SQLSTATEs worth a bounded retry: deadlock and serialization failures.
pub fn is_transient_db_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") | Some("55P03")
        ),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_tables_complete() {
        assert!(REQUIRED_TABLES.contains(&"sync_cursors"));
        assert!(REQUIRED_TABLES.contains(&"campaigns"));
        assert!(REQUIRED_TABLES.contains(&"contributions"));
        assert!(REQUIRED_TABLES.contains(&"blockchain_events"));
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(is_transient_db_error(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        assert!(!is_transient_db_error(&sqlx::Error::RowNotFound));
    }
}
