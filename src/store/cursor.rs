/// Sync cursor - one row per chain
///
/// The producer's only persistent write. Committed strictly after the
/// publisher-confirm barrier, which is what makes the producer safely
/// restartable: a crash mid-batch re-fetches a range consumers deduplicate.

use chrono::Utc;
use sqlx::PgPool;

pub const ZERO_HASH: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub height: u64,
    pub hash: String,
}

impl Cursor {
    /// Bootstrap state before any batch was ever confirmed.
    pub fn genesis() -> Self {
        Self {
            height: 0,
            hash: ZERO_HASH.to_string(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.hash == ZERO_HASH
    }
}

pub async fn read(pool: &PgPool, chain_id: u64) -> Result<Cursor, sqlx::Error> {
    let row: Option<(i64, String)> = sqlx::query_as(
        "SELECT last_block, last_block_hash FROM sync_cursors WHERE chain_id = $1",
    )
    .bind(chain_id as i64)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some((height, hash)) => Cursor {
            height: height as u64,
            hash,
        },
        None => Cursor::genesis(),
    })
}

/// Idempotent last-write-wins commit.
pub async fn commit(
    pool: &PgPool,
    chain_id: u64,
    height: u64,
    hash: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO sync_cursors (chain_id, last_block, last_block_hash, updated_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (chain_id) DO UPDATE \
         SET last_block = EXCLUDED.last_block, \
             last_block_hash = EXCLUDED.last_block_hash, \
             updated_at = EXCLUDED.updated_at",
    )
    .bind(chain_id as i64)
    .bind(height as i64)
    .bind(hash)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
