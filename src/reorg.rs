/// Reorg detection
///
/// Before fetching new logs, the producer compares the on-chain hash at
/// the cursor height against the stored cursor hash. A divergence means
/// previously observed blocks were replaced; the producer then publishes a
/// rollback for the window `(rewind_to, cursor.height]` and rewinds.

use sqlx::PgPool;
use tracing::warn;

use crate::error::IndexerError;
use crate::messages::format_hash;
use crate::rpc::{ChainClient, RpcError};
use crate::store::cursor::Cursor;
use crate::store::events;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgDetection {
    /// New cursor height; also the exclusive lower bound of the rollback
    /// window
    pub rewind_to: u64,
    /// Inclusive upper bound of the rollback window (the old cursor)
    pub to_block: u64,
    pub reason: String,
}

/// The rollback window for a reorg observed at `height`, clamped at
/// genesis.
pub fn rollback_window(height: u64, rollback_depth: u64) -> (u64, u64) {
    (height.saturating_sub(rollback_depth), height)
}

/// Probe for a reorg at the stored cursor. `None` means the chain still
/// agrees with what we last confirmed.
pub async fn probe(
    client: &ChainClient,
    pool: &PgPool,
    chain_id: u64,
    cursor: &Cursor,
    rollback_depth: u64,
) -> Result<Option<ReorgDetection>, IndexerError> {
    if cursor.is_genesis() {
        return Ok(None);
    }

    match client.block_hash_at(cursor.height).await {
        Ok(hash) if format_hash(&hash) == cursor.hash => Ok(None),

        Ok(hash) => {
            // chain still contains this height, with a different block
            let (rewind_to, to_block) = rollback_window(cursor.height, rollback_depth);
            warn!(
                height = cursor.height,
                stored = %cursor.hash,
                canonical = %format_hash(&hash),
                rewind_to,
                "reorg detected: hash mismatch at cursor"
            );
            Ok(Some(ReorgDetection {
                rewind_to,
                to_block,
                reason: format!(
                    "hash mismatch at height {}: stored {}, canonical {}",
                    cursor.height,
                    cursor.hash,
                    format_hash(&hash)
                ),
            }))
        }

        Err(RpcError::NotFound { .. }) => {
            // chain is shorter than the cursor: deep reorg
            let rewind_to = deepest_matching_ancestor(client, pool, chain_id, cursor, rollback_depth)
                .await?;
            warn!(
                height = cursor.height,
                rewind_to, "deep reorg: chain no longer contains cursor height"
            );
            Ok(Some(ReorgDetection {
                rewind_to,
                to_block: cursor.height,
                reason: format!(
                    "chain shorter than cursor height {}; deepest matching ancestor {}",
                    cursor.height, rewind_to
                ),
            }))
        }

        Err(e) => Err(e.into()),
    }
}

/// Linear probe backward from the cursor, bounded by the rollback depth,
/// comparing on-chain hashes against block hashes recorded in the event
/// log. Heights with no recorded events cannot be compared and are
/// skipped; with no match the full window is rewound.
async fn deepest_matching_ancestor(
    client: &ChainClient,
    pool: &PgPool,
    chain_id: u64,
    cursor: &Cursor,
    rollback_depth: u64,
) -> Result<u64, IndexerError> {
    let floor = cursor.height.saturating_sub(rollback_depth);

    for height in (floor..cursor.height).rev() {
        let Some(stored) = events::recorded_block_hash(pool, chain_id, height).await? else {
            continue;
        };
        match client.block_hash_at(height).await {
            Ok(hash) if format_hash(&hash) == stored => return Ok(height),
            Ok(_) => continue,
            Err(RpcError::NotFound { .. }) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_window() {
        assert_eq!(rollback_window(1000, 50), (950, 1000));
        assert_eq!(rollback_window(50, 50), (0, 50));
    }

    #[test]
    fn test_rollback_window_clamped_at_genesis() {
        assert_eq!(rollback_window(30, 50), (0, 30));
        assert_eq!(rollback_window(0, 50), (0, 0));
    }

    #[test]
    fn test_window_bounds_are_exclusive_inclusive() {
        // the window (from, to] must contain the cursor height itself
        let (from, to) = rollback_window(100, 10);
        assert!(from < 100 || to == 0);
        assert_eq!(to, 100);
        assert_eq!(from, 90);
    }
}
