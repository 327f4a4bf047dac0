/// Canonical event log
///
/// `(chain_id, tx_hash, log_index)` uniqueness is the idempotency barrier
/// for the whole pipeline. Rows are never deleted; a reorg flips `removed`
/// and derived state is rebuilt from the survivors.

use std::collections::BTreeSet;

use bigdecimal::BigDecimal;
use chrono::Utc;
use num_traits::Zero;
use sqlx::{PgConnection, PgPool};

use crate::messages::EventMessage;

/// Insert one event row. Returns false when the idempotency key already
/// exists (duplicate delivery).
pub async fn insert(tx: &mut PgConnection, msg: &EventMessage) -> Result<bool, sqlx::Error> {
    let payload = serde_json::to_value(&msg.event_data)
        .map_err(|e| sqlx::Error::Protocol(format!("unserializable event payload: {}", e)))?;

    let result = sqlx::query(
        "INSERT INTO blockchain_events \
         (chain_id, tx_hash, log_index, block_number, block_hash, address, \
          event_type, payload, removed, ingested_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, $9) \
         ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING",
    )
    .bind(msg.chain_id as i64)
    .bind(&msg.tx_hash)
    .bind(msg.log_index as i64)
    .bind(msg.block_number as i64)
    .bind(&msg.block_hash)
    .bind(&msg.address)
    .bind(msg.event_type.as_str())
    .bind(payload)
    .bind(Utc::now())
    .execute(tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// An event orphaned by a rollback, as needed to find the campaigns whose
/// derived state must be rebuilt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrphanedEvent {
    pub address: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Flip `removed` on every live event in `(from_block, to_block]`.
pub async fn mark_removed_in_range(
    tx: &mut PgConnection,
    chain_id: u64,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<OrphanedEvent>, sqlx::Error> {
    sqlx::query_as(
        "UPDATE blockchain_events SET removed = true \
         WHERE chain_id = $1 AND block_number > $2 AND block_number <= $3 \
           AND removed = false \
         RETURNING address, event_type, payload",
    )
    .bind(chain_id as i64)
    .bind(from_block as i64)
    .bind(to_block as i64)
    .fetch_all(tx)
    .await
}

/// The campaign a given event row belongs to. `CampaignCreated` rows carry
/// the factory as the emitting address, so the campaign lives in the
/// payload; everything else is emitted by the campaign itself.
pub fn campaign_of(event: &OrphanedEvent) -> Option<String> {
    if event.event_type == "CampaignCreated" {
        event
            .payload
            .get("campaign")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    } else {
        Some(event.address.clone())
    }
}

/// Distinct campaigns touched by a set of orphaned events.
pub fn touched_campaigns(events: &[OrphanedEvent]) -> BTreeSet<String> {
    events.iter().filter_map(campaign_of).collect()
}

/// Live (non-removed) events left in `(from_block, to_block]`. The
/// producer polls this to observe consumer acknowledgment of a rollback.
pub async fn count_live_in_range(
    pool: &PgPool,
    chain_id: u64,
    from_block: u64,
    to_block: u64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM blockchain_events \
         WHERE chain_id = $1 AND block_number > $2 AND block_number <= $3 \
           AND removed = false",
    )
    .bind(chain_id as i64)
    .bind(from_block as i64)
    .bind(to_block as i64)
    .fetch_one(pool)
    .await
}

/// Block hash recorded for a height, if any live event was indexed there.
/// Used by the deep-reorg probe to find the deepest still-matching
/// ancestor.
pub async fn recorded_block_hash(
    pool: &PgPool,
    chain_id: u64,
    height: u64,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT block_hash FROM blockchain_events \
         WHERE chain_id = $1 AND block_number = $2 AND removed = false \
         LIMIT 1",
    )
    .bind(chain_id as i64)
    .bind(height as i64)
    .fetch_optional(pool)
    .await
}

/// Lifetime donation total of a campaign from surviving events.
pub async fn surviving_donation_total(
    tx: &mut PgConnection,
    chain_id: u64,
    campaign: &str,
) -> Result<BigDecimal, sqlx::Error> {
    let total: Option<BigDecimal> = sqlx::query_scalar(
        "SELECT SUM((payload->>'amount')::numeric) FROM blockchain_events \
         WHERE chain_id = $1 AND address = $2 \
           AND event_type = 'DonationReceived' AND removed = false",
    )
    .bind(chain_id as i64)
    .bind(campaign)
    .fetch_one(tx)
    .await?;
    Ok(total.unwrap_or_else(BigDecimal::zero))
}

/// Per-donor contributed/refunded sums from surviving events.
pub async fn surviving_contribution_sums(
    tx: &mut PgConnection,
    chain_id: u64,
    campaign: &str,
) -> Result<Vec<(String, BigDecimal, BigDecimal)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT payload->>'donor' AS donor, \
                COALESCE(SUM((payload->>'amount')::numeric) \
                    FILTER (WHERE event_type = 'DonationReceived'), 0) AS contributed, \
                COALESCE(SUM((payload->>'amount')::numeric) \
                    FILTER (WHERE event_type = 'Refunded'), 0) AS refunded \
         FROM blockchain_events \
         WHERE chain_id = $1 AND address = $2 AND removed = false \
           AND event_type IN ('DonationReceived', 'Refunded') \
         GROUP BY 1",
    )
    .bind(chain_id as i64)
    .bind(campaign)
    .fetch_all(tx)
    .await
}

/// Surviving withdrawal amount, if the campaign still has a live
/// `Withdrawn` event.
pub async fn surviving_withdrawal(
    tx: &mut PgConnection,
    chain_id: u64,
    campaign: &str,
) -> Result<Option<BigDecimal>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT (payload->>'amount')::numeric FROM blockchain_events \
         WHERE chain_id = $1 AND address = $2 \
           AND event_type = 'Withdrawn' AND removed = false \
         LIMIT 1",
    )
    .bind(chain_id as i64)
    .bind(campaign)
    .fetch_optional(tx)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orphan(event_type: &str, address: &str, payload: serde_json::Value) -> OrphanedEvent {
        OrphanedEvent {
            address: address.to_string(),
            event_type: event_type.to_string(),
            payload,
        }
    }

    #[test]
    fn test_campaign_of_created_reads_payload() {
        let event = orphan(
            "CampaignCreated",
            "0xfactory",
            json!({"campaign": "0xcamp", "creator": "0xcreator"}),
        );
        assert_eq!(campaign_of(&event), Some("0xcamp".to_string()));
    }

    #[test]
    fn test_campaign_of_other_events_is_emitter() {
        let event = orphan("DonationReceived", "0xcamp", json!({"donor": "0xdonor"}));
        assert_eq!(campaign_of(&event), Some("0xcamp".to_string()));
    }

    #[test]
    fn test_campaign_of_created_without_payload_field() {
        let event = orphan("CampaignCreated", "0xfactory", json!({}));
        assert_eq!(campaign_of(&event), None);
    }

    #[test]
    fn test_touched_campaigns_dedupes() {
        let events = vec![
            orphan("DonationReceived", "0xcamp1", json!({})),
            orphan("Refunded", "0xcamp1", json!({})),
            orphan("Withdrawn", "0xcamp2", json!({})),
            orphan("CampaignCreated", "0xfactory", json!({"campaign": "0xcamp2"})),
        ];
        let touched = touched_campaigns(&events);
        assert_eq!(touched.len(), 2);
        assert!(touched.contains("0xcamp1"));
        assert!(touched.contains("0xcamp2"));
    }
}
