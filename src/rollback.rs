/// Rollback handler
///
/// Consumes control-plane rollback messages. One transaction: flip
/// `removed` on every event in the orphaned window, then rebuild the
/// derived state of every touched campaign from the surviving events.
/// The advisory lock serializes this against any competing control
/// consumer.

use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use tracing::info;

use crate::messages::RollbackMessage;
use crate::status::derive_status;
use crate::store::{self, campaigns, contributions, events};

#[derive(Debug, Default)]
pub struct RollbackSummary {
    pub events_removed: usize,
    pub campaigns_rebuilt: usize,
}

pub async fn handle_rollback(
    pool: &PgPool,
    msg: &RollbackMessage,
) -> Result<RollbackSummary, sqlx::Error> {
    let mut tx = pool.begin().await?;
    store::acquire_control_lock(&mut tx, msg.chain_id).await?;

    let orphaned =
        events::mark_removed_in_range(&mut tx, msg.chain_id, msg.from_block, msg.to_block).await?;
    let touched = events::touched_campaigns(&orphaned);

    let now = Utc::now().timestamp();
    for campaign in &touched {
        rebuild_campaign(&mut tx, msg.chain_id, campaign, now).await?;
    }

    tx.commit().await?;

    let summary = RollbackSummary {
        events_removed: orphaned.len(),
        campaigns_rebuilt: touched.len(),
    };
    info!(
        chain_id = msg.chain_id,
        from_block = msg.from_block,
        to_block = msg.to_block,
        events_removed = summary.events_removed,
        campaigns_rebuilt = summary.campaigns_rebuilt,
        reason = %msg.reason,
        "rollback applied"
    );
    Ok(summary)
}

/// Recompute every derived field of one campaign from its surviving
/// events: lifetime donation total, per-donor sums, withdrawal flag, and
/// the materialized status.
async fn rebuild_campaign(
    tx: &mut PgConnection,
    chain_id: u64,
    campaign: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    // Row absent means the creation event never materialized a campaign
    // (or was itself orphaned before any consumer saw it); nothing to
    // rebuild. Rows are never deleted, so a surviving creation keeps its
    // row and gets fresh derived state below.
    let Some((goal, deadline)) = campaigns::goal_and_deadline(tx, campaign).await? else {
        return Ok(());
    };

    let total_raised = events::surviving_donation_total(tx, chain_id, campaign).await?;
    let withdrawal = events::surviving_withdrawal(tx, chain_id, campaign).await?;
    let status = derive_status(&total_raised, &goal, deadline, withdrawal.is_some(), now);

    campaigns::rebuild(tx, campaign, &total_raised, withdrawal.as_ref(), status).await?;

    contributions::zero_campaign(tx, campaign).await?;
    let sums = events::surviving_contribution_sums(tx, chain_id, campaign).await?;
    for (donor, contributed, refunded) in sums {
        contributions::set_sums(tx, campaign, &donor, &contributed, &refunded).await?;
    }
    Ok(())
}
