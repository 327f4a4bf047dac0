/// Campaign rows and their derived-state mutations
///
/// All guards live in the SQL predicates so that concurrent workers cannot
/// race a status downgrade: `GREATEST` keeps `total_raised` monotonic and
/// the lattice conditions are part of every UPDATE's WHERE clause.

use bigdecimal::BigDecimal;
use chrono::Utc;
use sqlx::{PgConnection, PgPool};

use crate::status::CampaignStatus;

#[derive(Debug, Clone)]
pub struct NewCampaign<'a> {
    pub address: &'a str,
    pub factory_address: &'a str,
    pub creator: &'a str,
    pub goal: BigDecimal,
    pub deadline: i64,
    pub cid: &'a str,
}

/// Insert-only upsert; duplicate `CampaignCreated` deliveries are no-ops.
pub async fn insert_created(
    tx: &mut PgConnection,
    campaign: NewCampaign<'_>,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO campaigns \
         (address, factory_address, creator, goal, deadline, cid, status, \
          total_raised, withdrawn, withdrawn_amount, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, 'ACTIVE', 0, false, NULL, $7, $7) \
         ON CONFLICT (address) DO NOTHING",
    )
    .bind(campaign.address)
    .bind(campaign.factory_address)
    .bind(campaign.creator)
    .bind(campaign.goal)
    .bind(campaign.deadline)
    .bind(campaign.cid)
    .bind(now)
    .execute(tx)
    .await?;
    Ok(())
}

pub async fn status_of(
    tx: &mut PgConnection,
    address: &str,
) -> Result<Option<CampaignStatus>, sqlx::Error> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM campaigns WHERE address = $1 FOR UPDATE")
            .bind(address)
            .fetch_optional(tx)
            .await?;
    Ok(status.and_then(|s| CampaignStatus::parse(&s)))
}

/// Fold a donation's chain-observed post-state into `total_raised`.
/// `GREATEST` makes the fold monotonic under out-of-order and duplicate
/// delivery: the final value equals the maximum `new_total_raised` seen.
/// Returns false when the campaign row does not exist yet.
pub async fn raise_total(
    tx: &mut PgConnection,
    address: &str,
    new_total: &BigDecimal,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE campaigns \
         SET total_raised = GREATEST(total_raised, $2), updated_at = $3 \
         WHERE address = $1",
    )
    .bind(address)
    .bind(new_total)
    .bind(Utc::now())
    .execute(tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// ACTIVE -> SUCCESS once the goal is met. A no-op in any other state, so
/// late donations can never downgrade WITHDRAWN or resurrect FAILED.
pub async fn promote_to_success(tx: &mut PgConnection, address: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE campaigns SET status = 'SUCCESS', updated_at = $2 \
         WHERE address = $1 AND status = 'ACTIVE' AND total_raised >= goal",
    )
    .bind(address)
    .bind(Utc::now())
    .execute(tx)
    .await?;
    Ok(())
}

/// Terminal withdrawal transition.
pub async fn apply_withdrawal(
    tx: &mut PgConnection,
    address: &str,
    amount: &BigDecimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE campaigns \
         SET withdrawn = true, withdrawn_amount = $2, status = 'WITHDRAWN', updated_at = $3 \
         WHERE address = $1",
    )
    .bind(address)
    .bind(amount)
    .bind(Utc::now())
    .execute(tx)
    .await?;
    Ok(())
}

/// Overwrite derived state after a rollback rebuild.
pub async fn rebuild(
    tx: &mut PgConnection,
    address: &str,
    total_raised: &BigDecimal,
    withdrawn_amount: Option<&BigDecimal>,
    status: CampaignStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE campaigns \
         SET total_raised = $2, withdrawn = $3, withdrawn_amount = $4, \
             status = $5, updated_at = $6 \
         WHERE address = $1",
    )
    .bind(address)
    .bind(total_raised)
    .bind(withdrawn_amount.is_some())
    .bind(withdrawn_amount)
    .bind(status.as_str())
    .bind(Utc::now())
    .execute(tx)
    .await?;
    Ok(())
}

/// Goal and deadline, needed to re-derive status during a rebuild.
pub async fn goal_and_deadline(
    tx: &mut PgConnection,
    address: &str,
) -> Result<Option<(BigDecimal, i64)>, sqlx::Error> {
    sqlx::query_as("SELECT goal, deadline FROM campaigns WHERE address = $1")
        .bind(address)
        .fetch_optional(tx)
        .await
}

/// Deadline sweep: every expired, under-goal, non-withdrawn ACTIVE
/// campaign becomes FAILED. The single statement keeps the sweep atomic.
pub async fn fail_expired(tx: &mut PgConnection, now: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE campaigns SET status = 'FAILED', updated_at = $2 \
         WHERE status = 'ACTIVE' AND deadline < $1 \
           AND withdrawn = false AND total_raised < goal",
    )
    .bind(now)
    .bind(Utc::now())
    .execute(tx)
    .await?;
    Ok(result.rows_affected())
}

/// All known campaign addresses for the producer's log-fetch address set.
/// Read fresh each iteration; a long-lived cache could miss campaigns
/// created through another producer instance.
pub async fn all_addresses(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT address FROM campaigns ORDER BY created_at")
        .fetch_all(pool)
        .await
}
