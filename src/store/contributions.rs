/// Per-(campaign, donor) contribution rows
///
/// `contributed` is a lifetime gross sum; refunds raise `refunded` and
/// never decrement it. Net support = contributed - refunded.

use bigdecimal::BigDecimal;
use chrono::Utc;
use sqlx::PgConnection;

/// Accumulate a donation, creating the row on the donor's first one.
pub async fn add_contribution(
    tx: &mut PgConnection,
    campaign: &str,
    donor: &str,
    amount: &BigDecimal,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO contributions \
         (campaign_address, donor, contributed, refunded, created_at, updated_at) \
         VALUES ($1, $2, $3, 0, $4, $4) \
         ON CONFLICT (campaign_address, donor) DO UPDATE \
         SET contributed = contributions.contributed + EXCLUDED.contributed, \
             updated_at = EXCLUDED.updated_at",
    )
    .bind(campaign)
    .bind(donor)
    .bind(amount)
    .bind(now)
    .execute(tx)
    .await?;
    Ok(())
}

pub enum RefundOutcome {
    Applied,
    /// No contribution row for this (campaign, donor)
    MissingContribution,
    /// Applying the refund would exceed the lifetime contribution
    ExceedsContributed,
}

/// Accumulate a refund, preserving `refunded <= contributed`.
pub async fn add_refund(
    tx: &mut PgConnection,
    campaign: &str,
    donor: &str,
    amount: &BigDecimal,
) -> Result<RefundOutcome, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE contributions \
         SET refunded = refunded + $3, updated_at = $4 \
         WHERE campaign_address = $1 AND donor = $2 \
           AND refunded + $3 <= contributed",
    )
    .bind(campaign)
    .bind(donor)
    .bind(amount)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(RefundOutcome::Applied);
    }

    let exists: Option<i32> = sqlx::query_scalar(
        "SELECT 1 FROM contributions WHERE campaign_address = $1 AND donor = $2",
    )
    .bind(campaign)
    .bind(donor)
    .fetch_optional(tx)
    .await?;

    Ok(if exists.is_some() {
        RefundOutcome::ExceedsContributed
    } else {
        RefundOutcome::MissingContribution
    })
}

/// Overwrite a donor's sums from recomputed values (rollback rebuild).
pub async fn set_sums(
    tx: &mut PgConnection,
    campaign: &str,
    donor: &str,
    contributed: &BigDecimal,
    refunded: &BigDecimal,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO contributions \
         (campaign_address, donor, contributed, refunded, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $5) \
         ON CONFLICT (campaign_address, donor) DO UPDATE \
         SET contributed = EXCLUDED.contributed, \
             refunded = EXCLUDED.refunded, \
             updated_at = EXCLUDED.updated_at",
    )
    .bind(campaign)
    .bind(donor)
    .bind(contributed)
    .bind(refunded)
    .bind(now)
    .execute(tx)
    .await?;
    Ok(())
}

/// Zero every row of a campaign before a rebuild repopulates the
/// survivors; donors whose events were all orphaned keep a zeroed row
/// (rows are never deleted).
pub async fn zero_campaign(tx: &mut PgConnection, campaign: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE contributions SET contributed = 0, refunded = 0, updated_at = $2 \
         WHERE campaign_address = $1",
    )
    .bind(campaign)
    .bind(Utc::now())
    .execute(tx)
    .await?;
    Ok(())
}
