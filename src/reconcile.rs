/// Reconciler
///
/// Deadline-driven sweep, triggered by control-plane reconciliation
/// messages. The only path to FAILED: refunds on their own never imply a
/// campaign failed; status derives from deadline + goal.

use chrono::Utc;
use sqlx::PgPool;
use tracing::info;

use crate::messages::ReconciliationMessage;
use crate::store::{self, campaigns};

pub async fn run_reconciliation(
    pool: &PgPool,
    msg: &ReconciliationMessage,
) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    store::acquire_control_lock(&mut tx, msg.chain_id).await?;

    let failed = campaigns::fail_expired(&mut tx, Utc::now().timestamp()).await?;

    tx.commit().await?;

    if failed > 0 {
        info!(
            chain_id = msg.chain_id,
            campaigns_failed = failed,
            "reconciliation transitioned expired campaigns"
        );
    }
    Ok(failed)
}
