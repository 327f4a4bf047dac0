/// State updater - the event-to-state algebra
///
/// One atomic transaction per message: event-log insert (the dedup
/// barrier), then the state mutation, then commit. The algebra is
/// commutative under duplicates and monotonic under out-of-order delivery,
/// so N competing workers need no coordination beyond the store's
/// uniqueness constraints.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use num_traits::Zero;
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;

use crate::messages::{EventData, EventMessage};
use crate::status::CampaignStatus;
use crate::store::{self, campaigns, contributions, events};

#[derive(Debug, Error)]
pub enum ApplyError {
    /// A row this event depends on is not indexed yet (its message may be
    /// in flight on another queue). Retryable.
    #[error("dependency not yet indexed: {0}")]
    MissingDependency(String),

    /// The message itself is defective. Poison.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Applying the event would break a store invariant. Poison.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Idempotency key already present; the redelivery folded to a no-op.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retry,
    Poison,
}

pub fn classify(error: &ApplyError) -> FailureClass {
    match error {
        ApplyError::MissingDependency(_) => FailureClass::Retry,
        ApplyError::Malformed(_) | ApplyError::Invariant(_) => FailureClass::Poison,
        ApplyError::Db(e) => {
            if store::is_transient_db_error(e) {
                FailureClass::Retry
            } else {
                FailureClass::Poison
            }
        }
    }
}

/// Apply one event message to the store.
pub async fn apply_event(pool: &PgPool, msg: &EventMessage) -> Result<ApplyOutcome, ApplyError> {
    validate(msg)?;

    let mut tx = pool.begin().await?;

    if !events::insert(&mut tx, msg).await? {
        // seen before: ack and move on without touching state
        tx.commit().await?;
        debug!(key = %msg.idempotency_key(), "duplicate event folded");
        return Ok(ApplyOutcome::Duplicate);
    }

    match &msg.event_data {
        EventData::CampaignCreated {
            campaign,
            creator,
            goal,
            deadline,
            cid,
        } => {
            campaigns::insert_created(
                &mut tx,
                campaigns::NewCampaign {
                    address: campaign,
                    factory_address: &msg.address,
                    creator,
                    goal: parse_amount("goal", goal)?,
                    deadline: *deadline as i64,
                    cid,
                },
            )
            .await?;
        }

        EventData::DonationReceived {
            donor,
            amount,
            new_total_raised,
            ..
        } => {
            let amount = parse_amount("amount", amount)?;
            let new_total = parse_amount("new_total_raised", new_total_raised)?;

            if !campaigns::raise_total(&mut tx, &msg.address, &new_total).await? {
                return Err(ApplyError::MissingDependency(format!(
                    "campaign {}",
                    msg.address
                )));
            }
            contributions::add_contribution(&mut tx, &msg.address, donor, &amount).await?;
            campaigns::promote_to_success(&mut tx, &msg.address).await?;
        }

        EventData::Withdrawn { amount, .. } => {
            let amount = parse_amount("amount", amount)?;
            if amount.is_zero() {
                return Err(ApplyError::Invariant(
                    "withdrawal of zero amount".to_string(),
                ));
            }
            match campaigns::status_of(&mut tx, &msg.address).await? {
                None => {
                    return Err(ApplyError::MissingDependency(format!(
                        "campaign {}",
                        msg.address
                    )))
                }
                Some(status) if !status.allows(CampaignStatus::Withdrawn) => {
                    return Err(ApplyError::Invariant(format!(
                        "withdrawal on {} campaign {}",
                        status.as_str(),
                        msg.address
                    )))
                }
                Some(_) => {
                    campaigns::apply_withdrawal(&mut tx, &msg.address, &amount).await?;
                }
            }
        }

        EventData::Refunded { donor, amount, .. } => {
            let amount = parse_amount("amount", amount)?;
            // a refund does not touch total_raised or status; the FAILED
            // transition is owned by the reconciler
            match contributions::add_refund(&mut tx, &msg.address, donor, &amount).await? {
                contributions::RefundOutcome::Applied => {}
                contributions::RefundOutcome::MissingContribution => {
                    return Err(ApplyError::MissingDependency(format!(
                        "contribution ({}, {})",
                        msg.address, donor
                    )))
                }
                contributions::RefundOutcome::ExceedsContributed => {
                    return Err(ApplyError::Invariant(format!(
                        "refund of {} exceeds lifetime contribution of ({}, {})",
                        amount, msg.address, donor
                    )))
                }
            }
        }
    }

    tx.commit().await?;
    Ok(ApplyOutcome::Applied)
}

fn validate(msg: &EventMessage) -> Result<(), ApplyError> {
    if msg.event_type != msg.event_data.kind() {
        return Err(ApplyError::Malformed(format!(
            "event_type {:?} does not match payload shape {:?}",
            msg.event_type,
            msg.event_data.kind()
        )));
    }
    if !msg.tx_hash.starts_with("0x") || !msg.address.starts_with("0x") {
        return Err(ApplyError::Malformed(
            "tx_hash/address missing 0x prefix".to_string(),
        ));
    }
    Ok(())
}

fn parse_amount(field: &str, raw: &str) -> Result<BigDecimal, ApplyError> {
    let value = BigDecimal::from_str(raw)
        .map_err(|e| ApplyError::Malformed(format!("{} is not a decimal: {}", field, e)))?;
    if value < BigDecimal::zero() {
        return Err(ApplyError::Invariant(format!(
            "{} is negative: {}",
            field, raw
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::EventKind;
    use chrono::Utc;

    fn donation_msg() -> EventMessage {
        EventMessage {
            chain_id: 1,
            published_at: Utc::now(),
            event_type: EventKind::DonationReceived,
            block_number: 10,
            block_hash: format!("0x{}", "11".repeat(32)),
            tx_hash: format!("0x{}", "22".repeat(32)),
            log_index: 0,
            address: format!("0x{}", "33".repeat(20)),
            event_data: EventData::DonationReceived {
                donor: format!("0x{}", "44".repeat(20)),
                amount: "1000".to_string(),
                new_total_raised: "1000".to_string(),
                timestamp: 1_700_000_000,
            },
        }
    }

    #[test]
    fn test_validate_accepts_matching_kind() {
        assert!(validate(&donation_msg()).is_ok());
    }

    #[test]
    fn test_validate_rejects_kind_mismatch() {
        let mut msg = donation_msg();
        msg.event_type = EventKind::Withdrawn;
        assert!(matches!(validate(&msg), Err(ApplyError::Malformed(_))));
    }

    #[test]
    fn test_validate_rejects_unprefixed_hashes() {
        let mut msg = donation_msg();
        msg.tx_hash = "22".repeat(32);
        assert!(matches!(validate(&msg), Err(ApplyError::Malformed(_))));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(
            parse_amount("amount", "3000000000000000000").unwrap(),
            BigDecimal::from_str("3000000000000000000").unwrap()
        );
        assert!(matches!(
            parse_amount("amount", "3.5e2x"),
            Err(ApplyError::Malformed(_))
        ));
        assert!(matches!(
            parse_amount("amount", "-1"),
            Err(ApplyError::Invariant(_))
        ));
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(&ApplyError::MissingDependency("campaign 0xabc".into())),
            FailureClass::Retry
        );
        assert_eq!(
            classify(&ApplyError::Malformed("junk".into())),
            FailureClass::Poison
        );
        assert_eq!(
            classify(&ApplyError::Invariant("downgrade".into())),
            FailureClass::Poison
        );
        assert_eq!(
            classify(&ApplyError::Db(sqlx::Error::PoolTimedOut)),
            FailureClass::Retry
        );
        assert_eq!(
            classify(&ApplyError::Db(sqlx::Error::RowNotFound)),
            FailureClass::Poison
        );
    }
}
