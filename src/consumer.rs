/// Consumer pool - N share-nothing workers competing on the durable queues
///
/// Each worker owns its broker connection and processes deliveries one at
/// a time (prefetch bounds in-flight work). Per-campaign ordering is not
/// guaranteed across workers; the state algebra tolerates that. Control
/// messages are serialized by the advisory lock inside their handlers.

use std::collections::HashMap;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker;
use crate::config::Settings;
use crate::error::IndexerError;
use crate::messages::BrokerMessage;
use crate::reconcile::run_reconciliation;
use crate::retry::Backoff;
use crate::rollback::handle_rollback;
use crate::store::is_transient_db_error;
use crate::updater::{self, ApplyOutcome, FailureClass};

/// Per-message redelivery bookkeeping. AMQP redelivery flags carry no
/// count, so attempts are tracked in-memory by idempotency key; the map is
/// bounded so a long-lived worker cannot grow it without limit.
pub struct RetryTracker {
    attempts: HashMap<String, u32>,
    max_retries: u32,
}

const RETRY_TRACKER_CAP: usize = 16_384;

impl RetryTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            attempts: HashMap::new(),
            max_retries,
        }
    }

    /// Record a failed attempt. Returns true while the message still has
    /// retry budget (should be requeued), false once exhausted (should be
    /// dead-lettered).
    pub fn record(&mut self, key: &str) -> bool {
        if self.attempts.len() >= RETRY_TRACKER_CAP && !self.attempts.contains_key(key) {
            // losing counts only grants extra retries, never drops messages
            self.attempts.clear();
        }
        let attempts = self.attempts.entry(key.to_string()).or_insert(0);
        *attempts += 1;
        *attempts <= self.max_retries
    }

    pub fn clear(&mut self, key: &str) {
        self.attempts.remove(key);
    }
}

/// Spawn and supervise the worker pool; resolves when every worker has
/// drained and stopped after shutdown.
pub async fn run_pool(
    settings: Settings,
    pool: PgPool,
    shutdown: CancellationToken,
) -> Result<(), IndexerError> {
    let workers = settings.consumer.workers;
    info!(workers, prefetch = settings.broker.prefetch, "consumer pool starting");

    let mut set = JoinSet::new();
    for worker_id in 0..workers {
        let settings = settings.clone();
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        set.spawn(async move { supervise_worker(worker_id, settings, pool, shutdown).await });
    }

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker task panicked");
        }
    }
    info!("consumer pool stopped");
    Ok(())
}

/// Keep one worker alive across broker connection failures until shutdown.
async fn supervise_worker(
    worker_id: usize,
    settings: Settings,
    pool: PgPool,
    shutdown: CancellationToken,
) {
    let mut backoff = Backoff::transient();
    while !shutdown.is_cancelled() {
        match worker_session(worker_id, &settings, &pool, &shutdown).await {
            Ok(()) => backoff.reset(),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(worker_id, error = %e, retry_in = ?delay, "worker session ended, reconnecting");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    info!(worker_id, "worker stopped");
}

/// One broker session: connect, subscribe to every queue, process
/// deliveries strictly one at a time. Returns Ok on shutdown or on an
/// orderly stream end (caller reconnects).
async fn worker_session(
    worker_id: usize,
    settings: &Settings,
    pool: &PgPool,
    shutdown: &CancellationToken,
) -> Result<(), IndexerError> {
    let connection = broker::connect(&settings.broker).await?;
    let channel = broker::consumer_channel(&connection, settings.broker.prefetch).await?;

    let mut consumers = Vec::with_capacity(broker::ALL_QUEUES.len());
    for queue in broker::ALL_QUEUES {
        let consumer = channel
            .basic_consume(
                queue,
                &format!("crowdex-worker-{}-{}", worker_id, queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        consumers.push(consumer);
    }
    let mut deliveries = futures::stream::select_all(consumers);
    let mut retries = RetryTracker::new(settings.consumer.max_retries);

    debug!(worker_id, "worker consuming");
    loop {
        // take the next delivery or stop; the in-flight message below is
        // always finished before the worker exits
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = deliveries.next() => next,
        };
        let Some(delivery) = next.transpose()? else {
            // all consumers cancelled server-side; reconnect
            return Ok(());
        };
        handle_delivery(pool, &mut retries, delivery, worker_id).await?;
    }
}

/// Dispatch one delivery. Only ack/nack transport failures escape as
/// errors; message-level failures are settled here (requeue or DLQ).
async fn handle_delivery(
    pool: &PgPool,
    retries: &mut RetryTracker,
    delivery: Delivery,
    worker_id: usize,
) -> Result<(), IndexerError> {
    let message: BrokerMessage = match serde_json::from_slice(&delivery.data) {
        Ok(message) => message,
        Err(e) => {
            warn!(worker_id, error = %e, "undeserializable message, dead-lettering");
            nack(&delivery, false).await?;
            return Ok(());
        }
    };

    match message {
        BrokerMessage::Event(event) => {
            let key = event.idempotency_key();
            match updater::apply_event(pool, &event).await {
                Ok(ApplyOutcome::Applied) => {
                    retries.clear(&key);
                    debug!(worker_id, %key, event = event.event_type.as_str(), "event applied");
                    ack(&delivery).await?;
                }
                Ok(ApplyOutcome::Duplicate) => {
                    retries.clear(&key);
                    debug!(worker_id, %key, "duplicate delivery acked");
                    ack(&delivery).await?;
                }
                Err(e) => match updater::classify(&e) {
                    FailureClass::Retry if retries.record(&key) => {
                        warn!(worker_id, %key, error = %e, "retryable failure, requeueing");
                        nack(&delivery, true).await?;
                    }
                    class => {
                        error!(
                            worker_id,
                            %key,
                            error = %e,
                            exhausted = matches!(class, FailureClass::Retry),
                            "dead-lettering event message"
                        );
                        retries.clear(&key);
                        nack(&delivery, false).await?;
                    }
                },
            }
        }

        BrokerMessage::Rollback(rollback) => {
            let key = format!("rollback:{}:{}:{}", rollback.chain_id, rollback.from_block, rollback.to_block);
            match handle_rollback(pool, &rollback).await {
                Ok(_) => {
                    retries.clear(&key);
                    ack(&delivery).await?;
                }
                Err(e) if is_transient_db_error(&e) && retries.record(&key) => {
                    warn!(worker_id, error = %e, "rollback hit transient DB error, requeueing");
                    nack(&delivery, true).await?;
                }
                Err(e) => {
                    error!(worker_id, error = %e, "dead-lettering rollback message");
                    retries.clear(&key);
                    nack(&delivery, false).await?;
                }
            }
        }

        BrokerMessage::Reconciliation(reconciliation) => {
            match run_reconciliation(pool, &reconciliation).await {
                Ok(_) => ack(&delivery).await?,
                Err(e) if is_transient_db_error(&e) => {
                    // the next periodic tick covers a lost sweep; still
                    // requeue so a transient blip does not skip one
                    warn!(worker_id, error = %e, "reconciliation failed, requeueing");
                    nack(&delivery, true).await?;
                }
                Err(e) => {
                    error!(worker_id, error = %e, "dead-lettering reconciliation message");
                    nack(&delivery, false).await?;
                }
            }
        }
    }

    Ok(())
}

async fn ack(delivery: &Delivery) -> Result<(), IndexerError> {
    delivery.ack(BasicAckOptions::default()).await?;
    Ok(())
}

async fn nack(delivery: &Delivery, requeue: bool) -> Result<(), IndexerError> {
    delivery
        .nack(BasicNackOptions {
            requeue,
            ..Default::default()
        })
        .await?;
    Ok(())
}

/// Print queue depths for `consumer status`.
pub async fn print_status(settings: &Settings) -> Result<(), IndexerError> {
    let connection = broker::connect(&settings.broker).await?;
    let channel = connection.create_channel().await?;
    let stats = broker::queue_stats(&channel).await?;

    println!("{:<24} {:>10} {:>10}", "queue", "messages", "consumers");
    for stat in stats {
        println!("{:<24} {:>10} {:>10}", stat.name, stat.messages, stat.consumers);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_tracker_respects_budget() {
        let mut tracker = RetryTracker::new(3);
        let key = "1:0xabc:0";
        assert!(tracker.record(key)); // attempt 1
        assert!(tracker.record(key)); // attempt 2
        assert!(tracker.record(key)); // attempt 3
        assert!(!tracker.record(key)); // exhausted
    }

    #[test]
    fn test_retry_tracker_zero_retries_goes_straight_to_dlq() {
        let mut tracker = RetryTracker::new(0);
        assert!(!tracker.record("k"));
    }

    #[test]
    fn test_retry_tracker_clear_resets_budget() {
        let mut tracker = RetryTracker::new(1);
        assert!(tracker.record("k"));
        tracker.clear("k");
        assert!(tracker.record("k"));
    }

    #[test]
    fn test_retry_tracker_keys_are_independent() {
        let mut tracker = RetryTracker::new(1);
        assert!(tracker.record("a"));
        assert!(tracker.record("b"));
        assert!(!tracker.record("a"));
        assert!(!tracker.record("b"));
    }
}
