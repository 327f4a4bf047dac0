/// Producer - polls finalized blocks and publishes typed event messages
///
/// Single logical thread of control. The only persistent write is the sync
/// cursor, committed strictly after the publisher-confirm barrier, so the
/// producer is safe to kill and restart at any point; consumers fold the
/// re-published tail into no-ops.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use primitive_types::H160;
use sqlx::PgPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::publisher::Publisher;
use crate::codec::{campaign_topics, decode_log, CampaignEvent, TOPIC_CAMPAIGN_CREATED};
use crate::config::Settings;
use crate::error::IndexerError;
use crate::messages::{
    format_hash, BrokerMessage, EventMessage, ReconciliationMessage, RollbackMessage,
};
use crate::reorg::{self, ReorgDetection};
use crate::retry::Backoff;
use crate::rpc::{parse_h160, ChainClient, RpcError};
use crate::store::cursor::{self, ZERO_HASH};
use crate::store::{campaigns, events};
use crate::telemetry::truncate_hex;

/// How long the producer waits for consumers to drain a rollback before
/// giving up and retrying the whole iteration.
const ROLLBACK_BARRIER_TIMEOUT_SECS: u64 = 120;
const ROLLBACK_BARRIER_POLL_MS: u64 = 500;

enum Iteration {
    /// Published a batch and advanced the cursor to the given height.
    Advanced { to: u64, published: usize },
    /// Nothing new under the finality horizon.
    Idle,
    /// A reorg was handled; the cursor was rewound.
    RolledBack,
}

pub struct Producer {
    settings: Settings,
    client: ChainClient,
    pool: PgPool,
    publisher: Publisher,
    factory: H160,
    chain_id: u64,
    /// Known campaign addresses, refreshed from the store each iteration
    /// and unioned with same-batch discoveries not yet materialized by
    /// consumers.
    known_campaigns: HashSet<H160>,
    last_reconcile: Option<Instant>,
}

impl Producer {
    pub fn new(
        settings: Settings,
        pool: PgPool,
        publisher: Publisher,
    ) -> Result<Self, IndexerError> {
        let client = ChainClient::new(
            &settings.chain.rpc_url,
            Duration::from_secs(settings.chain.rpc_timeout_seconds),
        )?;
        let factory = parse_h160(&settings.chain.factory_address)?;
        let chain_id = settings.chain.chain_id;
        Ok(Self {
            settings,
            client,
            pool,
            publisher,
            factory,
            chain_id,
            known_campaigns: HashSet::new(),
            last_reconcile: None,
        })
    }

    /// Main polling loop; returns cleanly on shutdown, with an error only
    /// for fatal (non-retryable) failures.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), IndexerError> {
        info!(
            chain_id = self.chain_id,
            factory = %format!("{:#x}", self.factory),
            batch_blocks = self.settings.poll.batch_blocks,
            confirmations = self.settings.chain.confirmations,
            "producer started"
        );

        let poll_interval = Duration::from_secs_f64(self.settings.poll.interval_seconds);
        let mut backoff = Backoff::transient();

        while !shutdown.is_cancelled() {
            match self.iteration().await {
                Ok(Iteration::Advanced { to, published }) => {
                    backoff.reset();
                    info!(to, published, "batch confirmed, cursor advanced");
                }
                Ok(Iteration::Idle) => {
                    backoff.reset();
                    sleep_or_cancel(poll_interval, &shutdown).await;
                }
                Ok(Iteration::RolledBack) => {
                    backoff.reset();
                }
                Err(IndexerError::Rpc(RpcError::Fatal(message))) => {
                    error!(%message, "fatal RPC failure, shutting down");
                    return Err(IndexerError::Rpc(RpcError::Fatal(message)));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "iteration failed, backing off");
                    sleep_or_cancel(delay, &shutdown).await;
                }
            }
        }

        info!("producer stopped");
        Ok(())
    }

    async fn iteration(&mut self) -> Result<Iteration, IndexerError> {
        let cursor = cursor::read(&self.pool, self.chain_id).await?;

        if let Some(detection) = reorg::probe(
            &self.client,
            &self.pool,
            self.chain_id,
            &cursor,
            self.settings.reorg.rollback_depth,
        )
        .await?
        {
            self.execute_rollback(&detection).await?;
            return Ok(Iteration::RolledBack);
        }

        let finalized = self
            .client
            .latest_finalized_block(self.settings.chain.confirmations)
            .await?;
        let target = finalized.min(cursor.height + self.settings.poll.batch_blocks);
        if target <= cursor.height {
            self.reconcile_tick().await?;
            return Ok(Iteration::Idle);
        }
        let from = cursor.height + 1;

        self.refresh_known_campaigns().await?;
        let messages = self.scan_range(from, target).await?;

        if !messages.is_empty() {
            self.publisher.publish_all(&messages).await?;
        }

        // NotFound here means the chain shrank between the scan and now;
        // surface it as transient so the next iteration's probe handles it
        let target_hash = match self.client.block_hash_at(target).await {
            Ok(hash) => hash,
            Err(RpcError::NotFound { height }) => {
                return Err(IndexerError::Rpc(RpcError::Transient(format!(
                    "target block {} vanished before cursor commit",
                    height
                ))))
            }
            Err(e) => return Err(e.into()),
        };
        cursor::commit(&self.pool, self.chain_id, target, &format_hash(&target_hash)).await?;

        self.reconcile_tick().await?;

        Ok(Iteration::Advanced {
            to: target,
            published: messages.len(),
        })
    }

    /// Fetch and decode both contract types over `[from, to]`. Factory
    /// first: campaigns discovered here join this same scan's address set,
    /// since the cursor will advance past the range.
    async fn scan_range(&mut self, from: u64, to: u64) -> Result<Vec<BrokerMessage>, IndexerError> {
        let mut messages = Vec::new();

        let factory_logs = self
            .client
            .get_logs(&[self.factory], from, to, &[*TOPIC_CAMPAIGN_CREATED])
            .await?;
        for log in &factory_logs {
            match decode_log(log) {
                Ok(event) => {
                    if let CampaignEvent::CampaignCreated { campaign, .. } = &event {
                        self.known_campaigns.insert(*campaign);
                    }
                    messages.push(BrokerMessage::Event(EventMessage::from_decoded(
                        self.chain_id,
                        log,
                        &event,
                    )));
                }
                Err(e) => {
                    warn!(
                        tx_hash = %truncate_hex(&format_hash(&log.tx_hash), 18),
                        log_index = log.log_index,
                        error = %e,
                        "skipping undecodable factory log"
                    );
                }
            }
        }

        if !self.known_campaigns.is_empty() {
            let addresses: Vec<H160> = self.known_campaigns.iter().copied().collect();
            let campaign_logs = self
                .client
                .get_logs(&addresses, from, to, &campaign_topics())
                .await?;
            for log in &campaign_logs {
                match decode_log(log) {
                    Ok(event) => {
                        messages.push(BrokerMessage::Event(EventMessage::from_decoded(
                            self.chain_id,
                            log,
                            &event,
                        )));
                    }
                    Err(e) => {
                        warn!(
                            tx_hash = %truncate_hex(&format_hash(&log.tx_hash), 18),
                            log_index = log.log_index,
                            error = %e,
                            "skipping undecodable campaign log"
                        );
                    }
                }
            }
        }

        Ok(messages)
    }

    async fn refresh_known_campaigns(&mut self) -> Result<(), IndexerError> {
        for address in campaigns::all_addresses(&self.pool).await? {
            match parse_h160(&address) {
                Ok(parsed) => {
                    self.known_campaigns.insert(parsed);
                }
                Err(e) => warn!(%address, error = %e, "unparseable campaign address in store"),
            }
        }
        Ok(())
    }

    /// Publish the rollback, wait until consumers have flipped the whole
    /// window, then rewind the cursor. No event messages are published in
    /// between.
    async fn execute_rollback(&self, detection: &ReorgDetection) -> Result<(), IndexerError> {
        let message = BrokerMessage::Rollback(RollbackMessage {
            chain_id: self.chain_id,
            published_at: Utc::now(),
            from_block: detection.rewind_to,
            to_block: detection.to_block,
            reason: detection.reason.clone(),
        });
        self.publisher.publish(&message).await?;

        self.await_rollback_drained(detection).await?;

        let hash = if detection.rewind_to == 0 {
            ZERO_HASH.to_string()
        } else {
            format_hash(&self.client.block_hash_at(detection.rewind_to).await?)
        };
        cursor::commit(&self.pool, self.chain_id, detection.rewind_to, &hash).await?;
        info!(
            rewind_to = detection.rewind_to,
            to_block = detection.to_block,
            "cursor rewound after rollback"
        );
        Ok(())
    }

    async fn await_rollback_drained(&self, detection: &ReorgDetection) -> Result<(), IndexerError> {
        let deadline = Instant::now() + Duration::from_secs(ROLLBACK_BARRIER_TIMEOUT_SECS);
        loop {
            let live = events::count_live_in_range(
                &self.pool,
                self.chain_id,
                detection.rewind_to,
                detection.to_block,
            )
            .await?;
            if live == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(IndexerError::RollbackBarrierTimeout(
                    ROLLBACK_BARRIER_TIMEOUT_SECS,
                ));
            }
            tokio::time::sleep(Duration::from_millis(ROLLBACK_BARRIER_POLL_MS)).await;
        }
    }

    /// Throttled control-plane tick asking consumers to run the deadline
    /// sweep.
    async fn reconcile_tick(&mut self) -> Result<(), IndexerError> {
        let interval = Duration::from_secs_f64(self.settings.reconcile.interval_seconds);
        let due = match self.last_reconcile {
            None => true,
            Some(last) => last.elapsed() >= interval,
        };
        if !due {
            return Ok(());
        }
        let now = Utc::now();
        self.publisher
            .publish(&BrokerMessage::Reconciliation(ReconciliationMessage {
                chain_id: self.chain_id,
                published_at: now,
                triggered_at: now,
            }))
            .await?;
        self.last_reconcile = Some(Instant::now());
        Ok(())
    }

    /// Process a bounded historical range, in batch-sized chunks, without
    /// touching the cursor. Duplicates fold into no-ops at the sink.
    pub async fn backfill(&mut self, from: u64, to: u64) -> Result<usize, IndexerError> {
        if from > to {
            return Err(IndexerError::Other(format!(
                "backfill range is inverted: {} > {}",
                from, to
            )));
        }
        self.refresh_known_campaigns().await?;

        let mut published = 0usize;
        let mut chunk_start = from;
        while chunk_start <= to {
            let chunk_end = to.min(chunk_start + self.settings.poll.batch_blocks - 1);
            let messages = self.scan_range(chunk_start, chunk_end).await?;
            if !messages.is_empty() {
                self.publisher.publish_all(&messages).await?;
            }
            published += messages.len();
            info!(
                from = chunk_start,
                to = chunk_end,
                published = messages.len(),
                "backfill chunk confirmed"
            );
            chunk_start = chunk_end + 1;
        }
        Ok(published)
    }
}

async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Print the cursor position and lag behind the finalized head.
pub async fn print_status(settings: &Settings, pool: &PgPool) -> Result<(), IndexerError> {
    let client = ChainClient::new(
        &settings.chain.rpc_url,
        Duration::from_secs(settings.chain.rpc_timeout_seconds),
    )?;
    let cursor = cursor::read(pool, settings.chain.chain_id).await?;
    let finalized = client
        .latest_finalized_block(settings.chain.confirmations)
        .await?;
    let lag = finalized.saturating_sub(cursor.height);

    println!("chain id:        {}", settings.chain.chain_id);
    println!("cursor height:   {}", cursor.height);
    println!("cursor hash:     {}", cursor.hash);
    println!("finalized head:  {}", finalized);
    println!("lag:             {} block(s)", lag);
    Ok(())
}
