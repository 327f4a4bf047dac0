/// Broker topology
///
/// One durable topic exchange, four durable primary queues bound by
/// routing key, and a dead-letter exchange + queue for poison messages.
/// Declarations are idempotent; `broker setup` can be re-run at any time.

pub mod publisher;

use lapin::options::{
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};

use crate::config::BrokerSettings;
use crate::messages::{
    RK_CAMPAIGN_CREATED, RK_DONATION_RECEIVED, RK_RECONCILIATION, RK_REFUNDED, RK_ROLLBACK,
    RK_WITHDRAWN,
};

pub const Q_CAMPAIGN_CREATED: &str = "q.campaign_created";
pub const Q_DONATION_RECEIVED: &str = "q.donation_received";
pub const Q_WITHDRAWAL_REFUND: &str = "q.withdrawal_refund";
pub const Q_CONTROL: &str = "q.control";
pub const DLQ_EVENTS: &str = "dlq.events";

/// Primary queues and the routing keys bound to each.
pub const BINDINGS: [(&str, &[&str]); 4] = [
    (Q_CAMPAIGN_CREATED, &[RK_CAMPAIGN_CREATED]),
    (Q_DONATION_RECEIVED, &[RK_DONATION_RECEIVED]),
    (Q_WITHDRAWAL_REFUND, &[RK_WITHDRAWN, RK_REFUNDED]),
    (Q_CONTROL, &[RK_ROLLBACK, RK_RECONCILIATION]),
];

/// Every queue a worker consumes, campaign creation first so fresh rows
/// exist before their donations where possible.
pub const ALL_QUEUES: [&str; 4] = [
    Q_CAMPAIGN_CREATED,
    Q_DONATION_RECEIVED,
    Q_WITHDRAWAL_REFUND,
    Q_CONTROL,
];

pub fn dead_letter_exchange(exchange: &str) -> String {
    format!("{}.dlx", exchange)
}

pub async fn connect(settings: &BrokerSettings) -> Result<Connection, lapin::Error> {
    Connection::connect(&settings.url, ConnectionProperties::default()).await
}

/// Declare the exchange, queues, bindings and dead-letter path.
pub async fn declare_topology(channel: &Channel, exchange: &str) -> Result<(), lapin::Error> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };
    let dlx = dead_letter_exchange(exchange);

    channel
        .exchange_declare(exchange, ExchangeKind::Topic, durable, FieldTable::default())
        .await?;
    channel
        .exchange_declare(&dlx, ExchangeKind::Topic, durable, FieldTable::default())
        .await?;

    let queue_options = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    for (queue, routing_keys) in BINDINGS {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.clone().into()),
        );
        channel.queue_declare(queue, queue_options, args).await?;
        for routing_key in routing_keys {
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
    }

    // dead-lettered messages keep their original routing key; catch them all
    channel
        .queue_declare(DLQ_EVENTS, queue_options, FieldTable::default())
        .await?;
    channel
        .queue_bind(
            DLQ_EVENTS,
            &dlx,
            "#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

/// Open a consuming channel with bounded prefetch.
pub async fn consumer_channel(
    connection: &Connection,
    prefetch: u16,
) -> Result<Channel, lapin::Error> {
    let channel = connection.create_channel().await?;
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await?;
    Ok(channel)
}

#[derive(Debug)]
pub struct QueueStats {
    pub name: &'static str,
    pub messages: u32,
    pub consumers: u32,
}

/// Per-queue message and consumer counts via passive declares.
pub async fn queue_stats(channel: &Channel) -> Result<Vec<QueueStats>, lapin::Error> {
    let passive = QueueDeclareOptions {
        passive: true,
        ..Default::default()
    };
    let mut stats = Vec::new();
    for name in ALL_QUEUES.into_iter().chain([DLQ_EVENTS]) {
        let queue = channel
            .queue_declare(name, passive, FieldTable::default())
            .await?;
        stats.push(QueueStats {
            name,
            messages: queue.message_count(),
            consumers: queue.consumer_count(),
        });
    }
    Ok(stats)
}

/// Empty one queue; returns the number of purged messages.
pub async fn purge_queue(channel: &Channel, queue: &str) -> Result<u32, lapin::Error> {
    channel.queue_purge(queue, QueuePurgeOptions::default()).await
}

pub fn is_known_queue(queue: &str) -> bool {
    ALL_QUEUES.contains(&queue) || queue == DLQ_EVENTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings_cover_all_routing_keys() {
        let bound: Vec<&str> = BINDINGS.iter().flat_map(|(_, keys)| keys.iter().copied()).collect();
        for key in [
            RK_CAMPAIGN_CREATED,
            RK_DONATION_RECEIVED,
            RK_WITHDRAWN,
            RK_REFUNDED,
            RK_ROLLBACK,
            RK_RECONCILIATION,
        ] {
            assert!(bound.contains(&key), "routing key {} unbound", key);
        }
    }

    #[test]
    fn test_withdrawal_and_refund_share_a_queue() {
        let (queue, keys) = BINDINGS
            .iter()
            .find(|(q, _)| *q == Q_WITHDRAWAL_REFUND)
            .unwrap();
        assert_eq!(*queue, Q_WITHDRAWAL_REFUND);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_dead_letter_exchange_name() {
        assert_eq!(dead_letter_exchange("crowdex.events"), "crowdex.events.dlx");
    }

    #[test]
    fn test_known_queues() {
        assert!(is_known_queue("q.control"));
        assert!(is_known_queue("dlq.events"));
        assert!(!is_known_queue("q.unknown"));
    }
}
