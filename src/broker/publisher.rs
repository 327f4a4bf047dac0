/// Confirmed publisher
///
/// Publishes persistent messages on a confirm-mode channel. The producer's
/// batch commit awaits the conjunction of all per-message confirmations; a
/// negative ack or error aborts the batch so the cursor never advances
/// past unconfirmed messages.

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::{Confirmation, PublisherConfirm};
use lapin::{BasicProperties, Channel, Connection};
use thiserror::Error;

use crate::messages::BrokerMessage;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("message serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("broker negatively acknowledged a publish on {routing_key}")]
    Nacked { routing_key: &'static str },
}

pub struct Publisher {
    channel: Channel,
    exchange: String,
}

impl Publisher {
    pub async fn new(connection: &Connection, exchange: &str) -> Result<Self, lapin::Error> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            channel,
            exchange: exchange.to_string(),
        })
    }

    /// Publish one message and wait for its broker acknowledgment.
    pub async fn publish(&self, message: &BrokerMessage) -> Result<(), PublishError> {
        let confirm = self.submit(message).await?;
        Self::settle(confirm, message.routing_key()).await
    }

    /// Publish a whole batch, then wait on the conjunction of confirms.
    /// Any nack fails the batch; duplicates from a republish are safe
    /// because the sink is idempotent.
    pub async fn publish_all(&self, messages: &[BrokerMessage]) -> Result<(), PublishError> {
        let mut in_flight = Vec::with_capacity(messages.len());
        for message in messages {
            in_flight.push((self.submit(message).await?, message.routing_key()));
        }
        for (confirm, routing_key) in in_flight {
            Self::settle(confirm, routing_key).await?;
        }
        Ok(())
    }

    async fn submit(&self, message: &BrokerMessage) -> Result<PublisherConfirm, PublishError> {
        let payload = serde_json::to_vec(message)?;
        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                message.routing_key(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // persistent
                    .with_content_type("application/json".into()),
            )
            .await?;
        Ok(confirm)
    }

    async fn settle(
        confirm: PublisherConfirm,
        routing_key: &'static str,
    ) -> Result<(), PublishError> {
        match confirm.await? {
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(PublishError::Nacked { routing_key }),
        }
    }
}
