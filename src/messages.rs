/// Broker wire format
///
/// JSON messages, schema-validated at the consumer boundary by typed
/// deserialization. Amounts travel as decimal strings (256-bit values must
/// never pass through floats); addresses and hashes are 0x-prefixed
/// lowercase hex.

use chrono::{DateTime, Utc};
use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};

use crate::codec::CampaignEvent;
use crate::rpc::RawLog;

pub const RK_CAMPAIGN_CREATED: &str = "event.campaign_created";
pub const RK_DONATION_RECEIVED: &str = "event.donation_received";
pub const RK_WITHDRAWN: &str = "event.withdrawn";
pub const RK_REFUNDED: &str = "event.refunded";
pub const RK_ROLLBACK: &str = "control.rollback";
pub const RK_RECONCILIATION: &str = "control.reconciliation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CampaignCreated,
    DonationReceived,
    Withdrawn,
    Refunded,
}

impl EventKind {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::CampaignCreated => RK_CAMPAIGN_CREATED,
            Self::DonationReceived => RK_DONATION_RECEIVED,
            Self::Withdrawn => RK_WITHDRAWN,
            Self::Refunded => RK_REFUNDED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CampaignCreated => "CampaignCreated",
            Self::DonationReceived => "DonationReceived",
            Self::Withdrawn => "Withdrawn",
            Self::Refunded => "Refunded",
        }
    }
}

/// Common envelope plus per-type payloads. `message_type` is the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum BrokerMessage {
    Event(EventMessage),
    Rollback(RollbackMessage),
    Reconciliation(ReconciliationMessage),
}

impl BrokerMessage {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::Event(event) => event.event_type.routing_key(),
            Self::Rollback(_) => RK_ROLLBACK,
            Self::Reconciliation(_) => RK_RECONCILIATION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub chain_id: u64,
    pub published_at: DateTime<Utc>,
    pub event_type: EventKind,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub log_index: u64,
    /// Emitting contract address (factory or campaign), lowercase
    pub address: String,
    pub event_data: EventData,
}

/// Decoded event fields, name-keyed. Variants are disambiguated by their
/// field sets; `event_type` is cross-checked against the parsed variant at
/// the consumer boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    CampaignCreated {
        campaign: String,
        creator: String,
        goal: String,
        deadline: u64,
        cid: String,
    },
    DonationReceived {
        donor: String,
        amount: String,
        new_total_raised: String,
        timestamp: u64,
    },
    Withdrawn {
        creator: String,
        amount: String,
        timestamp: u64,
    },
    Refunded {
        donor: String,
        amount: String,
        timestamp: u64,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CampaignCreated { .. } => EventKind::CampaignCreated,
            Self::DonationReceived { .. } => EventKind::DonationReceived,
            Self::Withdrawn { .. } => EventKind::Withdrawn,
            Self::Refunded { .. } => EventKind::Refunded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackMessage {
    pub chain_id: u64,
    pub published_at: DateTime<Utc>,
    /// Exclusive lower bound of the orphaned range
    pub from_block: u64,
    /// Inclusive upper bound of the orphaned range
    pub to_block: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationMessage {
    pub chain_id: u64,
    pub published_at: DateTime<Utc>,
    pub triggered_at: DateTime<Utc>,
}

pub fn format_address(address: &H160) -> String {
    format!("{:#x}", address)
}

pub fn format_hash(hash: &H256) -> String {
    format!("{:#x}", hash)
}

pub fn format_amount(amount: &U256) -> String {
    amount.to_string()
}

impl EventMessage {
    /// Build the wire message for one decoded log.
    pub fn from_decoded(chain_id: u64, log: &RawLog, event: &CampaignEvent) -> Self {
        let (event_type, event_data) = match event {
            CampaignEvent::CampaignCreated {
                campaign,
                creator,
                goal,
                deadline,
                cid,
            } => (
                EventKind::CampaignCreated,
                EventData::CampaignCreated {
                    campaign: format_address(campaign),
                    creator: format_address(creator),
                    goal: format_amount(goal),
                    deadline: *deadline,
                    cid: cid.clone(),
                },
            ),
            CampaignEvent::DonationReceived {
                donor,
                amount,
                new_total_raised,
                timestamp,
            } => (
                EventKind::DonationReceived,
                EventData::DonationReceived {
                    donor: format_address(donor),
                    amount: format_amount(amount),
                    new_total_raised: format_amount(new_total_raised),
                    timestamp: *timestamp,
                },
            ),
            CampaignEvent::Withdrawn {
                creator,
                amount,
                timestamp,
            } => (
                EventKind::Withdrawn,
                EventData::Withdrawn {
                    creator: format_address(creator),
                    amount: format_amount(amount),
                    timestamp: *timestamp,
                },
            ),
            CampaignEvent::Refunded {
                donor,
                amount,
                timestamp,
            } => (
                EventKind::Refunded,
                EventData::Refunded {
                    donor: format_address(donor),
                    amount: format_amount(amount),
                    timestamp: *timestamp,
                },
            ),
        };

        Self {
            chain_id,
            published_at: Utc::now(),
            event_type,
            block_number: log.block_number,
            block_hash: format_hash(&log.block_hash),
            tx_hash: format_hash(&log.tx_hash),
            log_index: log.log_index,
            address: format_address(&log.address),
            event_data,
        }
    }

    /// The idempotency key of the underlying on-chain event.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.chain_id, self.tx_hash, self.log_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn donation_message() -> BrokerMessage {
        BrokerMessage::Event(EventMessage {
            chain_id: 31337,
            published_at: Utc::now(),
            event_type: EventKind::DonationReceived,
            block_number: 120,
            block_hash: "0x".to_string() + &"11".repeat(32),
            tx_hash: "0x".to_string() + &"22".repeat(32),
            log_index: 3,
            address: "0x".to_string() + &"33".repeat(20),
            event_data: EventData::DonationReceived {
                donor: "0x".to_string() + &"44".repeat(20),
                amount: "3000000000000000000".to_string(),
                new_total_raised: "10000000000000000000".to_string(),
                timestamp: 1_700_000_000,
            },
        })
    }

    #[test]
    fn test_event_message_wire_shape() {
        let json = serde_json::to_value(donation_message()).unwrap();
        assert_eq!(json["message_type"], "event");
        assert_eq!(json["event_type"], "donation_received");
        assert_eq!(json["chain_id"], 31337);
        assert_eq!(json["block_number"], 120);
        assert_eq!(json["log_index"], 3);
        // amounts are decimal strings, not numbers
        assert_eq!(json["event_data"]["amount"], "3000000000000000000");
        assert_eq!(
            json["event_data"]["new_total_raised"],
            "10000000000000000000"
        );
    }

    #[test]
    fn test_round_trip_event() {
        let bytes = serde_json::to_vec(&donation_message()).unwrap();
        let parsed: BrokerMessage = serde_json::from_slice(&bytes).unwrap();
        match parsed {
            BrokerMessage::Event(event) => {
                assert_eq!(event.event_type, EventKind::DonationReceived);
                assert_eq!(event.event_data.kind(), EventKind::DonationReceived);
                assert_eq!(event.log_index, 3);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_rollback_wire_shape() {
        let message = BrokerMessage::Rollback(RollbackMessage {
            chain_id: 1,
            published_at: Utc::now(),
            from_block: 950,
            to_block: 1000,
            reason: "hash mismatch at cursor".to_string(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["message_type"], "rollback");
        assert_eq!(json["from_block"], 950);
        assert_eq!(json["to_block"], 1000);
        assert_eq!(message.routing_key(), RK_ROLLBACK);
    }

    #[test]
    fn test_reconciliation_wire_shape() {
        let message = BrokerMessage::Reconciliation(ReconciliationMessage {
            chain_id: 1,
            published_at: Utc::now(),
            triggered_at: Utc::now(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["message_type"], "reconciliation");
        assert!(json["triggered_at"].is_string());
        assert_eq!(message.routing_key(), RK_RECONCILIATION);
    }

    #[test]
    fn test_untagged_event_data_disambiguation() {
        // Withdrawn and Refunded share shape except creator vs donor
        let withdrawn: EventData = serde_json::from_str(
            r#"{"creator": "0xabc", "amount": "5", "timestamp": 1}"#,
        )
        .unwrap();
        assert_eq!(withdrawn.kind(), EventKind::Withdrawn);

        let refunded: EventData =
            serde_json::from_str(r#"{"donor": "0xabc", "amount": "5", "timestamp": 1}"#).unwrap();
        assert_eq!(refunded.kind(), EventKind::Refunded);

        let donation: EventData = serde_json::from_str(
            r#"{"donor": "0xabc", "amount": "5", "new_total_raised": "5", "timestamp": 1}"#,
        )
        .unwrap();
        assert_eq!(donation.kind(), EventKind::DonationReceived);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let garbage = br#"{"message_type": "event", "chain_id": "not-a-number"}"#;
        assert!(serde_json::from_slice::<BrokerMessage>(garbage).is_err());

        let unknown = br#"{"message_type": "mystery"}"#;
        assert!(serde_json::from_slice::<BrokerMessage>(unknown).is_err());
    }

    #[test]
    fn test_routing_keys() {
        assert_eq!(EventKind::CampaignCreated.routing_key(), RK_CAMPAIGN_CREATED);
        assert_eq!(
            EventKind::DonationReceived.routing_key(),
            RK_DONATION_RECEIVED
        );
        assert_eq!(EventKind::Withdrawn.routing_key(), RK_WITHDRAWN);
        assert_eq!(EventKind::Refunded.routing_key(), RK_REFUNDED);
    }

    #[test]
    fn test_from_decoded_normalizes_case() {
        use crate::codec::CampaignEvent;
        let log = RawLog {
            address: H160::from([0xAB; 20]),
            topics: vec![],
            data: vec![],
            block_number: 7,
            block_hash: H256::from([0xCD; 32]),
            tx_hash: H256::from([0xEF; 32]),
            log_index: 1,
        };
        let event = CampaignEvent::Withdrawn {
            creator: H160::from([0xAB; 20]),
            amount: U256::from(1u64),
            timestamp: 9,
        };
        let message = EventMessage::from_decoded(5, &log, &event);
        assert_eq!(message.address, format!("0x{}", "ab".repeat(20)));
        assert_eq!(message.block_hash, format!("0x{}", "cd".repeat(32)));
        assert_eq!(message.idempotency_key(), format!("5:0x{}:1", "ef".repeat(32)));
    }
}
