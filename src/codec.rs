/// Event Codec - canonical topic hashes and ABI decoding
///
/// The codec turns raw log tuples `(topic0, indexed topics, data)` into
/// typed event records. Decode failures are scoped to the single log: the
/// producer logs and skips, never publishes, so a malformed log can never
/// reach the store.
///
/// Wire ABI: the emitting contract address carries the factory/campaign
/// identity, so it is not repeated as a parameter.

use once_cell::sync::Lazy;
use primitive_types::{H160, H256, U256};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::rpc::RawLog;

pub const SIG_CAMPAIGN_CREATED: &str = "CampaignCreated(address,address,uint256,uint256,string)";
pub const SIG_DONATION_RECEIVED: &str = "DonationReceived(address,uint256,uint256,uint256)";
pub const SIG_WITHDRAWN: &str = "Withdrawn(address,uint256,uint256)";
pub const SIG_REFUNDED: &str = "Refunded(address,uint256,uint256)";

pub static TOPIC_CAMPAIGN_CREATED: Lazy<H256> =
    Lazy::new(|| keccak256(SIG_CAMPAIGN_CREATED.as_bytes()));
pub static TOPIC_DONATION_RECEIVED: Lazy<H256> =
    Lazy::new(|| keccak256(SIG_DONATION_RECEIVED.as_bytes()));
pub static TOPIC_WITHDRAWN: Lazy<H256> = Lazy::new(|| keccak256(SIG_WITHDRAWN.as_bytes()));
pub static TOPIC_REFUNDED: Lazy<H256> = Lazy::new(|| keccak256(SIG_REFUNDED.as_bytes()));

/// All topic0 hashes emitted by campaign contracts.
pub fn campaign_topics() -> Vec<H256> {
    vec![*TOPIC_DONATION_RECEIVED, *TOPIC_WITHDRAWN, *TOPIC_REFUNDED]
}

pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignEvent {
    /// Emitted by the factory when a campaign contract is deployed.
    CampaignCreated {
        campaign: H160,
        creator: H160,
        goal: U256,
        deadline: u64,
        cid: String,
    },
    DonationReceived {
        donor: H160,
        amount: U256,
        new_total_raised: U256,
        timestamp: u64,
    },
    Withdrawn {
        creator: H160,
        amount: U256,
        timestamp: u64,
    },
    Refunded {
        donor: H160,
        amount: U256,
        timestamp: u64,
    },
}

impl CampaignEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CampaignCreated { .. } => "CampaignCreated",
            Self::DonationReceived { .. } => "DonationReceived",
            Self::Withdrawn { .. } => "Withdrawn",
            Self::Refunded { .. } => "Refunded",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown topic0 {0:#x}")]
    UnknownTopic(H256),

    #[error("log has no topics")]
    NoTopics,

    #[error("{event}: expected {expected} topics, got {got}")]
    TopicCount {
        event: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{event}: data too short, expected at least {expected} bytes, got {got}")]
    ShortData {
        event: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{event}: {reason}")]
    Malformed {
        event: &'static str,
        reason: String,
    },
}

/// Total decode function for a raw log.
pub fn decode_log(log: &RawLog) -> Result<CampaignEvent, DecodeError> {
    let topic0 = *log.topics.first().ok_or(DecodeError::NoTopics)?;

    if topic0 == *TOPIC_CAMPAIGN_CREATED {
        decode_campaign_created(log)
    } else if topic0 == *TOPIC_DONATION_RECEIVED {
        decode_donation_received(log)
    } else if topic0 == *TOPIC_WITHDRAWN {
        decode_withdrawn(log)
    } else if topic0 == *TOPIC_REFUNDED {
        decode_refunded(log)
    } else {
        Err(DecodeError::UnknownTopic(topic0))
    }
}

fn decode_campaign_created(log: &RawLog) -> Result<CampaignEvent, DecodeError> {
    const EVENT: &str = "CampaignCreated";
    expect_topics(EVENT, log, 3)?;

    let goal = word_u256(EVENT, &log.data, 0)?;
    let deadline = word_u64(EVENT, &log.data, 1)?;
    let cid = decode_string(EVENT, &log.data, 2)?;

    Ok(CampaignEvent::CampaignCreated {
        campaign: address_topic(&log.topics[1]),
        creator: address_topic(&log.topics[2]),
        goal,
        deadline,
        cid,
    })
}

fn decode_donation_received(log: &RawLog) -> Result<CampaignEvent, DecodeError> {
    const EVENT: &str = "DonationReceived";
    expect_topics(EVENT, log, 2)?;

    Ok(CampaignEvent::DonationReceived {
        donor: address_topic(&log.topics[1]),
        amount: word_u256(EVENT, &log.data, 0)?,
        new_total_raised: word_u256(EVENT, &log.data, 1)?,
        timestamp: word_u64(EVENT, &log.data, 2)?,
    })
}

fn decode_withdrawn(log: &RawLog) -> Result<CampaignEvent, DecodeError> {
    const EVENT: &str = "Withdrawn";
    expect_topics(EVENT, log, 2)?;

    Ok(CampaignEvent::Withdrawn {
        creator: address_topic(&log.topics[1]),
        amount: word_u256(EVENT, &log.data, 0)?,
        timestamp: word_u64(EVENT, &log.data, 1)?,
    })
}

fn decode_refunded(log: &RawLog) -> Result<CampaignEvent, DecodeError> {
    const EVENT: &str = "Refunded";
    expect_topics(EVENT, log, 2)?;

    Ok(CampaignEvent::Refunded {
        donor: address_topic(&log.topics[1]),
        amount: word_u256(EVENT, &log.data, 0)?,
        timestamp: word_u64(EVENT, &log.data, 1)?,
    })
}

fn expect_topics(event: &'static str, log: &RawLog, expected: usize) -> Result<(), DecodeError> {
    if log.topics.len() != expected {
        return Err(DecodeError::TopicCount {
            event,
            expected,
            got: log.topics.len(),
        });
    }
    Ok(())
}

/// Indexed address parameters are left-padded to 32 bytes in topics.
fn address_topic(topic: &H256) -> H160 {
    H160::from_slice(&topic.as_bytes()[12..])
}

fn word<'a>(event: &'static str, data: &'a [u8], index: usize) -> Result<&'a [u8], DecodeError> {
    let start = index * 32;
    let end = start + 32;
    data.get(start..end).ok_or(DecodeError::ShortData {
        event,
        expected: end,
        got: data.len(),
    })
}

fn word_u256(event: &'static str, data: &[u8], index: usize) -> Result<U256, DecodeError> {
    Ok(U256::from_big_endian(word(event, data, index)?))
}

fn word_u64(event: &'static str, data: &[u8], index: usize) -> Result<u64, DecodeError> {
    let value = word_u256(event, data, index)?;
    if value.bits() > 64 {
        return Err(DecodeError::Malformed {
            event,
            reason: format!("value {} does not fit in 64 bits", value),
        });
    }
    Ok(value.low_u64())
}

/// Decode a dynamic `string` parameter: the word at `index` is the byte
/// offset of a length-prefixed UTF-8 payload.
fn decode_string(event: &'static str, data: &[u8], index: usize) -> Result<String, DecodeError> {
    let offset = word_u64(event, data, index)? as usize;
    let len_end = offset.checked_add(32).ok_or(DecodeError::Malformed {
        event,
        reason: "string offset overflow".to_string(),
    })?;
    let len_word = data.get(offset..len_end).ok_or(DecodeError::ShortData {
        event,
        expected: len_end,
        got: data.len(),
    })?;
    let len = U256::from_big_endian(len_word);
    if len.bits() > 32 {
        return Err(DecodeError::Malformed {
            event,
            reason: format!("unreasonable string length {}", len),
        });
    }
    let len = len.low_u64() as usize;
    let bytes = data
        .get(len_end..len_end + len)
        .ok_or(DecodeError::ShortData {
            event,
            expected: len_end + len,
            got: data.len(),
        })?;
    String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::Malformed {
        event,
        reason: format!("string payload is not UTF-8: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h160(byte: u8) -> H160 {
        H160::from([byte; 20])
    }

    fn topic_for(addr: H160) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(addr.as_bytes());
        H256::from(bytes)
    }

    fn u256_word_bytes(value: U256) -> [u8; 32] {
        value.to_big_endian()
    }

    fn raw_log(topics: Vec<H256>, data: Vec<u8>) -> RawLog {
        RawLog {
            address: h160(0xaa),
            topics,
            data,
            block_number: 100,
            block_hash: H256::from([1u8; 32]),
            tx_hash: H256::from([2u8; 32]),
            log_index: 0,
        }
    }

    fn encode_campaign_created(
        campaign: H160,
        creator: H160,
        goal: U256,
        deadline: u64,
        cid: &str,
    ) -> RawLog {
        let mut data = Vec::new();
        data.extend_from_slice(&u256_word_bytes(goal));
        data.extend_from_slice(&u256_word_bytes(U256::from(deadline)));
        // dynamic string: offset, then length, then right-padded payload
        data.extend_from_slice(&u256_word_bytes(U256::from(96u64)));
        data.extend_from_slice(&u256_word_bytes(U256::from(cid.len() as u64)));
        let mut payload = cid.as_bytes().to_vec();
        while payload.len() % 32 != 0 {
            payload.push(0);
        }
        data.extend_from_slice(&payload);

        raw_log(
            vec![*TOPIC_CAMPAIGN_CREATED, topic_for(campaign), topic_for(creator)],
            data,
        )
    }

    fn encode_donation(donor: H160, amount: U256, new_total: U256, ts: u64) -> RawLog {
        let mut data = Vec::new();
        data.extend_from_slice(&u256_word_bytes(amount));
        data.extend_from_slice(&u256_word_bytes(new_total));
        data.extend_from_slice(&u256_word_bytes(U256::from(ts)));
        raw_log(vec![*TOPIC_DONATION_RECEIVED, topic_for(donor)], data)
    }

    #[test]
    fn test_topic_hashes_are_distinct() {
        let topics = [
            *TOPIC_CAMPAIGN_CREATED,
            *TOPIC_DONATION_RECEIVED,
            *TOPIC_WITHDRAWN,
            *TOPIC_REFUNDED,
        ];
        for (i, a) in topics.iter().enumerate() {
            assert_ne!(*a, H256::zero());
            for b in topics.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_decode_campaign_created() {
        let goal = U256::from(10u64) * U256::exp10(18);
        let log = encode_campaign_created(h160(0x11), h160(0x22), goal, 1_700_003_600, "QmTestCid");

        match decode_log(&log).unwrap() {
            CampaignEvent::CampaignCreated {
                campaign,
                creator,
                goal: decoded_goal,
                deadline,
                cid,
            } => {
                assert_eq!(campaign, h160(0x11));
                assert_eq!(creator, h160(0x22));
                assert_eq!(decoded_goal, goal);
                assert_eq!(deadline, 1_700_003_600);
                assert_eq!(cid, "QmTestCid");
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_campaign_created_empty_cid() {
        let log = encode_campaign_created(h160(0x11), h160(0x22), U256::from(5), 1000, "");
        match decode_log(&log).unwrap() {
            CampaignEvent::CampaignCreated { cid, .. } => assert_eq!(cid, ""),
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_donation_received() {
        let amount = U256::from(3u64) * U256::exp10(18);
        let new_total = U256::from(7u64) * U256::exp10(18);
        let log = encode_donation(h160(0x33), amount, new_total, 1_700_000_000);

        match decode_log(&log).unwrap() {
            CampaignEvent::DonationReceived {
                donor,
                amount: a,
                new_total_raised,
                timestamp,
            } => {
                assert_eq!(donor, h160(0x33));
                assert_eq!(a, amount);
                assert_eq!(new_total_raised, new_total);
                assert_eq!(timestamp, 1_700_000_000);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_withdrawn_and_refunded() {
        let amount = U256::from(42u64);
        let mut data = Vec::new();
        data.extend_from_slice(&u256_word_bytes(amount));
        data.extend_from_slice(&u256_word_bytes(U256::from(123u64)));

        let withdrawn = raw_log(vec![*TOPIC_WITHDRAWN, topic_for(h160(0x44))], data.clone());
        match decode_log(&withdrawn).unwrap() {
            CampaignEvent::Withdrawn {
                creator,
                amount: a,
                timestamp,
            } => {
                assert_eq!(creator, h160(0x44));
                assert_eq!(a, amount);
                assert_eq!(timestamp, 123);
            }
            other => panic!("wrong event: {:?}", other),
        }

        let refunded = raw_log(vec![*TOPIC_REFUNDED, topic_for(h160(0x55))], data);
        match decode_log(&refunded).unwrap() {
            CampaignEvent::Refunded { donor, .. } => assert_eq!(donor, h160(0x55)),
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_topic() {
        let log = raw_log(vec![keccak256(b"SomethingElse(uint256)")], vec![0u8; 32]);
        assert!(matches!(
            decode_log(&log),
            Err(DecodeError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_decode_no_topics() {
        let log = raw_log(vec![], vec![]);
        assert!(matches!(decode_log(&log), Err(DecodeError::NoTopics)));
    }

    #[test]
    fn test_decode_wrong_topic_count() {
        let log = raw_log(vec![*TOPIC_DONATION_RECEIVED], vec![0u8; 96]);
        assert!(matches!(
            decode_log(&log),
            Err(DecodeError::TopicCount { .. })
        ));
    }

    #[test]
    fn test_decode_truncated_data() {
        let log = raw_log(
            vec![*TOPIC_DONATION_RECEIVED, topic_for(h160(0x33))],
            vec![0u8; 40],
        );
        assert!(matches!(
            decode_log(&log),
            Err(DecodeError::ShortData { .. })
        ));
    }

    #[test]
    fn test_decode_string_bad_offset() {
        let mut data = Vec::new();
        data.extend_from_slice(&u256_word_bytes(U256::from(1u64)));
        data.extend_from_slice(&u256_word_bytes(U256::from(1000u64)));
        // offset points far past the end of data
        data.extend_from_slice(&u256_word_bytes(U256::from(4096u64)));

        let log = raw_log(
            vec![*TOPIC_CAMPAIGN_CREATED, topic_for(h160(1)), topic_for(h160(2))],
            data,
        );
        assert!(matches!(
            decode_log(&log),
            Err(DecodeError::ShortData { .. })
        ));
    }

    #[test]
    fn test_decode_string_bad_utf8() {
        let mut data = Vec::new();
        data.extend_from_slice(&u256_word_bytes(U256::from(1u64)));
        data.extend_from_slice(&u256_word_bytes(U256::from(1000u64)));
        data.extend_from_slice(&u256_word_bytes(U256::from(96u64)));
        data.extend_from_slice(&u256_word_bytes(U256::from(2u64)));
        let mut payload = vec![0xff, 0xfe];
        payload.resize(32, 0);
        data.extend_from_slice(&payload);

        let log = raw_log(
            vec![*TOPIC_CAMPAIGN_CREATED, topic_for(h160(1)), topic_for(h160(2))],
            data,
        );
        assert!(matches!(
            decode_log(&log),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_address_topic_extraction() {
        let addr = h160(0xab);
        assert_eq!(address_topic(&topic_for(addr)), addr);
    }
}
