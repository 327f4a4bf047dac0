/// Chain Client - typed wrapper over Ethereum JSON-RPC
///
/// Stateless: no block data is cached across calls, every result may be
/// superseded by a reorg. Three operations are exposed: latest finalized
/// height, block hash at height, and log fetch by address set + range +
/// topic0 set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use primitive_types::{H160, H256};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// Network timeouts, connection failures, 5xx, rate limits. Retryable.
    #[error("transient RPC failure: {0}")]
    Transient(String),

    /// Protocol mismatch or malformed response. Not retryable.
    #[error("fatal RPC failure: {0}")]
    Fatal(String),

    /// Requested height is beyond the current head.
    #[error("block at height {height} not found")]
    NotFound { height: u64 },
}

/// A raw, undecoded log entry as returned by eth_getLogs.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: H160,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: H256,
    pub tx_hash: H256,
    pub log_index: u64,
}

pub struct ChainClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl ChainClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Head height minus `confirmations`.
    pub async fn latest_finalized_block(&self, confirmations: u64) -> Result<u64, RpcError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let head = parse_quantity(&result)?;
        Ok(head.saturating_sub(confirmations))
    }

    /// Hash of the canonical block at `height`. `NotFound` past head.
    pub async fn block_hash_at(&self, height: u64) -> Result<H256, RpcError> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("{:#x}", height), false]),
            )
            .await?;
        if result.is_null() {
            return Err(RpcError::NotFound { height });
        }
        let hash = result
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Fatal("block object has no hash field".to_string()))?;
        parse_h256(hash)
    }

    /// Logs emitted by `addresses` in `[from, to]` (both inclusive) whose
    /// topic0 is one of `topics0`, ordered by (block_number, log_index).
    pub async fn get_logs(
        &self,
        addresses: &[H160],
        from: u64,
        to: u64,
        topics0: &[H256],
    ) -> Result<Vec<RawLog>, RpcError> {
        let filter = json!({
            "fromBlock": format!("{:#x}", from),
            "toBlock": format!("{:#x}", to),
            "address": addresses.iter().map(|a| format!("{:#x}", a)).collect::<Vec<_>>(),
            "topics": [topics0.iter().map(|t| format!("{:#x}", t)).collect::<Vec<_>>()],
        });
        let result = self.call("eth_getLogs", json!([filter])).await?;
        let entries = result
            .as_array()
            .ok_or_else(|| RpcError::Fatal("eth_getLogs did not return an array".to_string()))?;

        let mut logs = Vec::with_capacity(entries.len());
        for entry in entries {
            logs.push(parse_log(entry)?);
        }
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(RpcError::Transient(format!("HTTP {} from RPC node", status)));
        }
        if !status.is_success() {
            return Err(RpcError::Fatal(format!("HTTP {} from RPC node", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Fatal(format!("non-JSON RPC response: {}", e)))?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(classify_rpc_error(error));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| RpcError::Fatal("RPC response has neither result nor error".to_string()))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> RpcError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        RpcError::Transient(e.to_string())
    } else {
        RpcError::Fatal(e.to_string())
    }
}

/// JSON-RPC error objects: rate limiting is transient, everything else
/// (unknown method, bad params) is a protocol mismatch.
fn classify_rpc_error(error: &Value) -> RpcError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown RPC error");
    match code {
        -32005 => RpcError::Transient(format!("rate limited: {}", message)),
        _ => RpcError::Fatal(format!("RPC error {}: {}", code, message)),
    }
}

pub fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Fatal(format!("expected hex quantity, got {}", value)))?;
    let stripped = s
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Fatal(format!("quantity missing 0x prefix: {}", s)))?;
    u64::from_str_radix(stripped, 16)
        .map_err(|e| RpcError::Fatal(format!("bad hex quantity {}: {}", s, e)))
}

pub fn parse_h256(s: &str) -> Result<H256, RpcError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| RpcError::Fatal(format!("bad hash {}: {}", s, e)))?;
    if bytes.len() != 32 {
        return Err(RpcError::Fatal(format!(
            "hash {} has {} bytes, expected 32",
            s,
            bytes.len()
        )));
    }
    Ok(H256::from_slice(&bytes))
}

pub fn parse_h160(s: &str) -> Result<H160, RpcError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| RpcError::Fatal(format!("bad address {}: {}", s, e)))?;
    if bytes.len() != 20 {
        return Err(RpcError::Fatal(format!(
            "address {} has {} bytes, expected 20",
            s,
            bytes.len()
        )));
    }
    Ok(H160::from_slice(&bytes))
}

fn field<'a>(entry: &'a Value, name: &str) -> Result<&'a Value, RpcError> {
    entry
        .get(name)
        .ok_or_else(|| RpcError::Fatal(format!("log entry missing {}", name)))
}

fn str_field<'a>(entry: &'a Value, name: &str) -> Result<&'a str, RpcError> {
    field(entry, name)?
        .as_str()
        .ok_or_else(|| RpcError::Fatal(format!("log field {} is not a string", name)))
}

fn parse_log(entry: &Value) -> Result<RawLog, RpcError> {
    let topics = field(entry, "topics")?
        .as_array()
        .ok_or_else(|| RpcError::Fatal("log topics is not an array".to_string()))?
        .iter()
        .map(|t| {
            t.as_str()
                .ok_or_else(|| RpcError::Fatal("log topic is not a string".to_string()))
                .and_then(parse_h256)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let data = hex::decode(str_field(entry, "data")?.trim_start_matches("0x"))
        .map_err(|e| RpcError::Fatal(format!("bad log data: {}", e)))?;

    Ok(RawLog {
        address: parse_h160(str_field(entry, "address")?)?,
        topics,
        data,
        block_number: parse_quantity(field(entry, "blockNumber")?)?,
        block_hash: parse_h256(str_field(entry, "blockHash")?)?,
        tx_hash: parse_h256(str_field(entry, "transactionHash")?)?,
        log_index: parse_quantity(field(entry, "logIndex")?)?,
    })
}
