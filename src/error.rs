/// Top-level error taxonomy
///
/// Structural failures (bad config, absent schema, unreachable broker at
/// startup) terminate the process with a non-zero exit code. Transient
/// classes are retried locally by their owners and never bubble up here.

use thiserror::Error;

use crate::broker::publisher::PublishError;
use crate::rpc::RpcError;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(
        "relational schema missing: table(s) {tables:?} not found; \
         run the platform migrations before starting the indexer"
    )]
    SchemaMissing { tables: Vec<String> },

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("chain RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("message serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("rollback was not acknowledged by consumers within {0} seconds")]
    RollbackBarrierTimeout(u64),

    #[error("{0}")]
    Other(String),
}
