//! The RPC collaborator consumed by the pipeline.

use async_trait::async_trait;

use crate::error::ArkiverError;
use crate::types::{LogFilter, RawBlock, RawLog};

/// Trait for fetching chain data from a JSON-RPC provider.
///
/// Implementations must surface reorg-affected logs through missing
/// block-identifying fields rather than by returning an error.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Current chain head block number.
    async fn get_block_number(&self) -> Result<u64, ArkiverError>;

    /// All logs in the filter's window matching its addresses and topics.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ArkiverError>;

    /// A block by number; `None` if the node does not have it yet.
    async fn get_block(&self, number: u64) -> Result<Option<RawBlock>, ArkiverError>;
}
