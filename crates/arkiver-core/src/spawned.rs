//! Contract instances discovered at runtime (factory children).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ArkiverError;

/// A persisted source registered by a handler while indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnedSource {
    /// Chain the source lives on.
    pub chain: String,
    /// Id of the contract descriptor the address is added to.
    pub parent_contract_id: String,
    /// Contract address (lowercase `0x…`).
    pub address: String,
    /// First block to index the address from.
    pub start_block_height: u64,
}

/// Persistence for spawned sources, so they survive a restart.
#[async_trait]
pub trait SpawnedSourceStore: Send + Sync {
    /// All sources spawned on `chain`, in insertion order.
    async fn list_spawned_sources(&self, chain: &str) -> Result<Vec<SpawnedSource>, ArkiverError>;

    /// Persist a spawned source. Re-adding the same address is a no-op.
    async fn add_spawned_source(&self, source: SpawnedSource) -> Result<(), ArkiverError>;
}

/// Handle given to handlers for registering new sources mid-run.
///
/// A spawned source only affects fetch windows that start after it is
/// registered.
#[async_trait]
pub trait SourceSpawner: Send + Sync {
    async fn spawn_source(
        &self,
        parent_contract_id: &str,
        address: &str,
        start_block_height: u64,
    ) -> Result<(), ArkiverError>;
}
