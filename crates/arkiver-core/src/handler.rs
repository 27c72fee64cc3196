//! Event and block handler traits, and the contexts they receive.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ArkiverError;
use crate::rpc::RpcClient;
use crate::spawned::SourceSpawner;
use crate::store::Store;
use crate::types::{DecodedEvent, RawBlock};

/// Context passed to an event handler for one decoded log.
#[derive(Clone)]
pub struct EventContext {
    /// The decoded event.
    pub event: DecodedEvent,
    /// Id of the contract the log was routed to.
    pub contract: String,
    /// Chain the log was fetched from.
    pub chain: String,
    /// RPC client of that chain.
    pub client: Arc<dyn RpcClient>,
    /// Memoization store shared by every handler in the process.
    pub store: Store,
    /// Registers contract instances discovered at runtime.
    pub spawner: Arc<dyn SourceSpawner>,
}

/// Context passed to a block handler for one scheduled block.
#[derive(Clone)]
pub struct BlockContext {
    /// The scheduled block.
    pub block: RawBlock,
    /// Chain the block was fetched from.
    pub chain: String,
    /// RPC client of that chain.
    pub client: Arc<dyn RpcClient>,
    /// Memoization store shared by every handler in the process.
    pub store: Store,
    /// Registers contract instances discovered at runtime.
    pub spawner: Arc<dyn SourceSpawner>,
}

/// Trait for user-provided event handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for each decoded log routed to this handler.
    async fn handle(&self, ctx: &EventContext) -> Result<(), ArkiverError>;

    /// Name used in log lines and error events.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Trait for user-provided block handlers.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// Called once for every block the handler is scheduled on.
    async fn handle_block(&self, ctx: &BlockContext) -> Result<(), ArkiverError>;

    /// Name used in log lines and error events.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
