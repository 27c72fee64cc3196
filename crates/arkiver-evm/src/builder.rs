//! Fluent builder API for creating chain sources.
//!
//! # Example
//!
//! ```rust,no_run
//! use arkiver_core::config::ChainConfig;
//! use arkiver_evm::{ChainSourceBuilder, ContractDescriptor};
//! # fn abi() -> alloy_json_abi::JsonAbi { unimplemented!() }
//! # struct OnTransfer;
//! # #[async_trait::async_trait]
//! # impl arkiver_core::EventHandler for OnTransfer {
//! #     async fn handle(&self, _: &arkiver_core::EventContext) -> Result<(), arkiver_core::ArkiverError> { Ok(()) }
//! # }
//!
//! # fn main() -> Result<(), arkiver_core::ArkiverError> {
//! let usdc = ContractDescriptor::new("USDC", abi())
//!     .with_source("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 6_082_465)?
//!     .on_event("Transfer", OnTransfer);
//!
//! let source = ChainSourceBuilder::new(ChainConfig::new("ethereum", "https://eth.llamarpc.com"))
//!     .contract(usdc)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use arkiver_core::checkpoint::{CheckpointRecord, CheckpointStore, CheckpointTracker};
use arkiver_core::config::ChainConfig;
use arkiver_core::error::ArkiverError;
use arkiver_core::rpc::RpcClient;
use arkiver_core::schedule::{BlockHandlerSpec, BlockSchedule};
use arkiver_core::spawned::SpawnedSourceStore;
use arkiver_core::store::Store;
use arkiver_core::types::ArkiverEvent;
use arkiver_storage::InMemoryStorage;

use crate::client::HttpRpcClient;
use crate::registry::{ContractDescriptor, ContractRegistry};
use crate::source::{ChainSource, ChainSpawner, EVENT_CHANNEL_CAPACITY};
use crate::staging::Staging;
use crate::state::ChainState;

/// Fluent builder for [`ChainSource`].
///
/// Anything not supplied gets a default: an [`HttpRpcClient`] for
/// `config.rpc_url`, one [`InMemoryStorage`] for checkpoints and spawned
/// sources, a fresh [`Store`] and a private event channel.
pub struct ChainSourceBuilder {
    config: ChainConfig,
    client: Option<Arc<dyn RpcClient>>,
    contracts: Vec<ContractDescriptor>,
    block_handlers: Vec<BlockHandlerSpec>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    spawned: Option<Arc<dyn SpawnedSourceStore>>,
    store: Option<Store>,
    events: Option<broadcast::Sender<ArkiverEvent>>,
}

impl ChainSourceBuilder {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            client: None,
            contracts: Vec::new(),
            block_handlers: Vec::new(),
            checkpoints: None,
            spawned: None,
            store: None,
            events: None,
        }
    }

    /// Use `client` instead of an HTTP client for `rpc_url`.
    pub fn client(mut self, client: Arc<dyn RpcClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Index a contract.
    pub fn contract(mut self, descriptor: ContractDescriptor) -> Self {
        self.contracts.push(descriptor);
        self
    }

    pub fn contracts(mut self, descriptors: impl IntoIterator<Item = ContractDescriptor>) -> Self {
        self.contracts.extend(descriptors);
        self
    }

    /// Register a block handler.
    pub fn block_handler(mut self, spec: BlockHandlerSpec) -> Self {
        self.block_handlers.push(spec);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn spawned_store(mut self, store: Arc<dyn SpawnedSourceStore>) -> Self {
        self.spawned = Some(store);
        self
    }

    /// Share a memoization store with other chains.
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Broadcast status events on `events`.
    pub fn events(mut self, events: broadcast::Sender<ArkiverEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration and normalize contracts and block handlers.
    pub fn build(self) -> Result<ChainSource, ArkiverError> {
        self.config.validate()?;
        let chain = self.config.chain.clone();

        let client: Arc<dyn RpcClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpRpcClient::default_for(&self.config.rpc_url)?),
        };
        let registry = ContractRegistry::from_descriptors(&chain, self.contracts)?;
        let schedule = BlockSchedule::new(self.block_handlers)?;

        let (checkpoints, spawned) = match (self.checkpoints, self.spawned) {
            (Some(c), Some(s)) => (c, s),
            (c, s) => {
                let memory = Arc::new(InMemoryStorage::new());
                (
                    c.unwrap_or_else(|| memory.clone() as Arc<dyn CheckpointStore>),
                    s.unwrap_or_else(|| memory.clone() as Arc<dyn SpawnedSourceStore>),
                )
            }
        };
        let store = self.store.unwrap_or_default();
        let events = self
            .events
            .unwrap_or_else(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0);

        let registry = Arc::new(RwLock::new(registry));
        let staging = Arc::new(Staging::new());
        let tracker = CheckpointTracker::new(
            checkpoints,
            store.clone(),
            CheckpointRecord::new(&chain, &self.config.arkive_id, &self.config.arkive_version),
        );
        let spawner = Arc::new(ChainSpawner::new(&chain, registry.clone(), staging.clone(), spawned));

        tracing::debug!(
            chain = %chain,
            block_range = self.config.block_range,
            max_stage_size = self.config.max_stage_size,
            block_handlers = schedule.specs().len(),
            "chain source built"
        );
        let state = ChainState::new(
            self.config,
            client,
            registry,
            staging,
            tracker,
            store,
            spawner,
            events,
        );
        Ok(ChainSource::new(Arc::new(state), schedule))
    }
}
