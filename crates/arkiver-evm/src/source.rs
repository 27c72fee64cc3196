//! A chain source — one chain's fetcher and processor plus their shared state.
//!
//! Built with [`ChainSourceBuilder`](crate::builder::ChainSourceBuilder).
//! [`ChainSource::run`] resolves where to start and spawns both loops.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use arkiver_core::checkpoint::CheckpointRecord;
use arkiver_core::error::ArkiverError;
use arkiver_core::schedule::BlockSchedule;
use arkiver_core::spawned::{SourceSpawner, SpawnedSource, SpawnedSourceStore};
use arkiver_core::store::Store;
use arkiver_core::types::ArkiverEvent;

use crate::fetcher::Fetcher;
use crate::processor::Processor;
use crate::registry::{resolve_start_height, ContractRegistry, Source};
use crate::staging::{SpawnNotice, Staging};
use crate::state::ChainState;

/// Capacity of the event channel created when none is supplied.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ─── ChainSpawner ────────────────────────────────────────────────────────────

/// [`SourceSpawner`] of one chain: merges into the live registry, then
/// persists.
///
/// Windows already staged past the new source's start height are re-fetched
/// with the widened filter, and the processor catches up the window it is
/// working on.
pub struct ChainSpawner {
    chain: String,
    registry: Arc<RwLock<ContractRegistry>>,
    staging: Arc<Staging>,
    store: Arc<dyn SpawnedSourceStore>,
}

impl ChainSpawner {
    pub fn new(
        chain: impl Into<String>,
        registry: Arc<RwLock<ContractRegistry>>,
        staging: Arc<Staging>,
        store: Arc<dyn SpawnedSourceStore>,
    ) -> Self {
        Self {
            chain: chain.into(),
            registry,
            staging,
            store,
        }
    }
}

#[async_trait]
impl SourceSpawner for ChainSpawner {
    async fn spawn_source(
        &self,
        parent_contract_id: &str,
        address: &str,
        start_block_height: u64,
    ) -> Result<(), ArkiverError> {
        let source = Source::new(address, start_block_height);
        let address = source.address.clone();
        let restaged = {
            let mut registry = self.registry.write();
            if !registry.add_source(parent_contract_id, source)? {
                return Ok(());
            }
            let notice = SpawnNotice {
                address: address.clone(),
                start: start_block_height,
            };
            self.staging
                .restage_logs(notice, |from, to| registry.log_filter(from, to))
        };
        self.store
            .add_spawned_source(SpawnedSource {
                chain: self.chain.clone(),
                parent_contract_id: parent_contract_id.to_string(),
                address: address.clone(),
                start_block_height,
            })
            .await?;
        tracing::info!(
            chain = %self.chain,
            contract = parent_contract_id,
            address = %address,
            start = start_block_height,
            restaged,
            "source spawned"
        );
        Ok(())
    }
}

// ─── ChainSource ─────────────────────────────────────────────────────────────

/// Indexing pipeline of one chain.
pub struct ChainSource {
    state: Arc<ChainState>,
    /// Handed to the fetcher on `run`.
    schedule: Mutex<Option<BlockSchedule>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ChainSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainSource")
            .field("chain", &self.state.chain())
            .field("live", &self.state.live())
            .field("fetched", &self.state.fetched())
            .field("processed", &self.state.processed())
            .field("running", &self.state.processing())
            .finish()
    }
}

impl ChainSource {
    pub(crate) fn new(state: Arc<ChainState>, schedule: BlockSchedule) -> Self {
        Self {
            state,
            schedule: Mutex::new(Some(schedule)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn chain(&self) -> &str {
        self.state.chain()
    }

    /// Resolve the start height and spawn the fetcher and processor.
    ///
    /// Returns the block indexing starts at.
    pub async fn run(&self) -> Result<u64, ArkiverError> {
        let chain = self.state.chain().to_string();
        let schedule = self
            .schedule
            .lock()
            .take()
            .ok_or_else(|| ArkiverError::Config(format!("chain source '{chain}' already started")))?;

        let checkpoint = self.state.tracker.load().await?;
        let declared = [self.state.registry.read().min_start_height(), schedule.min_start()]
            .into_iter()
            .flatten()
            .min();
        let start = match resolve_start_height(&chain, declared, checkpoint) {
            Some(height) => height,
            None => self.state.client.get_block_number().await?,
        };

        self.state.start_at(start);
        self.state.tracker.set_height(start);
        self.state.set_running();
        tracing::info!(chain = %chain, start, resumed = checkpoint.is_some(), "chain source started");

        let fetcher = Fetcher::new(self.state.clone(), schedule);
        let processor = Processor::new(self.state.clone());
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(fetcher.run()));
        tasks.push(tokio::spawn(processor.run()));
        Ok(start)
    }

    /// Stop both loops after their current tick.
    pub fn stop(&self) {
        tracing::info!(chain = %self.state.chain(), "stopping chain source");
        self.state.stop();
    }

    /// Wait for both loops to exit.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(chain = %self.state.chain(), error = %e, "chain task panicked");
            }
        }
    }

    pub fn live_block_height(&self) -> u64 {
        self.state.live()
    }

    pub fn fetched_block_height(&self) -> u64 {
        self.state.fetched()
    }

    pub fn processed_block_height(&self) -> u64 {
        self.state.processed()
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    pub fn is_running(&self) -> bool {
        self.state.fetching() || self.state.processing()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArkiverEvent> {
        self.state.events.subscribe()
    }

    /// The spawner handed to this chain's handlers.
    pub fn spawner(&self) -> Arc<dyn SourceSpawner> {
        self.state.spawner.clone()
    }

    pub fn store(&self) -> &Store {
        &self.state.store
    }

    /// In-memory checkpoint, including counters not yet persisted.
    pub fn checkpoint(&self) -> CheckpointRecord {
        self.state.tracker.snapshot()
    }
}

impl Drop for ChainSource {
    fn drop(&mut self) {
        self.state.stop();
    }
}
