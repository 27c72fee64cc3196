//! State shared by the fetcher and processor of one chain.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use arkiver_core::checkpoint::CheckpointTracker;
use arkiver_core::config::ChainConfig;
use arkiver_core::rpc::RpcClient;
use arkiver_core::spawned::SourceSpawner;
use arkiver_core::store::Store;
use arkiver_core::types::ArkiverEvent;

use crate::registry::ContractRegistry;
use crate::staging::Staging;

const UNSET: u64 = u64::MAX;

pub(crate) struct ChainState {
    pub config: ChainConfig,
    pub client: Arc<dyn RpcClient>,
    pub registry: Arc<RwLock<ContractRegistry>>,
    pub staging: Arc<Staging>,
    pub tracker: CheckpointTracker,
    pub store: Store,
    pub spawner: Arc<dyn SourceSpawner>,
    pub events: broadcast::Sender<ArkiverEvent>,
    live: AtomicU64,
    fetched: AtomicU64,
    processed: AtomicU64,
    /// Head observed when the chain went live.
    sync_target: AtomicU64,
    is_live: AtomicBool,
    synced: AtomicBool,
    fetching: AtomicBool,
    processing: AtomicBool,
}

impl ChainState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChainConfig,
        client: Arc<dyn RpcClient>,
        registry: Arc<RwLock<ContractRegistry>>,
        staging: Arc<Staging>,
        tracker: CheckpointTracker,
        store: Store,
        spawner: Arc<dyn SourceSpawner>,
        events: broadcast::Sender<ArkiverEvent>,
    ) -> Self {
        Self {
            config,
            client,
            registry,
            staging,
            tracker,
            store,
            spawner,
            events,
            live: AtomicU64::new(0),
            fetched: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            sync_target: AtomicU64::new(UNSET),
            is_live: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            fetching: AtomicBool::new(false),
            processing: AtomicBool::new(false),
        }
    }

    pub fn chain(&self) -> &str {
        &self.config.chain
    }

    // ─── Heights ─────────────────────────────────────────────────────────────

    pub fn live(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, head: u64) {
        self.live.store(head, Ordering::Release);
    }

    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Set both frontiers before the loops start.
    pub fn start_at(&self, height: u64) {
        self.fetched.store(height, Ordering::Release);
        self.processed.store(height, Ordering::Release);
    }

    pub fn advance_fetched(&self, next: u64) {
        self.fetched.fetch_max(next, Ordering::AcqRel);
    }

    pub fn advance_processed(&self, next: u64) {
        self.processed.fetch_max(next, Ordering::AcqRel);
    }

    // ─── Sync ────────────────────────────────────────────────────────────────

    pub fn is_live(&self) -> bool {
        self.is_live.load(Ordering::Acquire)
    }

    /// Record `head` as the sync target. Returns `false` if already live.
    pub fn mark_live(&self, head: u64) -> bool {
        if self.is_live.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.sync_target.store(head, Ordering::Release);
        true
    }

    pub fn sync_target(&self) -> Option<u64> {
        match self.sync_target.load(Ordering::Acquire) {
            UNSET => None,
            target => Some(target),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Returns `true` only for the first call.
    pub fn mark_synced(&self) -> bool {
        !self.synced.swap(true, Ordering::AcqRel)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    pub fn set_running(&self) {
        self.fetching.store(true, Ordering::Release);
        self.processing.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.fetching.store(false, Ordering::Release);
        self.processing.store(false, Ordering::Release);
    }

    pub fn fetching(&self) -> bool {
        self.fetching.load(Ordering::Acquire)
    }

    pub fn processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Broadcast an event; having no subscribers is fine.
    pub fn emit(&self, event: ArkiverEvent) {
        let _ = self.events.send(event);
    }
}
