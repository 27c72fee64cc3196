//! The coordinator — one [`ChainSource`] per chain and an arkive-wide
//! synced signal.
//!
//! ```text
//!                 ┌── ChainSource(ethereum) ──┐
//! Arkiver::run ───┼── ChainSource(arbitrum) ──┼──► broadcast ──► aggregator ──► Synced
//!                 └── ChainSource(base)     ──┘
//! ```
//!
//! Chains are independent: one that fails to build or stops on a fatal
//! error is reported as [`ArkiverEvent::ChainError`] and the others keep
//! running.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use arkiver_core::checkpoint::CheckpointStore;
use arkiver_core::config::{ArkiverConfig, ChainConfig};
use arkiver_core::error::ArkiverError;
use arkiver_core::rpc::RpcClient;
use arkiver_core::schedule::BlockHandlerSpec;
use arkiver_core::spawned::SpawnedSourceStore;
use arkiver_core::store::Store;
use arkiver_core::types::ArkiverEvent;

use crate::builder::ChainSourceBuilder;
use crate::registry::{ContractDescriptor, Source};
use crate::source::{ChainSource, EVENT_CHANNEL_CAPACITY};

// ─── ChainManifest ───────────────────────────────────────────────────────────

/// What to index on one chain.
pub struct ChainManifest {
    pub chain: String,
    pub contracts: Vec<ContractDescriptor>,
    pub block_handlers: Vec<BlockHandlerSpec>,
    /// Replaces the HTTP client built from `rpc_url`.
    pub client: Option<Arc<dyn RpcClient>>,
    /// Replaces the chain's entry in [`ArkiverConfig::chains`].
    pub config: Option<ChainConfig>,
}

impl ChainManifest {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            contracts: Vec::new(),
            block_handlers: Vec::new(),
            client: None,
            config: None,
        }
    }

    pub fn contract(mut self, descriptor: ContractDescriptor) -> Self {
        self.contracts.push(descriptor);
        self
    }

    pub fn block_handler(mut self, spec: BlockHandlerSpec) -> Self {
        self.block_handlers.push(spec);
        self
    }

    pub fn client(mut self, client: Arc<dyn RpcClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(mut self, config: ChainConfig) -> Self {
        self.config = Some(config);
        self
    }
}

impl fmt::Debug for ChainManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainManifest")
            .field("chain", &self.chain)
            .field("contracts", &self.contracts.len())
            .field("block_handlers", &self.block_handlers)
            .field("client", &self.client.is_some())
            .finish()
    }
}

// ─── Arkiver ─────────────────────────────────────────────────────────────────

/// Runs every chain of one arkive.
pub struct Arkiver {
    config: ArkiverConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    spawned: Arc<dyn SpawnedSourceStore>,
    store: Store,
    events: broadcast::Sender<ArkiverEvent>,
    manifests: Mutex<Vec<ChainManifest>>,
    sources: Mutex<Vec<Arc<ChainSource>>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    synced: Arc<AtomicBool>,
}

impl Arkiver {
    pub fn new(
        config: ArkiverConfig,
        checkpoints: Arc<dyn CheckpointStore>,
        spawned: Arc<dyn SpawnedSourceStore>,
    ) -> Self {
        let store = Store::new(&config.store);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            checkpoints,
            spawned,
            store,
            events,
            manifests: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
            aggregator: Mutex::new(None),
            synced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a chain for the next [`run`](Self::run).
    pub fn add_chain(&self, manifest: ChainManifest) {
        self.manifests.lock().push(manifest);
    }

    /// Start every queued chain.
    ///
    /// A chain that cannot be built or started is logged, reported as
    /// [`ArkiverEvent::ChainError`] and skipped. Returns the chains that
    /// started.
    pub async fn run(&self) -> Result<Vec<String>, ArkiverError> {
        if self.config.arkive_id.trim().is_empty() {
            return Err(ArkiverError::Config("arkive_id is empty".into()));
        }
        let manifests = std::mem::take(&mut *self.manifests.lock());
        // Subscribe before any chain runs so no ChainSynced is missed.
        let rx = self.events.subscribe();

        let mut seen = HashSet::new();
        let mut started = Vec::new();
        for manifest in manifests {
            let chain = manifest.chain.clone();
            let outcome = if seen.insert(chain.clone()) {
                self.start_chain(manifest).await
            } else {
                Err(ArkiverError::Config(format!("chain '{chain}' added twice")))
            };
            match outcome {
                Ok(source) => started.push(source),
                Err(e) => {
                    tracing::error!(chain = %chain, error = %e, "chain failed to start; skipping");
                    let _ = self.events.send(ArkiverEvent::ChainError {
                        chain,
                        error: e.to_string(),
                    });
                }
            }
        }

        let names: Vec<String> = started.iter().map(|s| s.chain().to_string()).collect();
        tracing::info!(
            arkive = %self.config.arkive_id,
            version = %self.config.arkive_version,
            chains = ?names,
            "arkiver started"
        );
        let aggregator = tokio::spawn(aggregate_synced(
            rx,
            started.clone(),
            self.events.clone(),
            self.synced.clone(),
        ));
        *self.aggregator.lock() = Some(aggregator);
        self.sources.lock().extend(started);
        Ok(names)
    }

    async fn start_chain(&self, manifest: ChainManifest) -> Result<Arc<ChainSource>, ArkiverError> {
        let ChainManifest {
            chain,
            mut contracts,
            block_handlers,
            client,
            config,
        } = manifest;

        let mut config = match config {
            Some(config) => config,
            None => self
                .config
                .chain(&chain)
                .cloned()
                .ok_or_else(|| ArkiverError::Config(format!("chain '{chain}' is not configured")))?,
        };
        if config.arkive_id.is_empty() {
            config.arkive_id = self.config.arkive_id.clone();
        }
        if config.arkive_version.is_empty() {
            config.arkive_version = self.config.arkive_version.clone();
        }

        self.merge_spawned(&chain, &mut contracts).await?;

        let mut builder = ChainSourceBuilder::new(config)
            .contracts(contracts)
            .checkpoint_store(self.checkpoints.clone())
            .spawned_store(self.spawned.clone())
            .store(self.store.clone())
            .events(self.events.clone());
        for spec in block_handlers {
            builder = builder.block_handler(spec);
        }
        if let Some(client) = client {
            builder = builder.client(client);
        }

        let source = Arc::new(builder.build()?);
        source.run().await?;
        Ok(source)
    }

    /// Add persisted spawned sources to the descriptors they belong to.
    async fn merge_spawned(
        &self,
        chain: &str,
        contracts: &mut [ContractDescriptor],
    ) -> Result<(), ArkiverError> {
        let spawned = self.spawned.list_spawned_sources(chain).await?;
        let mut merged = 0usize;
        for record in spawned {
            let Some(descriptor) = contracts.iter_mut().find(|c| c.id == record.parent_contract_id) else {
                tracing::warn!(
                    chain,
                    contract = %record.parent_contract_id,
                    address = %record.address,
                    "spawned source for unknown contract; skipping"
                );
                continue;
            };
            match descriptor.add_source(Source::new(&record.address, record.start_block_height)) {
                Ok(_) => merged += 1,
                Err(e) => tracing::warn!(
                    chain,
                    contract = %record.parent_contract_id,
                    address = %record.address,
                    error = %e,
                    "spawned source rejected; skipping"
                ),
            }
        }
        if merged > 0 {
            tracing::info!(chain, merged, "restored spawned sources");
        }
        Ok(())
    }

    /// Stop every chain after its current tick.
    pub fn stop(&self) {
        for source in self.sources.lock().iter() {
            source.stop();
        }
        if let Some(aggregator) = self.aggregator.lock().take() {
            aggregator.abort();
        }
    }

    /// Wait for every chain's loops to exit.
    pub async fn join(&self) {
        let sources: Vec<Arc<ChainSource>> = self.sources.lock().clone();
        for source in sources {
            source.join().await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArkiverEvent> {
        self.events.subscribe()
    }

    /// `true` once every started chain has synced.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn source(&self, chain: &str) -> Option<Arc<ChainSource>> {
        self.sources.lock().iter().find(|s| s.chain() == chain).cloned()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ArkiverConfig {
        &self.config
    }
}

/// Emit [`ArkiverEvent::Synced`] once every source has synced.
async fn aggregate_synced(
    mut rx: broadcast::Receiver<ArkiverEvent>,
    sources: Vec<Arc<ChainSource>>,
    events: broadcast::Sender<ArkiverEvent>,
    synced: Arc<AtomicBool>,
) {
    let mut pending: HashSet<String> = sources.iter().map(|s| s.chain().to_string()).collect();
    if pending.is_empty() {
        return;
    }
    loop {
        match rx.recv().await {
            Ok(ArkiverEvent::ChainSynced { chain, .. }) => {
                pending.remove(&chain);
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event aggregator lagged; rechecking chains");
                pending.retain(|chain| !sources.iter().any(|s| s.chain() == chain && s.is_synced()));
            }
            Err(RecvError::Closed) => return,
        }
        if pending.is_empty() {
            synced.store(true, Ordering::Release);
            tracing::info!(chains = sources.len(), "all chains synced");
            let _ = events.send(ArkiverEvent::Synced);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use arkiver_core::spawned::SpawnedSource;
    use arkiver_storage::InMemoryStorage;
    use std::time::Duration;

    fn arkive(chains: &[(&str, u64)]) -> ArkiverConfig {
        let mut config = ArkiverConfig::new("dex", "2");
        config.chains = chains
            .iter()
            .map(|(chain, block_range)| ChainConfig {
                arkive_id: String::new(),
                arkive_version: String::new(),
                block_range: *block_range,
                ..ChainConfig::new(*chain, "http://localhost:8545")
            })
            .collect();
        config
    }

    fn arkiver(config: ArkiverConfig, storage: &Arc<InMemoryStorage>) -> Arkiver {
        Arkiver::new(config, storage.clone(), storage.clone())
    }

    fn token_manifest(chain: &str, rpc: &Arc<MockRpc>, journal: &Journal) -> ChainManifest {
        ChainManifest::new(chain).client(rpc.clone()).contract(
            ContractDescriptor::new("Token", erc20_abi())
                .on_event("Transfer", RecordingHandler::with_journal(journal.clone()))
                .with_source("0xaaa", 0)
                .unwrap(),
        )
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<ArkiverEvent>,
        pred: impl Fn(&ArkiverEvent) -> bool,
    ) -> ArkiverEvent {
        tokio::time::timeout(Duration::from_secs(3600), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event never arrived")
    }

    #[tokio::test(start_paused = true)]
    async fn synced_fires_after_every_chain() {
        let storage = Arc::new(InMemoryStorage::new());
        let ark = arkiver(arkive(&[("ethereum", 10), ("arbitrum", 100)]), &storage);
        let (eth, arb) = (MockRpc::new(30), MockRpc::new(500));
        let journal = Journal::default();
        eth.push_log(transfer_log("0xaaa", 3, 0, 1));
        arb.push_log(transfer_log("0xaaa", 450, 0, 2));
        ark.add_chain(token_manifest("ethereum", &eth, &journal));
        ark.add_chain(token_manifest("arbitrum", &arb, &journal));

        let mut rx = ark.subscribe();
        let started = ark.run().await.unwrap();
        assert_eq!(started, vec!["ethereum".to_string(), "arbitrum".to_string()]);

        let mut synced_chains = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                ArkiverEvent::ChainSynced { chain, .. } => synced_chains.push(chain),
                ArkiverEvent::Synced => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        synced_chains.sort();
        assert_eq!(synced_chains, vec!["arbitrum", "ethereum"]);
        assert!(ark.is_synced());
        assert_eq!(journal.lock().len(), 2);

        let mut ids: Vec<_> = storage
            .checkpoints()
            .into_iter()
            .map(|c| (c.chain, c.arkive_id, c.arkive_version))
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ("arbitrum".to_string(), "dex".to_string(), "2".to_string()),
                ("ethereum".to_string(), "dex".to_string(), "2".to_string()),
            ]
        );
        ark.stop();
        ark.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn misconfigured_chain_is_skipped() {
        let storage = Arc::new(InMemoryStorage::new());
        let ark = arkiver(arkive(&[("ethereum", 10), ("base", 10)]), &storage);
        let eth = MockRpc::new(20);
        ark.add_chain(token_manifest("ethereum", &eth, &Journal::default()));
        ark.add_chain(
            ChainManifest::new("base").client(MockRpc::new(20)).contract(
                ContractDescriptor::new("Token", erc20_abi()).on_event("Mint", RecordingHandler::default()),
            ),
        );
        ark.add_chain(ChainManifest::new("optimism").client(MockRpc::new(20)));

        let mut rx = ark.subscribe();
        assert_eq!(ark.run().await.unwrap(), vec!["ethereum".to_string()]);

        let mut errors = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                ArkiverEvent::ChainError { chain, .. } => errors.push(chain),
                ArkiverEvent::Synced => break,
                _ => {}
            }
        }
        assert_eq!(errors, vec!["base", "optimism"]);
        assert!(ark.source("base").is_none());
        assert!(ark.source("ethereum").unwrap().is_synced());
        ark.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_spawned_sources_are_restored() {
        let storage = Arc::new(InMemoryStorage::new());
        let pair = format!("0x{}", "cc".repeat(20));
        for (parent, address) in [("Pair", pair.as_str()), ("Ghost", "0xdddd")] {
            storage
                .add_spawned_source(SpawnedSource {
                    chain: "ethereum".into(),
                    parent_contract_id: parent.into(),
                    address: address.into(),
                    start_block_height: 0,
                })
                .await
                .unwrap();
        }

        let rpc = MockRpc::new(20);
        rpc.push_log(sync_log(&pair, 7, 0, 1, 2));
        let journal = Journal::default();
        let ark = arkiver(arkive(&[("ethereum", 10)]), &storage);
        ark.add_chain(
            ChainManifest::new("ethereum").client(rpc.clone()).contract(
                ContractDescriptor::new("Pair", pair_abi())
                    .on_event("Sync", RecordingHandler::with_journal(journal.clone())),
            ),
        );

        let mut rx = ark.subscribe();
        ark.run().await.unwrap();
        next_matching(&mut rx, |e| matches!(e, ArkiverEvent::Synced)).await;

        assert_eq!(*journal.lock(), vec!["Pair.Sync@7#0"]);
        assert_eq!(rpc.filters.lock()[0].addresses, vec![pair]);
        ark.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_chain_blocks_synced() {
        let storage = Arc::new(InMemoryStorage::new());
        let ark = arkiver(arkive(&[("ethereum", 10), ("arbitrum", 10)]), &storage);
        let stuck = MockRpc::new(20);
        stuck.push_log(transfer_log("0xaaa", 3, 0, 1));
        stuck.fail_next_logs(u32::MAX);
        ark.add_chain(token_manifest("ethereum", &MockRpc::new(20), &Journal::default()));
        ark.add_chain(token_manifest("arbitrum", &stuck, &Journal::default()));

        let mut rx = ark.subscribe();
        ark.run().await.unwrap();
        next_matching(&mut rx, |e| matches!(e, ArkiverEvent::ChainSynced { .. })).await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(ark.source("ethereum").unwrap().is_synced());
        assert!(!ark.source("arbitrum").unwrap().is_synced());
        assert!(!ark.is_synced());
        ark.stop();
        ark.join().await;
    }

    #[tokio::test]
    async fn empty_arkive_id_is_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        let ark = arkiver(ArkiverConfig::new("", "1"), &storage);
        assert!(ark.run().await.unwrap_err().is_config());
    }
}
