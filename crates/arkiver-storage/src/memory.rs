//! In-memory storage backend.
//!
//! Keeps checkpoints and spawned sources in RAM. Useful for tests and
//! short-lived arkives that don't need to resume after a restart.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use arkiver_core::checkpoint::{CheckpointRecord, CheckpointStore};
use arkiver_core::error::ArkiverError;
use arkiver_core::spawned::{SpawnedSource, SpawnedSourceStore};

/// In-memory arkiver storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: Mutex<HashMap<String, CheckpointRecord>>,
    spawned: Mutex<Vec<SpawnedSource>>,
    upserts: Mutex<u64>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoint upserts so far.
    pub fn checkpoint_writes(&self) -> u64 {
        *self.upserts.lock()
    }

    /// Every stored checkpoint, in no particular order.
    pub fn checkpoints(&self) -> Vec<CheckpointRecord> {
        self.checkpoints.lock().values().cloned().collect()
    }

    /// Number of spawned sources across all chains.
    pub fn spawned_count(&self) -> usize {
        self.spawned.lock().len()
    }
}

fn checkpoint_key(chain: &str, arkive_id: &str, arkive_version: &str) -> String {
    format!("{chain}:{arkive_id}:{arkive_version}")
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn get_checkpoint(
        &self,
        chain: &str,
        arkive_id: &str,
        arkive_version: &str,
    ) -> Result<Option<CheckpointRecord>, ArkiverError> {
        let key = checkpoint_key(chain, arkive_id, arkive_version);
        Ok(self.checkpoints.lock().get(&key).cloned())
    }

    async fn upsert_checkpoint(&self, record: CheckpointRecord) -> Result<(), ArkiverError> {
        let key = checkpoint_key(&record.chain, &record.arkive_id, &record.arkive_version);
        self.checkpoints.lock().insert(key, record);
        *self.upserts.lock() += 1;
        Ok(())
    }
}

#[async_trait]
impl SpawnedSourceStore for InMemoryStorage {
    async fn list_spawned_sources(&self, chain: &str) -> Result<Vec<SpawnedSource>, ArkiverError> {
        Ok(self
            .spawned
            .lock()
            .iter()
            .filter(|s| s.chain == chain)
            .cloned()
            .collect())
    }

    async fn add_spawned_source(&self, mut source: SpawnedSource) -> Result<(), ArkiverError> {
        source.address = source.address.to_ascii_lowercase();
        let mut spawned = self.spawned.lock();
        let exists = spawned.iter().any(|s| {
            s.chain == source.chain
                && s.parent_contract_id == source.parent_contract_id
                && s.address == source.address
        });
        if !exists {
            spawned.push(source);
        }
        Ok(())
    }
}
