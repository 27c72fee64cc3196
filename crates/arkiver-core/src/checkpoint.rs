//! Checkpoints — persisted per-chain progress for crash recovery.
//!
//! A checkpoint stores the first block that has not been fully processed,
//! together with handler call counters and recent handler errors. On
//! restart, a chain source resumes from the checkpoint instead of
//! re-indexing from its declared start heights.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ArkiverError;
use crate::store::Store;

/// Most recent handler errors kept on a checkpoint.
const MAX_RECORDED_ERRORS: usize = 100;

/// How long a per-block checkpoint upsert stays memoized.
const BLOCK_MEMO_TTL: Duration = Duration::from_secs(300);

/// A persisted checkpoint for one chain of one arkive version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Chain name (e.g. `"ethereum"`).
    pub chain: String,
    /// Arkive identifier.
    pub arkive_id: String,
    /// Arkive version; a new version indexes from scratch.
    pub arkive_version: String,
    /// First block not yet fully processed.
    pub processed_block_height: u64,
    /// Total event handler invocations.
    pub event_handler_calls: u64,
    /// Total block handler invocations.
    pub block_handler_calls: u64,
    /// Most recent handler errors, oldest first.
    pub errors: Vec<String>,
    /// Unix timestamp of the last upsert.
    pub updated_at: i64,
}

impl CheckpointRecord {
    pub fn new(
        chain: impl Into<String>,
        arkive_id: impl Into<String>,
        arkive_version: impl Into<String>,
    ) -> Self {
        Self {
            chain: chain.into(),
            arkive_id: arkive_id.into(),
            arkive_version: arkive_version.into(),
            processed_block_height: 0,
            event_handler_calls: 0,
            block_handler_calls: 0,
            errors: Vec::new(),
            updated_at: 0,
        }
    }
}

/// Trait for storing and loading checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a chain + arkive version.
    async fn get_checkpoint(
        &self,
        chain: &str,
        arkive_id: &str,
        arkive_version: &str,
    ) -> Result<Option<CheckpointRecord>, ArkiverError>;

    /// Insert or replace a checkpoint.
    async fn upsert_checkpoint(&self, record: CheckpointRecord) -> Result<(), ArkiverError>;
}

/// Keeps the in-memory checkpoint for one chain and writes it through to a
/// [`CheckpointStore`].
pub struct CheckpointTracker {
    store: Arc<dyn CheckpointStore>,
    memo: Store,
    record: Mutex<CheckpointRecord>,
    /// Memo keys written since the last commit.
    touched: Mutex<Vec<String>>,
}

impl CheckpointTracker {
    pub fn new(store: Arc<dyn CheckpointStore>, memo: Store, record: CheckpointRecord) -> Self {
        Self {
            store,
            memo,
            record: Mutex::new(record),
            touched: Mutex::new(Vec::new()),
        }
    }

    /// Load the persisted checkpoint, adopting its counters.
    ///
    /// Returns the persisted resume height, if any.
    pub async fn load(&self) -> Result<Option<u64>, ArkiverError> {
        let (chain, id, version) = {
            let r = self.record.lock();
            (r.chain.clone(), r.arkive_id.clone(), r.arkive_version.clone())
        };
        let Some(saved) = self.store.get_checkpoint(&chain, &id, &version).await? else {
            return Ok(None);
        };
        let height = saved.processed_block_height;
        *self.record.lock() = saved;
        Ok(Some(height))
    }

    /// Set the resume height without persisting it.
    pub fn set_height(&self, height: u64) {
        self.record.lock().processed_block_height = height;
    }

    pub fn record_event_call(&self) {
        self.record.lock().event_handler_calls += 1;
    }

    pub fn record_block_call(&self) {
        self.record.lock().block_handler_calls += 1;
    }

    /// Remember a handler error on the checkpoint.
    pub fn record_error(&self, error: impl Into<String>) {
        let mut r = self.record.lock();
        r.errors.push(error.into());
        if r.errors.len() > MAX_RECORDED_ERRORS {
            let excess = r.errors.len() - MAX_RECORDED_ERRORS;
            r.errors.drain(..excess);
        }
    }

    /// Snapshot of the in-memory checkpoint.
    pub fn snapshot(&self) -> CheckpointRecord {
        self.record.lock().clone()
    }

    /// Upsert progress after an item in `block`.
    ///
    /// The upsert is memoized per block, so later items in the same block
    /// reuse the record written for the first one.
    pub async fn touch(&self, block: u64) -> Result<CheckpointRecord, ArkiverError> {
        let mut record = self.snapshot();
        record.updated_at = chrono::Utc::now().timestamp();
        let key = format!("checkpoint:{}:{}", record.chain, block);
        self.touched.lock().push(key.clone());

        let store = self.store.clone();
        self.memo
            .retrieve_pipeline(
                key,
                move || async move {
                    store.upsert_checkpoint(record.clone()).await?;
                    Ok(record)
                },
                Some(BLOCK_MEMO_TTL),
            )
            .await
    }

    /// Persist `next_from` as the resume height after a completed window.
    pub async fn commit(&self, next_from: u64) -> Result<(), ArkiverError> {
        let record = {
            let mut r = self.record.lock();
            r.processed_block_height = next_from;
            r.updated_at = chrono::Utc::now().timestamp();
            r.clone()
        };
        let touched = std::mem::take(&mut *self.touched.lock());
        for key in touched {
            self.memo.remove_pipeline(&key);
        }
        self.store.upsert_checkpoint(record).await
    }
}
