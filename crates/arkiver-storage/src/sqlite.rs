//! SQLite storage backend for Arkiver.
//!
//! Persists checkpoints and spawned sources to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use arkiver_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./arkive.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use arkiver_core::checkpoint::{CheckpointRecord, CheckpointStore};
use arkiver_core::error::ArkiverError;
use arkiver_core::spawned::{SpawnedSource, SpawnedSourceStore};

fn storage_err(e: impl std::fmt::Display) -> ArkiverError {
    ArkiverError::Storage(e.to_string())
}

/// SQLite-backed storage for checkpoints and spawned sources.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./arkive.db"`) or a full
    /// SQLite URL (`"sqlite:./arkive.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, ArkiverError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, ArkiverError> {
        // Every connection to `:memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), ArkiverError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                chain                  TEXT    NOT NULL,
                arkive_id              TEXT    NOT NULL,
                arkive_version         TEXT    NOT NULL,
                processed_block_height INTEGER NOT NULL,
                event_handler_calls    INTEGER NOT NULL,
                block_handler_calls    INTEGER NOT NULL,
                errors_json            TEXT    NOT NULL,
                updated_at             INTEGER NOT NULL,
                PRIMARY KEY (chain, arkive_id, arkive_version)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS spawned_sources (
                chain              TEXT    NOT NULL,
                parent_contract_id TEXT    NOT NULL,
                address            TEXT    NOT NULL,
                start_block_height INTEGER NOT NULL,
                PRIMARY KEY (chain, parent_contract_id, address)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }
}

fn checkpoint_from_row(r: &SqliteRow) -> Result<CheckpointRecord, ArkiverError> {
    let errors_json: String = r.get("errors_json");
    let errors: Vec<String> = serde_json::from_str(&errors_json).map_err(storage_err)?;
    Ok(CheckpointRecord {
        chain: r.get("chain"),
        arkive_id: r.get("arkive_id"),
        arkive_version: r.get("arkive_version"),
        processed_block_height: r.get::<i64, _>("processed_block_height") as u64,
        event_handler_calls: r.get::<i64, _>("event_handler_calls") as u64,
        block_handler_calls: r.get::<i64, _>("block_handler_calls") as u64,
        errors,
        updated_at: r.get("updated_at"),
    })
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn get_checkpoint(
        &self,
        chain: &str,
        arkive_id: &str,
        arkive_version: &str,
    ) -> Result<Option<CheckpointRecord>, ArkiverError> {
        let row = sqlx::query(
            "SELECT chain, arkive_id, arkive_version, processed_block_height,
                    event_handler_calls, block_handler_calls, errors_json, updated_at
             FROM checkpoints
             WHERE chain = ? AND arkive_id = ? AND arkive_version = ?",
        )
        .bind(chain)
        .bind(arkive_id)
        .bind(arkive_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn upsert_checkpoint(&self, record: CheckpointRecord) -> Result<(), ArkiverError> {
        let errors_json = serde_json::to_string(&record.errors).map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO checkpoints
             (chain, arkive_id, arkive_version, processed_block_height,
              event_handler_calls, block_handler_calls, errors_json, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (chain, arkive_id, arkive_version) DO UPDATE SET
                processed_block_height = excluded.processed_block_height,
                event_handler_calls    = excluded.event_handler_calls,
                block_handler_calls    = excluded.block_handler_calls,
                errors_json            = excluded.errors_json,
                updated_at             = excluded.updated_at",
        )
        .bind(&record.chain)
        .bind(&record.arkive_id)
        .bind(&record.arkive_version)
        .bind(record.processed_block_height as i64)
        .bind(record.event_handler_calls as i64)
        .bind(record.block_handler_calls as i64)
        .bind(&errors_json)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(
            chain = %record.chain,
            arkive_id = %record.arkive_id,
            block = record.processed_block_height,
            "checkpoint saved"
        );
        Ok(())
    }
}

// ─── SpawnedSourceStore impl ─────────────────────────────────────────────────

#[async_trait]
impl SpawnedSourceStore for SqliteStorage {
    async fn list_spawned_sources(&self, chain: &str) -> Result<Vec<SpawnedSource>, ArkiverError> {
        let rows = sqlx::query(
            "SELECT chain, parent_contract_id, address, start_block_height
             FROM spawned_sources WHERE chain = ? ORDER BY rowid",
        )
        .bind(chain)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .iter()
            .map(|r| SpawnedSource {
                chain: r.get("chain"),
                parent_contract_id: r.get("parent_contract_id"),
                address: r.get("address"),
                start_block_height: r.get::<i64, _>("start_block_height") as u64,
            })
            .collect())
    }

    async fn add_spawned_source(&self, source: SpawnedSource) -> Result<(), ArkiverError> {
        let address = source.address.to_ascii_lowercase();
        sqlx::query(
            "INSERT INTO spawned_sources (chain, parent_contract_id, address, start_block_height)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (chain, parent_contract_id, address) DO NOTHING",
        )
        .bind(&source.chain)
        .bind(&source.parent_contract_id)
        .bind(&address)
        .bind(source.start_block_height as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(
            chain = %source.chain,
            contract = %source.parent_contract_id,
            address = %address,
            block = source.start_block_height,
            "spawned source saved"
        );
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(height: u64) -> CheckpointRecord {
        CheckpointRecord {
            chain: "ethereum".into(),
            arkive_id: "uniswap".into(),
            arkive_version: "1".into(),
            processed_block_height: height,
            event_handler_calls: 3,
            block_handler_calls: 1,
            errors: vec!["Swap: reverted".into()],
            updated_at: 1_700_000_000,
        }
    }

    fn pair(address: &str, start: u64) -> SpawnedSource {
        SpawnedSource {
            chain: "ethereum".into(),
            parent_contract_id: "Pair".into(),
            address: address.into(),
            start_block_height: start,
        }
    }

    // ── CheckpointStore ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.upsert_checkpoint(record(151)).await.unwrap();

        let loaded = store
            .get_checkpoint("ethereum", "uniswap", "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record(151));
    }

    #[tokio::test]
    async fn checkpoint_upsert_overwrites() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.upsert_checkpoint(record(100)).await.unwrap();
        let mut next = record(201);
        next.event_handler_calls = 9;
        store.upsert_checkpoint(next).await.unwrap();

        let loaded = store
            .get_checkpoint("ethereum", "uniswap", "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.processed_block_height, 201);
        assert_eq!(loaded.event_handler_calls, 9);
    }

    #[tokio::test]
    async fn checkpoint_missing_returns_none() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.upsert_checkpoint(record(100)).await.unwrap();
        assert!(store
            .get_checkpoint("ethereum", "uniswap", "2")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_checkpoint("polygon", "uniswap", "1")
            .await
            .unwrap()
            .is_none());
    }

    // ── SpawnedSourceStore ────────────────────────────────────────────────────

    #[tokio::test]
    async fn spawned_sources_listed_in_insertion_order() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.add_spawned_source(pair("0xBBB", 20)).await.unwrap();
        store.add_spawned_source(pair("0xaaa", 10)).await.unwrap();

        let listed = store.list_spawned_sources("ethereum").await.unwrap();
        let addresses: Vec<_> = listed.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(addresses, vec!["0xbbb", "0xaaa"]);
    }

    #[tokio::test]
    async fn spawned_source_readd_is_noop() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.add_spawned_source(pair("0xaaa", 10)).await.unwrap();
        store.add_spawned_source(pair("0xAAA", 99)).await.unwrap();

        let listed = store.list_spawned_sources("ethereum").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].start_block_height, 10);
    }

    #[tokio::test]
    async fn spawned_sources_chain_isolation() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.add_spawned_source(pair("0xaaa", 10)).await.unwrap();
        assert!(store.list_spawned_sources("polygon").await.unwrap().is_empty());
    }
}
