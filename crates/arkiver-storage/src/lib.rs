//! arkiver-storage — pluggable persistence for Arkiver progress.
//!
//! Backends store [`CheckpointRecord`](arkiver_core::CheckpointRecord)s
//! and [`SpawnedSource`](arkiver_core::SpawnedSource)s:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;
