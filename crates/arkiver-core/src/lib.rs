//! arkiver-core — chain-agnostic foundation of the Arkiver indexing pipeline.
//!
//! # Architecture
//!
//! ```text
//! ChainSource (arkiver-evm)
//!     ├── RpcClient          (head, logs, blocks)
//!     ├── BlockSchedule      (block handler cursors)
//!     ├── CheckpointTracker  (resume height + counters)
//!     ├── SpawnedSourceStore (factory children)
//!     └── Store              (TTL memoization shared by handlers)
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod handler;
pub mod rpc;
pub mod schedule;
pub mod spawned;
pub mod store;
pub mod telemetry;
pub mod types;

pub use checkpoint::{CheckpointRecord, CheckpointStore, CheckpointTracker};
pub use config::{ArkiverConfig, ChainConfig};
pub use error::ArkiverError;
pub use handler::{BlockContext, BlockHandler, EventContext, EventHandler};
pub use rpc::RpcClient;
pub use schedule::{BlockHandlerSpec, BlockPlan, BlockSchedule, ScheduledCallback, StartHeight};
pub use spawned::{SourceSpawner, SpawnedSource, SpawnedSourceStore};
pub use store::{Store, StoreConfig};
pub use telemetry::{init_tracing, LogConfig};
pub use types::{ArkiverEvent, DecodedEvent, LogFilter, RawBlock, RawLog};
