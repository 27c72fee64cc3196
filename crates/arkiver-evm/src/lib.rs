//! arkiver-evm — EVM ingestion pipeline for Arkiver.
//!
//! # Architecture
//!
//! ```text
//! Arkiver
//!   └── ChainSource (one per chain)
//!         ├── Fetcher    ── eth_getLogs / eth_getBlockByNumber ──► Staging
//!         ├── Processor  ◄── Staging ── route ► decode ► handler
//!         └── ContractRegistry (shared with handlers through ChainSpawner)
//! ```
//!
//! The fetcher may run up to `max_stage_size` windows ahead of the
//! processor. The processor applies windows strictly in block order and
//! checkpoints after each one.

pub mod abi;
pub mod arkiver;
pub mod builder;
pub mod client;
pub mod registry;
pub mod source;
pub mod staging;

mod fetcher;
mod processor;
mod state;

#[cfg(test)]
pub(crate) mod testutil;

pub use abi::AbiEventDecoder;
pub use arkiver::{Arkiver, ChainManifest};
pub use builder::ChainSourceBuilder;
pub use client::{HttpClientConfig, HttpRpcClient, RetryConfig};
pub use registry::{ContractDescriptor, ContractRegistry, Source, WILDCARD};
pub use source::{ChainSource, ChainSpawner};
