//! Contract registry — maps logs to the contract and handler they belong to.
//!
//! Descriptors are normalized once per chain into three lookups:
//!
//! ```text
//! address (lowercase) ──► contract id + start height     (or the wildcard)
//! (topic0, contract)  ──► AbiEventDecoder + EventHandler
//! subscribed topics   ──► topic filter of every eth_getLogs call
//! ```

use alloy_json_abi::JsonAbi;
use alloy_primitives::keccak256;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use arkiver_core::error::ArkiverError;
use arkiver_core::handler::EventHandler;
use arkiver_core::types::{LogFilter, RawLog};

use crate::abi::AbiEventDecoder;

/// Address of a source that matches every address not claimed by another
/// contract.
pub const WILDCARD: &str = "*";

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// One address a contract is indexed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Lowercase address, or [`WILDCARD`].
    pub address: String,
    pub start_block_height: u64,
}

impl Source {
    pub fn new(address: impl AsRef<str>, start_block_height: u64) -> Self {
        Self {
            address: address.as_ref().to_ascii_lowercase(),
            start_block_height,
        }
    }

    pub fn wildcard(start_block_height: u64) -> Self {
        Self::new(WILDCARD, start_block_height)
    }

    pub fn is_wildcard(&self) -> bool {
        self.address == WILDCARD
    }
}

/// A handler subscribed to an event by name.
#[derive(Clone)]
pub struct EventSubscription {
    pub event_name: String,
    pub handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("event_name", &self.event_name)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// A contract ABI with the addresses it lives at and the events to handle.
#[derive(Debug, Clone)]
pub struct ContractDescriptor {
    pub id: String,
    pub abi: JsonAbi,
    pub sources: Vec<Source>,
    pub events: Vec<EventSubscription>,
}

impl ContractDescriptor {
    /// A descriptor identified by a user-given name.
    pub fn new(id: impl Into<String>, abi: JsonAbi) -> Self {
        Self {
            id: id.into(),
            abi,
            sources: Vec::new(),
            events: Vec::new(),
        }
    }

    /// A descriptor identified by the keccak256 of its ABI JSON.
    pub fn from_abi(abi: JsonAbi) -> Result<Self, ArkiverError> {
        let id = abi_content_id(&abi)?;
        Ok(Self::new(id, abi))
    }

    /// Parse an ABI JSON string. Without a name, the id is the ABI hash.
    pub fn from_abi_json(name: Option<&str>, abi_json: &str) -> Result<Self, ArkiverError> {
        let abi: JsonAbi = serde_json::from_str(abi_json).map_err(|e| ArkiverError::InvalidAbi {
            contract: name.unwrap_or("<unnamed>").to_string(),
            reason: e.to_string(),
        })?;
        match name {
            Some(name) => Ok(Self::new(name, abi)),
            None => Self::from_abi(abi),
        }
    }

    pub fn has_wildcard(&self) -> bool {
        self.sources.iter().any(Source::is_wildcard)
    }

    /// Add a source. Mixing the wildcard with specific addresses is rejected.
    pub fn add_source(&mut self, source: Source) -> Result<&mut Self, ArkiverError> {
        let mixed = if source.is_wildcard() {
            self.sources.iter().any(|s| !s.is_wildcard())
        } else {
            self.has_wildcard()
        };
        if mixed {
            return Err(ArkiverError::MixedSources {
                contract: self.id.clone(),
            });
        }
        if !self.sources.iter().any(|s| s.address == source.address) {
            self.sources.push(source);
        }
        Ok(self)
    }

    /// Builder form of [`ContractDescriptor::add_source`].
    pub fn with_source(mut self, address: impl AsRef<str>, start: u64) -> Result<Self, ArkiverError> {
        self.add_source(Source::new(address, start))?;
        Ok(self)
    }

    /// Subscribe `handler` to every overload of `event_name`.
    pub fn on_event(mut self, event_name: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        self.events.push(EventSubscription {
            event_name: event_name.into(),
            handler: Arc::new(handler),
        });
        self
    }
}

/// `0x`-prefixed keccak256 of the serialized ABI.
pub fn abi_content_id(abi: &JsonAbi) -> Result<String, ArkiverError> {
    let json = serde_json::to_vec(abi).map_err(|e| ArkiverError::InvalidAbi {
        contract: "<unnamed>".into(),
        reason: e.to_string(),
    })?;
    Ok(format!("0x{}", hex::encode(keccak256(json))))
}

// ─── Normalized registry ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Claim {
    contract: String,
    start: u64,
}

#[derive(Debug, Default)]
struct ContractState {
    wildcard: bool,
    specific: bool,
}

/// Decoder and handler a log is dispatched to.
#[derive(Clone)]
pub struct Route {
    pub contract: String,
    pub event: String,
    pub decoder: Arc<AbiEventDecoder>,
    pub handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("contract", &self.contract)
            .field("event", &self.event)
            .finish()
    }
}

/// Normalized lookups for the contracts of one chain.
#[derive(Debug)]
pub struct ContractRegistry {
    chain: String,
    contracts: BTreeMap<String, ContractState>,
    addresses: HashMap<String, Claim>,
    wildcard: Option<Claim>,
    routes: HashMap<(String, String), Route>,
    subscribed_topics: BTreeSet<String>,
}

impl ContractRegistry {
    pub fn from_descriptors(
        chain: impl Into<String>,
        descriptors: Vec<ContractDescriptor>,
    ) -> Result<Self, ArkiverError> {
        let mut registry = Self {
            chain: chain.into(),
            contracts: BTreeMap::new(),
            addresses: HashMap::new(),
            wildcard: None,
            routes: HashMap::new(),
            subscribed_topics: BTreeSet::new(),
        };
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    fn register(&mut self, descriptor: ContractDescriptor) -> Result<(), ArkiverError> {
        let id = descriptor.id.clone();
        if self.contracts.contains_key(&id) {
            return Err(ArkiverError::Config(format!(
                "contract '{id}' declared twice on chain '{}'",
                self.chain
            )));
        }
        self.contracts.insert(id.clone(), ContractState::default());

        for source in descriptor.sources {
            self.add_source(&id, source)?;
        }

        for sub in descriptor.events {
            let overloads = descriptor
                .abi
                .events
                .get(&sub.event_name)
                .filter(|events| !events.is_empty())
                .ok_or_else(|| ArkiverError::UnknownEvent {
                    contract: id.clone(),
                    event: sub.event_name.clone(),
                })?;
            for event in overloads {
                let decoder = AbiEventDecoder::new(event).map_err(|e| ArkiverError::InvalidAbi {
                    contract: id.clone(),
                    reason: e.to_string(),
                })?;
                let topic = decoder.topic().to_string();
                let key = (topic.clone(), id.clone());
                if self.routes.contains_key(&key) {
                    return Err(ArkiverError::DuplicateHandler {
                        contract: id.clone(),
                        event: sub.event_name.clone(),
                    });
                }
                self.routes.insert(
                    key,
                    Route {
                        contract: id.clone(),
                        event: sub.event_name.clone(),
                        decoder: Arc::new(decoder),
                        handler: sub.handler.clone(),
                    },
                );
                self.subscribed_topics.insert(topic);
            }
        }

        tracing::debug!(chain = %self.chain, contract = %id, "contract registered");
        Ok(())
    }

    /// Merge a source into a registered contract.
    ///
    /// Returns `false` if the contract already had that address.
    pub fn add_source(&mut self, contract_id: &str, source: Source) -> Result<bool, ArkiverError> {
        let state = self
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ArkiverError::UnknownContract {
                contract: contract_id.to_string(),
            })?;
        let mixed = if source.is_wildcard() {
            state.specific
        } else {
            state.wildcard
        };
        if mixed {
            return Err(ArkiverError::MixedSources {
                contract: contract_id.to_string(),
            });
        }

        let claim = Claim {
            contract: contract_id.to_string(),
            start: source.start_block_height,
        };

        if source.is_wildcard() {
            match &self.wildcard {
                Some(existing) if existing.contract == contract_id => return Ok(false),
                Some(_) => {
                    return Err(ArkiverError::MixedSources {
                        contract: contract_id.to_string(),
                    })
                }
                None => {
                    state.wildcard = true;
                    self.wildcard = Some(claim);
                    return Ok(true);
                }
            }
        }

        match self.addresses.get(&source.address) {
            Some(existing) if existing.contract == contract_id => Ok(false),
            Some(existing) => Err(ArkiverError::DuplicateAddress {
                address: source.address,
                first: existing.contract.clone(),
                second: contract_id.to_string(),
            }),
            None => {
                state.specific = true;
                self.addresses.insert(source.address, claim);
                Ok(true)
            }
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn contains(&self, contract_id: &str) -> bool {
        self.contracts.contains_key(contract_id)
    }

    pub fn subscribed_topics(&self) -> &BTreeSet<String> {
        &self.subscribed_topics
    }

    /// Minimum start height over every source.
    pub fn min_start_height(&self) -> Option<u64> {
        self.addresses
            .values()
            .chain(self.wildcard.iter())
            .map(|c| c.start)
            .min()
    }

    /// The `eth_getLogs` filter for `[from, to]`, or `None` if no source is
    /// active by `to`.
    pub fn log_filter(&self, from: u64, to: u64) -> Option<LogFilter> {
        if self.subscribed_topics.is_empty() {
            return None;
        }
        let topics = vec![self.subscribed_topics.iter().cloned().collect()];

        if self.wildcard.as_ref().is_some_and(|w| w.start <= to) {
            return Some(LogFilter {
                addresses: Vec::new(),
                topics,
                from_block: from,
                to_block: to,
            });
        }

        let mut addresses: Vec<String> = self
            .addresses
            .iter()
            .filter(|(_, claim)| claim.start <= to)
            .map(|(address, _)| address.clone())
            .collect();
        if addresses.is_empty() {
            return None;
        }
        addresses.sort();
        Some(LogFilter {
            addresses,
            topics,
            from_block: from,
            to_block: to,
        })
    }

    /// Resolve the route of a mined log.
    ///
    /// `Ok(None)` means the log is not meant for any handler: it precedes
    /// its source's start height, or its contract does not subscribe to its
    /// topic.
    pub fn route(&self, log: &RawLog) -> Result<Option<Route>, ArkiverError> {
        let address = log.address.to_ascii_lowercase();
        let block = log.block_number_u64().unwrap_or_default();
        let claim = self
            .addresses
            .get(&address)
            .or(self.wildcard.as_ref())
            .ok_or_else(|| ArkiverError::UnknownAddress {
                chain: self.chain.clone(),
                address: address.clone(),
                block,
            })?;
        if block < claim.start {
            return Ok(None);
        }
        let Some(topic) = log.topic0() else {
            return Ok(None);
        };
        Ok(self.routes.get(&(topic, claim.contract.clone())).cloned())
    }
}

/// Pick the block a chain starts indexing at.
///
/// `declared` is the lowest start height of any source or absolute block
/// handler. A checkpoint at or above it wins; one below it is ignored.
/// `None` means nothing declares a start and the chain begins at its head.
pub fn resolve_start_height(chain: &str, declared: Option<u64>, checkpoint: Option<u64>) -> Option<u64> {
    match (declared, checkpoint) {
        (Some(d), Some(c)) if c >= d => Some(c),
        (Some(d), Some(c)) => {
            tracing::warn!(
                chain,
                checkpoint = c,
                declared = d,
                "checkpoint is below the declared start height; ignoring it"
            );
            Some(d)
        }
        (Some(d), None) => Some(d),
        (None, c) => c,
    }
}
