//! Error types for the arkiver pipeline.

use thiserror::Error;

/// Errors that can occur while configuring or running an arkive.
#[derive(Debug, Error)]
pub enum ArkiverError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Store computation failed for '{key}': {reason}")]
    Store { key: String, reason: String },

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Decode error for event '{event}': {reason}")]
    Decode { event: String, reason: String },

    #[error("Event '{event}' not found in ABI of contract '{contract}'")]
    UnknownEvent { contract: String, event: String },

    #[error("Duplicate handler for event '{event}' on contract '{contract}'")]
    DuplicateHandler { contract: String, event: String },

    #[error("Contract '{contract}' mixes wildcard and specific-address sources")]
    MixedSources { contract: String },

    #[error("Address {address} is claimed by both '{first}' and '{second}'")]
    DuplicateAddress {
        address: String,
        first: String,
        second: String,
    },

    #[error("Unknown contract '{contract}'")]
    UnknownContract { contract: String },

    #[error("Invalid ABI for contract '{contract}': {reason}")]
    InvalidAbi { contract: String, reason: String },

    #[error("Missing RPC URL for chain '{chain}'")]
    MissingRpcUrl { chain: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Log from unregistered address {address} on chain '{chain}' at block {block}")]
    UnknownAddress {
        chain: String,
        address: String,
        block: u64,
    },

    #[error("{0}")]
    Other(String),
}

impl ArkiverError {
    /// Returns `true` for misconfiguration detected before `run()` begins.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::UnknownEvent { .. }
                | Self::DuplicateHandler { .. }
                | Self::MixedSources { .. }
                | Self::DuplicateAddress { .. }
                | Self::UnknownContract { .. }
                | Self::InvalidAbi { .. }
                | Self::MissingRpcUrl { .. }
                | Self::Config(_)
        )
    }

    /// Returns `true` if the error is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_classified() {
        let err = ArkiverError::MixedSources {
            contract: "Pair".into(),
        };
        assert!(err.is_config());
        assert!(!err.is_transient());

        let err = ArkiverError::Rpc("connection reset".into());
        assert!(!err.is_config());
        assert!(err.is_transient());
    }

    #[test]
    fn unknown_address_is_not_config() {
        let err = ArkiverError::UnknownAddress {
            chain: "ethereum".into(),
            address: "0xdead".into(),
            block: 7,
        };
        assert!(!err.is_config());
        assert_eq!(
            err.to_string(),
            "Log from unregistered address 0xdead on chain 'ethereum' at block 7"
        );
    }
}
