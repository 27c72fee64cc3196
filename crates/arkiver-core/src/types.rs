//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── RawLog ──────────────────────────────────────────────────────────────────

/// A raw EVM log as returned by `eth_getLogs`.
///
/// The block-identifying fields are optional: nodes return them as `null`
/// for logs that belong to a pending (not yet canonical) block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<String>,
    #[serde(rename = "blockHash", default)]
    pub block_hash: Option<String>,
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: Option<String>,
    #[serde(rename = "logIndex", default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    /// Build a log that has been included in a block.
    pub fn mined(
        address: impl Into<String>,
        topics: Vec<String>,
        data: impl Into<String>,
        block_number: u64,
        log_index: u64,
    ) -> Self {
        Self {
            address: address.into(),
            topics,
            data: data.into(),
            block_number: Some(format!("{block_number:#x}")),
            block_hash: Some(format!("0x{block_number:064x}")),
            transaction_hash: Some(format!("0x{:064x}", block_number * 1_000 + log_index)),
            log_index: Some(format!("{log_index:#x}")),
            removed: None,
        }
    }

    /// Returns the block number, if the log has one.
    pub fn block_number_u64(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(parse_hex_u64)
    }

    /// Returns the log index within its block, if present.
    pub fn log_index_u64(&self) -> Option<u64> {
        self.log_index.as_deref().and_then(parse_hex_u64)
    }

    /// Returns topic0 (the event signature hash), lowercased.
    pub fn topic0(&self) -> Option<String> {
        self.topics.first().map(|t| t.to_ascii_lowercase())
    }

    /// Returns `true` if this log is a reorg artifact: removed, or missing
    /// any of its block hash, block number or log index.
    pub fn is_pending(&self) -> bool {
        self.removed.unwrap_or(false)
            || self.block_hash.is_none()
            || self.block_number_u64().is_none()
            || self.log_index_u64().is_none()
    }
}

// ─── RawBlock ────────────────────────────────────────────────────────────────

/// A block snapshot handed to block handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    /// Number of transactions in the block.
    pub tx_count: u32,
}

impl RawBlock {
    /// Convert a JSON `eth_getBlockByNumber` response into a `RawBlock`.
    pub fn from_json(v: &Value) -> Option<Self> {
        Some(Self {
            number: parse_hex_u64(v["number"].as_str()?)?,
            hash: v["hash"].as_str()?.to_string(),
            parent_hash: v["parentHash"].as_str()?.to_string(),
            timestamp: parse_hex_u64(v["timestamp"].as_str()?)? as i64,
            tx_count: v["transactions"].as_array().map(|a| a.len() as u32).unwrap_or(0),
        })
    }
}

// ─── LogFilter ───────────────────────────────────────────────────────────────

/// An `eth_getLogs` filter over an inclusive block window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Only logs from these addresses (empty = all addresses).
    pub addresses: Vec<String>,
    /// Topic filter by position; `topics[0]` lists accepted event signatures.
    pub topics: Vec<Vec<String>>,
    /// Start block (inclusive).
    pub from_block: u64,
    /// End block (inclusive).
    pub to_block: u64,
}

impl LogFilter {
    /// Returns `true` if `address` matches this filter.
    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Returns `true` if `topic0` matches this filter.
    pub fn matches_topic0(&self, topic0: &str) -> bool {
        match self.topics.first() {
            None => true,
            Some(accepted) => {
                accepted.is_empty() || accepted.iter().any(|t| t.eq_ignore_ascii_case(topic0))
            }
        }
    }

    /// Returns `true` if the log lies inside the window and matches the filter.
    pub fn matches(&self, log: &RawLog) -> bool {
        let in_window = log
            .block_number_u64()
            .map(|n| n >= self.from_block && n <= self.to_block)
            .unwrap_or(true);
        in_window
            && self.matches_address(&log.address)
            && log.topics.first().map(|t| self.matches_topic0(t)).unwrap_or(false)
    }
}

// ─── DecodedEvent ────────────────────────────────────────────────────────────

/// A log decoded against its contract's ABI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Event name from the ABI (e.g. `"Transfer"`).
    pub name: String,
    /// Canonical signature (e.g. `"Transfer(address,address,uint256)"`).
    pub signature: String,
    /// Contract address that emitted the event (lowercase).
    pub address: String,
    /// Block number.
    pub block_number: u64,
    /// Block hash.
    pub block_hash: String,
    /// Transaction hash.
    pub transaction_hash: String,
    /// Log index within the block.
    pub log_index: u64,
    /// Named event arguments. Unnamed parameters are keyed `arg{i}`.
    pub args: Map<String, Value>,
}

impl DecodedEvent {
    /// Look up a decoded argument by name.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }
}

// ─── ArkiverEvent ────────────────────────────────────────────────────────────

/// Status events broadcast by chain sources and the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArkiverEvent {
    /// A chain processed past the head it observed when it went live.
    ChainSynced { chain: String, block: u64 },
    /// Every configured chain has synced.
    Synced,
    /// A handler failed; it is redelivered once.
    HandlerError {
        chain: String,
        contract: Option<String>,
        event: Option<String>,
        block: u64,
        error: String,
    },
    /// A chain stopped, or failed to start.
    ChainError { chain: String, error: String },
}

/// Parse a hex-encoded string (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSFER: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn mined_log_is_not_pending() {
        let log = RawLog::mined("0xAAA", vec![TRANSFER.into()], "0x", 150, 3);
        assert!(!log.is_pending());
        assert_eq!(log.block_number_u64(), Some(150));
        assert_eq!(log.log_index_u64(), Some(3));
    }

    #[test]
    fn pending_log_from_json() {
        let log: RawLog = serde_json::from_value(serde_json::json!({
            "address": "0xaaa",
            "topics": [TRANSFER],
            "data": "0x",
            "blockNumber": null,
            "blockHash": null,
            "transactionHash": "0x01",
            "logIndex": null
        }))
        .unwrap();
        assert!(log.is_pending());
    }

    #[test]
    fn removed_log_is_pending() {
        let mut log = RawLog::mined("0xaaa", vec![TRANSFER.into()], "0x", 1, 0);
        log.removed = Some(true);
        assert!(log.is_pending());
    }

    #[test]
    fn block_from_json() {
        let v = serde_json::json!({
            "number": "0x1388",
            "hash": "0xabc",
            "parentHash": "0xabb",
            "timestamp": "0x64",
            "transactions": ["0x1", "0x2"]
        });
        let block = RawBlock::from_json(&v).unwrap();
        assert_eq!(block.number, 5000);
        assert_eq!(block.timestamp, 100);
        assert_eq!(block.tx_count, 2);
    }

    #[test]
    fn filter_matches_case_insensitive() {
        let filter = LogFilter {
            addresses: vec!["0xabcdef".into()],
            topics: vec![vec![TRANSFER.into()]],
            from_block: 100,
            to_block: 150,
        };
        let log = RawLog::mined("0xAbCdEf", vec![TRANSFER.to_uppercase()], "0x", 120, 0);
        assert!(filter.matches(&log));

        let outside = RawLog::mined("0xabcdef", vec![TRANSFER.into()], "0x", 151, 0);
        assert!(!filter.matches(&outside));
    }

    #[test]
    fn empty_filter_matches_any_address() {
        let f = LogFilter::default();
        assert!(f.matches_address("0xanything"));
        assert!(f.matches_topic0("0xanything"));
    }
}
