//! Fixtures shared by the crate's unit tests: ABIs, log builders, recording
//! handlers and a scripted in-memory RPC node.

use alloy_dyn_abi::DynSolValue;
use alloy_json_abi::JsonAbi;
use alloy_primitives::U256;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arkiver_core::error::ArkiverError;
use arkiver_core::handler::{BlockContext, BlockHandler, EventContext, EventHandler};
use arkiver_core::rpc::RpcClient;
use arkiver_core::types::{LogFilter, RawBlock, RawLog};

pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

pub fn erc20_abi() -> JsonAbi {
    serde_json::from_str(
        r#"[{"type":"event","name":"Transfer","anonymous":false,"inputs":[
            {"name":"from","type":"address","indexed":true},
            {"name":"to","type":"address","indexed":true},
            {"name":"value","type":"uint256","indexed":false}]}]"#,
    )
    .unwrap()
}

pub fn pair_abi() -> JsonAbi {
    serde_json::from_str(
        r#"[{"type":"event","name":"Sync","anonymous":false,"inputs":[
            {"name":"reserve0","type":"uint112","indexed":false},
            {"name":"reserve1","type":"uint112","indexed":false}]}]"#,
    )
    .unwrap()
}

pub fn factory_abi() -> JsonAbi {
    serde_json::from_str(
        r#"[{"type":"event","name":"PairCreated","anonymous":false,"inputs":[
            {"name":"token0","type":"address","indexed":true},
            {"name":"token1","type":"address","indexed":true},
            {"name":"pair","type":"address","indexed":false},
            {"name":"","type":"uint256","indexed":false}]}]"#,
    )
    .unwrap()
}

fn topic_of(abi: &JsonAbi, event: &str) -> String {
    format!("0x{}", hex::encode(abi.events[event][0].selector()))
}

fn word_address(byte: u8) -> String {
    format!("0x{}{}", "00".repeat(12), format!("{byte:02x}").repeat(20))
}

fn encode(values: Vec<DynSolValue>) -> String {
    let body = DynSolValue::Tuple(values).abi_encode_sequence().unwrap_or_default();
    format!("0x{}", hex::encode(body))
}

/// An encoded `Transfer(0x11.., 0x22.., value)` log.
pub fn transfer_log(address: &str, block: u64, index: u64, value: u64) -> RawLog {
    RawLog::mined(
        address,
        vec![TRANSFER_TOPIC.into(), word_address(0x11), word_address(0x22)],
        encode(vec![DynSolValue::Uint(U256::from(value), 256)]),
        block,
        index,
    )
}

/// An encoded `Sync(reserve0, reserve1)` log.
pub fn sync_log(address: &str, block: u64, index: u64, reserve0: u64, reserve1: u64) -> RawLog {
    RawLog::mined(
        address,
        vec![topic_of(&pair_abi(), "Sync")],
        encode(vec![
            DynSolValue::Uint(U256::from(reserve0), 112),
            DynSolValue::Uint(U256::from(reserve1), 112),
        ]),
        block,
        index,
    )
}

/// An encoded `PairCreated` log announcing `pair` (a 20-byte hex address).
pub fn pair_created_log(factory: &str, block: u64, index: u64, pair: &str) -> RawLog {
    let pair_bytes: [u8; 20] = hex::decode(pair.trim_start_matches("0x"))
        .ok()
        .and_then(|b| b.try_into().ok())
        .unwrap_or([0; 20]);
    RawLog::mined(
        factory,
        vec![topic_of(&factory_abi(), "PairCreated"), word_address(0x11), word_address(0x22)],
        encode(vec![
            DynSolValue::Address(pair_bytes.into()),
            DynSolValue::Uint(U256::from(1u64), 256),
        ]),
        block,
        index,
    )
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Ordered record of handler invocations, shared between handlers.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Event handler that appends `contract.Event@block#index` to a journal.
#[derive(Default)]
pub struct RecordingHandler {
    pub journal: Journal,
    failures: AtomicU32,
}

impl RecordingHandler {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            failures: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` invocations (still journaling them).
    pub fn failing(journal: Journal, n: u32) -> Self {
        Self {
            journal,
            failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, ctx: &EventContext) -> Result<(), ArkiverError> {
        self.journal.lock().push(format!(
            "{}.{}@{}#{}",
            ctx.contract, ctx.event.name, ctx.event.block_number, ctx.event.log_index
        ));
        let fail = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ArkiverError::Handler {
                handler: "recording".into(),
                reason: "scripted failure".into(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Block handler that appends `name:block` to a journal.
pub struct BlockRecorder {
    pub name: String,
    pub journal: Journal,
}

impl BlockRecorder {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
        }
    }
}

#[async_trait]
impl BlockHandler for BlockRecorder {
    async fn handle_block(&self, ctx: &BlockContext) -> Result<(), ArkiverError> {
        self.journal.lock().push(format!("{}:{}", self.name, ctx.block.number));
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─── MockRpc ─────────────────────────────────────────────────────────────────

/// Scripted RPC node: a head, a set of mined logs and injectable failures.
#[derive(Default)]
pub struct MockRpc {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    /// Returned for any window they fall in, ignoring the filter's addresses.
    stray: Mutex<Vec<RawLog>>,
    fail_logs: AtomicU32,
    reorg_logs: AtomicU32,
    fail_head: AtomicU32,
    pub log_calls: AtomicU64,
    pub block_calls: AtomicU64,
    pub filters: Mutex<Vec<LogFilter>>,
}

impl MockRpc {
    pub fn new(head: u64) -> Arc<Self> {
        let rpc = Self::default();
        rpc.head.store(head, Ordering::Release);
        Arc::new(rpc)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::Release);
    }

    pub fn push_log(&self, log: RawLog) {
        self.logs.lock().push(log);
    }

    /// Serve `log` regardless of the filter's addresses, like a buggy node.
    pub fn push_stray_log(&self, log: RawLog) {
        self.stray.lock().push(log);
    }

    /// Make the next `n` `eth_getLogs` calls fail.
    pub fn fail_next_logs(&self, n: u32) {
        self.fail_logs.store(n, Ordering::Release);
    }

    /// Make the next `n` `eth_getLogs` calls include a log without a block hash.
    pub fn reorg_next_logs(&self, n: u32) {
        self.reorg_logs.store(n, Ordering::Release);
    }

    /// Make the next `n` `eth_blockNumber` calls fail.
    pub fn fail_next_heads(&self, n: u32) {
        self.fail_head.store(n, Ordering::Release);
    }

    pub fn log_calls(&self) -> u64 {
        self.log_calls.load(Ordering::Acquire)
    }

    pub fn block_calls(&self) -> u64 {
        self.block_calls.load(Ordering::Acquire)
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RpcClient for MockRpc {
    async fn get_block_number(&self) -> Result<u64, ArkiverError> {
        if Self::consume(&self.fail_head) {
            return Err(ArkiverError::Rpc("eth_blockNumber: scripted failure".into()));
        }
        Ok(self.head.load(Ordering::Acquire))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ArkiverError> {
        self.log_calls.fetch_add(1, Ordering::AcqRel);
        self.filters.lock().push(filter.clone());
        if Self::consume(&self.fail_logs) {
            return Err(ArkiverError::Rpc("eth_getLogs: scripted failure".into()));
        }
        let mut logs: Vec<RawLog> = self
            .logs
            .lock()
            .iter()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        logs.extend(
            self.stray
                .lock()
                .iter()
                .filter(|l| {
                    l.block_number_u64()
                        .is_some_and(|n| n >= filter.from_block && n <= filter.to_block)
                })
                .cloned(),
        );
        if Self::consume(&self.reorg_logs) {
            if let Some(first) = logs.first_mut() {
                first.block_hash = None;
            } else {
                let mut pending = RawLog::mined("0x0", vec![TRANSFER_TOPIC.into()], "0x", filter.from_block, 0);
                pending.block_hash = None;
                logs.push(pending);
            }
        }
        Ok(logs)
    }

    async fn get_block(&self, number: u64) -> Result<Option<RawBlock>, ArkiverError> {
        self.block_calls.fetch_add(1, Ordering::AcqRel);
        if number > self.head.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(Some(RawBlock {
            number,
            hash: format!("0x{number:064x}"),
            parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
            timestamp: 1_700_000_000 + number as i64 * 12,
            tx_count: 0,
        }))
    }
}
