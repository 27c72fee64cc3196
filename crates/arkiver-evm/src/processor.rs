//! The processor loop — applies staged windows strictly in block order.
//!
//! Within a window, items are ordered by block number, then logs before
//! block handlers, then log index. Handlers of one chain never run
//! concurrently, except for the detached redelivery of a failed handler.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arkiver_core::error::ArkiverError;
use arkiver_core::handler::{BlockContext, BlockHandler, EventContext, EventHandler};
use arkiver_core::types::{ArkiverEvent, RawLog};

use crate::fetcher::fetch_mined_logs;
use crate::staging::{SpawnNotice, StagedBlock, StagedWindow, WindowStatus};
use crate::state::ChainState;

/// One unit of work in a window.
enum WorkItem {
    Log(RawLog),
    Block(StagedBlock),
}

impl WorkItem {
    fn sort_key(&self) -> (u64, u8, u64) {
        match self {
            Self::Log(log) => (
                log.block_number_u64().unwrap_or_default(),
                0,
                log.log_index_u64().unwrap_or_default(),
            ),
            Self::Block(b) => (b.block.number, 1, 0),
        }
    }
}

/// Merge a window's logs and blocks into dispatch order.
fn work_list(window: &mut StagedWindow) -> VecDeque<WorkItem> {
    let mut items: Vec<WorkItem> = window
        .take_logs()
        .into_iter()
        .map(WorkItem::Log)
        .chain(window.take_blocks().into_iter().map(WorkItem::Block))
        .collect();
    items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    items.into()
}

/// Queue `logs` that sort after `after`, keeping dispatch order.
fn splice_logs(items: &mut VecDeque<WorkItem>, logs: Vec<RawLog>, after: (u64, u8, u64)) {
    items.extend(
        logs.into_iter()
            .map(WorkItem::Log)
            .filter(|item| item.sort_key() > after),
    );
    items
        .make_contiguous()
        .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

pub(crate) struct Processor {
    state: Arc<ChainState>,
}

impl Processor {
    pub fn new(state: Arc<ChainState>) -> Self {
        Self { state }
    }

    pub async fn run(self) {
        tracing::debug!(chain = %self.state.chain(), from = self.state.processed(), "processor started");
        while self.state.processing() {
            match self.tick().await {
                Ok(Some(delay)) => tokio::time::sleep(delay).await,
                Ok(None) => tokio::task::yield_now().await,
                Err(e) => {
                    tracing::error!(chain = %self.state.chain(), error = %e, "chain stopped");
                    self.state.emit(ArkiverEvent::ChainError {
                        chain: self.state.chain().to_string(),
                        error: e.to_string(),
                    });
                    self.state.stop();
                }
            }
        }
        tracing::debug!(chain = %self.state.chain(), processed = self.state.processed(), "processor stopped");
    }

    /// Process the window at the frontier, or return how long to wait for it.
    async fn tick(&self) -> Result<Option<Duration>, ArkiverError> {
        let config = &self.state.config;
        let at = self.state.processed();
        match self.state.staging.status(at) {
            WindowStatus::Missing => {
                // Resumed right past the head: nothing to process until it moves.
                self.check_synced(at);
                return Ok(Some(config.fetch_interval()));
            }
            WindowStatus::Pending => return Ok(Some(config.queue_delay())),
            WindowStatus::Ready => {}
        }
        let Some(mut window) = self.state.staging.take(at) else {
            return Ok(Some(config.queue_delay()));
        };

        let mut items = work_list(&mut window);
        let mut count = 0;
        while let Some(item) = items.pop_front() {
            let key = item.sort_key();
            match item {
                WorkItem::Log(log) => self.process_log(log).await?,
                WorkItem::Block(block) => self.process_block(block).await,
            }
            count += 1;
            let spawned = self.state.staging.take_spawned();
            if spawned.is_empty() {
                continue;
            }
            match self.catch_up(&window, spawned, key.0).await {
                Some(logs) => splice_logs(&mut items, logs, key),
                // Stopped mid-window; it is not committed.
                None => return Ok(None),
            }
        }

        let next = window.next_from();
        self.state.advance_processed(next);
        if let Err(e) = self.state.tracker.commit(next).await {
            tracing::warn!(chain = %config.chain, block = next, error = %e, "checkpoint upsert failed");
        }
        tracing::debug!(chain = %config.chain, from = window.from, to = window.to, items = count, "window processed");

        self.check_synced(next);
        Ok(None)
    }

    /// Emit `ChainSynced` the first time `next` passes the sync target.
    fn check_synced(&self, next: u64) {
        let Some(target) = self.state.sync_target() else {
            return;
        };
        if next > target && self.state.mark_synced() {
            tracing::info!(chain = %self.state.chain(), block = target, "chain synced");
            self.state.emit(ArkiverEvent::ChainSynced {
                chain: self.state.chain().to_string(),
                block: target,
            });
        }
    }

    /// Fetch the logs of sources spawned while `window` was being processed,
    /// from block `at` to the end of the window.
    ///
    /// Retries until the fetch succeeds; `None` means the chain was stopped.
    async fn catch_up(
        &self,
        window: &StagedWindow,
        spawned: Vec<SpawnNotice>,
        at: u64,
    ) -> Option<Vec<RawLog>> {
        let mut addresses: Vec<String> = spawned
            .into_iter()
            .filter(|n| n.start <= window.to && !window.covers(&n.address))
            .map(|n| n.address)
            .collect();
        let from = at.max(window.from);
        let filter = self.state.registry.read().log_filter(from, window.to);
        let Some(mut filter) = filter else {
            return Some(Vec::new());
        };
        if addresses.is_empty() || filter.addresses.is_empty() {
            return Some(Vec::new());
        }
        addresses.sort();
        addresses.dedup();
        filter.addresses = addresses;

        loop {
            match fetch_mined_logs(self.state.client.as_ref(), &filter).await {
                Ok(logs) => {
                    tracing::debug!(
                        chain = %self.state.chain(),
                        from,
                        to = window.to,
                        logs = logs.len(),
                        "caught up spawned sources"
                    );
                    return Some(logs);
                }
                Err(e) => {
                    tracing::warn!(chain = %self.state.chain(), from, to = window.to, error = %e, "spawned source fetch failed");
                    tokio::time::sleep(self.state.config.fetch_interval()).await;
                    if !self.state.processing() {
                        return None;
                    }
                }
            }
        }
    }

    async fn process_log(&self, log: RawLog) -> Result<(), ArkiverError> {
        let chain = self.state.chain();
        let route = self.state.registry.read().route(&log)?;
        let Some(route) = route else {
            return Ok(());
        };
        let block = log.block_number_u64().unwrap_or_default();

        let event = match route.decoder.decode(&log) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    chain,
                    contract = %route.contract,
                    event = %route.event,
                    block,
                    error = %e,
                    "failed to decode log; skipping"
                );
                self.state.tracker.record_error(e.to_string());
                return Ok(());
            }
        };

        let ctx = EventContext {
            event,
            contract: route.contract.clone(),
            chain: chain.to_string(),
            client: self.state.client.clone(),
            store: self.state.store.clone(),
            spawner: self.state.spawner.clone(),
        };
        if let Err(e) = route.handler.handle(&ctx).await {
            self.report_failure(Some(&route.contract), Some(&route.event), block, route.handler.name(), &e);
            redeliver_event(route.handler.clone(), ctx);
        }

        self.state.tracker.record_event_call();
        self.touch_checkpoint(block).await;
        Ok(())
    }

    async fn process_block(&self, staged: StagedBlock) {
        let block = staged.block.number;
        for callback in staged.callbacks {
            let ctx = BlockContext {
                block: staged.block.clone(),
                chain: self.state.chain().to_string(),
                client: self.state.client.clone(),
                store: self.state.store.clone(),
                spawner: self.state.spawner.clone(),
            };
            if let Err(e) = callback.handler.handle_block(&ctx).await {
                self.report_failure(None, None, block, &callback.name, &e);
                redeliver_block(callback.handler.clone(), callback.name.clone(), ctx);
            }
            self.state.tracker.record_block_call();
            self.touch_checkpoint(block).await;
        }
    }

    fn report_failure(
        &self,
        contract: Option<&str>,
        event: Option<&str>,
        block: u64,
        handler: &str,
        error: &ArkiverError,
    ) {
        let chain = self.state.chain();
        tracing::warn!(
            chain,
            contract = contract.unwrap_or("-"),
            event = event.unwrap_or("-"),
            block,
            handler,
            error = %error,
            "handler failed; redelivering once"
        );
        self.state.tracker.record_error(format!("{handler} at block {block}: {error}"));
        self.state.emit(ArkiverEvent::HandlerError {
            chain: chain.to_string(),
            contract: contract.map(str::to_string),
            event: event.map(str::to_string),
            block,
            error: error.to_string(),
        });
    }

    async fn touch_checkpoint(&self, block: u64) {
        if let Err(e) = self.state.tracker.touch(block).await {
            tracing::warn!(chain = %self.state.chain(), block, error = %e, "checkpoint upsert failed");
        }
    }
}

/// Second, detached attempt of a failed event handler.
fn redeliver_event(handler: Arc<dyn EventHandler>, ctx: EventContext) {
    tokio::spawn(async move {
        if let Err(e) = handler.handle(&ctx).await {
            tracing::error!(
                chain = %ctx.chain,
                contract = %ctx.contract,
                event = %ctx.event.name,
                block = ctx.event.block_number,
                handler = handler.name(),
                error = %e,
                "handler failed twice; dropping event"
            );
        }
    });
}

/// Second, detached attempt of a failed block handler.
fn redeliver_block(handler: Arc<dyn BlockHandler>, name: String, ctx: BlockContext) {
    tokio::spawn(async move {
        if let Err(e) = handler.handle_block(&ctx).await {
            tracing::error!(
                chain = %ctx.chain,
                block = ctx.block.number,
                handler = %name,
                error = %e,
                "block handler failed twice; dropping block"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use arkiver_core::schedule::BlockPlan;
    use arkiver_core::types::{LogFilter, RawBlock};

    fn block(n: u64) -> StagedBlock {
        StagedBlock {
            block: RawBlock {
                number: n,
                hash: format!("0x{n:064x}"),
                parent_hash: String::new(),
                timestamp: 0,
                tx_count: 0,
            },
            callbacks: vec![],
        }
    }

    #[test]
    fn work_list_orders_by_block_then_logs_then_index() {
        let mut plan = BlockPlan::new();
        plan.insert(120, vec![]);
        let mut window = StagedWindow::new(100, 150, Some(LogFilter::default()), plan);
        window.logs = crate::staging::Slot::Ready(vec![
            RawLog::mined("0xaaa", vec![], "0x", 130, 0),
            RawLog::mined("0xaaa", vec![], "0x", 120, 5),
            RawLog::mined("0xaaa", vec![], "0x", 120, 2),
            RawLog::mined("0xaaa", vec![], "0x", 101, 9),
        ]);
        window.blocks = crate::staging::Slot::Ready(vec![block(120), block(100)]);

        let keys: Vec<_> = work_list(&mut window).iter().map(WorkItem::sort_key).collect();
        assert_eq!(
            keys,
            vec![(100, 1, 0), (101, 0, 9), (120, 0, 2), (120, 0, 5), (120, 1, 0), (130, 0, 0)]
        );
    }

    #[test]
    fn spliced_logs_keep_order_and_skip_the_past() {
        let mut items: VecDeque<WorkItem> =
            vec![WorkItem::Block(block(120)), WorkItem::Log(RawLog::mined("0xaaa", vec![], "0x", 130, 0))].into();
        let late = vec![
            RawLog::mined("0xbbb", vec![], "0x", 110, 0),
            RawLog::mined("0xbbb", vec![], "0x", 115, 3),
            RawLog::mined("0xbbb", vec![], "0x", 115, 7),
            RawLog::mined("0xbbb", vec![], "0x", 125, 1),
        ];
        splice_logs(&mut items, late, (115, 0, 3));

        let keys: Vec<_> = items.iter().map(WorkItem::sort_key).collect();
        assert_eq!(keys, vec![(115, 0, 7), (120, 1, 0), (125, 0, 1), (130, 0, 0)]);
    }
}
