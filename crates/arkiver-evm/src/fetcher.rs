//! The fetcher loop — advances the fetched frontier one window per tick.
//!
//! Each tick:
//! 1. Re-fetch the pending slots of every window in the retry set
//! 2. Back off while `max_stage_size` windows are unconsumed
//! 3. Refresh the head when the frontier is within one window of it
//! 4. Stage `[fetched, min(fetched + block_range, live)]`: logs and
//!    scheduled blocks are fetched concurrently
//!
//! A failed window goes to the retry set and the frontier moves on anyway.

use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;

use arkiver_core::error::ArkiverError;
use arkiver_core::rpc::RpcClient;
use arkiver_core::schedule::{BlockPlan, BlockSchedule};
use arkiver_core::types::{LogFilter, RawLog};

use crate::staging::{StagedBlock, StagedWindow};
use crate::state::ChainState;

/// `eth_getLogs`, failing if any log is missing its block hash, number or
/// index.
pub(crate) async fn fetch_mined_logs(
    client: &dyn RpcClient,
    filter: &LogFilter,
) -> Result<Vec<RawLog>, ArkiverError> {
    let logs = client.get_logs(filter).await?;
    if let Some(log) = logs.iter().find(|l| l.is_pending()) {
        return Err(ArkiverError::Rpc(format!(
            "reorg-affected log from {} in tx {}",
            log.address,
            log.transaction_hash.as_deref().unwrap_or("<unknown>")
        )));
    }
    Ok(logs)
}

pub(crate) struct Fetcher {
    state: Arc<ChainState>,
    schedule: BlockSchedule,
    head_known: bool,
}

impl Fetcher {
    pub fn new(state: Arc<ChainState>, schedule: BlockSchedule) -> Self {
        Self {
            state,
            schedule,
            head_known: false,
        }
    }

    pub async fn run(mut self) {
        tracing::debug!(chain = %self.state.chain(), from = self.state.fetched(), "fetcher started");
        while self.state.fetching() {
            let delay = self.tick().await;
            tokio::time::sleep(delay).await;
        }
        tracing::debug!(chain = %self.state.chain(), fetched = self.state.fetched(), "fetcher stopped");
    }

    /// Run one tick; returns how long to sleep before the next one.
    async fn tick(&mut self) -> Duration {
        let config = &self.state.config;

        self.retry_failed().await;

        let staged = self.state.staging.len();
        if staged >= config.max_stage_size {
            tracing::debug!(chain = %config.chain, staged, "staging full, backing off");
            return config.max_staging_delay();
        }

        let from = self.state.fetched();
        if !self.head_known || from.saturating_add(config.block_range) >= self.state.live() {
            match self.state.client.get_block_number().await {
                Ok(head) => {
                    self.state.set_live(head);
                    self.head_known = true;
                }
                Err(e) => {
                    tracing::warn!(chain = %config.chain, error = %e, "failed to refresh head");
                    return config.fetch_interval();
                }
            }
        }

        let live = self.state.live();
        let to = from.saturating_add(config.block_range).min(live);
        if from > to {
            // Caught up: resumed right past the head.
            if self.state.mark_live(live) {
                self.schedule.activate_live(from);
                tracing::info!(chain = %config.chain, head = live, "chain is live");
            }
            return config.live_delay();
        }
        if to == live && self.state.mark_live(live) {
            self.schedule.activate_live(live);
            tracing::info!(chain = %config.chain, head = live, "chain is live");
        }

        let plan = self.schedule.due_in(from, to);
        // Opened under the registry lock so a concurrent spawn either lands
        // in this filter or restages the window.
        let filter = {
            let registry = self.state.registry.read();
            let filter = registry.log_filter(from, to);
            self.state
                .staging
                .open(StagedWindow::new(from, to, filter.clone(), plan.clone()));
            filter
        };

        let block_plan = (!plan.is_empty()).then_some(&plan);
        self.fetch_slots(from, to, filter.as_ref(), 0, block_plan).await;

        self.state.advance_fetched(to + 1);
        self.schedule.advance(to);
        tracing::debug!(chain = %config.chain, from, to, live, "window fetched");
        config.fetch_interval()
    }

    async fn retry_failed(&self) {
        for job in self.state.staging.retry_jobs() {
            tracing::debug!(chain = %self.state.chain(), from = job.from, to = job.to, "retrying window");
            self.fetch_slots(
                job.from,
                job.to,
                job.log_filter.as_ref(),
                job.log_epoch,
                job.block_plan.as_ref(),
            )
            .await;
        }
    }

    /// Fetch the given slots of a window and stage what arrived.
    async fn fetch_slots(
        &self,
        from: u64,
        to: u64,
        filter: Option<&LogFilter>,
        log_epoch: u64,
        plan: Option<&BlockPlan>,
    ) {
        let logs = async {
            match filter {
                Some(f) => Some(self.fetch_logs(f).await),
                None => None,
            }
        };
        let blocks = async {
            match plan {
                Some(p) => Some(self.fetch_blocks(p).await),
                None => None,
            }
        };
        let (logs, blocks) = tokio::join!(logs, blocks);

        let mut failed = false;
        match logs {
            Some(Ok(logs)) => self.state.staging.fill_logs(from, log_epoch, logs),
            Some(Err(e)) => {
                tracing::warn!(chain = %self.state.chain(), from, to, error = %e, "log fetch failed");
                failed = true;
            }
            None => {}
        }
        match blocks {
            Some(Ok(blocks)) => self.state.staging.fill_blocks(from, blocks),
            Some(Err(e)) => {
                tracing::warn!(chain = %self.state.chain(), from, to, error = %e, "block fetch failed");
                failed = true;
            }
            None => {}
        }

        if failed {
            self.state.staging.mark_retry(from, to);
        } else {
            self.state.staging.resolve(from);
        }
    }

    async fn fetch_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ArkiverError> {
        fetch_mined_logs(self.state.client.as_ref(), filter).await
    }

    async fn fetch_blocks(&self, plan: &BlockPlan) -> Result<Vec<StagedBlock>, ArkiverError> {
        let client = &self.state.client;
        try_join_all(plan.iter().map(|(&number, callbacks)| async move {
            match client.get_block(number).await? {
                Some(block) => Ok(StagedBlock {
                    block,
                    callbacks: callbacks.clone(),
                }),
                None => Err(ArkiverError::Rpc(format!("block {number} not available yet"))),
            }
        }))
        .await
    }
}
