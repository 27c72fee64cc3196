//! Staging area between the fetcher and the processor.
//!
//! Windows are keyed by their start block. The fetcher opens a window, then
//! fills its slots as fetches succeed; the processor takes it once nothing
//! is pending. Windows whose fetch failed sit in the retry set until every
//! slot has been filled.
//!
//! ```text
//!             open            fill_*            take
//! fetcher ──► {Pending} ──► {Ready/Idle} ──► processor
//!                 │  fetch failed
//!                 └──► retry set ──► re-fetch pending slots each tick
//! ```

use parking_lot::Mutex;
use std::collections::BTreeMap;

use arkiver_core::schedule::{BlockPlan, ScheduledCallback};
use arkiver_core::types::{LogFilter, RawBlock, RawLog};

/// State of one half of a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<T> {
    /// Nothing to fetch.
    Idle,
    /// Fetch attempted, data not yet arrived.
    Pending,
    Ready(T),
}

impl<T> Slot<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    fn take(&mut self) -> Option<T> {
        match std::mem::replace(self, Self::Idle) {
            Self::Ready(data) => Some(data),
            _ => None,
        }
    }
}

/// A fetched block with the callbacks scheduled on it.
#[derive(Debug, Clone)]
pub struct StagedBlock {
    pub block: RawBlock,
    pub callbacks: Vec<ScheduledCallback>,
}

/// Everything fetched for `[from, to]`.
#[derive(Debug)]
pub struct StagedWindow {
    pub from: u64,
    pub to: u64,
    pub logs: Slot<Vec<RawLog>>,
    pub blocks: Slot<Vec<StagedBlock>>,
    log_filter: Option<LogFilter>,
    block_plan: BlockPlan,
    /// Bumped whenever the log filter is widened; older fetches are stale.
    log_epoch: u64,
}

impl StagedWindow {
    /// A window whose slots are pending where there is something to fetch.
    pub fn new(from: u64, to: u64, log_filter: Option<LogFilter>, block_plan: BlockPlan) -> Self {
        let logs = if log_filter.is_some() { Slot::Pending } else { Slot::Idle };
        let blocks = if block_plan.is_empty() { Slot::Idle } else { Slot::Pending };
        Self {
            from,
            to,
            logs,
            blocks,
            log_filter,
            block_plan,
            log_epoch: 0,
        }
    }

    /// Whether the logs of `address` were requested for this window.
    pub fn covers(&self, address: &str) -> bool {
        self.log_filter
            .as_ref()
            .is_some_and(|f| f.matches_address(address))
    }

    pub fn next_from(&self) -> u64 {
        self.to + 1
    }

    pub fn is_pending(&self) -> bool {
        self.logs.is_pending() || self.blocks.is_pending()
    }

    pub fn take_logs(&mut self) -> Vec<RawLog> {
        self.logs.take().unwrap_or_default()
    }

    pub fn take_blocks(&mut self) -> Vec<StagedBlock> {
        self.blocks.take().unwrap_or_default()
    }
}

/// What the processor finds at its frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    /// No window has been opened there yet.
    Missing,
    /// Open, but a slot is still pending.
    Pending,
    Ready,
}

/// Slots of a window that still need fetching.
#[derive(Debug, Clone)]
pub struct RetryJob {
    pub from: u64,
    pub to: u64,
    pub log_filter: Option<LogFilter>,
    pub log_epoch: u64,
    pub block_plan: Option<BlockPlan>,
}

/// A source added while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnNotice {
    pub address: String,
    pub start: u64,
}

#[derive(Default)]
struct Inner {
    windows: BTreeMap<u64, StagedWindow>,
    /// `from → to` of windows whose last fetch failed.
    retry: BTreeMap<u64, u64>,
    spawned: Vec<SpawnNotice>,
}

/// Shared staging area of one chain.
#[derive(Default)]
pub struct Staging {
    inner: Mutex<Inner>,
}

impl Staging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed windows.
    pub fn len(&self) -> usize {
        self.inner.lock().windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of windows waiting for a retry.
    pub fn retry_len(&self) -> usize {
        self.inner.lock().retry.len()
    }

    pub fn open(&self, window: StagedWindow) {
        self.inner.lock().windows.insert(window.from, window);
    }

    /// Stage the logs of `from`, unless its filter changed since `epoch`.
    pub fn fill_logs(&self, from: u64, epoch: u64, logs: Vec<RawLog>) {
        if let Some(w) = self.inner.lock().windows.get_mut(&from) {
            if w.logs.is_pending() && w.log_epoch == epoch {
                w.logs = Slot::Ready(logs);
            }
        }
    }

    pub fn fill_blocks(&self, from: u64, blocks: Vec<StagedBlock>) {
        if let Some(w) = self.inner.lock().windows.get_mut(&from) {
            if w.blocks.is_pending() {
                w.blocks = Slot::Ready(blocks);
            }
        }
    }

    pub fn mark_retry(&self, from: u64, to: u64) {
        self.inner.lock().retry.insert(from, to);
    }

    /// Drop the retry entry of `from` once none of its slots is pending.
    pub fn resolve(&self, from: u64) {
        let mut inner = self.inner.lock();
        let settled = inner.windows.get(&from).map_or(true, |w| !w.is_pending());
        if settled {
            inner.retry.remove(&from);
        }
    }

    /// Pending slots of every window in the retry set.
    pub fn retry_jobs(&self) -> Vec<RetryJob> {
        let inner = self.inner.lock();
        inner
            .retry
            .iter()
            .filter_map(|(&from, &to)| {
                let w = inner.windows.get(&from)?;
                Some(RetryJob {
                    from,
                    to,
                    log_filter: if w.logs.is_pending() { w.log_filter.clone() } else { None },
                    log_epoch: w.log_epoch,
                    block_plan: if w.blocks.is_pending() { Some(w.block_plan.clone()) } else { None },
                })
            })
            .collect()
    }

    /// Re-filter the logs of every window reaching `start` after a source
    /// was added, and queue the changed ones for a re-fetch.
    ///
    /// Returns the number of windows whose logs will be fetched again.
    pub fn restage_logs(
        &self,
        notice: SpawnNotice,
        filter_for: impl Fn(u64, u64) -> Option<LogFilter>,
    ) -> usize {
        let mut inner = self.inner.lock();
        let Inner { windows, retry, spawned } = &mut *inner;
        let mut restaged = 0;
        for w in windows.values_mut().filter(|w| w.to >= notice.start) {
            let filter = filter_for(w.from, w.to);
            if filter == w.log_filter {
                continue;
            }
            w.logs = if filter.is_some() { Slot::Pending } else { Slot::Idle };
            w.log_filter = filter;
            w.log_epoch += 1;
            retry.insert(w.from, w.to);
            restaged += 1;
        }
        spawned.push(notice);
        restaged
    }

    /// Sources added since the last call.
    pub fn take_spawned(&self) -> Vec<SpawnNotice> {
        std::mem::take(&mut self.inner.lock().spawned)
    }

    pub fn status(&self, from: u64) -> WindowStatus {
        match self.inner.lock().windows.get(&from) {
            None => WindowStatus::Missing,
            Some(w) if w.is_pending() => WindowStatus::Pending,
            Some(_) => WindowStatus::Ready,
        }
    }

    /// Remove and return the window at `from` if nothing in it is pending.
    pub fn take(&self, from: u64) -> Option<StagedWindow> {
        let mut inner = self.inner.lock();
        if inner.windows.get(&from)?.is_pending() {
            return None;
        }
        inner.retry.remove(&from);
        inner.windows.remove(&from)
    }
}
