//! Block-handler scheduling.
//!
//! A [`BlockHandlerSpec`] is immutable: it names a callback, where it starts
//! and how often it fires. The moving part, which block is due next, lives
//! in a [`ScheduleState`] owned by the chain's [`BlockSchedule`].
//!
//! ```text
//! spec { start: Live, interval: 1000 }   head = 5000 when the chain goes live
//!   due: 5000, 6000, 7000, ...            never before 5000
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ArkiverError;
use crate::handler::BlockHandler;

/// Where a block handler starts firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartHeight {
    /// An absolute block number.
    At(u64),
    /// The chain head at the moment the chain first reaches it.
    Live,
}

impl fmt::Display for StartHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(n) => write!(f, "{n}"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// A block callback registered for one chain.
#[derive(Clone)]
pub struct BlockHandlerSpec {
    pub name: String,
    pub start: StartHeight,
    /// Blocks between two invocations; must be positive.
    pub interval: u64,
    pub handler: Arc<dyn BlockHandler>,
}

impl BlockHandlerSpec {
    pub fn new(
        name: impl Into<String>,
        start: StartHeight,
        interval: u64,
        handler: impl BlockHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            start,
            interval,
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for BlockHandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHandlerSpec")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Scheduling cursor of one spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// Block the spec first fires at; `None` until a `Live` spec is anchored.
    pub anchor: Option<u64>,
    /// Next block the spec fires at.
    pub next_due: Option<u64>,
}

/// One callback attached to a scheduled block.
#[derive(Clone)]
pub struct ScheduledCallback {
    pub name: String,
    pub handler: Arc<dyn BlockHandler>,
}

impl fmt::Debug for ScheduledCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScheduledCallback").field(&self.name).finish()
    }
}

/// Due blocks of a window, each with its callbacks in registration order.
pub type BlockPlan = BTreeMap<u64, Vec<ScheduledCallback>>;

/// All block handlers of a chain plus their cursors.
#[derive(Debug, Default)]
pub struct BlockSchedule {
    specs: Vec<BlockHandlerSpec>,
    states: Vec<ScheduleState>,
}

impl BlockSchedule {
    /// Validate `specs` and set up their cursors.
    pub fn new(specs: Vec<BlockHandlerSpec>) -> Result<Self, ArkiverError> {
        let mut states = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if spec.interval == 0 {
                return Err(ArkiverError::Config(format!(
                    "block handler '{}' has a zero interval",
                    spec.name
                )));
            }
            if specs[..i].iter().any(|s| s.name == spec.name) {
                return Err(ArkiverError::Config(format!(
                    "block handler '{}' registered twice",
                    spec.name
                )));
            }
            let anchor = match spec.start {
                StartHeight::At(n) => Some(n),
                StartHeight::Live => None,
            };
            states.push(ScheduleState {
                anchor,
                next_due: anchor,
            });
        }
        Ok(Self { specs, states })
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[BlockHandlerSpec] {
        &self.specs
    }

    pub fn states(&self) -> &[ScheduleState] {
        &self.states
    }

    /// Lowest absolute start height; `Live` specs declare none.
    pub fn min_start(&self) -> Option<u64> {
        self.specs
            .iter()
            .filter_map(|s| match s.start {
                StartHeight::At(n) => Some(n),
                StartHeight::Live => None,
            })
            .min()
    }

    /// Anchor every not-yet-anchored `Live` spec at `head`.
    pub fn activate_live(&mut self, head: u64) {
        for (spec, state) in self.specs.iter().zip(self.states.iter_mut()) {
            if spec.start == StartHeight::Live && state.anchor.is_none() {
                tracing::debug!(handler = %spec.name, block = head, "anchoring live block handler");
                state.anchor = Some(head);
                state.next_due = Some(head);
            }
        }
    }

    /// Blocks due in `[from, to]` with their callbacks. Does not move any cursor.
    pub fn due_in(&self, from: u64, to: u64) -> BlockPlan {
        let mut plan = BlockPlan::new();
        if from > to {
            return plan;
        }
        for (spec, state) in self.specs.iter().zip(&self.states) {
            let Some(next) = state.next_due else { continue };
            let mut block = if next >= from {
                next
            } else {
                let behind = from - next;
                next + behind.div_ceil(spec.interval) * spec.interval
            };
            while block <= to {
                plan.entry(block).or_default().push(ScheduledCallback {
                    name: spec.name.clone(),
                    handler: spec.handler.clone(),
                });
                match block.checked_add(spec.interval) {
                    Some(b) => block = b,
                    None => break,
                }
            }
        }
        plan
    }

    /// Move every active cursor past `to`.
    pub fn advance(&mut self, to: u64) {
        for (spec, state) in self.specs.iter().zip(self.states.iter_mut()) {
            let Some(next) = state.next_due else { continue };
            if next > to {
                continue;
            }
            let steps = (to - next) / spec.interval + 1;
            state.next_due = next.checked_add(steps.saturating_mul(spec.interval));
        }
    }
}
