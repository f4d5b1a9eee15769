//! Schedulers for compiled graphs
//!
//! A scheduler takes ownership of every block's [`ExecUnit`], drives the units
//! with a [`BlockExecutor`](super::executor::BlockExecutor) until they finish
//! or are stopped, then hands the units back so the graph can be rewired and
//! restarted without losing buffers.
//!
//! Two models are provided:
//!
//! 1. **Thread per block** ([`ThreadPerBlock`]): every block gets its own OS
//!    thread, which sleeps on the block's notifier while blocked.
//! 2. **Single threaded** ([`SingleThreaded`]): one thread visits every block
//!    round-robin.

mod sts;
mod tpb;

pub use sts::SingleThreaded;
pub use tpb::ThreadPerBlock;

use std::sync::Arc;

use super::block::BlockRef;
use super::block_detail::BlockDetail;
use super::errors::GraphError;
use crate::config::{RuntimeConfig, SchedulerKind};

/// A block with its compiled state and its stream neighbours
pub struct ExecUnit {
    pub block: BlockRef,
    pub detail: BlockDetail,
    /// Blocks feeding our inputs
    pub upstream: Vec<BlockRef>,
    /// Blocks reading our outputs
    pub downstream: Vec<BlockRef>,
}

impl ExecUnit {
    pub fn new(block: BlockRef, detail: BlockDetail) -> Self {
        Self {
            block,
            detail,
            upstream: Vec::new(),
            downstream: Vec::new(),
        }
    }

    pub fn alias(&self) -> &str {
        self.block.alias()
    }

    fn call_start(&self) {
        if let Err(e) = self.block.lock().start() {
            tracing::error!("[{}] start failed: {}", self.alias(), e);
        }
    }

    fn call_stop(&self) {
        if let Err(e) = self.block.lock().stop() {
            tracing::error!("[{}] stop failed: {}", self.alias(), e);
        }
    }
}

impl std::fmt::Debug for ExecUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ExecUnit")
            .field("block", &self.block)
            .field("detail", &self.detail)
            .finish()
    }
}

/// Parameters every scheduler reads at start
#[derive(Debug, Clone)]
pub struct SchedulerParams {
    pub max_noutput_items: usize,
    pub vector_alignment: usize,
    pub input_wait_timeout: std::time::Duration,
    pub watchdog_threshold: std::time::Duration,
}

impl SchedulerParams {
    pub fn from_config(config: &RuntimeConfig, max_noutput_items: usize) -> Self {
        Self {
            max_noutput_items,
            vector_alignment: config.vector_alignment,
            input_wait_timeout: config.input_wait_timeout,
            watchdog_threshold: config.watchdog_threshold,
        }
    }
}

/// A running execution of a flattened graph
pub trait Scheduler: Send + Sync {
    /// Ask every worker to leave its loop; returns immediately
    fn stop(&self);

    /// Block until every worker has exited. Safe to call more than once.
    fn wait(&self);

    /// Units handed back by exited workers; empty until `wait` returned
    fn take_units(&self) -> Vec<ExecUnit>;
}

/// Start `units` under the scheduler `kind`
pub fn spawn(
    kind: SchedulerKind,
    units: Vec<ExecUnit>,
    params: SchedulerParams,
) -> Result<Arc<dyn Scheduler>, GraphError> {
    Ok(match kind {
        SchedulerKind::ThreadPerBlock => Arc::new(ThreadPerBlock::start(units, params)?),
        SchedulerKind::SingleThreaded => Arc::new(SingleThreaded::start(units, params)?),
    })
}
