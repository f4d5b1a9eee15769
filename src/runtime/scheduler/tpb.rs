//! Thread-per-block scheduler
//!
//! Spawns a dedicated thread for each block. Workers are held at a start gate
//! until every thread exists, then loop on their block's executor. A blocked
//! worker sleeps on its block's [`ThreadNotifier`](crate::runtime::notify::ThreadNotifier);
//! neighbours wake it when they produce into its inputs or free space in its
//! outputs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, error, info};

use super::{ExecUnit, Scheduler, SchedulerParams};
use crate::runtime::block::{BlockId, BlockRef};
use crate::runtime::errors::GraphError;
use crate::runtime::executor::{BlockExecutor, ExecState};
use crate::runtime::watchdog::{WaitKind, Watchdog, WatchdogHandle};

struct Workers {
    threads: HashMap<BlockId, (String, JoinHandle<ExecUnit>)>,
    completion_rx: Receiver<BlockId>,
    total: usize,
}

/// One OS thread per block
pub struct ThreadPerBlock {
    blocks: Vec<BlockRef>,
    workers: Mutex<Workers>,
    units: Mutex<Vec<ExecUnit>>,
    watchdog: Watchdog,
}

struct WorkerContext {
    gate: Receiver<()>,
    completion: Sender<BlockId>,
    /// Stream workers still running
    streams_alive: Arc<AtomicUsize>,
    has_streams: bool,
    params: SchedulerParams,
    watchdog: WatchdogHandle,
}

impl ThreadPerBlock {
    pub fn start(units: Vec<ExecUnit>, params: SchedulerParams) -> Result<Self, GraphError> {
        let total = units.len();
        let blocks: Vec<BlockRef> = units.iter().map(|u| u.block.clone()).collect();
        for block in &blocks {
            block.notifier().reset();
        }

        let nstreams = units
            .iter()
            .filter(|u| !u.block.meta().is_message_only())
            .count();
        let streams_alive = Arc::new(AtomicUsize::new(nstreams));
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (completion_tx, completion_rx) = unbounded();
        let watchdog = Watchdog::new(params.watchdog_threshold);

        let mut threads = HashMap::with_capacity(total);
        for unit in units {
            let name = unit.alias().to_string();
            let id = unit.block.id();
            let ctx = WorkerContext {
                gate: gate_rx.clone(),
                completion: completion_tx.clone(),
                streams_alive: Arc::clone(&streams_alive),
                has_streams: nstreams > 0,
                params: params.clone(),
                watchdog: watchdog.register(&name),
            };

            debug!("Starting block thread: {}", name);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(unit, ctx));
            match spawned {
                Ok(handle) => {
                    threads.insert(id, (name, handle));
                }
                Err(e) => {
                    error!("[{}] Failed to spawn thread: {}", name, e);
                    for block in &blocks {
                        block.notifier().interrupt();
                    }
                    drop(gate_tx);
                    for (_, (_, handle)) in threads.drain() {
                        let _ = handle.join();
                    }
                    return Err(GraphError::Spawn(e.to_string()));
                }
            }
        }

        watchdog.start();
        info!(
            "Watchdog enabled - will report workers blocked >{:.1}s",
            watchdog.threshold().as_secs_f64()
        );

        // Release every worker at once
        drop(gate_tx);
        drop(gate_rx);

        Ok(Self {
            blocks,
            workers: Mutex::new(Workers {
                threads,
                completion_rx,
                total,
            }),
            units: Mutex::new(Vec::with_capacity(total)),
            watchdog,
        })
    }

    /// Get the number of worker threads started
    pub fn num_threads(&self) -> usize {
        self.blocks.len()
    }
}

impl Scheduler for ThreadPerBlock {
    fn stop(&self) {
        for block in &self.blocks {
            block.notifier().interrupt();
        }
    }

    /// Joins threads as they report completion
    fn wait(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.threads.is_empty() {
            return;
        }

        let total = workers.total;
        let mut completed = total - workers.threads.len();
        info!("Waiting for {} threads to complete...", workers.threads.len());

        while !workers.threads.is_empty() {
            let Ok(id) = workers.completion_rx.recv() else {
                break;
            };
            let Some((name, handle)) = workers.threads.remove(&id) else {
                continue;
            };
            completed += 1;
            match handle.join() {
                Ok(unit) => {
                    info!("[{}] Thread completed ({}/{})", name, completed, total);
                    self.units
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(unit);
                }
                Err(e) => error!("[{}] Thread panicked ({}/{}): {:?}", name, completed, total, e),
            }
        }

        info!("All {} threads completed", total);
        self.watchdog.stop();
    }

    fn take_units(&self) -> Vec<ExecUnit> {
        std::mem::take(&mut *self.units.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Drop for ThreadPerBlock {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

/// Reports completion even if the worker unwinds
struct CompletionGuard {
    id: BlockId,
    tx: Sender<BlockId>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(self.id);
    }
}

fn notify_neighbours(unit: &ExecUnit, downstream: bool, upstream: bool) {
    if downstream {
        for block in &unit.downstream {
            block.notifier().notify_input();
        }
    }
    if upstream {
        for block in &unit.upstream {
            block.notifier().notify_output();
        }
    }
}

fn run_worker(mut unit: ExecUnit, ctx: WorkerContext) -> ExecUnit {
    let _completion = CompletionGuard {
        id: unit.block.id(),
        tx: ctx.completion,
    };

    // Returns once the scheduler drops its end of the gate
    let _ = ctx.gate.recv();

    let block = unit.block.clone();
    let alias = block.alias().to_string();
    let notifier = block.notifier();
    let message_only = block.meta().is_message_only();
    let mut exec = BlockExecutor::new(ctx.params.max_noutput_items, ctx.params.vector_alignment);

    unit.call_start();
    loop {
        if notifier.is_interrupted() {
            debug!("[{}] Stop signal received", alias);
            break;
        }
        notifier.clear_changed();

        match exec.run_one_iteration(&block, &mut unit.detail) {
            ExecState::Ready => {
                ctx.watchdog.progressed();
                notify_neighbours(&unit, true, true);
            }
            ExecState::ReadyNoOutput => {
                ctx.watchdog.progressed();
                notify_neighbours(&unit, false, true);
            }
            ExecState::BlockedOnInput => {
                if message_only && ctx.has_streams && ctx.streams_alive.load(Ordering::Acquire) == 0 {
                    debug!("[{}] Every stream block finished", alias);
                    break;
                }
                ctx.watchdog.blocked(WaitKind::Input);
                notifier.wait_input(ctx.params.input_wait_timeout);
            }
            ExecState::BlockedOnOutput => {
                ctx.watchdog.blocked(WaitKind::Output);
                notifier.wait_output();
            }
            ExecState::Done => {
                ctx.watchdog.progressed();
                notify_neighbours(&unit, true, true);
                break;
            }
        }
    }
    ctx.watchdog.progressed();
    unit.call_stop();

    if !message_only {
        ctx.streams_alive.fetch_sub(1, Ordering::AcqRel);
    }

    let stats = unit.detail.stats();
    info!(
        "[{}] Shutdown after {} work calls. Produced {} items.",
        alias,
        stats.work_calls(),
        stats.produced()
    );
    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block::{Block, BlockMeta, WorkIo, WorkResult, WorkReturn};
    use crate::runtime::block_detail::BlockDetail;
    use crate::runtime::messages::MessageOutbox;
    use crate::runtime::scheduler::tests::{pair, params};
    use crate::runtime::tag::TagValue;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    struct Listener {
        got: Arc<AtomicBool>,
    }

    impl Block for Listener {
        fn name(&self) -> &str {
            "listener"
        }
        fn meta(&self) -> BlockMeta {
            BlockMeta::new().message_input("in")
        }
        fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
            Ok(WorkReturn::Done)
        }
        fn handle_message(&mut self, _port: &str, _msg: TagValue, _outbox: &mut MessageOutbox) -> WorkResult {
            self.got.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn finished(&self) -> bool {
            self.got.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_message_only_block_wakes_on_post() {
        let got = Arc::new(AtomicBool::new(false));
        let block = BlockRef::new(Listener { got: Arc::clone(&got) });
        let unit = ExecUnit::new(block.clone(), BlockDetail::new(0, 0));
        let sched = ThreadPerBlock::start(vec![unit], params()).unwrap();
        assert_eq!(sched.num_threads(), 1);

        block.post("in", TagValue::Int(1));
        let start = Instant::now();
        sched.wait();
        assert!(got.load(Ordering::SeqCst));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_message_only_block_ends_with_streams() {
        let got = Arc::new(AtomicBool::new(false));
        let listener = BlockRef::new(Listener { got: Arc::clone(&got) });
        let (mut units, seen) = pair(Some(100));
        units.push(ExecUnit::new(listener, BlockDetail::new(0, 0)));
        let sched = ThreadPerBlock::start(units, params()).unwrap();
        sched.wait();
        assert_eq!(seen.lock().unwrap().len(), 100);
        assert!(!got.load(Ordering::SeqCst));
        assert_eq!(sched.take_units().len(), 3);
    }
}
