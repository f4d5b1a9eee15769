//! Single-threaded scheduler
//!
//! One worker thread visits every block round-robin. Sources are only run on
//! a pass after one that made no progress, which lets downstream blocks drain
//! what is already buffered first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace};

use super::{ExecUnit, Scheduler, SchedulerParams};
use crate::runtime::errors::GraphError;
use crate::runtime::executor::{BlockExecutor, ExecState};

/// Every block on one cooperative thread
pub struct SingleThreaded {
    stop_signal: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<Vec<ExecUnit>>>>,
    units: Mutex<Vec<ExecUnit>>,
}

impl SingleThreaded {
    pub fn start(units: Vec<ExecUnit>, params: SchedulerParams) -> Result<Self, GraphError> {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&stop_signal);
        let handle = thread::Builder::new()
            .name("sts".to_string())
            .spawn(move || run_all(units, params, signal))
            .map_err(|e| GraphError::Spawn(e.to_string()))?;

        Ok(Self {
            stop_signal,
            worker: Mutex::new(Some(handle)),
            units: Mutex::new(Vec::new()),
        })
    }
}

impl Scheduler for SingleThreaded {
    fn stop(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    fn wait(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = worker.take() else {
            return;
        };
        match handle.join() {
            Ok(units) => {
                info!("Single-threaded scheduler completed ({} blocks)", units.len());
                *self.units.lock().unwrap_or_else(|e| e.into_inner()) = units;
            }
            Err(e) => error!("Single-threaded scheduler panicked: {:?}", e),
        }
    }

    fn take_units(&self) -> Vec<ExecUnit> {
        std::mem::take(&mut *self.units.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Drop for SingleThreaded {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

fn run_all(mut units: Vec<ExecUnit>, params: SchedulerParams, stop_signal: Arc<AtomicBool>) -> Vec<ExecUnit> {
    let mut exec = BlockExecutor::new(params.max_noutput_items, params.vector_alignment);
    let has_streams = units.iter().any(|u| !u.block.meta().is_message_only());

    for unit in &units {
        unit.call_start();
    }

    let mut made_progress = false;
    let mut passes = 0u64;
    loop {
        if stop_signal.load(Ordering::Relaxed) {
            debug!("Stop signal received after {} passes", passes);
            break;
        }
        passes += 1;

        let mut streams_alive = 0;
        let mut messages_alive = 0;
        let mut progress = false;

        for unit in units.iter_mut() {
            if unit.detail.is_done() {
                continue;
            }
            let meta = unit.block.meta();
            let message_only = meta.is_message_only();
            if meta.is_source() && made_progress {
                streams_alive += 1;
                continue;
            }

            let state = exec.run_one_iteration(&unit.block, &mut unit.detail);
            trace!("[{}] {:?}", unit.alias(), state);
            match state {
                ExecState::Ready | ExecState::ReadyNoOutput => progress = true,
                ExecState::BlockedOnInput | ExecState::BlockedOnOutput => {}
                ExecState::Done => {
                    progress = true;
                    continue;
                }
            }
            if message_only {
                messages_alive += 1;
            } else {
                streams_alive += 1;
            }
        }

        if has_streams && streams_alive == 0 {
            debug!("Every stream block finished after {} passes", passes);
            break;
        }
        if !has_streams && messages_alive == 0 {
            break;
        }

        made_progress = progress;
        if !progress {
            thread::yield_now();
        }
    }

    for unit in &units {
        unit.call_stop();
    }
    info!("Single-threaded scheduler shutdown after {} passes", passes);
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scheduler::tests::{pair, params};

    #[test]
    fn test_sources_yield_to_downstream() {
        let (units, seen) = pair(Some(20_000));
        let sched = SingleThreaded::start(units, params()).unwrap();
        sched.wait();
        assert_eq!(seen.lock().unwrap().len(), 20_000);

        let units = sched.take_units();
        let src = &units[0];
        let sink = &units[1];
        assert_eq!(src.detail.stats().produced(), 20_000);
        assert_eq!(sink.detail.stats().consumed(), 20_000);
    }
}
