//! Top-level lifecycle controller
//!
//! A [`TopBlock`] owns the root hierarchy of a flowgraph. Starting it
//! flattens and compiles the hierarchy and hands the compiled blocks to a
//! scheduler. `lock()` / `unlock()` bracket live reconfiguration: the first
//! lock stops the running scheduler and takes its blocks back, the last unlock
//! recompiles the modified graph against the old one and starts a fresh
//! scheduler.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::errors::GraphError;
use super::flat_graph::FlatGraph;
use super::graph::{HierBlock, NodeRef};
use super::scheduler::{self, Scheduler, SchedulerParams};
use crate::config::RuntimeConfig;
use crate::prefs::Preferences;
use crate::vmcircbuf::VmCircBufFactory;

struct TopState {
    running: bool,
    lock_count: usize,
    scheduler: Option<Arc<dyn Scheduler>>,
    flat: Option<FlatGraph>,
    max_noutput_items: usize,
}

/// Root of a runnable flowgraph
pub struct TopBlock {
    root: HierBlock,
    config: RuntimeConfig,
    factory: Arc<VmCircBufFactory>,
    state: Mutex<TopState>,
    unlocked: Condvar,
}

impl TopBlock {
    /// A top block with the default configuration plus environment overrides
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, RuntimeConfig::default().with_env_overrides())
    }

    pub fn with_config(name: impl Into<String>, config: RuntimeConfig) -> Self {
        let prefs = match &config.prefs_path {
            Some(path) => Preferences::load(path),
            None => Preferences::load_default(),
        };
        let prefs = prefs.unwrap_or_else(|e| {
            warn!("Ignoring unreadable preferences: {}", e);
            Preferences::in_memory()
        });
        let factory =
            Arc::new(VmCircBufFactory::new(prefs).with_override(config.vmcircbuf_backend.clone()));
        Self::with_factory(name, config, factory)
    }

    /// Use an existing allocator factory, e.g. one shared between graphs
    pub fn with_factory(
        name: impl Into<String>,
        config: RuntimeConfig,
        factory: Arc<VmCircBufFactory>,
    ) -> Self {
        let max_noutput_items = config.max_noutput_items;
        Self {
            root: HierBlock::new(name, 0, 0),
            config,
            factory,
            state: Mutex::new(TopState {
                running: false,
                lock_count: 0,
                scheduler: None,
                flat: None,
                max_noutput_items,
            }),
            unlocked: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, TopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        self.root.name()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The root hierarchy, for use as a node in `connect` calls
    pub fn hier(&self) -> &HierBlock {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    fn check_modifiable(&self) -> Result<(), GraphError> {
        let st = self.state();
        if st.running && st.lock_count == 0 {
            return Err(GraphError::NotLocked);
        }
        Ok(())
    }

    pub fn connect(
        &self,
        src: impl Into<NodeRef>,
        src_port: usize,
        dst: impl Into<NodeRef>,
        dst_port: usize,
    ) -> Result<(), GraphError> {
        self.check_modifiable()?;
        Ok(self.root.connect(src, src_port, dst, dst_port)?)
    }

    pub fn disconnect(
        &self,
        src: impl Into<NodeRef>,
        src_port: usize,
        dst: impl Into<NodeRef>,
        dst_port: usize,
    ) -> Result<(), GraphError> {
        self.check_modifiable()?;
        Ok(self.root.disconnect(src, src_port, dst, dst_port)?)
    }

    pub fn msg_connect(
        &self,
        src: impl Into<NodeRef>,
        src_port: &str,
        dst: impl Into<NodeRef>,
        dst_port: &str,
    ) -> Result<(), GraphError> {
        self.check_modifiable()?;
        Ok(self.root.msg_connect(src, src_port, dst, dst_port)?)
    }

    pub fn msg_disconnect(
        &self,
        src: impl Into<NodeRef>,
        src_port: &str,
        dst: impl Into<NodeRef>,
        dst_port: &str,
    ) -> Result<(), GraphError> {
        self.check_modifiable()?;
        Ok(self.root.msg_disconnect(src, src_port, dst, dst_port)?)
    }

    pub fn disconnect_all(&self) -> Result<(), GraphError> {
        self.check_modifiable()?;
        self.root.disconnect_all();
        Ok(())
    }

    /// Upper bound on items per work call, applied at the next (re)start
    pub fn set_max_output_items(&self, n: usize) {
        self.state().max_noutput_items = n.max(1);
    }

    pub fn max_output_items(&self) -> usize {
        self.state().max_noutput_items
    }

    fn params(&self, st: &TopState) -> SchedulerParams {
        SchedulerParams::from_config(&self.config, st.max_noutput_items)
    }

    /// Compile the graph and start a scheduler
    pub fn start(&self, max_noutput_items: Option<usize>) -> Result<(), GraphError> {
        let mut st = self.state();
        if st.running {
            return Err(GraphError::AlreadyRunning);
        }
        if st.lock_count > 0 {
            return Err(GraphError::StartWhileLocked);
        }
        if let Some(n) = max_noutput_items {
            st.max_noutput_items = n.max(1);
        }

        let mut flat = FlatGraph::new(self.root.flatten()?);
        flat.validate()?;
        flat.setup_connections(&self.factory, &self.config)?;

        let units = flat.take_units();
        info!(
            "[{}] Starting {} blocks with the {} scheduler",
            self.name(),
            units.len(),
            self.config.scheduler.name()
        );
        let sched = scheduler::spawn(self.config.scheduler, units, self.params(&st))?;
        st.scheduler = Some(sched);
        st.flat = Some(flat);
        st.running = true;
        Ok(())
    }

    /// Ask the scheduler to stop; returns without waiting
    pub fn stop(&self) {
        let st = self.state();
        if let Some(sched) = &st.scheduler {
            debug!("[{}] Stop requested", self.name());
            sched.stop();
        }
    }

    /// Block until the graph has finished or been stopped.
    ///
    /// A lock/unlock cycle on another thread does not end the wait: it
    /// continues with the restarted scheduler.
    pub fn wait(&self) {
        loop {
            let sched = {
                let mut st = self.state();
                while st.lock_count > 0 && st.running {
                    st = self.unlocked.wait(st).unwrap_or_else(|e| e.into_inner());
                }
                match &st.scheduler {
                    Some(sched) => Arc::clone(sched),
                    None => {
                        st.running = false;
                        return;
                    }
                }
            };

            sched.wait();

            let mut st = self.state();
            let current = st
                .scheduler
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, &sched));
            if current && st.lock_count == 0 {
                let units = sched.take_units();
                if let Some(flat) = st.flat.as_mut() {
                    flat.restore_units(units);
                }
                st.scheduler = None;
                st.running = false;
                info!("[{}] Finished", self.name());
                return;
            }
            // Restarted or being reconfigured; wait on the new scheduler
        }
    }

    /// `start` followed by `wait`
    pub fn run(&self, max_noutput_items: Option<usize>) -> Result<(), GraphError> {
        self.start(max_noutput_items)?;
        self.wait();
        Ok(())
    }

    /// Pause execution for reconfiguration. Nested locks are counted.
    pub fn lock(&self) {
        let mut st = self.state();
        st.lock_count += 1;
        if st.lock_count > 1 || !st.running {
            return;
        }
        if let Some(sched) = st.scheduler.take() {
            debug!("[{}] Locking: stopping scheduler", self.name());
            sched.stop();
            sched.wait();
            let units = sched.take_units();
            if let Some(flat) = st.flat.as_mut() {
                flat.restore_units(units);
            }
        }
    }

    /// Undo one `lock`. The last unlock of a running graph recompiles it and
    /// starts a new scheduler.
    pub fn unlock(&self) -> Result<(), GraphError> {
        let mut st = self.state();
        if st.lock_count == 0 {
            return Err(GraphError::UnpairedUnlock);
        }
        st.lock_count -= 1;
        if st.lock_count > 0 {
            return Ok(());
        }

        let result = if st.running { self.restart(&mut st) } else { Ok(()) };
        if result.is_err() {
            st.running = false;
            st.scheduler = None;
        }
        drop(st);
        self.unlocked.notify_all();
        result
    }

    fn restart(&self, st: &mut TopState) -> Result<(), GraphError> {
        let mut flat = FlatGraph::new(self.root.flatten()?);
        flat.validate()?;
        match st.flat.as_mut() {
            Some(old) => flat.merge_connections(old, &self.factory, &self.config)?,
            None => flat.setup_connections(&self.factory, &self.config)?,
        }

        let units = flat.take_units();
        debug!("[{}] Unlocked: restarting {} blocks", self.name(), units.len());
        let sched = scheduler::spawn(self.config.scheduler, units, self.params(st))?;
        st.scheduler = Some(sched);
        st.flat = Some(flat);
        Ok(())
    }

    /// Blocks, buffers, readers and counters of the compiled graph
    pub fn dump(&self) -> String {
        self.state()
            .flat
            .as_ref()
            .map(FlatGraph::dump)
            .unwrap_or_default()
    }

    /// Stream edges as `src:port->dst:port` lines
    pub fn edge_list(&self) -> Result<String, GraphError> {
        let flat = self.root.flatten()?;
        Ok(flat.edges.iter().map(|e| format!("{e}\n")).collect())
    }

    /// Message edges as `src:port->dst:port` lines
    pub fn msg_edge_list(&self) -> Result<String, GraphError> {
        let flat = self.root.flatten()?;
        Ok(flat.msg_edges.iter().map(|e| format!("{e}\n")).collect())
    }
}

impl Drop for TopBlock {
    fn drop(&mut self) {
        let sched = self.state().scheduler.take();
        if let Some(sched) = sched {
            sched.stop();
            sched.wait();
        }
    }
}

impl std::fmt::Debug for TopBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TopBlock")
            .field("name", &self.name())
            .field("scheduler", &self.config.scheduler)
            .finish()
    }
}
