//! Graph compiler
//!
//! Turns the primitive edges of a flattened hierarchy into buffers and
//! readers. Every output port of every block gets a [`Buffer`] sized from its
//! own constraints and those of its consumers; every input port gets a
//! [`BufferReader`](super::buffer_reader::BufferReader) on the buffer that
//! feeds it. Message edges become subscriptions.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, error};

use super::block::{BlockId, BlockRef, Rate};
use super::block_detail::{BlockDetail, BlockStats};
use super::buffer::{Buffer, BufferType, ReaderId, TransferType};
use super::errors::{BufferError, ConnectionError};
use super::graph::{Edge, Flattened, MsgEdge};
use super::messages::Subscription;
use super::scheduler::ExecUnit;
use crate::config::RuntimeConfig;
use crate::vmcircbuf::{self, VmCircBufFactory, lcm};

/// Compiled form of a flattened graph
pub struct FlatGraph {
    blocks: Vec<BlockRef>,
    edges: Vec<Edge>,
    msg_edges: Vec<MsgEdge>,
    details: HashMap<BlockId, BlockDetail>,
    // Kept alongside the details so diagnostics work while a scheduler owns them
    buffers: HashMap<(BlockId, usize), Arc<Buffer>>,
    readers: HashMap<(BlockId, usize), (Arc<Buffer>, ReaderId)>,
    stats: HashMap<BlockId, Arc<BlockStats>>,
}

fn round_down(n: usize, multiple: usize) -> usize {
    n - n % multiple
}

/// Input items one work call of a consumer can need per output item
fn one_call_input(rate: &Rate) -> usize {
    let (num, den) = rate.ratio();
    den.div_ceil(num).max(1) as usize
}

impl FlatGraph {
    pub fn new(flat: Flattened) -> Self {
        Self {
            blocks: flat.blocks,
            edges: flat.edges,
            msg_edges: flat.msg_edges,
            details: HashMap::new(),
            buffers: HashMap::new(),
            readers: HashMap::new(),
            stats: HashMap::new(),
        }
    }

    pub fn blocks(&self) -> &[BlockRef] {
        &self.blocks
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn msg_edges(&self) -> &[MsgEdge] {
        &self.msg_edges
    }

    pub fn detail(&self, block: &BlockRef) -> Option<&BlockDetail> {
        self.details.get(&block.id())
    }

    /// Output buffer of `block` on `port`, also while running
    pub fn output_buffer(&self, block: &BlockRef, port: usize) -> Option<&Arc<Buffer>> {
        self.buffers.get(&(block.id(), port))
    }

    fn input_edge(&self, block: &BlockRef, port: usize) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| &e.dst == block && e.dst_port == port)
    }

    /// Every input connected exactly once, item sizes agree on every edge
    pub fn validate(&self) -> Result<(), ConnectionError> {
        for block in &self.blocks {
            let meta = block.meta();
            for port in 0..meta.inputs.len() {
                let count = self
                    .edges
                    .iter()
                    .filter(|e| &e.dst == block && e.dst_port == port)
                    .count();
                if count == 0 {
                    return Err(ConnectionError::UnconnectedInput {
                        block: block.alias().to_string(),
                        port,
                    });
                }
                if count > 1 {
                    return Err(ConnectionError::DuplicateConnection(format!(
                        "Input {}:{} has {} upstream connections",
                        block, port, count
                    )));
                }
            }
        }

        for edge in &self.edges {
            let src_size = edge.src.meta().outputs[edge.src_port].item_size;
            let dst_size = edge.dst.meta().inputs[edge.dst_port].item_size;
            if src_size != dst_size {
                return Err(ConnectionError::ItemSizeMismatch {
                    src: format!("{}:{}", edge.src, edge.src_port),
                    src_size,
                    dst: format!("{}:{}", edge.dst, edge.dst_port),
                    dst_size,
                });
            }
        }
        Ok(())
    }

    /// Allocate every output buffer and attach every reader
    pub fn setup_connections(
        &mut self,
        factory: &VmCircBufFactory,
        config: &RuntimeConfig,
    ) -> Result<(), ConnectionError> {
        for block in self.blocks.clone() {
            let detail = self.new_detail(&block, factory, config)?;
            self.details.insert(block.id(), detail);
        }
        for block in self.blocks.clone() {
            for port in 0..block.meta().inputs.len() {
                self.connect_input(&block, port)?;
            }
        }
        self.subscribe_messages();
        self.refresh_diagnostics();
        Ok(())
    }

    fn new_detail(
        &self,
        block: &BlockRef,
        factory: &VmCircBufFactory,
        config: &RuntimeConfig,
    ) -> Result<BlockDetail, ConnectionError> {
        let meta = block.meta();
        let mut detail = BlockDetail::new(meta.inputs.len(), meta.outputs.len());
        for port in 0..meta.outputs.len() {
            let buffer = self.allocate_buffer(block, port, factory, config)?;
            detail.set_output(port, Some(buffer));
        }
        Ok(detail)
    }

    /// Size and allocate the buffer behind output `port` of `block`
    fn allocate_buffer(
        &self,
        block: &BlockRef,
        port: usize,
        factory: &VmCircBufFactory,
        config: &RuntimeConfig,
    ) -> Result<Arc<Buffer>, ConnectionError> {
        let meta = block.meta();
        let spec = &meta.outputs[port];
        let item_size = spec.item_size.max(1);
        let multiple = meta.output_multiple.max(1);

        let mut nitems = (2 * config.default_buffer_bytes / item_size).max(2 * multiple);

        if let Some(max) = spec.max_buffer_items {
            nitems = round_down(nitems.min(max), multiple);
            if nitems < 1 {
                return Err(ConnectionError::InvalidMaxOutputBuffer {
                    block: block.alias().to_string(),
                    port,
                    max,
                });
            }
        } else if let Some(min) = spec.min_buffer_items {
            nitems = round_down(nitems.max(min), multiple).max(multiple);
        }

        // Downstream consumers must always be able to make progress
        let mut buffer_type = spec.buffer_type;
        let mut consumer_lcm = 1;
        for edge in self.edges.iter().filter(|e| &e.src == block && e.src_port == port) {
            let dmeta = edge.dst.meta();
            let (num, den) = dmeta.rate.ratio();
            let decimation = den as f64 / num as f64;
            let needed =
                2.0 * (decimation * dmeta.output_multiple as f64 + dmeta.history as f64);
            nitems = nitems.max(needed as usize);
            consumer_lcm = lcm(consumer_lcm, one_call_input(&dmeta.rate));
            if dmeta.inputs[edge.dst_port].buffer_type == BufferType::HostMirror {
                buffer_type = BufferType::HostMirror;
            }
        }

        let granularity = match buffer_type {
            BufferType::Default => factory.granularity().map_err(BufferError::from)?,
            BufferType::HostMirror => vmcircbuf::system_granularity(),
        };
        let unit = lcm(vmcircbuf::minimum_buffer_items(item_size, granularity), consumer_lcm);
        let nitems = nitems.div_ceil(unit) * unit;

        debug!(
            "Sizing {}:{}: {} items (granule unit {}, downstream lcm {})",
            block, port, nitems, unit, consumer_lcm
        );
        Ok(Buffer::new(
            nitems,
            item_size,
            buffer_type,
            factory,
            format!("{}:{}", block, port),
        )?)
    }

    /// Attach a fresh reader for input `port` of `block`
    fn connect_input(&mut self, block: &BlockRef, port: usize) -> Result<(), ConnectionError> {
        let Some(edge) = self.input_edge(block, port).cloned() else {
            return Err(ConnectionError::UnconnectedInput {
                block: block.alias().to_string(),
                port,
            });
        };
        let buffer = self.source_buffer(&edge)?;
        let reader = self.make_reader(&edge, &buffer)?;
        if let Some(detail) = self.details.get_mut(&block.id()) {
            detail.set_input(port, Some(reader));
        }
        Ok(())
    }

    fn source_buffer(&self, edge: &Edge) -> Result<Arc<Buffer>, ConnectionError> {
        self.details
            .get(&edge.src.id())
            .and_then(|d| d.output(edge.src_port))
            .cloned()
            .ok_or_else(|| ConnectionError::BlockNotFound(edge.src.alias().to_string()))
    }

    fn make_reader(
        &self,
        edge: &Edge,
        buffer: &Arc<Buffer>,
    ) -> Result<super::buffer_reader::BufferReader, ConnectionError> {
        let src_type = edge.src.meta().outputs[edge.src_port].buffer_type;
        let dmeta = edge.dst.meta();
        let dst_spec = &dmeta.inputs[edge.dst_port];
        let transfer = TransferType::between(src_type, dst_spec.buffer_type);
        buffer
            .set_transfer_type(transfer)
            .map_err(|e| ConnectionError::IncompatibleBufferTypes {
                src: format!("{}:{}", edge.src, edge.src_port),
                dst: format!("{}:{}", edge.dst, edge.dst_port),
                reason: e.to_string(),
            })?;
        debug!(
            "Reader {} (history {}, delay {}, {:?})",
            edge,
            dmeta.history,
            dst_spec.sample_delay,
            transfer
        );
        Ok(buffer.add_reader(dmeta.history, dst_spec.sample_delay))
    }

    fn subscribe_messages(&mut self) {
        for detail in self.details.values_mut() {
            detail.subscribers.clear();
        }
        for edge in &self.msg_edges {
            if let Some(detail) = self.details.get_mut(&edge.src.id()) {
                detail
                    .subscribers
                    .entry(edge.src_port.clone())
                    .or_default()
                    .push(Subscription {
                        dest: edge.dst.clone(),
                        port: edge.dst_port.clone(),
                    });
            }
        }
    }

    fn refresh_diagnostics(&mut self) {
        self.buffers.clear();
        self.readers.clear();
        self.stats.clear();
        for (id, detail) in &self.details {
            for port in 0..detail.noutputs() {
                if let Some(buffer) = detail.output(port) {
                    self.buffers.insert((*id, port), Arc::clone(buffer));
                }
            }
            for port in 0..detail.ninputs() {
                if let Some(reader) = detail.input(port) {
                    self.readers
                        .insert((*id, port), (Arc::clone(reader.buffer()), reader.id()));
                }
            }
            self.stats.insert(*id, Arc::clone(detail.stats()));
        }
    }

    /// Wire this (new) graph reusing the compiled state of `old`.
    ///
    /// Blocks present in both keep their detail and output buffers. An input
    /// whose feeding buffer is unchanged keeps its reader; others get a new
    /// one. Blocks that left the graph release their readers first. Blocks
    /// whose connectivity changed have their counters and tags reset.
    pub fn merge_connections(
        &mut self,
        old: &mut FlatGraph,
        factory: &VmCircBufFactory,
        config: &RuntimeConfig,
    ) -> Result<(), ConnectionError> {
        for block in self.blocks.clone() {
            let detail = match old.details.remove(&block.id()) {
                Some(detail) => detail,
                None => {
                    debug!("New block {}", block);
                    self.new_detail(&block, factory, config)?
                }
            };
            self.details.insert(block.id(), detail);
        }

        // Removed blocks must not keep readers into buffers about to go away
        for (id, detail) in old.details.iter_mut() {
            debug!("Releasing removed block {:?}", id);
            for port in 0..detail.ninputs() {
                detail.set_input(port, None);
            }
        }
        old.details.clear();

        for block in self.blocks.clone() {
            let mut changed = false;
            for port in 0..block.meta().inputs.len() {
                let Some(edge) = self.input_edge(&block, port).cloned() else {
                    return Err(ConnectionError::UnconnectedInput {
                        block: block.alias().to_string(),
                        port,
                    });
                };
                let buffer = self.source_buffer(&edge)?;
                let unchanged = self
                    .details
                    .get(&block.id())
                    .and_then(|d| d.input(port))
                    .is_some_and(|r| Arc::ptr_eq(r.buffer(), &buffer));
                if unchanged {
                    continue;
                }
                let reader = self.make_reader(&edge, &buffer)?;
                if let Some(detail) = self.details.get_mut(&block.id()) {
                    // A finished consumer never reads again
                    if detail.is_done() {
                        reader.set_done(true);
                    }
                    detail.set_input(port, Some(reader));
                }
                changed = true;
            }

            // An output whose consumer set changed also counts
            if !changed {
                changed = old.edges.iter().filter(|e| e.src == block).count()
                    != self.edges.iter().filter(|e| e.src == block).count()
                    || self
                        .edges
                        .iter()
                        .filter(|e| e.src == block)
                        .any(|e| !old.edges.contains(e));
            }

            if changed {
                debug!("Connectivity of {} changed", block);
                if let Some(detail) = self.details.get_mut(&block.id()) {
                    detail.reset_after_rewire();
                }
            }
        }

        self.subscribe_messages();
        self.refresh_diagnostics();
        Ok(())
    }

    /// Move every block's detail into a schedulable unit
    pub fn take_units(&mut self) -> Vec<ExecUnit> {
        let mut units = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let Some(detail) = self.details.remove(&block.id()) else {
                error!("[{}] has no compiled state", block);
                continue;
            };
            let mut unit = ExecUnit::new(block.clone(), detail);
            for edge in &self.edges {
                if &edge.dst == block && !unit.upstream.contains(&edge.src) {
                    unit.upstream.push(edge.src.clone());
                }
                if &edge.src == block && !unit.downstream.contains(&edge.dst) {
                    unit.downstream.push(edge.dst.clone());
                }
            }
            units.push(unit);
        }
        units
    }

    /// Take back units from a finished scheduler
    pub fn restore_units(&mut self, units: Vec<ExecUnit>) {
        for unit in units {
            self.details.insert(unit.block.id(), unit.detail);
        }
    }

    /// Human readable state of every block, buffer and reader
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            let meta = block.meta();
            let id = block.id();
            let _ = write!(out, "{}", block);
            if let Some(stats) = self.stats.get(&id) {
                let _ = write!(
                    out,
                    " (work calls {}, produced {}, consumed {})",
                    stats.work_calls(),
                    stats.produced(),
                    stats.consumed()
                );
            }
            out.push('\n');
            for port in 0..meta.inputs.len() {
                match self.readers.get(&(id, port)) {
                    Some((buffer, reader)) => {
                        let _ = writeln!(
                            out,
                            "  in[{}] <- {} history {} delay {} read {}",
                            port,
                            buffer.link(),
                            buffer.reader_history(*reader),
                            buffer.reader_delay(*reader),
                            buffer.reader_abs_read(*reader)
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  in[{}] <- (unconnected)", port);
                    }
                }
            }
            for port in 0..meta.outputs.len() {
                if let Some(buffer) = self.buffers.get(&(id, port)) {
                    let _ = writeln!(
                        out,
                        "  out[{}] {} items x {} bytes, {}, {:?}, readers {}, written {}",
                        port,
                        buffer.capacity(),
                        buffer.item_size(),
                        buffer.storage_kind(),
                        buffer.transfer_type(),
                        buffer.nreaders(),
                        buffer.nitems_written()
                    );
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for FlatGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FlatGraph")
            .field("blocks", &self.blocks)
            .field("edges", &self.edges.len())
            .field("msg_edges", &self.msg_edges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block::{Block, BlockMeta, PortSpec, WorkIo, WorkResult, WorkReturn};
    use crate::runtime::buffer::tests::test_factory;
    use crate::runtime::graph::HierBlock;

    struct Stub {
        meta: BlockMeta,
    }

    impl Block for Stub {
        fn name(&self) -> &str {
            "stub"
        }
        fn meta(&self) -> BlockMeta {
            self.meta.clone()
        }
        fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
            Ok(WorkReturn::Done)
        }
    }

    fn block(meta: BlockMeta) -> BlockRef {
        BlockRef::new(Stub { meta })
    }

    fn source() -> BlockRef {
        block(BlockMeta::new().output(PortSpec::of::<f32>()))
    }

    fn pass() -> BlockRef {
        block(
            BlockMeta::new()
                .input(PortSpec::of::<f32>())
                .output(PortSpec::of::<f32>()),
        )
    }

    fn sink() -> BlockRef {
        block(BlockMeta::new().input(PortSpec::of::<f32>()))
    }

    fn compile(top: &HierBlock) -> Result<FlatGraph, ConnectionError> {
        let mut fg = FlatGraph::new(top.flatten()?);
        fg.validate()?;
        fg.setup_connections(test_factory(), &RuntimeConfig::default())?;
        Ok(fg)
    }

    #[test]
    fn test_unconnected_input() {
        let top = HierBlock::new("top", 0, 0);
        let p = pass();
        let s = sink();
        top.connect(&p, 0, &s, 0).unwrap();
        assert!(matches!(
            compile(&top),
            Err(ConnectionError::UnconnectedInput { port: 0, .. })
        ));
    }

    #[test]
    fn test_item_size_mismatch() {
        let top = HierBlock::new("top", 0, 0);
        let src = block(BlockMeta::new().output(PortSpec::of::<u8>()));
        top.connect(&src, 0, &sink(), 0).unwrap();
        assert!(matches!(
            compile(&top),
            Err(ConnectionError::ItemSizeMismatch { src_size: 1, dst_size: 4, .. })
        ));
    }

    #[test]
    fn test_default_sizing() {
        let top = HierBlock::new("top", 0, 0);
        let src = source();
        let s = sink();
        top.connect(&src, 0, &s, 0).unwrap();
        let fg = compile(&top).unwrap();

        let buffer = fg.output_buffer(&src, 0).unwrap();
        let granule_items = vmcircbuf::minimum_buffer_items(4, test_factory().granularity().unwrap());
        // Twice the default byte budget, rounded up to whole granules
        let expected = (2 * 32768 / 4usize).div_ceil(granule_items) * granule_items;
        assert_eq!(buffer.capacity(), expected);
        assert_eq!(buffer.nreaders(), 1);
        assert_eq!(buffer.transfer_type(), Some(TransferType::HostToHost));
    }

    #[test]
    fn test_downstream_history_grows_buffer() {
        let top = HierBlock::new("top", 0, 0);
        let src = source();
        let long = block(
            BlockMeta::new()
                .input(PortSpec::of::<f32>())
                .with_history(40_000),
        );
        top.connect(&src, 0, &long, 0).unwrap();
        let fg = compile(&top).unwrap();
        assert!(fg.output_buffer(&src, 0).unwrap().capacity() >= 80_002);
    }

    /// Capacity the compiler should pick for an f32 port fed to one consumer
    fn expected_capacity(needed: usize, consumer_lcm: usize) -> usize {
        let granule_items = vmcircbuf::minimum_buffer_items(4, test_factory().granularity().unwrap());
        let unit = lcm(granule_items, consumer_lcm);
        (2 * 32768 / 4usize).max(needed).div_ceil(unit) * unit
    }

    fn consumer_capacity(consumer: BlockMeta) -> usize {
        let top = HierBlock::new("top", 0, 0);
        let src = source();
        let dst = block(consumer.input(PortSpec::of::<f32>()));
        top.connect(&src, 0, &dst, 0).unwrap();
        let fg = compile(&top).unwrap();
        fg.output_buffer(&src, 0).unwrap().capacity()
    }

    #[test]
    fn test_decimating_consumer_sizing() {
        let capacity = consumer_capacity(
            BlockMeta::new()
                .with_rate(Rate::decimator(3))
                .with_output_multiple(10_000),
        );
        // 2 * (3 * 10000 + 1), in whole granules and whole calls of 3 inputs
        assert!(capacity >= 60_002);
        assert_eq!(capacity % 3, 0);
        assert_eq!(capacity, expected_capacity(60_002, 3));
    }

    #[test]
    fn test_fractional_rate_consumer_sizing() {
        let capacity = consumer_capacity(
            BlockMeta::new()
                .with_rate(Rate::relative(2, 3))
                .with_output_multiple(20_000),
        );
        // 3/2 inputs per output must not truncate to 1
        assert!(capacity >= 60_002);
        assert_eq!(capacity % 2, 0);
        assert_eq!(capacity, expected_capacity(60_002, 2));
    }

    #[test]
    fn test_interpolating_consumer_sizing() {
        let capacity = consumer_capacity(
            BlockMeta::new()
                .with_rate(Rate::interpolator(4))
                .with_output_multiple(40_000),
        );
        // a quarter input per output still counts
        assert!(capacity >= 20_002);
        assert_eq!(capacity, expected_capacity(20_002, 1));
    }

    #[test]
    fn test_max_buffer_limits() {
        let top = HierBlock::new("top", 0, 0);
        let src = block(
            BlockMeta::new()
                .output(PortSpec::of::<f32>().with_max_buffer(10))
                .with_output_multiple(16),
        );
        top.connect(&src, 0, &sink(), 0).unwrap();
        assert!(matches!(
            compile(&top),
            Err(ConnectionError::InvalidMaxOutputBuffer { max: 10, .. })
        ));
    }

    #[test]
    fn test_mixed_consumer_types_rejected() {
        let top = HierBlock::new("top", 0, 0);
        let src = source();
        let host = sink();
        let device = block(
            BlockMeta::new().input(PortSpec::of::<f32>().with_buffer_type(BufferType::HostMirror)),
        );
        top.connect(&src, 0, &host, 0).unwrap();
        top.connect(&src, 0, &device, 0).unwrap();
        assert!(matches!(
            compile(&top),
            Err(ConnectionError::IncompatibleBufferTypes { .. })
        ));
    }

    #[test]
    fn test_host_mirror_consumer() {
        let top = HierBlock::new("top", 0, 0);
        let src = source();
        let device = block(
            BlockMeta::new().input(PortSpec::of::<f32>().with_buffer_type(BufferType::HostMirror)),
        );
        top.connect(&src, 0, &device, 0).unwrap();
        let fg = compile(&top).unwrap();
        let buffer = fg.output_buffer(&src, 0).unwrap();
        assert_eq!(buffer.storage_kind(), "host_mirror");
        assert_eq!(buffer.transfer_type(), Some(TransferType::HostToDevice));
    }

    #[test]
    fn test_rewire_keeps_unchanged_buffers() {
        // z -> x -> sink  becomes  z -> y -> sink
        let top = HierBlock::new("top", 0, 0);
        let z = source();
        let x = pass();
        let s = sink();
        top.connect(&z, 0, &x, 0).unwrap();
        top.connect(&x, 0, &s, 0).unwrap();
        let mut old = compile(&top).unwrap();
        let z_buffer = Arc::clone(old.output_buffer(&z, 0).unwrap());

        let y = pass();
        top.disconnect_all();
        top.connect(&z, 0, &y, 0).unwrap();
        top.connect(&y, 0, &s, 0).unwrap();

        let mut new = FlatGraph::new(top.flatten().unwrap());
        new.validate().unwrap();
        new.merge_connections(&mut old, test_factory(), &RuntimeConfig::default())
            .unwrap();

        assert!(Arc::ptr_eq(new.output_buffer(&z, 0).unwrap(), &z_buffer));
        let y_reader = new.detail(&y).unwrap().input(0).unwrap();
        assert!(Arc::ptr_eq(y_reader.buffer(), &z_buffer));
        // x's reader was released, y's is the only one left
        assert_eq!(z_buffer.nreaders(), 1);
        // the sink now reads y's buffer through a new reader
        let sink_reader = new.detail(&s).unwrap().input(0).unwrap();
        assert!(Arc::ptr_eq(sink_reader.buffer(), new.output_buffer(&y, 0).unwrap()));
    }

    #[test]
    fn test_rewire_without_change_keeps_readers() {
        let top = HierBlock::new("top", 0, 0);
        let src = source();
        let s = sink();
        top.connect(&src, 0, &s, 0).unwrap();
        let mut old = compile(&top).unwrap();
        let buffer = Arc::clone(old.output_buffer(&src, 0).unwrap());
        old.detail(&s).unwrap().stats().record(0, 7);

        let mut new = FlatGraph::new(top.flatten().unwrap());
        new.merge_connections(&mut old, test_factory(), &RuntimeConfig::default())
            .unwrap();
        assert!(Arc::ptr_eq(new.output_buffer(&src, 0).unwrap(), &buffer));
        assert_eq!(buffer.nreaders(), 1);
        // untouched blocks keep their counters
        assert_eq!(new.detail(&s).unwrap().stats().consumed(), 7);
    }

    #[test]
    fn test_units_round_trip() {
        let top = HierBlock::new("top", 0, 0);
        let src = source();
        let p = pass();
        let s = sink();
        top.connect(&src, 0, &p, 0).unwrap();
        top.connect(&p, 0, &s, 0).unwrap();
        let mut fg = compile(&top).unwrap();

        let units = fg.take_units();
        assert_eq!(units.len(), 3);
        let mid = units.iter().find(|u| u.block == p).unwrap();
        assert_eq!(mid.upstream, vec![src.clone()]);
        assert_eq!(mid.downstream, vec![s.clone()]);
        assert!(fg.detail(&p).is_none());
        // diagnostics still see the buffers
        assert!(fg.dump().contains("out[0]"));

        fg.restore_units(units);
        assert!(fg.detail(&p).is_some());
    }
}
