//! Block trait and per-block metadata
//!
//! Defines the [`Block`] trait every processing unit implements and the plain
//! data ([`BlockMeta`]) the graph compiler and executor read about it. The
//! executor calls [`Block::work`] whenever enough input and output space are
//! available; the block reads and writes through a [`WorkIo`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytemuck::Pod;

pub use super::errors::{WorkError, WorkResult};

use super::buffer::BufferType;
use super::buffer_reader::BufferReader;
use super::messages::{MessageInbox, MessageOutbox};
use super::notify::ThreadNotifier;
use super::tag::{Tag, TagValue};

/// Stream port description
#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
    pub item_size: usize,
    pub buffer_type: BufferType,
    /// Input only: tags on this port are seen this many items later
    pub sample_delay: u64,
    /// Output only: lower bound on the buffer, in items
    pub min_buffer_items: Option<usize>,
    /// Output only: upper bound on the buffer, in items
    pub max_buffer_items: Option<usize>,
}

impl PortSpec {
    /// A port carrying items of type `T`
    pub fn of<T>() -> Self {
        Self::bytes(std::mem::size_of::<T>())
    }

    /// A port carrying opaque items of `item_size` bytes
    pub fn bytes(item_size: usize) -> Self {
        Self {
            item_size,
            buffer_type: BufferType::Default,
            sample_delay: 0,
            min_buffer_items: None,
            max_buffer_items: None,
        }
    }

    pub fn with_buffer_type(mut self, buffer_type: BufferType) -> Self {
        self.buffer_type = buffer_type;
        self
    }

    pub fn with_sample_delay(mut self, delay: u64) -> Self {
        self.sample_delay = delay;
        self
    }

    pub fn with_min_buffer(mut self, nitems: usize) -> Self {
        self.min_buffer_items = Some(nitems);
        self
    }

    pub fn with_max_buffer(mut self, nitems: usize) -> Self {
        self.max_buffer_items = Some(nitems);
        self
    }
}

/// Relationship between items consumed and items produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    /// Exactly `interpolation` outputs per `decimation` inputs
    Fixed { interpolation: u64, decimation: u64 },
    /// Roughly `num` outputs per `den` inputs; the block consumes explicitly
    Relative { num: u64, den: u64 },
}

impl Default for Rate {
    fn default() -> Self {
        Rate::SYNC
    }
}

impl Rate {
    /// One output per input
    pub const SYNC: Rate = Rate::Fixed {
        interpolation: 1,
        decimation: 1,
    };

    pub fn decimator(decimation: u64) -> Self {
        Rate::Fixed {
            interpolation: 1,
            decimation: decimation.max(1),
        }
    }

    pub fn interpolator(interpolation: u64) -> Self {
        Rate::Fixed {
            interpolation: interpolation.max(1),
            decimation: 1,
        }
    }

    pub fn relative(num: u64, den: u64) -> Self {
        Rate::Relative {
            num: num.max(1),
            den: den.max(1),
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, Rate::Fixed { .. })
    }

    /// `(num, den)` with output = input * num / den
    pub fn ratio(&self) -> (u64, u64) {
        match *self {
            Rate::Fixed {
                interpolation,
                decimation,
            } => (interpolation, decimation),
            Rate::Relative { num, den } => (num, den),
        }
    }

    pub fn relative_rate(&self) -> f64 {
        let (num, den) = self.ratio();
        num as f64 / den as f64
    }

    /// Outputs produced by `ninput` inputs (rounded down)
    pub fn ninput_to_noutput(&self, ninput: usize) -> usize {
        let (num, den) = self.ratio();
        (ninput as u128 * num as u128 / den as u128) as usize
    }

    /// Inputs needed for `noutput` outputs (rounded up)
    pub fn noutput_to_ninput(&self, noutput: usize) -> usize {
        let (num, den) = self.ratio();
        (noutput as u128 * den as u128).div_ceil(num as u128) as usize
    }

    /// Map an item distance on the input side to the output side
    pub fn translate(&self, delta: u64) -> u64 {
        let (num, den) = self.ratio();
        (delta as u128 * num as u128 / den as u128) as u64
    }
}

/// How stream tags travel from inputs to outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagPropagation {
    DontPropagate,
    /// Every input's tags go to every output
    #[default]
    AllToAll,
    /// Input `i` feeds output `i` only
    OneToOne,
}

/// Static description of a block, read once when the block is wrapped
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMeta {
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    /// Items of look-back per input, including the current one (1 = none)
    pub history: usize,
    pub rate: Rate,
    pub output_multiple: usize,
    pub min_noutput_items: usize,
    pub max_noutput_items: Option<usize>,
    pub tag_propagation: TagPropagation,
    /// Nudge buffer pointers onto the runtime's vector alignment once
    pub vector_alignment: bool,
    pub message_inputs: Vec<String>,
    pub message_outputs: Vec<String>,
}

impl Default for BlockMeta {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            history: 1,
            rate: Rate::SYNC,
            output_multiple: 1,
            min_noutput_items: 1,
            max_noutput_items: None,
            tag_propagation: TagPropagation::AllToAll,
            vector_alignment: false,
            message_inputs: Vec::new(),
            message_outputs: Vec::new(),
        }
    }
}

impl BlockMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    /// Set the rate; interpolators also get their output multiple.
    pub fn with_rate(mut self, rate: Rate) -> Self {
        self.rate = rate;
        if let Rate::Fixed { interpolation, .. } = rate {
            self.output_multiple = self.output_multiple.max(interpolation as usize);
        }
        self
    }

    pub fn with_output_multiple(mut self, multiple: usize) -> Self {
        self.output_multiple = multiple.max(1);
        self
    }

    pub fn with_min_noutput_items(mut self, n: usize) -> Self {
        self.min_noutput_items = n.max(1);
        self
    }

    pub fn with_max_noutput_items(mut self, n: usize) -> Self {
        self.max_noutput_items = Some(n);
        self
    }

    pub fn with_tag_propagation(mut self, policy: TagPropagation) -> Self {
        self.tag_propagation = policy;
        self
    }

    pub fn with_vector_alignment(mut self) -> Self {
        self.vector_alignment = true;
        self
    }

    pub fn message_input(mut self, port: impl Into<String>) -> Self {
        self.message_inputs.push(port.into());
        self
    }

    pub fn message_output(mut self, port: impl Into<String>) -> Self {
        self.message_outputs.push(port.into());
        self
    }

    pub fn is_source(&self) -> bool {
        self.inputs.is_empty() && !self.outputs.is_empty()
    }

    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty() && !self.inputs.is_empty()
    }

    /// No stream ports at all
    pub fn is_message_only(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}

/// Outcome of one work call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkReturn {
    /// Items produced on every output
    Produced(usize),
    /// The block will never produce again
    Done,
}

/// A processing unit
/// - Sources have 0 inputs and N outputs
/// - Sinks have N inputs and 0 outputs
/// - Message-only blocks have no stream ports and react to messages
pub trait Block: Send {
    /// Get a debug name for this block
    fn name(&self) -> &str;

    /// Ports, rate and scheduling constraints
    fn meta(&self) -> BlockMeta;

    /// Input needed on each port to produce `noutput_items`.
    ///
    /// `ninput_items_required` arrives filled with what the block's rate
    /// implies; override to ask for something else.
    fn forecast(&self, _noutput_items: usize, _ninput_items_required: &mut [usize]) {}

    /// Read inputs, write up to `io.noutput_items()` items to each output.
    /// Fixed-rate blocks that do not call `consume` have their inputs consumed
    /// according to their rate.
    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn>;

    /// Handle one message that arrived on input message port `port`
    fn handle_message(
        &mut self,
        _port: &str,
        _msg: TagValue,
        _outbox: &mut MessageOutbox,
    ) -> WorkResult {
        Ok(())
    }

    /// Called on every scheduler visit of a message-only block
    fn tick(&mut self, _outbox: &mut MessageOutbox) -> WorkResult {
        Ok(())
    }

    /// Called once by the scheduler before the first iteration
    fn start(&mut self) -> WorkResult {
        Ok(())
    }

    /// Called once by the scheduler after the last iteration
    fn stop(&mut self) -> WorkResult {
        Ok(())
    }

    /// Message-only blocks report completion here
    fn finished(&self) -> bool {
        false
    }
}

fn cast<T: Pod>(bytes: &[u8]) -> WorkResult<&[T]> {
    bytemuck::try_cast_slice(bytes).map_err(WorkError::from)
}

fn cast_mut<T: Pod>(bytes: &mut [u8]) -> WorkResult<&mut [T]> {
    bytemuck::try_cast_slice_mut(bytes).map_err(WorkError::from)
}

pub(crate) struct InputPortIo<'a> {
    pub(crate) bytes: &'a [u8],
    pub(crate) history: usize,
    pub(crate) available: usize,
    pub(crate) reader: &'a BufferReader,
}

/// Input windows of one work call.
///
/// Each window starts `history - 1` items before the first unread item, so
/// item `history - 1 + k` of the slice is the `k`-th new item.
pub struct InputItems<'a> {
    pub(crate) ports: Vec<InputPortIo<'a>>,
}

impl<'a> InputItems<'a> {
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    fn port(&self, port: usize) -> WorkResult<&InputPortIo<'a>> {
        self.ports.get(port).ok_or(WorkError::PortOutOfRange(port))
    }

    pub fn get<T: Pod>(&self, port: usize) -> WorkResult<&[T]> {
        cast(self.port(port)?.bytes)
    }

    pub fn bytes(&self, port: usize) -> WorkResult<&[u8]> {
        Ok(self.port(port)?.bytes)
    }

    /// New items on `port`, history excluded
    pub fn available(&self, port: usize) -> usize {
        self.ports.get(port).map_or(0, |p| p.available)
    }

    pub fn history(&self, port: usize) -> usize {
        self.ports.get(port).map_or(1, |p| p.history)
    }

    /// Absolute offset of the first new item on `port`
    pub fn nitems_read(&self, port: usize) -> u64 {
        self.ports.get(port).map_or(0, |p| p.reader.nitems_read())
    }

    /// Tags on the new items of `port`
    pub fn tags(&self, port: usize) -> Vec<Tag> {
        match self.ports.get(port) {
            Some(p) => {
                let start = p.reader.nitems_read();
                p.reader.tags_in_range(start, start + p.available as u64)
            }
            None => Vec::new(),
        }
    }

    pub fn tags_in_range(&self, port: usize, start: u64, end: u64) -> Vec<Tag> {
        self.ports
            .get(port)
            .map_or_else(Vec::new, |p| p.reader.tags_in_range(start, end))
    }
}

pub(crate) struct OutputPortIo<'a> {
    pub(crate) bytes: &'a mut [u8],
    pub(crate) nitems_written: u64,
}

/// Output windows of one work call, each `noutput_items` long
pub struct OutputItems<'a> {
    pub(crate) ports: Vec<OutputPortIo<'a>>,
}

impl OutputItems<'_> {
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn get_mut<T: Pod>(&mut self, port: usize) -> WorkResult<&mut [T]> {
        let p = self
            .ports
            .get_mut(port)
            .ok_or(WorkError::PortOutOfRange(port))?;
        cast_mut(p.bytes)
    }

    /// Every output at once, for blocks that fan out
    pub fn all_mut<T: Pod>(&mut self) -> WorkResult<Vec<&mut [T]>> {
        self.ports.iter_mut().map(|p| cast_mut(p.bytes)).collect()
    }

    /// Absolute offset the first item written in this call will get
    pub fn nitems_written(&self, port: usize) -> u64 {
        self.ports.get(port).map_or(0, |p| p.nitems_written)
    }
}

/// Everything a block sees during one [`Block::work`] call
pub struct WorkIo<'a> {
    pub inputs: InputItems<'a>,
    pub outputs: OutputItems<'a>,
    noutput_items: usize,
    pub(crate) consumed: Vec<Option<usize>>,
    pub(crate) new_tags: Vec<(usize, Tag)>,
    pub(crate) outbox: &'a mut MessageOutbox,
}

impl<'a> WorkIo<'a> {
    pub(crate) fn new(
        inputs: InputItems<'a>,
        outputs: OutputItems<'a>,
        noutput_items: usize,
        outbox: &'a mut MessageOutbox,
    ) -> Self {
        let consumed = vec![None; inputs.len()];
        Self {
            inputs,
            outputs,
            noutput_items,
            consumed,
            new_tags: Vec::new(),
            outbox,
        }
    }

    /// Upper bound on items to write per output in this call
    pub fn noutput_items(&self) -> usize {
        self.noutput_items
    }

    pub fn ninput_items(&self, port: usize) -> usize {
        self.inputs.available(port)
    }

    /// Mark `n` new items of `port` consumed
    pub fn consume(&mut self, port: usize, n: usize) {
        if let Some(slot) = self.consumed.get_mut(port) {
            *slot = Some(slot.unwrap_or(0) + n);
        }
    }

    pub fn consume_each(&mut self, n: usize) {
        for port in 0..self.consumed.len() {
            self.consume(port, n);
        }
    }

    /// Attach a tag to output `port` at an absolute offset
    pub fn add_tag(&mut self, port: usize, tag: Tag) {
        self.new_tags.push((port, tag));
    }

    pub fn post_message(&mut self, port: impl Into<String>, msg: TagValue) {
        self.outbox.post(port, msg);
    }
}

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a wrapped block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

struct BlockInner {
    id: BlockId,
    alias: String,
    meta: BlockMeta,
    block: Mutex<Box<dyn Block>>,
    inbox: MessageInbox,
    notifier: ThreadNotifier,
}

/// Shared handle to a block placed in a graph.
///
/// Metadata is captured once at wrap time. The block itself sits behind a
/// mutex that the running worker holds for each iteration.
#[derive(Clone)]
pub struct BlockRef(Arc<BlockInner>);

impl BlockRef {
    /// Wrap a block under an alias derived from its name
    pub fn new(block: impl Block + 'static) -> Self {
        let id = BlockId(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed));
        let alias = format!("{}{}", block.name(), id.0);
        Self::build(id, alias, Box::new(block))
    }

    /// Wrap a block under an explicit alias
    pub fn with_alias(block: impl Block + 'static, alias: impl Into<String>) -> Self {
        let id = BlockId(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed));
        Self::build(id, alias.into(), Box::new(block))
    }

    fn build(id: BlockId, alias: String, block: Box<dyn Block>) -> Self {
        let meta = block.meta();
        Self(Arc::new(BlockInner {
            id,
            alias,
            meta,
            block: Mutex::new(block),
            inbox: MessageInbox::new(),
            notifier: ThreadNotifier::new(),
        }))
    }

    pub fn id(&self) -> BlockId {
        self.0.id
    }

    pub fn alias(&self) -> &str {
        &self.0.alias
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.0.meta
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Box<dyn Block>> {
        self.0.block.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn inbox(&self) -> &MessageInbox {
        &self.0.inbox
    }

    pub(crate) fn notifier(&self) -> &ThreadNotifier {
        &self.0.notifier
    }

    /// Queue a message for input message port `port` and wake the block
    pub fn post(&self, port: &str, msg: TagValue) {
        self.0.inbox.send(port, msg);
        self.0.notifier.notify_message();
    }
}

impl PartialEq for BlockRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for BlockRef {}

impl Hash for BlockRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("id", &self.0.id)
            .field("alias", &self.0.alias)
            .finish()
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0.alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Block for Nop {
        fn name(&self) -> &str {
            "nop"
        }

        fn meta(&self) -> BlockMeta {
            BlockMeta::new()
                .input(PortSpec::of::<f32>())
                .output(PortSpec::of::<f32>())
                .with_rate(Rate::interpolator(4))
        }

        fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
            Ok(WorkReturn::Produced(0))
        }
    }

    #[test]
    fn test_rate_conversions() {
        let decim = Rate::decimator(3);
        assert_eq!(decim.ninput_to_noutput(10), 3);
        assert_eq!(decim.noutput_to_ninput(3), 9);
        assert_eq!(decim.translate(7), 2);

        let interp = Rate::interpolator(4);
        assert_eq!(interp.noutput_to_ninput(5), 2);
        assert_eq!(interp.ninput_to_noutput(2), 8);

        let rel = Rate::relative(2, 3);
        assert!(!rel.is_fixed());
        assert!((rel.relative_rate() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_meta_builder() {
        let meta = Nop.meta();
        assert_eq!(meta.output_multiple, 4);
        assert_eq!(meta.inputs[0].item_size, 4);
        assert!(!meta.is_source() && !meta.is_sink());
        assert!(BlockMeta::new().is_message_only());
    }

    #[test]
    fn test_block_ref_identity() {
        let a = BlockRef::new(Nop);
        let b = BlockRef::new(Nop);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.alias().starts_with("nop"));
        let named = BlockRef::with_alias(Nop, "upsampler");
        assert_eq!(named.to_string(), "upsampler");
    }

    #[test]
    fn test_post_wakes_block() {
        let block = BlockRef::new(Nop);
        block.post("in", TagValue::Int(5));
        assert!(block.notifier().wait_input(std::time::Duration::from_millis(1)));
        assert_eq!(block.inbox().try_recv(), Some(("in".to_string(), TagValue::Int(5))));
    }
}
