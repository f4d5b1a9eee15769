//! Compiled, scheduler-facing state of one block

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::buffer::Buffer;
use super::buffer_reader::BufferReader;
use super::messages::Subscribers;

/// Counters shared between a running worker and diagnostics
#[derive(Debug, Default)]
pub struct BlockStats {
    work_calls: AtomicU64,
    produced: AtomicU64,
    consumed: AtomicU64,
}

impl BlockStats {
    pub(crate) fn record(&self, produced: usize, consumed: usize) {
        self.work_calls.fetch_add(1, Ordering::Relaxed);
        self.produced.fetch_add(produced as u64, Ordering::Relaxed);
        self.consumed.fetch_add(consumed as u64, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.work_calls.store(0, Ordering::Relaxed);
        self.produced.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
    }

    pub fn work_calls(&self) -> u64 {
        self.work_calls.load(Ordering::Relaxed)
    }

    /// Items produced per output since the last reset
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Items consumed, summed over inputs, since the last reset
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }
}

/// Input readers, output buffers and run state of one block
pub struct BlockDetail {
    inputs: Vec<Option<BufferReader>>,
    outputs: Vec<Option<Arc<Buffer>>>,
    pub(crate) subscribers: Subscribers,
    done: bool,
    pub(crate) aligned: bool,
    stats: Arc<BlockStats>,
}

impl BlockDetail {
    pub fn new(ninputs: usize, noutputs: usize) -> Self {
        Self {
            inputs: (0..ninputs).map(|_| None).collect(),
            outputs: vec![None; noutputs],
            subscribers: Subscribers::new(),
            done: false,
            aligned: false,
            stats: Arc::new(BlockStats::default()),
        }
    }

    pub fn ninputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn noutputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, port: usize) -> Option<&BufferReader> {
        self.inputs.get(port).and_then(Option::as_ref)
    }

    /// Replace the reader on `port`; the previous one is deregistered
    pub fn set_input(&mut self, port: usize, reader: Option<BufferReader>) {
        if let Some(slot) = self.inputs.get_mut(port) {
            *slot = reader;
        }
    }

    pub fn output(&self, port: usize) -> Option<&Arc<Buffer>> {
        self.outputs.get(port).and_then(Option::as_ref)
    }

    pub fn set_output(&mut self, port: usize, buffer: Option<Arc<Buffer>>) {
        if let Some(slot) = self.outputs.get_mut(port) {
            *slot = buffer;
        }
    }

    pub(crate) fn readers(&self) -> impl Iterator<Item = &BufferReader> {
        self.inputs.iter().flatten()
    }

    pub(crate) fn buffers(&self) -> impl Iterator<Item = &Arc<Buffer>> {
        self.outputs.iter().flatten()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Mark the block finished: its outputs stop growing and its readers stop
    /// holding back their writers.
    pub fn set_done(&mut self, done: bool) {
        self.done = done;
        if done {
            for buffer in self.buffers() {
                buffer.set_done(true);
            }
            for reader in self.readers() {
                reader.set_done(true);
            }
        }
    }

    pub fn nitems_read(&self, port: usize) -> u64 {
        self.input(port).map_or(0, BufferReader::nitems_read)
    }

    pub fn nitems_written(&self, port: usize) -> u64 {
        self.output(port).map_or(0, |b| b.nitems_written())
    }

    pub fn stats(&self) -> &Arc<BlockStats> {
        &self.stats
    }

    /// Forget counters, stored output tags and the alignment nudge after the
    /// block's connectivity changed
    pub fn reset_after_rewire(&mut self) {
        self.stats.reset();
        self.aligned = false;
        for buffer in self.buffers() {
            let guard = buffer.on_lock();
            guard.clear_tags();
        }
    }
}

impl std::fmt::Debug for BlockDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlockDetail")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::BufferType;
    use crate::runtime::buffer::tests::small_buffer;
    use crate::runtime::tag::Tag;

    #[test]
    fn test_done_propagates_to_buffers_and_readers() {
        let upstream = small_buffer(BufferType::Default);
        let out = small_buffer(BufferType::Default);
        let downstream_reader = out.add_reader(1, 0);

        let mut detail = BlockDetail::new(1, 1);
        detail.set_input(0, Some(upstream.add_reader(1, 0)));
        detail.set_output(0, Some(Arc::clone(&out)));

        detail.set_done(true);
        assert!(downstream_reader.writer_done());
        assert!(upstream.all_readers_done());
    }

    #[test]
    fn test_replacing_input_drops_old_reader() {
        let a = small_buffer(BufferType::Default);
        let b = small_buffer(BufferType::Default);
        let mut detail = BlockDetail::new(1, 0);
        detail.set_input(0, Some(a.add_reader(1, 0)));
        assert_eq!(a.nreaders(), 1);
        detail.set_input(0, Some(b.add_reader(1, 0)));
        assert_eq!(a.nreaders(), 0);
        assert_eq!(b.nreaders(), 1);
    }

    #[test]
    fn test_reset_after_rewire() {
        let out = small_buffer(BufferType::Default);
        out.add_tag(Tag::new(0, "k", 1i64));
        let mut detail = BlockDetail::new(0, 1);
        detail.set_output(0, Some(out.clone()));
        detail.stats().record(10, 0);
        detail.reset_after_rewire();
        assert_eq!(detail.stats().produced(), 0);
        assert!(out.tags().is_empty());
    }
}
