//! Drives one block through one unit of work
//!
//! Each call to [`BlockExecutor::run_one_iteration`] measures the block's
//! input and output buffers, settles on an output count that the buffers and
//! the block's forecast both allow, calls `work` once and commits the result:
//! read and write pointers advance, tags move downstream, messages go out.

use std::slice;

use tracing::{debug, error, trace, warn};

use super::block::{
    Block, BlockMeta, BlockRef, InputItems, InputPortIo, OutputItems, OutputPortIo,
    TagPropagation, WorkIo, WorkReturn,
};
use super::block_detail::BlockDetail;
use super::messages::{MessageOutbox, publish};

/// Result of one executor iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Produced output (and maybe consumed input)
    Ready,
    /// Consumed input or handled messages without producing
    ReadyNoOutput,
    BlockedOnInput,
    BlockedOnOutput,
    /// The block will never run again
    Done,
}

enum Space {
    Items(usize),
    Blocked,
    Done,
}

fn round_down(n: usize, multiple: usize) -> usize {
    n - n % multiple
}

fn round_up(n: usize, multiple: usize) -> usize {
    n.div_ceil(multiple).saturating_mul(multiple)
}

/// Per-worker scratch state for running blocks
pub struct BlockExecutor {
    max_noutput_items: usize,
    vector_alignment: usize,
    ninput_items: Vec<usize>,
    ninput_items_required: Vec<usize>,
    input_done: Vec<bool>,
    outbox: MessageOutbox,
}

impl BlockExecutor {
    pub fn new(max_noutput_items: usize, vector_alignment: usize) -> Self {
        Self {
            max_noutput_items: max_noutput_items.max(1),
            vector_alignment: vector_alignment.max(1),
            ninput_items: Vec::new(),
            ninput_items_required: Vec::new(),
            input_done: Vec::new(),
            outbox: MessageOutbox::new(),
        }
    }

    /// Advance `block` by at most one work call.
    ///
    /// Pending messages are handled first. A `Done` result also marks the
    /// detail done, which flags its output buffers finished and releases its
    /// input readers.
    pub fn run_one_iteration(&mut self, block: &BlockRef, detail: &mut BlockDetail) -> ExecState {
        if detail.is_done() {
            return ExecState::Done;
        }

        let state = {
            let mut guard = block.lock();
            let handled = self.drain_messages(block, &mut **guard);
            if block.meta().is_message_only() {
                Self::message_only_state(block, &mut **guard, &mut self.outbox, handled)
            } else {
                self.iterate(block, &mut **guard, detail)
            }
        };
        publish(block.alias(), &detail.subscribers, &mut self.outbox);

        if state == ExecState::Done {
            debug!("[{}] done", block.alias());
            detail.set_done(true);
        }
        state
    }

    fn drain_messages(&mut self, block: &BlockRef, imp: &mut dyn Block) -> usize {
        let mut handled = 0;
        while let Some((port, msg)) = block.inbox().try_recv() {
            if let Err(e) = imp.handle_message(&port, msg, &mut self.outbox) {
                warn!("[{}] message on '{}' failed: {}", block.alias(), port, e);
            }
            handled += 1;
        }
        handled
    }

    fn message_only_state(
        block: &BlockRef,
        imp: &mut dyn Block,
        outbox: &mut MessageOutbox,
        handled: usize,
    ) -> ExecState {
        if let Err(e) = imp.tick(outbox) {
            error!("[{}] tick failed: {}", block.alias(), e);
            return ExecState::Done;
        }
        if imp.finished() {
            ExecState::Done
        } else if handled > 0 || !outbox.is_empty() {
            ExecState::ReadyNoOutput
        } else {
            ExecState::BlockedOnInput
        }
    }

    fn min_available_space(
        alias: &str,
        detail: &BlockDetail,
        multiple: usize,
        min_noutput_items: usize,
    ) -> Space {
        let min_noutput_items = min_noutput_items.max(1);
        let mut min_space = usize::MAX;
        for (port, buffer) in detail.buffers().enumerate() {
            let avail_n = round_down(buffer.space_available(), multiple);
            let best_n = round_down(buffer.capacity() / 2, multiple);
            if best_n < min_noutput_items {
                warn!(
                    "[{}] output {} buffer of {} items can never hold min_noutput_items = {}",
                    alias,
                    port,
                    buffer.capacity(),
                    min_noutput_items
                );
                return Space::Done;
            }
            let n = avail_n.min(best_n);
            if n < min_noutput_items {
                // Downstream finished and will never free space again
                if buffer.all_readers_done() {
                    return Space::Done;
                }
                return Space::Blocked;
            }
            min_space = min_space.min(n);
        }
        Space::Items(min_space)
    }

    /// Move each pointer forward by whole items until it sits on the vector
    /// alignment boundary, when that is reachable.
    fn align(&self, alias: &str, detail: &BlockDetail) {
        let align = self.vector_alignment;
        for reader in detail.readers() {
            let item_size = reader.buffer().item_size();
            let rem = reader.read_pointer() as usize % align;
            if rem == 0 || (align - rem) % item_size != 0 {
                continue;
            }
            let skip = (align - rem) / item_size;
            if skip <= reader.items_available() {
                trace!("[{}] skipping {} items to align input", alias, skip);
                reader.update_read_pointer(skip);
            }
        }
        for buffer in detail.buffers() {
            let item_size = buffer.item_size();
            let ptr = buffer.write_pointer();
            let rem = ptr as usize % align;
            if rem == 0 || (align - rem) % item_size != 0 {
                continue;
            }
            let fill = (align - rem) / item_size;
            if fill <= buffer.space_available() {
                let _live = buffer.pointer_guard();
                // SAFETY: `fill` items fit in the free space after the write pointer.
                unsafe { std::ptr::write_bytes(ptr, 0, fill * item_size) };
                buffer.update_write_pointer(fill);
                trace!("[{}] padded {} items to align output", alias, fill);
            }
        }
    }

    fn iterate(&mut self, block: &BlockRef, imp: &mut dyn Block, detail: &mut BlockDetail) -> ExecState {
        let meta = block.meta();
        let alias = block.alias();
        let ninputs = detail.ninputs();
        let multiple = meta.output_multiple.max(1);

        if detail.readers().count() != ninputs || detail.buffers().count() != detail.noutputs() {
            error!("[{}] executed with unconnected ports", alias);
            return ExecState::Done;
        }

        if !detail.aligned {
            if meta.vector_alignment {
                self.align(alias, detail);
            }
            detail.aligned = true;
        }

        let block_max = meta
            .max_noutput_items
            .map_or(self.max_noutput_items, |m| m.min(self.max_noutput_items));
        let mut max_noutput_items = round_down(block_max, multiple).max(multiple);

        if ninputs == 0 {
            let noutput_items = match Self::min_available_space(alias, detail, multiple, meta.min_noutput_items) {
                Space::Done => return ExecState::Done,
                Space::Blocked => return ExecState::BlockedOnOutput,
                Space::Items(n) => n.min(max_noutput_items),
            };
            return self.call_work(block, imp, detail, noutput_items);
        }

        self.ninput_items.clear();
        self.input_done.clear();
        let mut max_items_avail = 0;
        for reader in detail.readers() {
            let (available, done) = reader.availability();
            self.ninput_items.push(available);
            self.input_done.push(done);
            max_items_avail = max_items_avail.max(available);
        }

        let mut noutput_items = if detail.noutputs() == 0 {
            let swag = (max_items_avail as f64 * meta.rate.relative_rate()) as usize;
            round_down(swag, multiple).max(multiple)
        } else {
            match Self::min_available_space(alias, detail, multiple, meta.min_noutput_items) {
                Space::Done => return ExecState::Done,
                Space::Blocked => return ExecState::BlockedOnOutput,
                Space::Items(n) => n,
            }
        };

        loop {
            if meta.rate.is_fixed() {
                // Try to use everything that is available
                let reqd = round_down(meta.rate.ninput_to_noutput(max_items_avail), multiple);
                if reqd > 0 && reqd <= noutput_items {
                    noutput_items = reqd;
                }
                max_noutput_items = max_noutput_items.max(multiple);
            }
            noutput_items = noutput_items.min(max_noutput_items);

            self.ninput_items_required.clear();
            self.ninput_items_required
                .resize(ninputs, meta.rate.noutput_to_ninput(noutput_items));
            imp.forecast(noutput_items, &mut self.ninput_items_required);

            let short = (0..ninputs).find(|&i| self.ninput_items_required[i] > self.ninput_items[i]);
            let Some(port) = short else {
                break;
            };

            if noutput_items > multiple {
                noutput_items = round_up(noutput_items / 2, multiple);
                continue;
            }

            if self.input_done[port] {
                return ExecState::Done;
            }

            let required = self.ninput_items_required[port];
            let max_possible = detail
                .input(port)
                .map_or(0, |r| r.max_possible_items_available());
            if required > max_possible {
                warn!(
                    "[{}] requests {} items on input {} but its buffer can never hold more than {}; \
                     if this is a filter, consider reducing the number of taps",
                    alias, required, port, max_possible
                );
                return ExecState::Done;
            }
            return ExecState::BlockedOnInput;
        }

        self.call_work(block, imp, detail, noutput_items)
    }

    fn call_work(
        &mut self,
        block: &BlockRef,
        imp: &mut dyn Block,
        detail: &BlockDetail,
        noutput_items: usize,
    ) -> ExecState {
        let meta = block.meta();
        let alias = block.alias();

        let read_start: Vec<u64> = detail.readers().map(|r| r.nitems_read()).collect();
        let write_start: Vec<u64> = detail.buffers().map(|b| b.nitems_written()).collect();

        let result = {
            let _in_guards: Vec<_> = detail.readers().map(|r| r.buffer().pointer_guard()).collect();
            let _out_guards: Vec<_> = detail.buffers().map(|b| b.pointer_guard()).collect();

            let mut inputs = Vec::with_capacity(detail.ninputs());
            for (i, reader) in detail.readers().enumerate() {
                let history = reader.history();
                let available = self.ninput_items.get(i).copied().unwrap_or(0);
                let window = history - 1 + available;
                if window > reader.buffer().capacity() {
                    warn!("[{}] input {} window exceeds its buffer", alias, i);
                    return ExecState::Done;
                }
                // SAFETY: the window starts inside the first copy of the ring and
                // spans at most `capacity` items, so it ends inside the mirror.
                // The writer never touches retained items; the pointer guard
                // keeps structural callbacks out until the slice is dropped.
                let bytes = unsafe {
                    slice::from_raw_parts(reader.read_pointer(), window * reader.buffer().item_size())
                };
                inputs.push(InputPortIo {
                    bytes,
                    history,
                    available,
                    reader,
                });
            }

            let mut outputs = Vec::with_capacity(detail.noutputs());
            for buffer in detail.buffers() {
                // SAFETY: noutput_items never exceeds the free space of any
                // output, and only this block writes these buffers.
                let bytes = unsafe {
                    slice::from_raw_parts_mut(buffer.write_pointer(), noutput_items * buffer.item_size())
                };
                outputs.push(OutputPortIo {
                    bytes,
                    nitems_written: buffer.nitems_written(),
                });
            }

            let mut io = WorkIo::new(
                InputItems { ports: inputs },
                OutputItems { ports: outputs },
                noutput_items,
                &mut self.outbox,
            );
            let ret = imp.work(&mut io);
            (ret, std::mem::take(&mut io.consumed), std::mem::take(&mut io.new_tags))
        };

        let (ret, consumed, new_tags) = result;
        let produced = match ret {
            Ok(WorkReturn::Produced(n)) => n,
            Ok(WorkReturn::Done) => return ExecState::Done,
            Err(e) => {
                error!("[{}] work error: {}", alias, e);
                return ExecState::Done;
            }
        };
        let produced = if produced > noutput_items {
            warn!(
                "[{}] produced {} items with room for {}",
                alias, produced, noutput_items
            );
            noutput_items
        } else {
            produced
        };

        let mut total_consumed = 0;
        let mut consumed_now = Vec::with_capacity(consumed.len());
        for (i, reader) in detail.readers().enumerate() {
            let requested = match consumed.get(i).copied().flatten() {
                Some(n) => n,
                None if meta.rate.is_fixed() => meta.rate.noutput_to_ninput(produced),
                None => 0,
            };
            let n = requested.min(self.ninput_items.get(i).copied().unwrap_or(0));
            reader.update_read_pointer(n);
            consumed_now.push(n);
            total_consumed += n;
        }

        Self::propagate_tags(alias, meta, detail, &read_start, &consumed_now, &write_start);
        for (port, tag) in new_tags {
            match detail.output(port) {
                Some(buffer) => buffer.add_tag(tag.clone()),
                None => warn!("[{}] tag '{}' for missing output {}", alias, tag.key, port),
            }
        }

        for buffer in detail.buffers() {
            buffer.update_write_pointer(produced);
        }
        detail.stats().record(produced, total_consumed);
        trace!(
            "[{}] work: noutput={} produced={} consumed={}",
            alias, noutput_items, produced, total_consumed
        );

        if produced > 0 {
            ExecState::Ready
        } else if total_consumed > 0 {
            ExecState::ReadyNoOutput
        } else {
            // Neither produced nor consumed: waiting for more input
            ExecState::BlockedOnInput
        }
    }

    fn propagate_tags(
        alias: &str,
        meta: &BlockMeta,
        detail: &BlockDetail,
        read_start: &[u64],
        consumed: &[usize],
        write_start: &[u64],
    ) {
        if meta.tag_propagation == TagPropagation::DontPropagate || detail.noutputs() == 0 {
            return;
        }
        for (i, reader) in detail.readers().enumerate() {
            let start = read_start[i];
            let end = start + consumed[i] as u64;
            if end == start {
                continue;
            }
            let tags = reader.tags_in_range(start, end);
            if tags.is_empty() {
                continue;
            }
            for (o, buffer) in detail.buffers().enumerate() {
                if meta.tag_propagation == TagPropagation::OneToOne && o != i {
                    continue;
                }
                for tag in &tags {
                    let mut out = tag.clone();
                    out.offset = write_start[o] + meta.rate.translate(tag.offset - start);
                    buffer.add_tag(out);
                }
            }
            trace!("[{}] propagated {} tags from input {}", alias, tags.len(), i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block::{BlockMeta, PortSpec, Rate, WorkResult};
    use crate::runtime::buffer::tests::small_buffer;
    use crate::runtime::buffer::{Buffer, BufferType};
    use crate::runtime::buffer_reader::BufferReader;
    use crate::runtime::tag::Tag;
    use std::sync::Arc;

    /// Emits 0, 1, 2, ... up to `limit`, tagging item 0
    struct Ramp {
        next: u32,
        limit: u32,
    }

    impl Block for Ramp {
        fn name(&self) -> &str {
            "ramp"
        }
        fn meta(&self) -> BlockMeta {
            BlockMeta::new().output(PortSpec::of::<u32>())
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
            if self.next >= self.limit {
                return Ok(WorkReturn::Done);
            }
            if self.next == 0 {
                let at = io.outputs.nitems_written(0);
                io.add_tag(0, Tag::new(at, "start", true));
            }
            let out = io.outputs.get_mut::<u32>(0)?;
            let n = out.len().min((self.limit - self.next) as usize);
            for v in &mut out[..n] {
                *v = self.next;
                self.next += 1;
            }
            Ok(WorkReturn::Produced(n))
        }
    }

    /// Keeps every `n`-th item
    struct Decim(usize);

    impl Block for Decim {
        fn name(&self) -> &str {
            "decim"
        }
        fn meta(&self) -> BlockMeta {
            BlockMeta::new()
                .input(PortSpec::of::<u32>())
                .output(PortSpec::of::<u32>())
                .with_rate(Rate::decimator(self.0 as u64))
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
            let n = io.noutput_items();
            let input = io.inputs.get::<u32>(0)?;
            let out = io.outputs.get_mut::<u32>(0)?;
            for k in 0..n {
                out[k] = input[k * self.0];
            }
            Ok(WorkReturn::Produced(n))
        }
    }

    /// Needs a long look-back window
    struct Window(usize);

    impl Block for Window {
        fn name(&self) -> &str {
            "window"
        }
        fn meta(&self) -> BlockMeta {
            BlockMeta::new()
                .input(PortSpec::of::<u32>())
                .output(PortSpec::of::<u32>())
                .with_history(self.0)
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
            Ok(WorkReturn::Produced(io.noutput_items()))
        }
    }

    /// Copies input to output in groups of four
    struct Quads;

    impl Block for Quads {
        fn name(&self) -> &str {
            "quads"
        }
        fn meta(&self) -> BlockMeta {
            BlockMeta::new()
                .input(PortSpec::of::<u32>())
                .output(PortSpec::of::<u32>())
                .with_output_multiple(4)
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
            let n = io.noutput_items();
            let input = io.inputs.get::<u32>(0)?;
            let out = io.outputs.get_mut::<u32>(0)?;
            out[..n].copy_from_slice(&input[..n]);
            Ok(WorkReturn::Produced(n))
        }
    }

    fn wire(block: &BlockRef, input: Option<&Arc<Buffer>>) -> (BlockDetail, Option<BufferReader>) {
        let meta = block.meta();
        let mut detail = BlockDetail::new(meta.inputs.len(), meta.outputs.len());
        if let Some(buf) = input {
            detail.set_input(0, Some(buf.add_reader(meta.history, 0)));
        }
        let mut tap = None;
        if !meta.outputs.is_empty() {
            let out = small_buffer(BufferType::Default);
            tap = Some(out.add_reader(1, 0));
            detail.set_output(0, Some(out));
        }
        (detail, tap)
    }

    fn read_all(reader: &BufferReader) -> Vec<u32> {
        let n = reader.items_available();
        let ptr = reader.read_pointer().cast::<u32>();
        // SAFETY: `n` unread items start at the read pointer (history 1)
        let values = (0..n).map(|i| unsafe { ptr.add(i).read() }).collect();
        reader.update_read_pointer(n);
        values
    }

    #[test]
    fn test_source_runs_until_done() {
        let src = BlockRef::new(Ramp { next: 0, limit: 10 });
        let (mut detail, tap) = wire(&src, None);
        let tap = tap.unwrap();
        let mut exec = BlockExecutor::new(usize::MAX, 32);

        assert_eq!(exec.run_one_iteration(&src, &mut detail), ExecState::Ready);
        assert_eq!(read_all(&tap), (0..10).collect::<Vec<_>>());
        assert_eq!(exec.run_one_iteration(&src, &mut detail), ExecState::Done);
        assert!(tap.writer_done());
        assert_eq!(tap.tags_in_range(0, 1)[0].key, "start");
    }

    #[test]
    fn test_source_blocks_on_full_output() {
        let src = BlockRef::new(Ramp { next: 0, limit: u32::MAX });
        let (mut detail, _tap) = wire(&src, None);
        let mut exec = BlockExecutor::new(usize::MAX, 32);
        let mut state = ExecState::Ready;
        for _ in 0..10 {
            state = exec.run_one_iteration(&src, &mut detail);
            if state != ExecState::Ready {
                break;
            }
        }
        assert_eq!(state, ExecState::BlockedOnOutput);
    }

    #[test]
    fn test_source_done_when_readers_done() {
        let src = BlockRef::new(Ramp { next: 0, limit: u32::MAX });
        let (mut detail, tap) = wire(&src, None);
        let tap = tap.unwrap();
        tap.set_done(true);
        let mut exec = BlockExecutor::new(usize::MAX, 32);
        let mut state = ExecState::Ready;
        for _ in 0..10 {
            state = exec.run_one_iteration(&src, &mut detail);
            if state != ExecState::Ready {
                break;
            }
        }
        assert_eq!(state, ExecState::Done);
    }

    #[test]
    fn test_decimator_consumes_by_rate_and_moves_tags() {
        let upstream = small_buffer(BufferType::Default);
        let dec = BlockRef::new(Decim(3));
        let (mut detail, tap) = wire(&dec, Some(&upstream));
        let tap = tap.unwrap();
        let mut exec = BlockExecutor::new(usize::MAX, 32);

        let ptr = upstream.write_pointer().cast::<u32>();
        for i in 0..10u32 {
            // SAFETY: 10 items fit in a fresh buffer
            unsafe { ptr.add(i as usize).write(i) };
        }
        upstream.add_tag(Tag::new(7, "mark", 1i64));
        upstream.update_write_pointer(10);

        assert_eq!(exec.run_one_iteration(&dec, &mut detail), ExecState::Ready);
        assert_eq!(read_all(&tap), vec![0, 3, 6]);
        // 9 of 10 inputs consumed, one left over
        assert_eq!(detail.input(0).unwrap().items_available(), 1);
        let tags = tap.tags_in_range(0, 10);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].offset, 2);

        upstream.set_done(true);
        assert_eq!(exec.run_one_iteration(&dec, &mut detail), ExecState::Done);
    }

    #[test]
    fn test_output_multiple_uses_whole_groups_available() {
        let upstream = small_buffer(BufferType::Default);
        let quads = BlockRef::new(Quads);
        let (mut detail, tap) = wire(&quads, Some(&upstream));
        let tap = tap.unwrap();
        let mut exec = BlockExecutor::new(usize::MAX, 32);

        let ptr = upstream.write_pointer().cast::<u32>();
        for i in 0..13u32 {
            // SAFETY: 13 items fit in a fresh buffer
            unsafe { ptr.add(i as usize).write(i) };
        }
        upstream.update_write_pointer(13);

        assert_eq!(exec.run_one_iteration(&quads, &mut detail), ExecState::Ready);
        // three whole groups in a single call
        assert_eq!(read_all(&tap), (0..12).collect::<Vec<_>>());
        assert_eq!(detail.stats().work_calls(), 1);
        assert_eq!(detail.input(0).unwrap().items_available(), 1);
    }

    #[test]
    fn test_decimator_waits_for_input() {
        let upstream = small_buffer(BufferType::Default);
        let dec = BlockRef::new(Decim(4));
        let (mut detail, _tap) = wire(&dec, Some(&upstream));
        let mut exec = BlockExecutor::new(usize::MAX, 32);
        upstream.update_write_pointer(3);
        assert_eq!(exec.run_one_iteration(&dec, &mut detail), ExecState::BlockedOnInput);
    }

    #[test]
    fn test_unsatisfiable_history_is_done() {
        let upstream = small_buffer(BufferType::Default);
        let capacity = upstream.capacity();
        let win = BlockRef::new(Window(capacity + 1));
        let (mut detail, _tap) = wire(&win, Some(&upstream));
        let mut exec = BlockExecutor::new(usize::MAX, 32);
        assert_eq!(exec.run_one_iteration(&win, &mut detail), ExecState::Done);
        assert!(detail.is_done());
        assert!(upstream.all_readers_done());
    }

    #[test]
    fn test_max_noutput_items_clamps() {
        let src = BlockRef::new(Ramp { next: 0, limit: 1000 });
        let (mut detail, tap) = wire(&src, None);
        let tap = tap.unwrap();
        let mut exec = BlockExecutor::new(64, 32);
        assert_eq!(exec.run_one_iteration(&src, &mut detail), ExecState::Ready);
        assert_eq!(tap.items_available(), 64);
        assert_eq!(detail.stats().work_calls(), 1);
    }
}
