//! Single-writer, multi-reader circular buffers
//!
//! A [`Buffer`] is a ring of `capacity` fixed-size items owned by the block
//! that writes it. The storage is mapped twice back to back, so any window of
//! up to `capacity` items starting anywhere in the ring is one contiguous
//! slice and neither side ever has to split a read or write at the wrap point.
//!
//! Readers are registered with [`Buffer::add_reader`]. The buffer only keeps a
//! slot per reader (index, absolute offset, history); the returned
//! [`BufferReader`] owns an `Arc` to the buffer and deregisters its slot when
//! dropped, so the buffer outlives every reader without a reference cycle.
//!
//! All bookkeeping sits behind one mutex that is held for the duration of a
//! single operation, never across a block's work call.

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::debug;

use super::buffer_reader::BufferReader;
use super::errors::BufferError;
use super::tag::Tag;
use crate::vmcircbuf::{self, VmCircBufFactory, VmRegion};

/// Memory domain a port wants its buffer in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum BufferType {
    /// Double-mapped host memory
    #[default]
    Default,
    /// Host memory with an explicitly maintained mirror half, for ports that
    /// hand their data to a device
    HostMirror,
}

/// Which domains the producer and consumers of a buffer live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl TransferType {
    pub fn between(upstream: BufferType, downstream: BufferType) -> Self {
        match (upstream, downstream) {
            (BufferType::Default, BufferType::Default) => TransferType::HostToHost,
            (BufferType::Default, BufferType::HostMirror) => TransferType::HostToDevice,
            (BufferType::HostMirror, BufferType::Default) => TransferType::DeviceToHost,
            (BufferType::HostMirror, BufferType::HostMirror) => TransferType::DeviceToDevice,
        }
    }

    /// Whether the ring has to be a host-mirror allocation
    pub fn needs_mirror(&self) -> bool {
        !matches!(self, TransferType::HostToHost)
    }
}

/// Page-aligned heap allocation of `2 * size` bytes
struct MirrorAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: plain heap memory; access is coordinated by the owning buffer.
unsafe impl Send for MirrorAlloc {}
// SAFETY: see above.
unsafe impl Sync for MirrorAlloc {}

impl MirrorAlloc {
    fn new(size: usize, align: usize) -> Result<Self, BufferError> {
        let failed = || {
            BufferError::Alloc(vmcircbuf::AllocError::AllocationFailed(format!(
                "host mirror of {size} bytes"
            )))
        };
        let layout = Layout::from_size_align(2 * size, align).map_err(|_| failed())?;
        // SAFETY: layout has a non-zero size (capacity checks reject 0).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(failed)?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for MirrorAlloc {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

enum BufferStorage {
    DoubleMapped(VmRegion),
    HostMirror(MirrorAlloc),
}

impl BufferStorage {
    fn base(&self) -> *mut u8 {
        match self {
            BufferStorage::DoubleMapped(region) => region.as_ptr(),
            BufferStorage::HostMirror(mem) => mem.ptr.as_ptr(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            BufferStorage::DoubleMapped(region) => region.backend(),
            BufferStorage::HostMirror(_) => "host_mirror",
        }
    }
}

/// Handle of a reader slot inside one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(pub(crate) usize);

#[derive(Debug)]
struct ReaderSlot {
    /// First retained item (the oldest history item)
    read_index: usize,
    /// Absolute offset of the next unread item
    abs_read: u64,
    history: usize,
    delay: u64,
    done: bool,
}

#[derive(Debug)]
struct BufferState {
    write_index: usize,
    abs_write: u64,
    readers: Vec<Option<ReaderSlot>>,
    tags: BTreeMap<u64, Vec<Tag>>,
    writer_done: bool,
    transfer_type: Option<TransferType>,
    last_min_read: u64,
    max_reader_delay: u64,
    callback_active: bool,
    active_pointers: usize,
}

impl BufferState {
    fn live(&self) -> impl Iterator<Item = &ReaderSlot> {
        self.readers.iter().flatten()
    }

    fn slot(&self, id: ReaderId) -> Option<&ReaderSlot> {
        self.readers.get(id.0).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: ReaderId) -> Option<&mut ReaderSlot> {
        self.readers.get_mut(id.0).and_then(Option::as_mut)
    }

    fn unread(&self, slot: &ReaderSlot) -> usize {
        self.abs_write.saturating_sub(slot.abs_read) as usize
    }

    /// Items a reader pins in the ring: unread items plus its history
    fn retained(&self, slot: &ReaderSlot) -> usize {
        self.unread(slot) + slot.history.saturating_sub(1)
    }

    fn prune_tags(&mut self, cutoff: u64) {
        self.tags = self.tags.split_off(&cutoff);
    }
}

/// A circular buffer of fixed-size items
pub struct Buffer {
    item_size: usize,
    capacity: usize,
    buffer_type: BufferType,
    link: String,
    storage: BufferStorage,
    state: Mutex<BufferState>,
    cond: Condvar,
}

impl Buffer {
    /// Allocate a ring of `nitems` items.
    ///
    /// `nitems * item_size` must be a whole number of mapping granules; the
    /// graph compiler rounds capacities accordingly. `link` names the
    /// producing port for diagnostics.
    pub fn new(
        nitems: usize,
        item_size: usize,
        buffer_type: BufferType,
        factory: &VmCircBufFactory,
        link: impl Into<String>,
    ) -> Result<Arc<Self>, BufferError> {
        let granularity = match buffer_type {
            BufferType::Default => factory.granularity()?,
            BufferType::HostMirror => vmcircbuf::system_granularity(),
        };
        let size = nitems.saturating_mul(item_size);
        if nitems == 0 || item_size == 0 || size % granularity != 0 {
            return Err(BufferError::InvalidCapacity {
                nitems,
                item_size,
                granularity,
            });
        }

        let storage = match buffer_type {
            BufferType::Default => BufferStorage::DoubleMapped(factory.make(size)?),
            BufferType::HostMirror => BufferStorage::HostMirror(MirrorAlloc::new(size, granularity)?),
        };

        let link = link.into();
        debug!(
            "Allocated buffer for {}: {} items x {} bytes ({})",
            link,
            nitems,
            item_size,
            storage.kind()
        );

        Ok(Arc::new(Self {
            item_size,
            capacity: nitems,
            buffer_type,
            link,
            storage,
            state: Mutex::new(BufferState {
                write_index: 0,
                abs_write: 0,
                readers: Vec::new(),
                tags: BTreeMap::new(),
                writer_done: false,
                transfer_type: None,
                last_min_read: 0,
                max_reader_delay: 0,
                callback_active: false,
                active_pointers: 0,
            }),
            cond: Condvar::new(),
        }))
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Producing block alias and port, e.g. `copy3:0`
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Name of the allocation mechanism behind the ring
    pub fn storage_kind(&self) -> &'static str {
        self.storage.kind()
    }

    /// Address of item `index`; valid for up to `capacity` items onwards.
    pub(crate) fn item_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity, so the offset lies within the first copy.
        unsafe { self.storage.base().add(index * self.item_size) }
    }

    /// Where the next item goes; `space_available()` items may be written there
    pub fn write_pointer(&self) -> *mut u8 {
        let index = self.state().write_index;
        self.item_ptr(index)
    }

    /// Free slots: `capacity - 1 - max(retained)` across readers.
    ///
    /// Also retires tags no reader can observe any more, once the slowest
    /// reader has moved since the last call.
    pub fn space_available(&self) -> usize {
        let mut st = self.state();
        let mut max_retained = None;
        let mut min_read = None;
        for slot in st.live() {
            let retained = st.retained(slot);
            max_retained = Some(max_retained.map_or(retained, |m: usize| m.max(retained)));
            min_read = Some(min_read.map_or(slot.abs_read, |m: u64| m.min(slot.abs_read)));
        }

        if let Some(min_read) = min_read {
            if min_read != st.last_min_read {
                let cutoff = min_read
                    .saturating_sub(st.max_reader_delay)
                    .saturating_sub(self.capacity as u64);
                st.prune_tags(cutoff);
                st.last_min_read = min_read;
            }
        }

        match max_retained {
            Some(retained) => (self.capacity - 1).saturating_sub(retained),
            None => self.capacity - 1,
        }
    }

    /// Commit `nitems` items written at the write pointer
    pub fn update_write_pointer(&self, nitems: usize) {
        if nitems == 0 {
            return;
        }
        let mut st = self.state();
        debug_assert!(nitems < self.capacity);

        if let BufferStorage::HostMirror(mem) = &self.storage {
            let half = self.capacity * self.item_size;
            let start = st.write_index * self.item_size;
            let end = start + nitems * self.item_size;
            let base = mem.ptr.as_ptr();
            // SAFETY: start < half and end < 2 * half. The two copies are
            // `half` apart, so source and destination never overlap.
            unsafe {
                let low_end = end.min(half);
                ptr::copy_nonoverlapping(base.add(start), base.add(start + half), low_end - start);
                if end > half {
                    ptr::copy_nonoverlapping(base.add(half), base, end - half);
                }
            }
        }

        st.write_index = (st.write_index + nitems) % self.capacity;
        st.abs_write += nitems as u64;
    }

    /// Absolute count of items ever written
    pub fn nitems_written(&self) -> u64 {
        self.state().abs_write
    }

    /// Attach a tag; offsets are absolute item positions of this buffer
    pub fn add_tag(&self, tag: Tag) {
        self.state().tags.entry(tag.offset).or_default().push(tag);
    }

    /// Drop every tag whose offset is below `cutoff`
    pub fn prune_tags(&self, cutoff: u64) {
        self.state().prune_tags(cutoff);
    }

    /// Every tag still stored, in offset order
    pub fn tags(&self) -> Vec<Tag> {
        self.state().tags.values().flatten().cloned().collect()
    }

    /// Mark the producing side finished (or not)
    pub fn set_done(&self, done: bool) {
        self.state().writer_done = done;
    }

    /// Whether the producer has finished
    pub fn is_done(&self) -> bool {
        self.state().writer_done
    }

    /// True when readers exist and every one of them has finished
    pub fn all_readers_done(&self) -> bool {
        let st = self.state();
        let mut any = false;
        for slot in st.live() {
            if !slot.done {
                return false;
            }
            any = true;
        }
        any
    }

    pub fn nreaders(&self) -> usize {
        self.state().live().count()
    }

    pub fn transfer_type(&self) -> Option<TransferType> {
        self.state().transfer_type
    }

    /// Fix the transfer type; it may only be set once or re-set to the same value.
    pub fn set_transfer_type(&self, requested: TransferType) -> Result<(), BufferError> {
        let mut st = self.state();
        match st.transfer_type {
            None => {
                st.transfer_type = Some(requested);
                Ok(())
            }
            Some(current) if current == requested => Ok(()),
            Some(current) => Err(BufferError::IncompatibleTransferType { current, requested }),
        }
    }

    /// Start an exclusive structural mutation.
    ///
    /// Blocks until no other callback is running and no reader or writer holds
    /// a raw pointer into the ring. The returned guard releases the buffer
    /// (`on_unlock`) when dropped and wakes every waiter.
    pub fn on_lock(&self) -> CallbackGuard<'_> {
        let mut st = self.state();
        while st.callback_active || st.active_pointers > 0 {
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st.callback_active = true;
        CallbackGuard { buffer: self }
    }

    fn on_unlock(&self) {
        self.state().callback_active = false;
        self.cond.notify_all();
    }

    /// Register a live pointer into the ring for the guard's lifetime
    pub(crate) fn pointer_guard(&self) -> PointerGuard<'_> {
        let mut st = self.state();
        while st.callback_active {
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st.active_pointers += 1;
        PointerGuard { buffer: self }
    }

    /// Register a reader that retains `history - 1` items and sees tags
    /// shifted by `delay`. The reader starts at the current write position.
    pub fn add_reader(self: &Arc<Self>, history: usize, delay: u64) -> BufferReader {
        let mut st = self.state();
        let preload = history.saturating_sub(1) % self.capacity;
        let slot = ReaderSlot {
            read_index: (st.write_index + self.capacity - preload) % self.capacity,
            abs_read: st.abs_write,
            history: history.max(1),
            delay,
            done: false,
        };
        st.max_reader_delay = st.max_reader_delay.max(delay);

        let index = match st.readers.iter().position(Option::is_none) {
            Some(free) => {
                st.readers[free] = Some(slot);
                free
            }
            None => {
                st.readers.push(Some(slot));
                st.readers.len() - 1
            }
        };
        drop(st);

        BufferReader::new(Arc::clone(self), ReaderId(index))
    }

    /// Forget a reader slot
    pub(crate) fn drop_reader(&self, id: ReaderId) -> Result<(), BufferError> {
        let mut st = self.state();
        match st.readers.get_mut(id.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(BufferError::ReaderNotFound(id.0)),
        }
    }

    // Reader-side accessors, used through `BufferReader`.

    pub(crate) fn reader_items_available(&self, id: ReaderId) -> usize {
        let st = self.state();
        st.slot(id).map_or(0, |slot| st.unread(slot))
    }

    /// Unread items and the writer's done flag, sampled atomically
    pub(crate) fn reader_availability(&self, id: ReaderId) -> (usize, bool) {
        let st = self.state();
        let available = st.slot(id).map_or(0, |slot| st.unread(slot));
        (available, st.writer_done)
    }

    pub(crate) fn reader_read_index(&self, id: ReaderId) -> usize {
        self.state().slot(id).map_or(0, |slot| slot.read_index)
    }

    pub(crate) fn reader_consume(&self, id: ReaderId, nitems: usize) {
        let mut st = self.state();
        let capacity = self.capacity;
        if let Some(slot) = st.slot_mut(id) {
            slot.read_index = (slot.read_index + nitems) % capacity;
            slot.abs_read += nitems as u64;
        }
    }

    pub(crate) fn reader_abs_read(&self, id: ReaderId) -> u64 {
        self.state().slot(id).map_or(0, |slot| slot.abs_read)
    }

    pub(crate) fn reader_history(&self, id: ReaderId) -> usize {
        self.state().slot(id).map_or(1, |slot| slot.history)
    }

    pub(crate) fn reader_delay(&self, id: ReaderId) -> u64 {
        self.state().slot(id).map_or(0, |slot| slot.delay)
    }

    pub(crate) fn reader_set_done(&self, id: ReaderId, done: bool) {
        if let Some(slot) = self.state().slot_mut(id) {
            slot.done = done;
        }
    }

    pub(crate) fn reader_is_done(&self, id: ReaderId) -> bool {
        self.state().slot(id).is_some_and(|slot| slot.done)
    }

    /// Tags a delayed reader sees in `[start, end)` of its own coordinates
    pub(crate) fn reader_tags_in_range(&self, id: ReaderId, start: u64, end: u64) -> Vec<Tag> {
        let st = self.state();
        let Some(delay) = st.slot(id).map(|slot| slot.delay) else {
            return Vec::new();
        };
        let lo = start.saturating_sub(delay);
        let hi = end.saturating_sub(delay);
        if lo >= hi {
            return Vec::new();
        }
        st.tags
            .range(lo..hi)
            .flat_map(|(_, tags)| tags.iter())
            .filter(|tag| tag.offset + delay >= start)
            .map(|tag| {
                let mut tag = tag.clone();
                tag.offset += delay;
                tag
            })
            .collect()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("link", &self.link)
            .field("capacity", &self.capacity)
            .field("item_size", &self.item_size)
            .field("storage", &self.storage.kind())
            .finish()
    }
}

/// Exclusive access obtained from [`Buffer::on_lock`]
pub struct CallbackGuard<'a> {
    buffer: &'a Buffer,
}

impl CallbackGuard<'_> {
    /// Remove every stored tag
    pub fn clear_tags(&self) {
        self.buffer.state().tags.clear();
    }

    /// Forget the writer's finished flag
    pub fn clear_done(&self) {
        self.buffer.set_done(false);
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.buffer.on_unlock();
    }
}

/// Counts a live raw pointer into a buffer
pub(crate) struct PointerGuard<'a> {
    buffer: &'a Buffer,
}

impl Drop for PointerGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.buffer.state();
        st.active_pointers -= 1;
        if st.active_pointers == 0 {
            self.buffer.cond.notify_all();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::prefs::Preferences;
    use proptest::prelude::*;
    use std::sync::OnceLock;
    use std::thread;
    use std::time::Duration;

    pub(crate) fn test_factory() -> &'static VmCircBufFactory {
        static FACTORY: OnceLock<VmCircBufFactory> = OnceLock::new();
        FACTORY.get_or_init(|| VmCircBufFactory::new(Preferences::in_memory()))
    }

    /// Smallest legal capacity for 4-byte items
    pub(crate) fn small_buffer(buffer_type: BufferType) -> Arc<Buffer> {
        let granularity = match buffer_type {
            BufferType::Default => test_factory().granularity().unwrap(),
            BufferType::HostMirror => vmcircbuf::system_granularity(),
        };
        let nitems = vmcircbuf::minimum_buffer_items(4, granularity);
        Buffer::new(nitems, 4, buffer_type, test_factory(), "test:0").unwrap()
    }

    fn write_u32s(buf: &Buffer, values: &[u32]) {
        let ptr = buf.write_pointer().cast::<u32>();
        for (i, v) in values.iter().enumerate() {
            // SAFETY: test writes stay within space_available
            unsafe { ptr.add(i).write(*v) };
        }
        buf.update_write_pointer(values.len());
    }

    fn read_u32s(reader: &BufferReader, n: usize) -> Vec<u32> {
        let ptr = reader.read_pointer().cast::<u32>();
        // SAFETY: the window is contiguous thanks to the mirror
        (0..n).map(|i| unsafe { ptr.add(i).read() }).collect()
    }

    #[test]
    fn test_empty_buffer_space() {
        let buf = small_buffer(BufferType::Default);
        assert_eq!(buf.space_available(), buf.capacity() - 1);
        let reader = buf.add_reader(1, 0);
        assert_eq!(reader.items_available(), 0);
        assert_eq!(buf.space_available(), buf.capacity() - 1);
    }

    #[test]
    fn test_wraparound_window_is_contiguous() {
        for kind in [BufferType::Default, BufferType::HostMirror] {
            let buf = small_buffer(kind);
            let cap = buf.capacity();
            let reader = buf.add_reader(1, 0);

            // Park both indices just before the wrap point
            let lead: Vec<u32> = (0..(cap - 3) as u32).collect();
            write_u32s(&buf, &lead);
            reader.update_read_pointer(cap - 3);

            let values: Vec<u32> = (1000..1010).collect();
            write_u32s(&buf, &values);
            assert_eq!(reader.items_available(), 10);
            assert_eq!(read_u32s(&reader, 10), values, "{kind:?}");
        }
    }

    #[test]
    fn test_history_retained() {
        let buf = small_buffer(BufferType::Default);
        let cap = buf.capacity();
        let reader = buf.add_reader(4, 0);
        // history - 1 items are pinned from the start
        assert_eq!(buf.space_available(), cap - 1 - 3);
        assert_eq!(reader.max_possible_items_available(), cap - 4);

        write_u32s(&buf, &[1, 2, 3, 4, 5]);
        reader.update_read_pointer(5);
        // the window now starts three items back
        let ptr = reader.read_pointer().cast::<u32>();
        // SAFETY: history items are still inside the ring
        let window: Vec<u32> = (0..3).map(|i| unsafe { ptr.add(i).read() }).collect();
        assert_eq!(window, vec![3, 4, 5]);
    }

    #[test]
    fn test_slowest_reader_bounds_space() {
        let buf = small_buffer(BufferType::Default);
        let cap = buf.capacity();
        let fast = buf.add_reader(1, 0);
        let slow = buf.add_reader(1, 0);
        write_u32s(&buf, &[0; 100]);
        fast.update_read_pointer(100);
        slow.update_read_pointer(10);
        assert_eq!(buf.space_available(), cap - 1 - 90);
        drop(slow);
        assert_eq!(buf.space_available(), cap - 1);
    }

    #[test]
    fn test_drop_unknown_reader() {
        let buf = small_buffer(BufferType::Default);
        assert!(matches!(
            buf.drop_reader(ReaderId(7)),
            Err(BufferError::ReaderNotFound(7))
        ));
        let reader = buf.add_reader(1, 0);
        let id = reader.id();
        drop(reader);
        assert!(buf.drop_reader(id).is_err());
        assert_eq!(buf.nreaders(), 0);
    }

    #[test]
    fn test_transfer_type_is_fixed_once_set() {
        let buf = small_buffer(BufferType::Default);
        assert!(buf.set_transfer_type(TransferType::HostToHost).is_ok());
        assert!(buf.set_transfer_type(TransferType::HostToHost).is_ok());
        assert!(matches!(
            buf.set_transfer_type(TransferType::HostToDevice),
            Err(BufferError::IncompatibleTransferType { .. })
        ));
        assert_eq!(
            TransferType::between(BufferType::HostMirror, BufferType::Default),
            TransferType::DeviceToHost
        );
    }

    #[test]
    fn test_tags_delay_and_prune() {
        let buf = small_buffer(BufferType::Default);
        let cap = buf.capacity() as u64;
        let plain = buf.add_reader(1, 0);
        let delayed = buf.add_reader(1, 5);

        buf.add_tag(Tag::new(2, "a", 1i64));
        buf.add_tag(Tag::new(8, "b", 2i64));
        write_u32s(&buf, &[0; 10]);

        let seen: Vec<u64> = plain.tags_in_range(0, 10).iter().map(|t| t.offset).collect();
        assert_eq!(seen, vec![2, 8]);
        let seen: Vec<u64> = delayed.tags_in_range(0, 10).iter().map(|t| t.offset).collect();
        assert_eq!(seen, vec![7]);

        // Once both readers are far past the tags they are retired
        plain.update_read_pointer(10);
        delayed.update_read_pointer(10);
        assert_eq!(buf.tags().len(), 2);
        while plain.nitems_read() <= 8 + 5 + cap {
            let n = buf.space_available().min(500);
            write_u32s(&buf, &vec![0; n]);
            plain.update_read_pointer(n);
            delayed.update_read_pointer(n);
        }
        let _ = buf.space_available();
        assert!(buf.tags().is_empty());

        buf.add_tag(Tag::new(100_000, "late", 0i64));
        buf.prune_tags(100_001);
        assert!(buf.tags().is_empty());
    }

    #[test]
    fn test_callback_waits_for_pointers() {
        let buf = small_buffer(BufferType::Default);
        buf.add_tag(Tag::new(0, "x", 0i64));
        let pointer = buf.pointer_guard();

        let worker = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let guard = buf.on_lock();
                guard.clear_tags();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(buf.tags().len(), 1, "callback ran while a pointer was live");
        drop(pointer);
        worker.join().unwrap();
        assert!(buf.tags().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_space_plus_max_retained(
            histories in proptest::collection::vec(1usize..8, 1..4),
            steps in proptest::collection::vec((0usize..600, 0usize..4, 0usize..600), 1..40),
        ) {
            let buf = small_buffer(BufferType::Default);
            let cap = buf.capacity();
            let readers: Vec<_> = histories.iter().map(|&h| buf.add_reader(h, 0)).collect();

            for (write, who, read) in steps {
                let n = write.min(buf.space_available());
                buf.update_write_pointer(n);

                let reader = &readers[who % readers.len()];
                let m = read.min(reader.items_available());
                reader.update_read_pointer(m);

                let max_retained = readers
                    .iter()
                    .map(|r| r.items_available() + r.history() - 1)
                    .max()
                    .unwrap();
                prop_assert_eq!(buf.space_available() + max_retained, cap - 1);
            }
        }
    }
}
