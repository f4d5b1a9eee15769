//! Per-consumer view of a buffer

use std::fmt;
use std::sync::Arc;

use tracing::error;

use super::buffer::{Buffer, ReaderId};
use super::tag::Tag;

/// One downstream consumer's position in a [`Buffer`].
///
/// Holds the buffer alive. Dropping the reader deregisters it, after which
/// the writer no longer waits for it.
pub struct BufferReader {
    buffer: Arc<Buffer>,
    id: ReaderId,
}

impl BufferReader {
    pub(crate) fn new(buffer: Arc<Buffer>, id: ReaderId) -> Self {
        Self { buffer, id }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Items written but not yet consumed, history excluded
    pub fn items_available(&self) -> usize {
        self.buffer.reader_items_available(self.id)
    }

    /// Unread items together with the writer's done flag
    pub(crate) fn availability(&self) -> (usize, bool) {
        self.buffer.reader_availability(self.id)
    }

    /// The most this reader could ever report: capacity minus history
    pub fn max_possible_items_available(&self) -> usize {
        self.buffer.capacity().saturating_sub(self.history())
    }

    /// Start of the readable window, `history - 1` items before the first unread one
    pub fn read_pointer(&self) -> *const u8 {
        self.buffer.item_ptr(self.buffer.reader_read_index(self.id))
    }

    /// Consume `nitems` items
    pub fn update_read_pointer(&self, nitems: usize) {
        debug_assert!(nitems <= self.items_available());
        self.buffer.reader_consume(self.id, nitems);
    }

    /// Absolute offset of the next unread item
    pub fn nitems_read(&self) -> u64 {
        self.buffer.reader_abs_read(self.id)
    }

    pub fn history(&self) -> usize {
        self.buffer.reader_history(self.id)
    }

    pub fn sample_delay(&self) -> u64 {
        self.buffer.reader_delay(self.id)
    }

    /// Tags in `[start, end)`, in this reader's (delay-shifted) coordinates
    pub fn tags_in_range(&self, start: u64, end: u64) -> Vec<Tag> {
        self.buffer.reader_tags_in_range(self.id, start, end)
    }

    /// Whether the producer has finished
    pub fn writer_done(&self) -> bool {
        self.buffer.is_done()
    }

    /// Mark the consumer finished
    pub fn set_done(&self, done: bool) {
        self.buffer.reader_set_done(self.id, done);
    }

    pub fn is_done(&self) -> bool {
        self.buffer.reader_is_done(self.id)
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        if let Err(e) = self.buffer.drop_reader(self.id) {
            error!("Reader lifecycle violation on {}: {}", self.buffer.link(), e);
        }
    }
}

impl fmt::Debug for BufferReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BufferReader")
            .field("buffer", &self.buffer.link())
            .field("id", &self.id)
            .field("history", &self.history())
            .field("delay", &self.sample_delay())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::BufferType;
    use crate::runtime::buffer::tests::small_buffer;

    #[test]
    fn test_reader_keeps_buffer_alive() {
        let buf = small_buffer(BufferType::Default);
        let weak = Arc::downgrade(&buf);
        let reader = buf.add_reader(1, 0);
        drop(buf);
        assert!(weak.upgrade().is_some());
        assert_eq!(reader.buffer().nreaders(), 1);
        drop(reader);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_late_reader_starts_at_writer() {
        let buf = small_buffer(BufferType::Default);
        buf.update_write_pointer(17);
        let reader = buf.add_reader(1, 0);
        assert_eq!(reader.items_available(), 0);
        assert_eq!(reader.nitems_read(), 17);
        buf.update_write_pointer(3);
        assert_eq!(reader.items_available(), 3);
    }

    #[test]
    fn test_done_flags() {
        let buf = small_buffer(BufferType::Default);
        let reader = buf.add_reader(1, 0);
        assert!(!buf.all_readers_done());
        reader.set_done(true);
        assert!(buf.all_readers_done());
        buf.set_done(true);
        assert!(reader.writer_done());
        assert_eq!(reader.availability(), (0, true));
    }

    #[test]
    fn test_history_larger_than_buffer() {
        let buf = small_buffer(BufferType::Default);
        let reader = buf.add_reader(buf.capacity() + 1, 0);
        assert_eq!(reader.max_possible_items_available(), 0);
    }
}
