//! Sinks

use std::sync::{Arc, Mutex};

use bytemuck::Pod;

use crate::runtime::block::{Block, BlockMeta, PortSpec, WorkIo, WorkResult, WorkReturn};
use crate::runtime::tag::Tag;

/// Collects every item and tag it receives
///
/// Take the shared handles with [`data`](Self::data) and [`tags`](Self::tags)
/// before wrapping the sink in a `BlockRef`.
pub struct VectorSink<T> {
    name: String,
    data: Arc<Mutex<Vec<T>>>,
    tags: Arc<Mutex<Vec<Tag>>>,
}

impl<T: Pod + Send> VectorSink<T> {
    pub fn new() -> Self {
        Self {
            name: "vector_sink".to_string(),
            data: Arc::new(Mutex::new(Vec::new())),
            tags: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn data(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.data)
    }

    pub fn tags(&self) -> Arc<Mutex<Vec<Tag>>> {
        Arc::clone(&self.tags)
    }
}

impl<T: Pod + Send> Default for VectorSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Pod + Send> Block for VectorSink<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new().input(PortSpec::of::<T>())
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        let n = io.noutput_items().min(io.ninput_items(0));
        let start = io.inputs.nitems_read(0);
        let input = io.inputs.get::<T>(0)?;
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(&input[..n]);

        let tags = io.inputs.tags_in_range(0, start, start + n as u64);
        if !tags.is_empty() {
            self.tags.lock().unwrap_or_else(|e| e.into_inner()).extend(tags);
        }
        io.consume(0, n);
        Ok(WorkReturn::Produced(n))
    }
}

/// Discards everything
pub struct NullSink {
    name: String,
    item_size: usize,
}

impl NullSink {
    pub fn new(item_size: usize) -> Self {
        Self {
            name: "null_sink".to_string(),
            item_size,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Block for NullSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new().input(PortSpec::bytes(self.item_size))
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        let n = io.noutput_items().min(io.ninput_items(0));
        io.consume(0, n);
        Ok(WorkReturn::Produced(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::tests::top;
    use crate::blocks::{Head, VectorSource};
    use crate::config::SchedulerKind;
    use crate::runtime::block::BlockRef;

    #[test]
    fn test_vector_sink_collects_tags() {
        let tb = top(SchedulerKind::SingleThreaded);
        let tags = vec![Tag::new(0, "first", true), Tag::new(99, "last", true)];
        let src = BlockRef::new(VectorSource::new(vec![0.5f64; 100], false).with_tags(tags));
        let sink = VectorSink::<f64>::new();
        let data = sink.data();
        let seen = sink.tags();
        tb.connect(&src, 0, &BlockRef::new(sink), 0).unwrap();
        tb.run(Some(16)).unwrap();

        assert_eq!(data.lock().unwrap().len(), 100);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].key, "first");
        assert_eq!(seen[1].offset, 99);
    }

    #[test]
    fn test_null_sink_drains_endless_source() {
        let tb = top(SchedulerKind::ThreadPerBlock);
        let src = BlockRef::new(VectorSource::new(vec![0u8; 7], true));
        let head = BlockRef::new(Head::new(1, 1 << 20));
        let sink = BlockRef::new(NullSink::new(1));
        tb.connect(&src, 0, &head, 0).unwrap();
        tb.connect(&head, 0, &sink, 0).unwrap();
        tb.run(None).unwrap();
        assert!(tb.dump().contains(&format!("consumed {}", 1 << 20)));
    }
}
