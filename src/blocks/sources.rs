//! Sources

use bytemuck::Pod;
use tracing::debug;

use crate::runtime::block::{Block, BlockMeta, PortSpec, WorkIo, WorkResult, WorkReturn};
use crate::runtime::tag::Tag;

/// Emits the items of a vector, once or forever
///
/// Tags given with [`with_tags`](Self::with_tags) are positioned relative to
/// the start of the vector and re-emitted on every repetition.
pub struct VectorSource<T> {
    name: String,
    data: Vec<T>,
    repeat: bool,
    tags: Vec<Tag>,
    emitted: u64,
}

impl<T: Pod + Send> VectorSource<T> {
    pub fn new(data: Vec<T>, repeat: bool) -> Self {
        Self {
            name: "vector_source".to_string(),
            data,
            repeat,
            tags: Vec::new(),
            emitted: 0,
        }
    }

    /// With custom name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<Tag>) -> Self {
        self.tags = tags;
        self
    }

    /// Attach every configured tag that falls in `[start, end)` of the output
    fn emit_tags(&self, io: &mut WorkIo<'_>, start: u64, end: u64) {
        let len = self.data.len() as u64;
        for tag in &self.tags {
            if tag.offset >= len {
                continue;
            }
            let mut pos = start - start % len + tag.offset;
            if pos < start {
                pos += len;
            }
            while pos < end {
                let mut out = tag.clone();
                out.offset = pos;
                io.add_tag(0, out);
                if !self.repeat {
                    break;
                }
                pos += len;
            }
        }
    }
}

impl<T: Pod + Send> Block for VectorSource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> BlockMeta {
        BlockMeta::new().output(PortSpec::of::<T>())
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkReturn> {
        let len = self.data.len();
        if len == 0 || (!self.repeat && self.emitted >= len as u64) {
            debug!("[{}] Finished after {} items", self.name, self.emitted);
            return Ok(WorkReturn::Done);
        }

        let start = self.emitted;
        let offset = (start % len as u64) as usize;
        let out = io.outputs.get_mut::<T>(0)?;
        let n = if self.repeat {
            let n = out.len();
            for (i, item) in out.iter_mut().enumerate() {
                *item = self.data[(offset + i) % len];
            }
            n
        } else {
            let n = out.len().min(len - offset);
            out[..n].copy_from_slice(&self.data[offset..offset + n]);
            n
        };

        self.emit_tags(io, start, start + n as u64);
        self.emitted += n as u64;
        Ok(WorkReturn::Produced(n))
    }
}
