//! Stock blocks
//!
//! Small general-purpose blocks for building and exercising graphs:
//! - **Sources**: [`VectorSource`]
//! - **Sinks**: [`VectorSink`], [`NullSink`]
//! - **Stream**: [`StreamCopy`], [`Head`], [`KeepOneInN`], [`Repeat`], [`MovingSum`]
//! - **Messages**: [`MessageStrobe`], [`MessageDebug`]
//!
//! Blocks that only move items around work on opaque items of a given size;
//! the others are generic over a [`bytemuck::Pod`] item type.

mod message;
mod sinks;
mod sources;
mod stream;

pub use message::{MessageDebug, MessageStrobe};
pub use sinks::{NullSink, VectorSink};
pub use sources::VectorSource;
pub use stream::{Head, KeepOneInN, MovingSum, Repeat, StreamCopy};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use crate::config::{RuntimeConfig, SchedulerKind};
    use crate::prefs::Preferences;
    use crate::runtime::TopBlock;
    use crate::vmcircbuf::VmCircBufFactory;

    /// A top block that never touches the user's preference file
    pub(crate) fn top(kind: SchedulerKind) -> TopBlock {
        let config = RuntimeConfig::default().with_scheduler(kind);
        let factory = Arc::new(VmCircBufFactory::new(Preferences::in_memory()));
        TopBlock::with_factory("test", config, factory)
    }
}
