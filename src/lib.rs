//! Streaming dataflow runtime
//!
//! Blocks are connected into a hierarchical graph, compiled into a flat
//! network of circular buffers and run by a scheduler that repeatedly calls
//! each block's work function while respecting backpressure, rate
//! relationships and per-block history.
//!
//! # Architecture
//!
//! - **vmcircbuf**: double-mapped memory regions so every buffer window is one
//!   contiguous slice, whatever the wraparound
//! - **Buffers and readers**: one writer, many readers, tags attached to
//!   absolute item offsets
//! - **Graph compiler**: flattens [`HierBlock`]s, sizes and allocates buffers,
//!   and rewires a running graph without losing buffered data
//! - **Schedulers**: thread-per-block or one cooperative thread
//! - **TopBlock**: start / stop / wait / lock / unlock lifecycle
//!
//! # Example
//!
//! ```no_run
//! use sigflow::blocks::{KeepOneInN, VectorSink, VectorSource};
//! use sigflow::{BlockRef, TopBlock};
//!
//! let tb = TopBlock::new("example");
//! let src = BlockRef::new(VectorSource::new((0..1000u32).collect(), false));
//! let keep = BlockRef::new(KeepOneInN::new(4, 10));
//! let sink = VectorSink::<u32>::new();
//! let data = sink.data();
//! let sink = BlockRef::new(sink);
//! tb.connect(&src, 0, &keep, 0)?;
//! tb.connect(&keep, 0, &sink, 0)?;
//! tb.run(None)?;
//! assert_eq!(data.lock().unwrap().len(), 100);
//! # Ok::<(), sigflow::Error>(())
//! ```

use thiserror::Error;

pub mod blocks;
pub mod config;
pub mod prefs;
pub mod runtime;
pub mod vmcircbuf;

pub use config::{RuntimeConfig, SchedulerKind};
pub use prefs::{Preferences, PrefsError};
pub use vmcircbuf::{AllocError, VmCircBufFactory};

pub use runtime::{
    Block, BlockMeta, BlockRef, BufferError, BufferType, ConnectionError, GraphError, HierBlock,
    MessageOutbox, PortSpec, Rate, Tag, TagPropagation, TagValue, TopBlock, WorkError, WorkIo,
    WorkResult, WorkReturn,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Work error: {0}")]
    Work(#[from] WorkError),

    #[error("Preferences error: {0}")]
    Prefs(#[from] PrefsError),
}

pub type Result<T> = std::result::Result<T, Error>;
