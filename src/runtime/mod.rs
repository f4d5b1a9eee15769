//! Runtime support for streaming block graphs

pub mod block;
pub mod block_detail;
pub mod buffer;
pub mod buffer_reader;
pub mod errors;
pub mod executor;
pub mod flat_graph;
pub mod graph;
pub mod messages;
pub mod notify;
pub mod scheduler;
pub mod tag;
pub mod top_block;
pub mod watchdog;

pub use block::{
    Block, BlockId, BlockMeta, BlockRef, InputItems, OutputItems, PortSpec, Rate, TagPropagation,
    WorkIo, WorkReturn,
};
pub use block_detail::{BlockDetail, BlockStats};
pub use buffer::{Buffer, BufferType, ReaderId, TransferType};
pub use buffer_reader::BufferReader;
pub use errors::{BufferError, ConnectionError, GraphError, WorkError, WorkResult};
pub use executor::{BlockExecutor, ExecState};
pub use flat_graph::FlatGraph;
pub use graph::{Edge, Flattened, HierBlock, MsgEdge, NodeRef};
pub use messages::MessageOutbox;
pub use scheduler::{Scheduler, SingleThreaded, ThreadPerBlock};
pub use tag::{Tag, TagValue};
pub use top_block::TopBlock;
pub use watchdog::Watchdog;
