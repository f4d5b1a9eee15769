//! Error types for the runtime system

use crate::vmcircbuf::AllocError;

use super::buffer::TransferType;

/// Error type for buffer operations
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Reader {0} is not registered with this buffer")]
    ReaderNotFound(usize),

    #[error("Transfer type already set to {current:?}, cannot change to {requested:?}")]
    IncompatibleTransferType {
        current: TransferType,
        requested: TransferType,
    },

    #[error("Buffer of {nitems} items x {item_size} bytes is not a whole number of {granularity}-byte granules")]
    InvalidCapacity {
        nitems: usize,
        item_size: usize,
        granularity: usize,
    },

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Error type for connection operations
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Block '{0}' not found")]
    BlockNotFound(String),

    #[error("Port {port} not found on '{block}' ({direction})")]
    PortNotFound {
        block: String,
        port: String,
        direction: &'static str,
    },

    #[error("{0}")]
    DuplicateConnection(String),

    #[error("No connection {0}")]
    EdgeNotFound(String),

    #[error("Item size mismatch: {src} produces {src_size} bytes, {dst} expects {dst_size} bytes")]
    ItemSizeMismatch {
        src: String,
        src_size: usize,
        dst: String,
        dst_size: usize,
    },

    #[error("Input port {port} on '{block}' is not connected")]
    UnconnectedInput { block: String, port: usize },

    #[error("Hierarchical port {port} on '{block}' is not mapped to an inner block")]
    UnmappedHierPort { block: String, port: String },

    #[error("Incompatible buffer types between {src} and {dst}: {reason}")]
    IncompatibleBufferTypes {
        src: String,
        dst: String,
        reason: String,
    },

    #[error("Invalid max output buffer {max} on {block}:{port}")]
    InvalidMaxOutputBuffer {
        block: String,
        port: usize,
        max: usize,
    },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Error type for lifecycle operations on a top block
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Top block is already running")]
    AlreadyRunning,

    #[error("Cannot start a top block while it is locked")]
    StartWhileLocked,

    #[error("unlock() called without a matching lock()")]
    UnpairedUnlock,

    #[error("Graph can only be modified while stopped or locked")]
    NotLocked,

    #[error("Failed to spawn scheduler thread: {0}")]
    Spawn(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Error type for work function operations
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("Item view cast failed: {0}")]
    Cast(bytemuck::PodCastError),

    #[error("Port {0} out of range")]
    PortOutOfRange(usize),

    #[error("Block-specific error: {0}")]
    NodeError(String),
}

impl From<bytemuck::PodCastError> for WorkError {
    fn from(e: bytemuck::PodCastError) -> Self {
        WorkError::Cast(e)
    }
}

/// Result type for work functions
pub type WorkResult<T = ()> = Result<T, WorkError>;
