use crate::{Address, BackendKind};

#[derive(Debug, PartialEq, Eq, onlyerror::Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,
    #[error("address {0} was not allocated by this heap")]
    InvalidPointer(Address),
    /// A freed extent could neither be merged with a neighbour nor stored in an empty free slot.
    #[error("free list is full (all {max_blocks} descriptors in use), extent cannot be recorded")]
    CapacityExhausted { max_blocks: usize },
    #[error("heap size must not be zero")]
    ZeroSizedHeap,
    #[error("descriptor count must not be zero")]
    ZeroBlockCount,
    #[error("{0:?} backend cannot back the system heap")]
    UnsupportedSystemBackend(BackendKind),
    #[error("{0:?} backend is not compiled in")]
    BackendUnavailable(BackendKind),
    #[error("region of {size} bytes is too small, at least {required} bytes are required")]
    RegionTooSmall { size: usize, required: usize },
    #[error("memory subsystem is already initialized")]
    AlreadyInitialized,
    #[error("memory subsystem is not initialized")]
    NotInitialized,
    #[error("heap metadata is corrupted: {0}")]
    Corrupted(&'static str),
}
