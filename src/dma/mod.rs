//! Zero-copy DMA buffer pool (spec §4.A).
//!
//! One [`DmaPool`] per worker. Holds idle and in-use chunk lists, a
//! per-[`ChunkType`] bump-allocator pointer, and a FIFO wait queue used for
//! backpressure when the pool is exhausted. The pool is the substrate both
//! for staging SSD I/O and, via the bulk-handle cache (`crate::bulk`), for
//! RDMA source/sink buffers.

mod chunk;
mod pool;

pub use chunk::{ChunkId, ChunkType, DmaChunk, BIO_DMA_PAGE_SZ};
pub use pool::{BulkReclaimer, DmaPool, DmaRegion, ReserveOutcome};
