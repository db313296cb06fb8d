//! RDMA bulk-handle cache (spec §4.B).
//!
//! Sits on top of the DMA pool: rather than registering a fresh RDMA memory
//! region for every request, chunks are pre-carved into fixed-size handles
//! and grouped by page-count so a request can grab (or share) a ready-made
//! handle instead of paying registration cost on the hot path.

mod cache;

pub use cache::{BulkCache, BulkGroup, BulkHandle, BulkLease};
