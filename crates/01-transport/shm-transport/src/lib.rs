//! Shared-memory primitives for the active-message transport.
//!
//! * [`ShmAllocator`] / [`SharedRegion`] – segments addressable by id, backed
//!   by anonymous or file mappings with optional huge pages.
//! * [`Fifo`] – single-producer/single-consumer ring of fixed-size tagged slots
//!   with batched tail release.
//! * [`DescPool`] – fixed-capacity pool of receive buffers for messages that
//!   outlive their ring slot.
//! * [`Status`] / [`TransportError`] – the shared outcome set and the
//!   low-level error surface.

mod desc_pool;
pub mod env;
mod error;
mod fifo;
pub mod segment;

pub use desc_pool::{DescBuf, DescPool, DescPoolConfig, DESC_ALIGNMENT};
pub use error::{Status, TransportError, TransportResult};
pub use fifo::{
    release_mask, Fifo, FifoConsumer, FifoElem, FifoLayout, FifoProducer, FifoPush,
    CACHE_LINE_SIZE, FIFO_ELEM_HEADER_SIZE,
};
pub use segment::{AnonShm, FileShm, HugetlbMode, SegmentId, SharedRegion, ShmAllocator};
