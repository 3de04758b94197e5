//! Error handling helpers for the shared-memory transport crate.
//!
//! The low-level layer keeps its error surface small: layout validation,
//! segment allocation and segment lookup. Every error maps onto the closed
//! [`Status`] set shared by the higher layers.

use std::fmt;

use crate::segment::SegmentId;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Closed set of outcomes reported across the transport and worker layers.
///
/// `WouldBlock` and `InProgress` are ordinary, retry-able outcomes rather than
/// failures; they are listed here so every layer reports against one set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation completed.
    Ok,
    /// Operation started but cannot complete synchronously.
    InProgress,
    /// Resource is full; retry later.
    WouldBlock,
    /// Allocation failed.
    NoMemory,
    /// A required parameter is missing or malformed.
    InvalidParam,
    /// No transport resource can serve the requested address.
    InvalidAddr,
    /// The process cannot safely continue.
    Fatal,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "success",
            Status::InProgress => "operation in progress",
            Status::WouldBlock => "resource temporarily unavailable",
            Status::NoMemory => "out of memory",
            Status::InvalidParam => "invalid parameter",
            Status::InvalidAddr => "invalid address",
            Status::Fatal => "fatal error",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
/// Errors surfaced by low-level transport helpers.
pub enum TransportError {
    /// Requested ring capacity is zero or not a power of two.
    InvalidCapacity { requested: usize },
    /// Slot size cannot hold the slot header plus payload, or is misaligned.
    InvalidElemSize { requested: usize, minimum: usize },
    /// Release factor is outside `[0, 1)`.
    InvalidReleaseFactor { factor: f64 },
    /// Allocation of a shared segment failed for the given size.
    AllocationFailed { size: usize },
    /// Huge pages were mandatory but the OS refused them.
    HugePagesUnavailable { size: usize },
    /// No segment with this id is registered with the allocator.
    UnknownSegment { id: SegmentId },
    /// The attached segment is smaller than the layout requires.
    SegmentTooSmall { id: SegmentId, len: usize, required: usize },
    /// Another producer is attached to the FIFO.
    ProducerAttached { id: SegmentId },
}

impl TransportError {
    /// Maps the error onto the shared status set.
    pub fn status(&self) -> Status {
        match self {
            TransportError::AllocationFailed { .. } | TransportError::HugePagesUnavailable { .. } => {
                Status::NoMemory
            }
            TransportError::InvalidCapacity { .. }
            | TransportError::InvalidElemSize { .. }
            | TransportError::InvalidReleaseFactor { .. }
            | TransportError::SegmentTooSmall { .. }
            | TransportError::ProducerAttached { .. } => Status::InvalidParam,
            TransportError::UnknownSegment { .. } => Status::InvalidAddr,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidCapacity { requested } => {
                write!(f, "fifo capacity {requested} must be a non-zero power of two")
            }
            TransportError::InvalidElemSize { requested, minimum } => {
                write!(
                    f,
                    "fifo element size {requested} must be at least {minimum} bytes and 8-byte aligned"
                )
            }
            TransportError::InvalidReleaseFactor { factor } => {
                write!(f, "fifo release factor {factor} must be within [0, 1)")
            }
            TransportError::AllocationFailed { size } => {
                write!(f, "failed to allocate shared segment of {size} bytes")
            }
            TransportError::HugePagesUnavailable { size } => {
                write!(f, "huge pages are mandatory but a {size} byte huge-page segment could not be mapped")
            }
            TransportError::UnknownSegment { id } => write!(f, "no shared segment with id {id}"),
            TransportError::SegmentTooSmall { id, len, required } => {
                write!(f, "segment {id} holds {len} bytes, layout requires {required}")
            }
            TransportError::ProducerAttached { id } => {
                write!(f, "fifo {id} already has a producer attached")
            }
        }
    }
}

impl std::error::Error for TransportError {}
