use thiserror::Error;

use shm_transport::{SegmentId, Status, TransportError};

use crate::iface::IfaceId;

pub type MmResult<T> = Result<T, MmError>;

#[derive(Debug, Error)]
pub enum MmError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("payload of {len} bytes exceeds the {max} byte fifo slot payload")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("descriptor from pool {key} was not issued by this interface")]
    ForeignDescriptor { key: SegmentId },

    #[error("invalid interface configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to get a receive descriptor")]
    NoMemory,

    #[error("{iface} is unusable: {reason}")]
    Fatal { iface: IfaceId, reason: &'static str },
}

impl MmError {
    /// Maps the error onto the shared status set.
    pub fn status(&self) -> Status {
        match self {
            MmError::Transport(err) => err.status(),
            MmError::PayloadTooLarge { .. }
            | MmError::ForeignDescriptor { .. }
            | MmError::InvalidConfig(_) => Status::InvalidParam,
            MmError::NoMemory => Status::NoMemory,
            MmError::Fatal { .. } => Status::Fatal,
        }
    }
}
