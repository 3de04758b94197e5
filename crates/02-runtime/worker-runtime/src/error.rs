use std::net::SocketAddr;

use thiserror::Error;

use mm_iface::MmError;
use shm_transport::{Status, TransportError};

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("no transport can serve address {addr}")]
    InvalidAddr { addr: SocketAddr },

    #[error("out of memory: {0}")]
    NoMemory(&'static str),

    #[error("interface error: {0}")]
    Iface(#[from] MmError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl WorkerError {
    /// Maps the error onto the shared status set.
    pub fn status(&self) -> Status {
        match self {
            WorkerError::InvalidParam(_) => Status::InvalidParam,
            WorkerError::InvalidAddr { .. } => Status::InvalidAddr,
            WorkerError::NoMemory(_) => Status::NoMemory,
            WorkerError::Iface(err) => err.status(),
            WorkerError::Transport(err) => err.status(),
        }
    }
}
