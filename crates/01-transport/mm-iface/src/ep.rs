use shm_transport::{Fifo, FifoProducer, FifoPush, ShmAllocator};

use crate::error::{MmError, MmResult};
use crate::iface::MmIfaceAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    /// The peer FIFO is full; nothing was written.
    WouldBlock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushStatus {
    /// The peer has released every slot this endpoint wrote.
    Done,
    InProgress,
}

/// Sending side of a connection to a peer [`crate::MmIface`].
///
/// The endpoint is the single producer of the peer's receive FIFO; while it
/// lives, further connects to the same address fail.
pub struct MmEp {
    producer: FifoProducer,
    peer: MmIfaceAddr,
}

impl MmEp {
    /// Attaches to the receive FIFO advertised in `addr` as its producer.
    ///
    /// Fails with an `InvalidParam` status while another endpoint is
    /// connected to the same FIFO.
    pub fn connect(alloc: &dyn ShmAllocator, addr: &MmIfaceAddr) -> MmResult<Self> {
        let fifo = Fifo::attach(alloc, addr.fifo_id, addr.layout()?)?;
        let producer = fifo.into_producer().inspect_err(|err| {
            tracing::debug!(fifo = %addr.fifo_id, "mm endpoint refused: {err}");
        })?;
        tracing::trace!(fifo = %addr.fifo_id, "connected mm endpoint");
        Ok(Self {
            producer,
            peer: *addr,
        })
    }

    /// Copies `payload` into the next peer slot tagged with `tag`.
    pub fn send(&mut self, tag: u8, payload: &[u8]) -> MmResult<SendStatus> {
        let max = self.producer.layout().max_payload();
        if payload.len() > max {
            return Err(MmError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        match self.producer.try_push(tag, payload) {
            FifoPush::Ok => Ok(SendStatus::Ok),
            FifoPush::WouldBlock => Ok(SendStatus::WouldBlock),
        }
    }

    /// Reports whether the peer has published a tail equal to our head.
    ///
    /// With a non-zero release factor the peer publishes in batches, so a
    /// flush may stay in progress until it consumes up to a batch boundary.
    pub fn flush(&self) -> FlushStatus {
        if self.producer.is_drained() {
            FlushStatus::Done
        } else {
            FlushStatus::InProgress
        }
    }

    pub fn peer(&self) -> &MmIfaceAddr {
        &self.peer
    }

    pub fn head(&self) -> u64 {
        self.producer.head()
    }

    /// Peer tail as last published.
    pub fn observed_tail(&self) -> u64 {
        self.producer.observed_tail()
    }
}

impl std::fmt::Debug for MmEp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmEp")
            .field("peer", &self.peer)
            .field("head", &self.head())
            .field("observed_tail", &self.observed_tail())
            .finish()
    }
}
