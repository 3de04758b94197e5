use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use shm_transport::{
    DescBuf, DescPool, Fifo, FifoConsumer, FifoLayout, SegmentId, ShmAllocator,
};

use crate::am::{AmHandler, AmStatus, AmTable};
use crate::config::MmIfaceConfig;
use crate::error::{MmError, MmResult};

static NEXT_IFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an interface, stamped into its descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IfaceId(u64);

impl fmt::Display for IfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mm-iface#{}", self.0)
    }
}

/// What a peer needs to attach to an interface's receive FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmIfaceAddr {
    pub fifo_id: SegmentId,
    pub capacity: usize,
    pub elem_size: usize,
}

impl MmIfaceAddr {
    pub fn layout(&self) -> MmResult<FifoLayout> {
        Ok(FifoLayout::new(self.capacity, self.elem_size)?)
    }
}

/// Result of one receive attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// No published slot at the read position.
    Empty,
    /// The handler consumed the message in place.
    Handled { tag: u8 },
    /// The message was copied into a descriptor on the deferred queue.
    Deferred { tag: u8 },
}

/// An active message copied out of the FIFO.
///
/// Hand it back with [`MmIface::release_am_desc`]; dropping it also returns
/// the buffer as long as the issuing interface is still open.
pub struct RecvDesc {
    buf: Option<DescBuf>,
    tag: u8,
    iface: IfaceId,
    pool: Weak<Mutex<DescPool>>,
}

impl RecvDesc {
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Interface that issued this descriptor.
    pub fn iface(&self) -> IfaceId {
        self.iface
    }

    pub fn data(&self) -> &[u8] {
        self.buf.as_ref().map(DescBuf::data).unwrap_or_default()
    }

    pub fn key(&self) -> Option<SegmentId> {
        self.buf.as_ref().map(DescBuf::key)
    }

    pub fn index(&self) -> Option<u32> {
        self.buf.as_ref().map(DescBuf::index)
    }
}

impl fmt::Debug for RecvDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvDesc")
            .field("tag", &self.tag)
            .field("iface", &self.iface)
            .field("buf", &self.buf)
            .finish()
    }
}

impl Drop for RecvDesc {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.pool.upgrade()) {
            pool.lock().put(buf);
        }
    }
}

/// Receive side of the shared-memory FIFO transport.
pub struct MmIface {
    id: IfaceId,
    config: MmIfaceConfig,
    last_recv_desc: Option<DescBuf>,
    recv_desc_mp: Arc<Mutex<DescPool>>,
    fifo: FifoConsumer,
    handlers: AmTable,
    deferred_tx: Sender<RecvDesc>,
    deferred_rx: Receiver<RecvDesc>,
    poisoned: bool,
}

impl MmIface {
    /// Allocates the receive FIFO and the descriptor pool, and prefetches the
    /// first receive descriptor.
    pub fn open(alloc: Arc<dyn ShmAllocator>, config: MmIfaceConfig) -> MmResult<Self> {
        config.validate()?;
        let layout = config.fifo_layout()?;
        let release_mask = config.release_mask()?;

        let fifo = Fifo::create(Arc::clone(&alloc), layout, config.hugetlb_mode)?;
        let mut pool = DescPool::new(alloc, config.mp, config.hugetlb_mode)?;
        let Some(first) = pool.try_get() else {
            tracing::error!("failed to get the first receive descriptor");
            return Err(MmError::NoMemory);
        };

        let id = IfaceId(NEXT_IFACE_ID.fetch_add(1, Ordering::Relaxed));
        let (deferred_tx, deferred_rx) = crossbeam_channel::unbounded();
        tracing::debug!(
            %id,
            fifo = %fifo.id(),
            fifo_size = config.fifo_size,
            elem_size = config.fifo_elem_size,
            release_mask,
            huge = fifo.is_huge(),
            "opened mm interface"
        );

        Ok(Self {
            id,
            config,
            last_recv_desc: Some(first),
            recv_desc_mp: Arc::new(Mutex::new(pool)),
            fifo: fifo.into_consumer(release_mask),
            handlers: AmTable::new(),
            deferred_tx,
            deferred_rx,
            poisoned: false,
        })
    }

    pub fn id(&self) -> IfaceId {
        self.id
    }

    pub fn config(&self) -> &MmIfaceConfig {
        &self.config
    }

    /// Address peers pass to [`crate::MmEp::connect`].
    pub fn address(&self) -> MmIfaceAddr {
        let layout = self.fifo.layout();
        MmIfaceAddr {
            fifo_id: self.fifo.id(),
            capacity: layout.capacity() as usize,
            elem_size: layout.elem_size(),
        }
    }

    /// Installs the handler for `tag` and returns the one it replaces.
    pub fn set_am_handler(&mut self, tag: u8, handler: AmHandler) -> AmHandler {
        self.handlers.set(tag, handler)
    }

    /// Receives at most one message.
    ///
    /// After a descriptor shortage the interface is poisoned and every call
    /// returns [`MmError::Fatal`].
    pub fn poll(&mut self) -> MmResult<PollOutcome> {
        if self.poisoned {
            return Err(self.fatal());
        }

        let Some(elem) = self.fifo.peek() else {
            return Ok(PollOutcome::Empty);
        };
        let tag = elem.tag;

        let outcome = match self.handlers.dispatch(tag, elem.payload) {
            AmStatus::Handled => PollOutcome::Handled { tag },
            AmStatus::WantsCopy => {
                let desc = self
                    .last_recv_desc
                    .take()
                    .or_else(|| self.recv_desc_mp.lock().try_get());
                let Some(mut buf) = desc else {
                    tracing::error!(
                        iface = %self.id,
                        tag,
                        len = elem.payload.len(),
                        "failed to allocate receive descriptor for active message"
                    );
                    self.poisoned = true;
                    return Err(self.fatal());
                };
                buf.fill(elem.payload);
                let desc = RecvDesc {
                    buf: Some(buf),
                    tag,
                    iface: self.id,
                    pool: Arc::downgrade(&self.recv_desc_mp),
                };
                // The receiver is owned by `self`, so the channel is never disconnected.
                let _ = self.deferred_tx.send(desc);
                self.last_recv_desc = self.recv_desc_mp.lock().try_get();
                PollOutcome::Deferred { tag }
            }
        };

        self.fifo.advance();
        Ok(outcome)
    }

    /// Polls until the FIFO is empty or `max` messages were received.
    pub fn progress(&mut self, max: usize) -> MmResult<usize> {
        let mut count = 0;
        while count < max {
            match self.poll()? {
                PollOutcome::Empty => break,
                PollOutcome::Handled { .. } | PollOutcome::Deferred { .. } => count += 1,
            }
        }
        Ok(count)
    }

    /// Next copied message, if any.
    pub fn try_recv_deferred(&self) -> Option<RecvDesc> {
        self.deferred_rx.try_recv().ok()
    }

    /// Receiver of copied messages, for consumption on another thread.
    pub fn deferred(&self) -> Receiver<RecvDesc> {
        self.deferred_rx.clone()
    }

    /// Returns a copied message's buffer to the pool.
    pub fn release_am_desc(&self, desc: RecvDesc) -> MmResult<()> {
        if desc.iface != self.id {
            return Err(MmError::ForeignDescriptor {
                key: desc.key().unwrap_or_else(|| SegmentId::from_raw(0)),
            });
        }
        drop(desc);
        Ok(())
    }

    /// Releases the descriptor pool, then the FIFO, then the interface.
    pub fn teardown(self) {
        tracing::debug!(iface = %self.id, "tearing down mm interface");
        drop(self);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Private read position of the receive FIFO.
    pub fn read_index(&self) -> u64 {
        self.fifo.read_index()
    }

    /// Tail as published to senders.
    pub fn published_tail(&self) -> u64 {
        self.fifo.published_tail()
    }

    pub fn release_mask(&self) -> u64 {
        self.fifo.release_mask()
    }

    /// Free descriptors in the pool, the prefetched one excluded.
    pub fn available_descs(&self) -> u32 {
        self.recv_desc_mp.lock().available()
    }

    pub fn has_prefetched_desc(&self) -> bool {
        self.last_recv_desc.is_some()
    }

    fn fatal(&self) -> MmError {
        MmError::Fatal {
            iface: self.id,
            reason: "receive descriptor pool exhausted",
        }
    }
}

impl Drop for MmIface {
    fn drop(&mut self) {
        if let Some(buf) = self.last_recv_desc.take() {
            self.recv_desc_mp.lock().put(buf);
        }
    }
}

impl fmt::Debug for MmIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmIface")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("read_index", &self.fifo.read_index())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
