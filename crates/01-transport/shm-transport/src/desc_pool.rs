//! Fixed-capacity pool of receive buffers in one shared segment.
//!
//! Messages a handler cannot consume in place are copied into a descriptor
//! buffer that outlives the ring slot. The pool carves a single segment into
//! `max_bufs` equally sized buffers and tracks free ones in an index ring stored
//! at the front of the segment:
//!
//! ```text
//! [ IndexRingHeader ][ u32 entries × max_bufs ][ pad to 64 ][ buf 0 ] ... [ buf n-1 ]
//! ```

use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::segment::{align_up, HugetlbMode, SegmentId, SegmentOwner, ShmAllocator, SharedRegion};
use crate::{TransportError, TransportResult};

/// Alignment enforced for every buffer inside the pool.
pub const DESC_ALIGNMENT: usize = 64;

#[cfg(debug_assertions)]
const FREE_RING_MAGIC: u64 = 0x5244_4553_4346_5245; // "RDESCFRE"
#[cfg(not(debug_assertions))]
const FREE_RING_MAGIC: u64 = 0;

#[repr(C, align(8))]
struct IndexRingHeader {
    capacity: u32,
    _pad: u32,
    head: AtomicU64,
    tail: AtomicU64,
    magic: u64,
}

/// Shape of a descriptor pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescPoolConfig {
    /// Usable bytes per buffer.
    pub seg_size: usize,
    /// Number of buffers in the pool.
    pub max_bufs: u32,
}

impl Default for DescPoolConfig {
    fn default() -> Self {
        Self {
            seg_size: 8 * 1024,
            max_bufs: 256,
        }
    }
}

struct IndexRing {
    header: NonNull<IndexRingHeader>,
    entries: NonNull<u32>,
}

impl IndexRing {
    /// # Safety
    ///
    /// `base` must be 8-byte aligned and point at
    /// `size_of::<IndexRingHeader>() + 4 * capacity` writable bytes that stay
    /// mapped for the lifetime of the ring.
    unsafe fn init(base: NonNull<u8>, capacity: u32) -> Self {
        let header = base.cast::<IndexRingHeader>();
        header.as_ptr().write(IndexRingHeader {
            capacity,
            _pad: 0,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            magic: FREE_RING_MAGIC,
        });
        let entries = base.add(mem::size_of::<IndexRingHeader>()).cast::<u32>();
        Self { header, entries }
    }

    fn header(&self) -> &IndexRingHeader {
        // SAFETY: initialised in `init`, mapped while the pool lives.
        let header = unsafe { self.header.as_ref() };
        debug_assert_eq!(header.magic, FREE_RING_MAGIC, "descriptor free ring corrupted");
        header
    }

    fn capacity(&self) -> u32 {
        self.header().capacity
    }

    fn len(&self) -> u32 {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as u32
    }

    fn push(&mut self, value: u32) -> Result<(), ()> {
        let (capacity, head, tail) = {
            let header = self.header();
            (
                u64::from(header.capacity),
                header.head.load(Ordering::Relaxed),
                header.tail.load(Ordering::Acquire),
            )
        };

        if head.wrapping_sub(tail) >= capacity {
            return Err(());
        }

        let index = (head % capacity) as usize;
        // SAFETY: `index < capacity`.
        unsafe { self.entries.as_ptr().add(index).write(value) };
        self.header()
            .head
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    fn pop(&mut self) -> Option<u32> {
        let (capacity, head, tail) = {
            let header = self.header();
            (
                u64::from(header.capacity),
                header.head.load(Ordering::Acquire),
                header.tail.load(Ordering::Relaxed),
            )
        };

        if tail == head {
            return None;
        }

        let index = (tail % capacity) as usize;
        // SAFETY: `index < capacity`.
        let value = unsafe { self.entries.as_ptr().add(index).read() };
        self.header()
            .tail
            .store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    fn fill_sequential(&mut self) {
        let capacity = self.capacity();
        for i in 0..capacity {
            // SAFETY: `i < capacity`.
            unsafe { self.entries.as_ptr().add(i as usize).write(i) };
        }
        let header = self.header();
        header.tail.store(0, Ordering::Relaxed);
        header.head.store(u64::from(capacity), Ordering::Release);
    }
}

/// A buffer checked out of a [`DescPool`].
///
/// The buffer keeps the pool segment mapped, so its bytes stay valid even if
/// the pool is torn down first; the index is simply never recycled then.
pub struct DescBuf {
    key: SegmentId,
    index: u32,
    base: NonNull<u8>,
    capacity: usize,
    len: usize,
    _region: SharedRegion,
}

// SAFETY: the buffer is exclusively owned until released; the region handle
// keeps the memory mapped.
unsafe impl Send for DescBuf {}
unsafe impl Sync for DescBuf {}

impl DescBuf {
    /// Segment key of the issuing pool.
    pub fn key(&self) -> SegmentId {
        self.key
    }

    /// Buffer index inside the pool.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Address of the first byte of the buffer.
    pub fn base_address(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Usable bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written by the last [`DescBuf::fill`].
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `data` into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than [`DescBuf::capacity`].
    pub fn fill(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.capacity,
            "descriptor of {} bytes cannot hold {} bytes",
            self.capacity,
            data.len()
        );
        // SAFETY: bounds checked above, buffer exclusively owned.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr(), data.len());
        }
        self.len = data.len();
    }

    /// Bytes written by the last fill.
    pub fn data(&self) -> &[u8] {
        // SAFETY: `len <= capacity` and the buffer is exclusively owned.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for DescBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescBuf")
            .field("key", &self.key)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

/// Fixed-capacity pool of receive buffers.
pub struct DescPool {
    region: SharedRegion,
    free: IndexRing,
    bufs: NonNull<u8>,
    stride: usize,
    config: DescPoolConfig,
    _owner: SegmentOwner,
}

// SAFETY: the ring and buffer pointers target `region`, owned by the pool.
unsafe impl Send for DescPool {}

impl DescPool {
    /// Allocates a pool segment and marks every buffer free.
    pub fn new(
        alloc: Arc<dyn ShmAllocator>,
        config: DescPoolConfig,
        hugetlb: HugetlbMode,
    ) -> TransportResult<Self> {
        validate_config(&config)?;
        let DescPoolConfig { seg_size, max_bufs } = config;

        let stride = align_up(seg_size, DESC_ALIGNMENT);
        let ring_len = mem::size_of::<IndexRingHeader>() + mem::size_of::<u32>() * max_bufs as usize;
        let bufs_offset = align_up(ring_len, DESC_ALIGNMENT);
        let total = stride
            .checked_mul(max_bufs as usize)
            .and_then(|bufs| bufs.checked_add(bufs_offset + DESC_ALIGNMENT - 1))
            .ok_or(TransportError::AllocationFailed { size: usize::MAX })?;

        let region = alloc.create(total, hugetlb)?;
        let owner = SegmentOwner::new(alloc, region.id());
        let raw = region.as_mut_ptr();
        let start = align_up(raw as usize, DESC_ALIGNMENT) - raw as usize;
        let base = NonNull::new(raw).ok_or(TransportError::AllocationFailed { size: total })?;

        // SAFETY: `start < DESC_ALIGNMENT` and `total` reserves that slack plus
        // the ring and every buffer.
        let (mut free, bufs) = unsafe {
            let ring_base = base.add(start);
            (
                IndexRing::init(ring_base, max_bufs),
                ring_base.add(bufs_offset),
            )
        };
        free.fill_sequential();

        tracing::trace!(
            id = %region.id(),
            seg_size,
            max_bufs,
            huge = region.is_huge(),
            "created receive descriptor pool"
        );

        Ok(Self {
            region,
            free,
            bufs,
            stride,
            config,
            _owner: owner,
        })
    }

    /// Segment key stamped into every buffer of this pool.
    pub fn key(&self) -> SegmentId {
        self.region.id()
    }

    pub fn config(&self) -> DescPoolConfig {
        self.config
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> u32 {
        self.free.len()
    }

    /// Takes a free buffer, or `None` when all are checked out.
    pub fn try_get(&mut self) -> Option<DescBuf> {
        let index = self.free.pop()?;
        // SAFETY: `index < max_bufs`, so the buffer lies inside the segment.
        let base = unsafe { self.bufs.add(index as usize * self.stride) };
        Some(DescBuf {
            key: self.key(),
            index,
            base,
            capacity: self.config.seg_size,
            len: 0,
            _region: self.region.clone(),
        })
    }

    /// Returns a buffer to the free ring.
    ///
    /// # Panics
    ///
    /// Panics if `buf` was issued by another pool.
    pub fn put(&mut self, buf: DescBuf) {
        assert_eq!(
            buf.key,
            self.key(),
            "descriptor {} returned to foreign pool {}",
            buf.key,
            self.key()
        );
        if self.free.push(buf.index).is_err() {
            debug_assert!(false, "free ring overflowed, index {} released twice?", buf.index);
        }
    }
}

fn validate_config(config: &DescPoolConfig) -> TransportResult<()> {
    if config.max_bufs == 0 {
        return Err(TransportError::InvalidCapacity { requested: 0 });
    }

    if config.seg_size == 0 {
        return Err(TransportError::InvalidElemSize {
            requested: 0,
            minimum: 1,
        });
    }

    Ok(())
}
