//! Shared-memory segments backing FIFOs and descriptor pools.
//!
//! A segment is a contiguous mapping identified by a [`SegmentId`]. The
//! creating side obtains it through [`ShmAllocator::create`]; peers map the same
//! memory with [`ShmAllocator::attach`] and detach by dropping their
//! [`SharedRegion`]. [`ShmAllocator::destroy`] releases the identifier; mappings
//! that are still attached stay valid until their last handle drops.
//!
//! Two allocators are provided:
//! * [`AnonShm`] – anonymous `mmap` regions shared between threads of one process.
//! * [`FileShm`] – file-backed `MAP_SHARED` regions (e.g. under `/dev/shm`)
//!   that independent processes attach to by id.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;

use crate::{TransportError, TransportResult};

/// Huge page size requested when huge pages are enabled.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Identifier of a shared segment, stable across attachments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u64);

impl SegmentId {
    /// Wraps a raw identifier received from a peer.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier to hand to a peer.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Huge page policy applied when creating a segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HugetlbMode {
    /// Request huge pages and fall back to normal pages on failure.
    #[default]
    Try,
    /// Request huge pages and fail when they are unavailable.
    Mandatory,
    /// Never request huge pages.
    Never,
}

impl FromStr for HugetlbMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "try" | "auto" => Ok(HugetlbMode::Try),
            "yes" | "y" | "on" | "1" | "mandatory" => Ok(HugetlbMode::Mandatory),
            "no" | "n" | "off" | "0" | "never" => Ok(HugetlbMode::Never),
            other => Err(format!("unknown huge page mode '{other}'")),
        }
    }
}

#[derive(Debug)]
struct Mapping {
    raw: MmapRaw,
    huge: bool,
}

/// Handle to an attached shared segment.
///
/// Cloning a region produces another attachment of the same memory. The memory
/// is shared and may be written concurrently by peers, so the region only hands
/// out raw pointers; typed access is the job of the structures laid over it.
#[derive(Clone, Debug)]
pub struct SharedRegion {
    id: SegmentId,
    mapping: Arc<Mapping>,
}

impl SharedRegion {
    fn new(id: SegmentId, mapping: Arc<Mapping>) -> Self {
        Self { id, mapping }
    }

    /// Identifier peers use to attach to this segment.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Total number of mapped bytes.
    pub fn len(&self) -> usize {
        self.mapping.raw.len()
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when the segment is backed by huge pages.
    pub fn is_huge(&self) -> bool {
        self.mapping.huge
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.mapping.raw.as_ptr()
    }

    /// Base address of the mapping for writes.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mapping.raw.as_mut_ptr()
    }
}

/// Shared-memory allocation primitive consumed by FIFOs and descriptor pools.
pub trait ShmAllocator: Send + Sync {
    /// Creates a segment of at least `len` bytes honoring the huge page policy.
    fn create(&self, len: usize, hugetlb: HugetlbMode) -> TransportResult<SharedRegion>;

    /// Maps an existing segment by id.
    fn attach(&self, id: SegmentId) -> TransportResult<SharedRegion>;

    /// Releases the segment identifier. Existing attachments remain mapped.
    fn destroy(&self, id: SegmentId) -> TransportResult<()>;
}

/// Destroys a segment id on drop. Held by the side that created the segment.
pub(crate) struct SegmentOwner {
    alloc: Arc<dyn ShmAllocator>,
    id: SegmentId,
}

impl SegmentOwner {
    pub(crate) fn new(alloc: Arc<dyn ShmAllocator>, id: SegmentId) -> Self {
        Self { alloc, id }
    }
}

impl Drop for SegmentOwner {
    fn drop(&mut self) {
        if let Err(err) = self.alloc.destroy(self.id) {
            tracing::warn!(id = %self.id, "failed to destroy shared segment: {err}");
        }
    }
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Anonymous-mapping allocator keeping an id registry for in-process peers.
#[derive(Debug, Default)]
pub struct AnonShm {
    segments: Mutex<HashMap<SegmentId, Arc<Mapping>>>,
    next_id: AtomicU64,
}

impl AnonShm {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segment ids currently registered.
    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }
}

impl ShmAllocator for AnonShm {
    fn create(&self, len: usize, hugetlb: HugetlbMode) -> TransportResult<SharedRegion> {
        let mapping = Arc::new(map_segment(len, hugetlb, map_anon_huge, map_anon)?);
        let id = SegmentId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.segments.lock().insert(id, Arc::clone(&mapping));
        tracing::trace!(%id, len, huge = mapping.huge, "created anonymous segment");
        Ok(SharedRegion::new(id, mapping))
    }

    fn attach(&self, id: SegmentId) -> TransportResult<SharedRegion> {
        let segments = self.segments.lock();
        let mapping = segments
            .get(&id)
            .ok_or(TransportError::UnknownSegment { id })?;
        Ok(SharedRegion::new(id, Arc::clone(mapping)))
    }

    fn destroy(&self, id: SegmentId) -> TransportResult<()> {
        self.segments
            .lock()
            .remove(&id)
            .map(|_| tracing::trace!(%id, "destroyed anonymous segment"))
            .ok_or(TransportError::UnknownSegment { id })
    }
}

/// File-backed allocator for peers living in different processes.
///
/// Segment files are named after the id, which embeds the creating pid so
/// concurrent processes sharing a directory never collide.
#[derive(Debug)]
pub struct FileShm {
    dir: PathBuf,
    counter: AtomicU64,
}

impl FileShm {
    /// Places segment files under `dir`, which must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: SegmentId) -> PathBuf {
        self.dir.join(format!("shm-seg-{:016x}", id.0))
    }

    fn next_id(&self) -> SegmentId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        SegmentId((u64::from(std::process::id()) << 32) | (seq & 0xFFFF_FFFF))
    }
}

impl ShmAllocator for FileShm {
    fn create(&self, len: usize, hugetlb: HugetlbMode) -> TransportResult<SharedRegion> {
        let id = self.next_id();
        let path = self.path_of(id);
        let map_file = |len: usize| -> io::Result<Mapping> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?;
            file.set_len(len as u64)?;
            map_file_shared(&file, len)
        };
        let mapping = map_segment(len, hugetlb, unsupported_huge, map_file).inspect_err(|_| {
            let _ = fs::remove_file(&path);
        })?;
        tracing::trace!(%id, len, path = %path.display(), "created file segment");
        Ok(SharedRegion::new(id, Arc::new(mapping)))
    }

    fn attach(&self, id: SegmentId) -> TransportResult<SharedRegion> {
        let path = self.path_of(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| TransportError::UnknownSegment { id })?;
        let len = file
            .metadata()
            .map_err(|_| TransportError::UnknownSegment { id })?
            .len() as usize;
        let mapping =
            map_file_shared(&file, len).map_err(|_| TransportError::AllocationFailed { size: len })?;
        Ok(SharedRegion::new(id, Arc::new(mapping)))
    }

    fn destroy(&self, id: SegmentId) -> TransportResult<()> {
        fs::remove_file(self.path_of(id)).map_err(|_| TransportError::UnknownSegment { id })
    }
}

fn map_segment<H, N>(
    len: usize,
    hugetlb: HugetlbMode,
    map_huge: H,
    map_normal: N,
) -> TransportResult<Mapping>
where
    H: FnOnce(usize) -> io::Result<Mapping>,
    N: FnOnce(usize) -> io::Result<Mapping>,
{
    if len == 0 {
        return Err(TransportError::AllocationFailed { size: len });
    }

    match hugetlb {
        HugetlbMode::Never => {}
        HugetlbMode::Mandatory => {
            return map_huge(len).map_err(|err| {
                tracing::debug!(size = len, %err, "mandatory huge page allocation failed");
                TransportError::HugePagesUnavailable { size: len }
            });
        }
        HugetlbMode::Try => match map_huge(len) {
            Ok(mapping) => return Ok(mapping),
            Err(err) => {
                tracing::debug!(size = len, %err, "huge pages unavailable, using normal pages");
            }
        },
    }

    map_normal(len).map_err(|err| {
        tracing::debug!(size = len, %err, "shared segment allocation failed");
        TransportError::AllocationFailed { size: len }
    })
}

fn map_anon(len: usize) -> io::Result<Mapping> {
    let map = MmapOptions::new().len(len).map_anon()?;
    Ok(Mapping {
        raw: MmapRaw::from(map),
        huge: false,
    })
}

#[cfg(target_os = "linux")]
fn map_anon_huge(len: usize) -> io::Result<Mapping> {
    let huge_len = len.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE;
    let map = MmapOptions::new().len(huge_len).huge(None).map_anon()?;
    Ok(Mapping {
        raw: MmapRaw::from(map),
        huge: true,
    })
}

#[cfg(not(target_os = "linux"))]
fn map_anon_huge(_len: usize) -> io::Result<Mapping> {
    unsupported_huge(_len)
}

fn unsupported_huge(_len: usize) -> io::Result<Mapping> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "huge pages are not available for this segment type",
    ))
}

fn map_file_shared(file: &File, len: usize) -> io::Result<Mapping> {
    let raw = MmapOptions::new().len(len).map_raw(file)?;
    Ok(Mapping { raw, huge: false })
}
