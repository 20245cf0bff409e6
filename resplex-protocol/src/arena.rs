//! Pooled, reference-counted byte storage.
//!
//! Bytes live in fixed-capacity segments rented from a [`SegmentPool`]. A
//! segment carries an explicit reference count and goes back to its pool
//! exactly once, when the count reaches zero. Several logical buffers may
//! reference the same segment at once: the inbound stream of a connection, a
//! pending write, and payloads retained by decoded frames.
//!
//! ```text
//!            running_index
//!   view 0   [......#####]            start..end of segment A
//!   view 1   [###########]            whole segment B
//!   view 2   [#####______]            segment C, tail writable region
//!                 ^ end   ^ capacity
//! ```
//!
//! Each view records the stream offset of its first readable byte
//! (`running_index`), so a logical offset maps to a segment by binary search
//! instead of a walk. Views are contiguous:
//! `views[i + 1].running_index == views[i].running_index + views[i].len()`.
//!
//! [`BufferArena`] is the writer side (acquire / commit / advance / detach),
//! [`ChainRef`] is a borrowed read view of committed data, and
//! [`BufferChain`] is an owned, independently releasable range.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default segment capacity (8 KiB).
pub const DEFAULT_SEGMENT_SIZE: usize = 8 * 1024;

/// Default number of idle blocks a pool keeps for reuse.
pub const DEFAULT_MAX_IDLE_SEGMENTS: usize = 64;

/// Payloads shorter than this are copied instead of pinning a segment.
const INLINE_COPY_THRESHOLD: usize = 64;

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks allocated from the heap.
    pub allocated: u64,
    /// Rentals served from the idle list.
    pub reused: u64,
    /// Blocks handed back at reference count zero.
    pub returned: u64,
    /// Blocks currently idle in the pool.
    pub idle: usize,
}

impl PoolStats {
    /// Number of rented segments not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.allocated + self.reused - self.returned
    }
}

struct PoolShared {
    segment_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    next_id: AtomicU64,
    allocated: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
}

impl PoolShared {
    fn give_back(&self, block: Box<[u8]>) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(block);
        }
    }
}

/// A pool of fixed-capacity byte blocks.
///
/// Cloning the pool is cheap and shares the same idle list.
#[derive(Clone)]
pub struct SegmentPool {
    shared: Arc<PoolShared>,
}

impl SegmentPool {
    /// Creates a pool handing out segments of `segment_size` bytes.
    pub fn new(segment_size: usize) -> Self {
        Self::with_max_idle(segment_size, DEFAULT_MAX_IDLE_SEGMENTS)
    }

    /// Creates a pool that keeps at most `max_idle` blocks for reuse.
    pub fn with_max_idle(segment_size: usize, max_idle: usize) -> Self {
        assert!(segment_size > 0, "segment size must be non-zero");
        Self {
            shared: Arc::new(PoolShared {
                segment_size,
                max_idle,
                idle: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                returned: AtomicU64::new(0),
            }),
        }
    }

    /// Capacity of every segment rented from this pool.
    pub fn segment_size(&self) -> usize {
        self.shared.segment_size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            returned: self.shared.returned.load(Ordering::Relaxed),
            idle: self.shared.idle.lock().len(),
        }
    }

    /// Rents a segment with a reference count of one.
    pub(crate) fn rent(&self) -> Arc<Segment> {
        let recycled = self.shared.idle.lock().pop();
        let block = match recycled {
            Some(block) => {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                block
            }
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.shared.segment_size].into_boxed_slice()
            }
        };
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Segment::new(id, block, self.shared.clone()))
    }
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_SIZE)
    }
}

impl fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentPool")
            .field("segment_size", &self.shared.segment_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A pooled block with an explicit reference count.
///
/// The block pointer is swapped to null when the count reaches zero and the
/// block is handed back to the pool; any later access is a fatal error.
pub struct Segment {
    id: u64,
    capacity: usize,
    block: AtomicPtr<u8>,
    refs: AtomicUsize,
    pool: Arc<PoolShared>,
}

impl Segment {
    fn new(id: u64, block: Box<[u8]>, pool: Arc<PoolShared>) -> Self {
        let capacity = block.len();
        let raw = Box::into_raw(block).cast::<u8>();
        Self {
            id,
            capacity,
            block: AtomicPtr::new(raw),
            refs: AtomicUsize::new(1),
            pool,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Returns true once the block went back to the pool.
    pub fn is_released(&self) -> bool {
        self.block.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn retain(&self) {
        let previous = self.refs.fetch_add(1, Ordering::AcqRel);
        assert!(
            previous > 0,
            "segment {} retained after it was released",
            self.id
        );
    }

    pub(crate) fn release(&self) {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                panic!(
                    "segment {} released more times than it was retained",
                    self.id
                );
            }
            match self.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == 1 {
            if let Some(block) = self.take_block() {
                self.pool.give_back(block);
            }
        }
    }

    fn take_block(&self) -> Option<Box<[u8]>> {
        let raw = self.block.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return None;
        }
        // SAFETY: `raw` came from `Box::into_raw` on a slice of `capacity`
        // bytes and the swap above guarantees it is reclaimed only once.
        Some(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(raw, self.capacity)) })
    }

    fn base(&self) -> *mut u8 {
        let raw = self.block.load(Ordering::Acquire);
        assert!(
            !raw.is_null(),
            "segment {} accessed after it was released",
            self.id
        );
        raw
    }

    /// Committed bytes `[start, end)`.
    ///
    /// Only committed ranges are read; the owning arena writes exclusively
    /// beyond the committed end.
    pub(crate) fn bytes(&self, start: usize, end: usize) -> &[u8] {
        assert!(start <= end && end <= self.capacity);
        // SAFETY: the range is in bounds and committed, so nobody writes it.
        unsafe { std::slice::from_raw_parts(self.base().add(start), end - start) }
    }

    /// Uncommitted bytes `[start, end)`.
    ///
    /// # Safety
    ///
    /// The caller must be the single writer of this segment and the range
    /// must lie past every committed byte.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, start: usize, end: usize) -> &mut [u8] {
        assert!(start <= end && end <= self.capacity);
        std::slice::from_raw_parts_mut(self.base().add(start), end - start)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Reached only if a holder unwound without releasing; free the block
        // rather than returning a block of unknown state to the pool.
        drop(self.take_block());
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// One reference to a committed range of a segment.
///
/// Holding a view holds one reference count; dropping it releases it.
pub(crate) struct SegmentView {
    segment: Arc<Segment>,
    start: usize,
    end: usize,
    running_index: u64,
}

impl SegmentView {
    /// Wraps a freshly rented segment (count already one).
    fn rented(segment: Arc<Segment>, running_index: u64) -> Self {
        Self {
            segment,
            start: 0,
            end: 0,
            running_index,
        }
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn end_index(&self) -> u64 {
        self.running_index + self.len() as u64
    }

    pub(crate) fn data(&self) -> &[u8] {
        self.segment.bytes(self.start, self.end)
    }

    /// A second reference to `[start, end)` of the same segment.
    fn share(&self, start: usize, end: usize, running_index: u64) -> Self {
        self.segment.retain();
        Self {
            segment: self.segment.clone(),
            start,
            end,
            running_index,
        }
    }
}

impl Drop for SegmentView {
    fn drop(&mut self) {
        self.segment.release();
    }
}

impl fmt::Debug for SegmentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentView")
            .field("segment", &self.segment.id())
            .field("start", &self.start)
            .field("end", &self.end)
            .field("running_index", &self.running_index)
            .finish()
    }
}

/// Owner type that lets a segment range back a [`Bytes`] without copying.
struct SegmentSlice(SegmentView);

impl AsRef<[u8]> for SegmentSlice {
    fn as_ref(&self) -> &[u8] {
        self.0.data()
    }
}

/// Growable byte stream over pooled segments.
///
/// Writers `acquire` a contiguous region, fill it, then `commit` what they
/// wrote. Readers look at the committed bytes through [`readable`] and drop
/// them with `advance`. [`detach`] moves everything committed into an
/// independent [`BufferChain`].
///
/// [`readable`]: BufferArena::readable
/// [`detach`]: BufferArena::detach
#[derive(Debug)]
pub struct BufferArena {
    pool: SegmentPool,
    views: Vec<SegmentView>,
    len: usize,
    acquired: usize,
    next_index: u64,
}

impl BufferArena {
    pub fn new(pool: SegmentPool) -> Self {
        Self {
            pool,
            views: Vec::new(),
            len: 0,
            acquired: 0,
            next_index: 0,
        }
    }

    /// Creates an arena over a private pool.
    pub fn with_segment_size(segment_size: usize) -> Self {
        Self::new(SegmentPool::new(segment_size))
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Committed, not yet advanced bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes handed out by the last `acquire` and not committed yet.
    pub fn acquired(&self) -> usize {
        self.acquired
    }

    pub fn segment_count(&self) -> usize {
        self.views.len()
    }

    /// Returns a writable region of at least `min(size_hint, capacity)` bytes.
    ///
    /// The region is never empty. A new segment is rented when the current
    /// tail cannot hold the requested size.
    pub fn acquire(&mut self, size_hint: usize) -> &mut [u8] {
        let capacity = self.pool.segment_size();
        let wanted = size_hint.clamp(1, capacity);

        let tail_fits = self
            .views
            .last()
            .is_some_and(|tail| capacity - tail.end >= wanted);
        if !tail_fits {
            if self.views.last().is_some_and(SegmentView::is_empty) {
                self.views.pop();
            }
            let segment = self.pool.rent();
            self.views
                .push(SegmentView::rented(segment, self.next_index));
        }

        let tail = self.views.last().expect("arena has a tail segment");
        self.acquired = capacity - tail.end;
        // SAFETY: [end, capacity) of the tail is uncommitted and this arena
        // is its only writer.
        unsafe { tail.segment.bytes_mut(tail.end, capacity) }
    }

    /// Marks the first `n` bytes of the acquired region as readable.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the acquired region.
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.acquired,
            "commit of {} bytes exceeds the {} acquired bytes",
            n,
            self.acquired
        );
        if n == 0 {
            return;
        }
        let tail = self.views.last_mut().expect("acquired region has a segment");
        tail.end += n;
        self.acquired -= n;
        self.len += n;
        self.next_index += n as u64;
    }

    /// Drops the first `n` committed bytes.
    ///
    /// Fully consumed segments are released; the writable tail is kept.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the committed length.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.len,
            "advance of {} bytes past the {} committed bytes",
            n,
            self.len
        );
        let capacity = self.pool.segment_size();
        let view_count = self.views.len();
        let mut remaining = n;
        let mut drop_count = 0;

        for (idx, view) in self.views.iter_mut().enumerate() {
            let step = remaining.min(view.len());
            view.start += step;
            view.running_index += step as u64;
            remaining -= step;

            let is_tail = idx + 1 == view_count;
            if view.is_empty() && (!is_tail || view.end == capacity) {
                drop_count = idx + 1;
            } else if remaining == 0 {
                break;
            }
        }
        // Fully consumed views form a prefix.
        self.views.drain(..drop_count);
        self.len -= n;
    }

    /// Borrowed view of the committed bytes.
    pub fn readable(&self) -> ChainRef<'_> {
        ChainRef {
            views: &self.views,
            len: self.len,
        }
    }

    /// Copies `data` into the arena, renting segments as needed.
    pub fn write_slice(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let region = self.acquire(data.len());
            let n = region.len().min(data.len());
            region[..n].copy_from_slice(&data[..n]);
            self.commit(n);
            data = &data[n..];
        }
    }

    /// Moves every committed byte into an independent chain and resets the
    /// arena.
    ///
    /// A tail segment with free space stays in the arena for further writes;
    /// it is then shared with the returned chain.
    pub fn detach(&mut self) -> BufferChain {
        let capacity = self.pool.segment_size();
        let mut views = std::mem::take(&mut self.views);

        if let Some(tail) = views.last() {
            if tail.end < capacity {
                let index = tail.end_index();
                self.views.push(tail.share(tail.end, tail.end, index));
            }
        }
        views.retain(|view| !view.is_empty());

        let len = std::mem::replace(&mut self.len, 0);
        self.acquired = 0;
        BufferChain::from_views(views, len)
    }

    /// Releases every segment.
    pub fn clear(&mut self) {
        self.views.clear();
        self.len = 0;
        self.acquired = 0;
    }
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new(SegmentPool::default())
    }
}

/// Borrowed view of committed bytes spread over segments.
///
/// Offsets are logical: `0` is the first readable byte.
#[derive(Clone, Copy)]
pub struct ChainRef<'a> {
    views: &'a [SegmentView],
    len: usize,
}

impl<'a> ChainRef<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base(&self) -> u64 {
        self.views.first().map_or(0, |view| view.running_index)
    }

    /// Non-empty contiguous pieces in order.
    pub fn chunks(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.views
            .iter()
            .map(SegmentView::data)
            .filter(|chunk| !chunk.is_empty())
    }

    /// The first contiguous piece (empty if there is no data).
    pub fn first_chunk(&self) -> &'a [u8] {
        self.chunks().next().unwrap_or(&[])
    }

    /// Maps a logical offset to (view index, offset inside the view).
    fn locate(&self, offset: usize) -> Option<(usize, usize)> {
        if offset >= self.len {
            return None;
        }
        let target = self.base() + offset as u64;
        let idx = self
            .views
            .partition_point(|view| view.end_index() <= target);
        let view = self.views.get(idx)?;
        Some((idx, (target - view.running_index) as usize))
    }

    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        let (idx, inner) = self.locate(offset)?;
        Some(self.views[idx].data()[inner])
    }

    /// Position of the first `byte` at or after `from`.
    pub fn find_byte(&self, from: usize, byte: u8) -> Option<usize> {
        let (first, inner) = self.locate(from)?;
        let mut logical = from - inner;
        for (idx, view) in self.views[first..].iter().enumerate() {
            let data = view.data();
            let skip = if idx == 0 { inner } else { 0 };
            if let Some(pos) = memchr::memchr(byte, &data[skip..]) {
                return Some(logical + skip + pos);
            }
            logical += data.len();
        }
        None
    }

    /// Copies `dst.len()` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn copy_to_slice(&self, offset: usize, dst: &mut [u8]) {
        assert!(
            offset + dst.len() <= self.len,
            "copy of {}..{} out of {} bytes",
            offset,
            offset + dst.len(),
            self.len
        );
        if dst.is_empty() {
            return;
        }
        let (first, inner) = self.locate(offset).expect("offset in bounds");
        let mut written = 0;
        for (idx, view) in self.views[first..].iter().enumerate() {
            let data = view.data();
            let skip = if idx == 0 { inner } else { 0 };
            let n = (data.len() - skip).min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&data[skip..skip + n]);
            written += n;
            if written == dst.len() {
                break;
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.copy_to_slice(0, &mut out);
        out
    }

    /// `len` bytes at `offset` as [`Bytes`].
    ///
    /// A range inside one segment is shared without copying; short or
    /// segment-spanning ranges are copied.
    pub fn slice_bytes(&self, offset: usize, len: usize) -> Bytes {
        assert!(offset + len <= self.len, "slice out of bounds");
        if len == 0 {
            return Bytes::new();
        }
        let (idx, inner) = self.locate(offset).expect("offset in bounds");
        let view = &self.views[idx];
        if len >= INLINE_COPY_THRESHOLD && inner + len <= view.len() {
            let start = view.start + inner;
            let shared = view.share(start, start + len, view.running_index + inner as u64);
            return Bytes::from_owner(SegmentSlice(shared));
        }
        let mut out = vec![0u8; len];
        self.copy_to_slice(offset, &mut out);
        Bytes::from(out)
    }

    /// Retained sub-chain covering `len` bytes at `offset`.
    pub fn to_chain(&self, offset: usize, len: usize) -> BufferChain {
        assert!(offset + len <= self.len, "chain range out of bounds");
        let mut views = Vec::new();
        let mut remaining = len;
        if let Some((first, inner)) = self.locate(offset) {
            for (idx, view) in self.views[first..].iter().enumerate() {
                if remaining == 0 {
                    break;
                }
                let skip = if idx == 0 { inner } else { 0 };
                let n = (view.len() - skip).min(remaining);
                if n > 0 {
                    let start = view.start + skip;
                    views.push(view.share(start, start + n, view.running_index + skip as u64));
                }
                remaining -= n;
            }
        }
        BufferChain::from_views(views, len)
    }
}

impl fmt::Debug for ChainRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRef")
            .field("len", &self.len)
            .field("segments", &self.views.len())
            .finish()
    }
}

/// An owned range of pooled bytes.
///
/// Cloning retains every segment; dropping releases them.
#[derive(Debug, Default)]
pub struct BufferChain {
    views: Vec<SegmentView>,
    len: usize,
}

impl BufferChain {
    /// Builds a chain and rebases running indices to start at zero.
    fn from_views(mut views: Vec<SegmentView>, len: usize) -> Self {
        let mut index = 0u64;
        for view in &mut views {
            view.running_index = index;
            index += view.len() as u64;
        }
        debug_assert_eq!(index as usize, len);
        Self { views, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.views.len()
    }

    pub fn view(&self) -> ChainRef<'_> {
        ChainRef {
            views: &self.views,
            len: self.len,
        }
    }

    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.views.iter().map(SegmentView::data)
    }

    /// Another owner of the same bytes.
    pub fn retain(&self) -> BufferChain {
        self.clone()
    }

    /// Gives up this owner's references.
    pub fn release(self) {
        drop(self);
    }

    /// Drops the first `n` bytes, releasing fully consumed segments.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.len,
            "advance of {} bytes past the {} bytes of the chain",
            n,
            self.len
        );
        let mut remaining = n;
        let mut drop_count = 0;
        for view in &mut self.views {
            if remaining == 0 {
                break;
            }
            let step = remaining.min(view.len());
            view.start += step;
            view.running_index += step as u64;
            remaining -= step;
            if view.is_empty() {
                drop_count += 1;
            }
        }
        self.views.drain(..drop_count);
        self.len -= n;
    }

    /// Keeps the first `len` bytes, releasing segments past the new end.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let mut kept = 0usize;
        let mut keep_views = 0;
        for view in &mut self.views {
            if kept == len {
                break;
            }
            let n = view.len().min(len - kept);
            view.end = view.start + n;
            kept += n;
            keep_views += 1;
        }
        self.views.truncate(keep_views);
        self.len = len;
    }

    /// Contiguous copy of the chain, shared without copying when it spans a
    /// single segment.
    pub fn to_bytes(&self) -> Bytes {
        self.view().slice_bytes(0, self.len)
    }

    #[cfg(test)]
    fn running_indices_consistent(&self) -> bool {
        self.views
            .windows(2)
            .all(|pair| pair[1].running_index == pair[0].end_index())
    }
}

impl Clone for BufferChain {
    fn clone(&self) -> Self {
        let views = self
            .views
            .iter()
            .map(|view| view.share(view.start, view.end, view.running_index))
            .collect();
        Self {
            views,
            len: self.len,
        }
    }
}

impl PartialEq for BufferChain {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.view().to_vec() == other.view().to_vec()
    }
}
