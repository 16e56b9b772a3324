//! Packet buffer pool shared by all forwarding cores
//!
//! Pre-allocates every packet buffer up front (hugepages if available) and
//! hands them out through a lock-free free list of buffer indices. A pool
//! lives for the rest of the process once created, so buffers carry a plain
//! `&'static` back-reference instead of a shared reference count.

use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use thiserror::Error;

/// Headroom reserved in front of every frame
pub const HEADROOM: usize = 128;

/// Default data room per buffer (fits a standard 1518 byte frame)
pub const DEFAULT_DATA_ROOM: usize = 2048;

/// Upper bound for the per-core cache size
pub const MAX_CACHE_SIZE: usize = 512;

/// 2MB hugepage size used to round up hugepage mappings
const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Buffer pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool capacity must be between 1 and {max}, got {capacity}")]
    InvalidCapacity { capacity: usize, max: usize },

    #[error("cache size {cache_size} too large for pool of {capacity} buffers")]
    InvalidCacheSize { cache_size: usize, capacity: usize },

    #[error("data room must be at least {min} bytes, got {data_room}")]
    InvalidDataRoom { data_room: usize, min: usize },

    #[error("failed to map {size} bytes for buffer pool: {source}")]
    Mmap {
        size: usize,
        #[source]
        source: nix::Error,
    },
}

/// Pool dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Total number of buffers
    pub capacity: usize,
    /// Per-core cache size (0 disables caching)
    pub cache_size: usize,
    /// Bytes available for frame data in each buffer (excluding headroom)
    pub data_room: usize,
}

impl PoolConfig {
    pub fn new(capacity: usize, cache_size: usize) -> Self {
        Self {
            capacity,
            cache_size,
            data_room: DEFAULT_DATA_ROOM,
        }
    }

    /// Size of one buffer slot including headroom
    pub fn buffer_size(&self) -> usize {
        HEADROOM.saturating_add(self.data_room)
    }

    fn validate(&self) -> Result<(), PoolError> {
        // Slot indices are u32 and the whole pool must fit one mapping
        let max = (u32::MAX as usize).min(usize::MAX / self.buffer_size());
        if self.capacity == 0 || self.capacity > max {
            return Err(PoolError::InvalidCapacity {
                capacity: self.capacity,
                max,
            });
        }
        // Same bound a mempool applies: caches may hold at most 2/3 of the pool
        if self.cache_size > MAX_CACHE_SIZE || self.cache_size * 3 > self.capacity * 2 {
            return Err(PoolError::InvalidCacheSize {
                cache_size: self.cache_size,
                capacity: self.capacity,
            });
        }
        if self.data_room < 64 {
            return Err(PoolError::InvalidDataRoom {
                data_room: self.data_room,
                min: 64,
            });
        }
        Ok(())
    }
}

/// Memory-mapped buffer pool
///
/// Provides lock-free allocation and deallocation of fixed-size buffers.
/// Individual buffers are owned by exactly one [`PoolBuffer`] at a time.
pub struct BufferPool {
    /// Base pointer to mmap'd region
    base: NonNull<u8>,
    /// Total size of mapped region
    size: usize,
    config: PoolConfig,
    /// Free list (lock-free queue of buffer indices)
    free: ArrayQueue<u32>,
    using_hugepages: bool,
}

// SAFETY: the mapping is process-global, each buffer slot is only touched
// through the PoolBuffer that owns its index, and ArrayQueue is thread-safe.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a buffer pool that lives for the rest of the process.
    ///
    /// Attempts to use 2MB hugepages for better TLB performance and falls
    /// back to regular pages if hugepages are not available.
    pub fn create(config: PoolConfig) -> Result<&'static BufferPool, PoolError> {
        config.validate()?;

        let size = config
            .capacity
            .checked_mul(config.buffer_size())
            .ok_or(PoolError::InvalidCapacity {
                capacity: config.capacity,
                max: usize::MAX / config.buffer_size(),
            })?;
        let (base, mapped, using_hugepages) = match Self::mmap_hugepages(size) {
            Ok((ptr, mapped)) => (ptr, mapped, true),
            Err(_) => {
                let ptr = Self::mmap_regular(size)
                    .map_err(|source| PoolError::Mmap { size, source })?;
                (ptr, size, false)
            }
        };

        let free = ArrayQueue::new(config.capacity);
        for i in 0..config.capacity {
            // ArrayQueue::push only fails if full, which can't happen here
            let _ = free.push(i as u32);
        }

        tracing::info!(
            buffers = config.capacity,
            buffer_size = config.buffer_size(),
            cache_size = config.cache_size,
            pool_size_kb = mapped / 1024,
            hugepages = using_hugepages,
            "Buffer pool created"
        );

        Ok(Box::leak(Box::new(BufferPool {
            base,
            size: mapped,
            config,
            free,
            using_hugepages,
        })))
    }

    fn mmap_hugepages(size: usize) -> nix::Result<(NonNull<u8>, usize)> {
        let mapped = size.div_ceil(HUGEPAGE_SIZE) * HUGEPAGE_SIZE;
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;
        let len = NonZeroUsize::new(mapped).ok_or(nix::Error::EINVAL)?;
        let ptr = unsafe {
            mmap_anonymous(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, flags)?
        };
        Ok((ptr.cast(), mapped))
    }

    fn mmap_regular(size: usize) -> nix::Result<NonNull<u8>> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        let len = NonZeroUsize::new(size).ok_or(nix::Error::EINVAL)?;
        let ptr = unsafe {
            mmap_anonymous(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, flags)?
        };
        Ok(ptr.cast())
    }

    /// Allocate a buffer straight from the shared free list
    ///
    /// Returns `None` if the pool is exhausted.
    #[inline]
    pub fn alloc(&'static self) -> Option<PoolBuffer> {
        self.free.pop().map(|index| PoolBuffer::new(self, index))
    }

    /// Number of buffers currently on the shared free list
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn cache_size(&self) -> usize {
        self.config.cache_size
    }

    pub fn data_room(&self) -> usize {
        self.config.data_room
    }

    pub fn using_hugepages(&self) -> bool {
        self.using_hugepages
    }

    /// Raw pointer to the start of the slot at `index` (headroom included)
    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index is always < capacity (enforced by ArrayQueue contents)
        unsafe {
            self.base
                .as_ptr()
                .add(index as usize * self.config.buffer_size())
        }
    }

    #[inline]
    fn return_index(&self, index: u32) {
        // Only fails if full, which can't happen for an index we handed out
        let _ = self.free.push(index);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.config.capacity)
            .field("available", &self.available())
            .field("data_room", &self.config.data_room)
            .field("hugepages", &self.using_hugepages)
            .finish()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: self.base was mapped in create() with self.size bytes
        unsafe {
            let _ = munmap(self.base.cast(), self.size);
        }
    }
}

/// A packet buffer owned from the pool
///
/// Returns to the pool when dropped or explicitly [`free`](Self::free)d.
pub struct PoolBuffer {
    pool: &'static BufferPool,
    index: u32,
    /// Length of valid frame data after the headroom
    len: usize,
}

impl PoolBuffer {
    #[inline]
    fn new(pool: &'static BufferPool, index: u32) -> Self {
        Self { pool, index, len: 0 }
    }

    /// Index of this buffer's slot within its pool
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the length of valid frame data
    ///
    /// # Panics
    /// Panics if `len` exceeds the pool's data room.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.pool.data_room(), "frame exceeds data room");
        self.len = len;
    }

    /// Frame bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: len never exceeds the data room, and this buffer owns its slot
        unsafe { std::slice::from_raw_parts(self.pool.slot_ptr(self.index).add(HEADROOM), self.len) }
    }

    /// Mutable frame bytes
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: len never exceeds the data room, and this buffer owns its slot
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.slot_ptr(self.index).add(HEADROOM), self.len)
        }
    }

    /// The whole data room, for receiving a frame into
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        // SAFETY: the data room is within this buffer's slot
        unsafe {
            std::slice::from_raw_parts_mut(
                self.pool.slot_ptr(self.index).add(HEADROOM),
                self.pool.data_room(),
            )
        }
    }

    /// Copy `frame` into the buffer, truncating to the data room
    pub fn fill(&mut self, frame: &[u8]) -> usize {
        let n = frame.len().min(self.pool.data_room());
        self.write_area()[..n].copy_from_slice(&frame[..n]);
        self.len = n;
        n
    }

    /// Release the buffer back to its pool
    #[inline]
    pub fn free(self) {
        drop(self);
    }

    /// Give up ownership without returning the slot to the free list
    #[inline]
    fn into_index(self) -> u32 {
        let this = ManuallyDrop::new(self);
        this.index
    }

    #[inline]
    fn belongs_to(&self, pool: &BufferPool) -> bool {
        std::ptr::eq(self.pool, pool)
    }
}

impl Drop for PoolBuffer {
    #[inline]
    fn drop(&mut self) {
        self.pool.return_index(self.index);
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

/// Per-core allocation cache in front of the shared free list
///
/// Refills `cache_size` indices at a time so a receive burst touches the
/// shared free list once per refill instead of once per buffer. Owned by a
/// single receive queue, never shared.
pub struct PoolCache {
    pool: &'static BufferPool,
    slots: Vec<u32>,
}

impl PoolCache {
    pub fn new(pool: &'static BufferPool) -> Self {
        Self {
            pool,
            slots: Vec::with_capacity(pool.cache_size()),
        }
    }

    pub fn pool(&self) -> &'static BufferPool {
        self.pool
    }

    /// Number of buffers parked in this cache
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn alloc(&mut self) -> Option<PoolBuffer> {
        let size = self.pool.cache_size();
        if size == 0 {
            return self.pool.alloc();
        }
        if self.slots.is_empty() {
            while self.slots.len() < size {
                match self.pool.free.pop() {
                    Some(index) => self.slots.push(index),
                    None => break,
                }
            }
        }
        self.slots
            .pop()
            .map(|index| PoolBuffer::new(self.pool, index))
    }

    /// Park an unused buffer in the cache (or return it to the pool when full)
    #[inline]
    pub fn put(&mut self, buf: PoolBuffer) {
        if buf.belongs_to(self.pool) && self.slots.len() < self.pool.cache_size() {
            self.slots.push(buf.into_index());
        }
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        for index in self.slots.drain(..) {
            self.pool.return_index(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(capacity: usize, cache_size: usize) -> &'static BufferPool {
        BufferPool::create(PoolConfig::new(capacity, cache_size)).expect("Failed to create pool")
    }

    #[test]
    fn test_pool_creation() {
        let pool = small_pool(64, 0);
        assert_eq!(pool.available(), 64);
        assert_eq!(pool.capacity(), 64);
    }

    #[test]
    fn test_buffer_alloc_and_drop() {
        let pool = small_pool(16, 0);

        let initial = pool.available();
        {
            let _buf = pool.alloc().expect("Failed to alloc");
            assert_eq!(pool.available(), initial - 1);
        }
        // Buffer returned on drop
        assert_eq!(pool.available(), initial);
    }

    #[test]
    fn test_explicit_free() {
        let pool = small_pool(16, 0);
        let buf = pool.alloc().unwrap();
        assert_eq!(pool.available(), 15);
        buf.free();
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn test_buffer_fill_and_read() {
        let pool = small_pool(16, 0);
        let mut buf = pool.alloc().expect("Failed to alloc");

        assert_eq!(buf.fill(b"hello"), 5);
        assert_eq!(buf.data(), b"hello");

        buf.data_mut()[0] = b'j';
        assert_eq!(buf.data(), b"jello");
    }

    #[test]
    fn test_fill_truncates_to_data_room() {
        let pool = small_pool(4, 0);
        let mut buf = pool.alloc().unwrap();
        let frame = vec![0xab; DEFAULT_DATA_ROOM + 100];
        assert_eq!(buf.fill(&frame), DEFAULT_DATA_ROOM);
        assert_eq!(buf.len(), DEFAULT_DATA_ROOM);
    }

    #[test]
    fn test_buffers_do_not_overlap() {
        let pool = small_pool(4, 0);
        let mut a = pool.alloc().unwrap();
        let mut b = pool.alloc().unwrap();
        a.fill(&[0x11; DEFAULT_DATA_ROOM]);
        b.fill(&[0x22; DEFAULT_DATA_ROOM]);
        assert!(a.data().iter().all(|&x| x == 0x11));
        assert!(b.data().iter().all(|&x| x == 0x22));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = small_pool(8, 0);
        let mut buffers = Vec::new();

        for _ in 0..8 {
            buffers.push(pool.alloc().expect("Should be able to alloc"));
        }

        assert!(pool.alloc().is_none());
        assert_eq!(pool.available(), 0);

        buffers.pop();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            BufferPool::create(PoolConfig::new(0, 0)),
            Err(PoolError::InvalidCapacity { .. })
        ));
        assert!(matches!(
            BufferPool::create(PoolConfig::new(100, 100)),
            Err(PoolError::InvalidCacheSize { .. })
        ));
        assert!(matches!(
            BufferPool::create(PoolConfig::new(10_000, MAX_CACHE_SIZE + 1)),
            Err(PoolError::InvalidCacheSize { .. })
        ));
        let mut config = PoolConfig::new(8, 0);
        config.data_room = 10;
        assert!(matches!(
            BufferPool::create(config),
            Err(PoolError::InvalidDataRoom { .. })
        ));
    }

    #[test]
    fn test_pool_size_overflow_rejected() {
        let mut config = PoolConfig::new(u32::MAX as usize, 0);
        config.data_room = usize::MAX / 2;
        assert!(matches!(
            BufferPool::create(config),
            Err(PoolError::InvalidCapacity { .. })
        ));

        config.data_room = usize::MAX;
        assert_eq!(config.buffer_size(), usize::MAX);
        assert!(matches!(
            BufferPool::create(config),
            Err(PoolError::InvalidCapacity { max: 1, .. })
        ));
    }

    #[test]
    fn test_pool_debug() {
        let pool = small_pool(8, 0);
        let _buf = pool.alloc().unwrap();
        let text = format!("{pool:?}");
        assert!(text.contains("capacity: 8"));
        assert!(text.contains("available: 7"));
    }

    #[test]
    fn test_cache_refills_in_bulk() {
        let pool = small_pool(64, 8);
        let mut cache = PoolCache::new(pool);

        let buf = cache.alloc().unwrap();
        // One refill pulled a whole cache worth of indices off the free list
        assert_eq!(pool.available(), 64 - 8);
        assert_eq!(cache.len(), 7);

        cache.put(buf);
        assert_eq!(cache.len(), 8);
        assert_eq!(pool.available(), 56);

        drop(cache);
        assert_eq!(pool.available(), 64);
    }

    #[test]
    fn test_cache_put_when_full_returns_to_pool() {
        let pool = small_pool(64, 4);
        let mut cache = PoolCache::new(pool);
        let extra = pool.alloc().unwrap();
        let _first = cache.alloc().unwrap();
        let second = cache.alloc().unwrap();
        cache.put(second);
        assert_eq!(cache.len(), 3);
        cache.put(pool.alloc().unwrap());
        assert_eq!(cache.len(), 4);

        let before = pool.available();
        cache.put(extra);
        assert_eq!(cache.len(), 4);
        assert_eq!(pool.available(), before + 1);
    }

    #[test]
    fn test_cache_disabled_allocates_directly() {
        let pool = small_pool(8, 0);
        let mut cache = PoolCache::new(pool);
        let _buf = cache.alloc().unwrap();
        assert_eq!(pool.available(), 7);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_buffer_send_across_threads() {
        let pool = small_pool(4, 0);
        let mut buf = pool.alloc().expect("Failed to alloc");
        buf.fill(b"hello");

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            tx.send(buf).unwrap();
        });

        let received = rx.recv().unwrap();
        assert_eq!(received.data(), b"hello");
    }
}
