//! Offset-based allocation inside a pool
//!
//! An allocator manages the bytes of a [`Pool`] beyond the pool header and
//! hands out offsets, never pointers, so every attached process sees the
//! same structure. Block metadata lives inline in the pool immediately
//! before the user data; there is no side table outside the segment.
//!
//! # Design
//!
//! [`SimpleAllocator`] keeps a doubly-linked list of *allocated* blocks in
//! address order (`head`/`tail` in its header). Free space is simply the
//! gaps between consecutive blocks, so freeing a block needs no explicit
//! coalescing: adjacent gaps are one gap. Allocation is a first-fit scan
//! over the gaps; when nothing fits, the allocator grows the pool and
//! retries.

use crate::error::{Error, Result};
use crate::pool::{Pool, POOL_HEADER_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Allocation interface over a pool.
///
/// Exactly one allocator discipline manages a given pool; this trait is the
/// seam where alternative disciplines (e.g. segregated free lists) plug in.
pub trait Allocator {
    /// The pool this allocator manages
    fn pool(&self) -> &Arc<Pool>;

    /// Allocate a block of at least `size` usable bytes, growing the pool
    /// if necessary. Returns the offset of the usable bytes.
    fn allocate(&self, size: usize) -> Result<u64>;

    /// Release a block previously returned by [`allocate`](Self::allocate)
    fn free(&self, offset: u64) -> Result<()>;

    /// Usable size of an allocated block, exactly as requested
    fn block_size(&self, offset: u64) -> Result<usize>;

    /// Record the offset of a consumer's root object; set once, stable
    /// across re-attachment
    fn set_base_object_offset(&self, offset: u64);

    /// The recorded root object offset, or 0 if none has been set
    fn base_object_offset(&self) -> u64;

    /// Sum of the requested sizes of all live blocks
    fn bytes_allocated(&self) -> u64;

    /// Bytes available for future allocations in the current segment
    fn bytes_free(&self) -> u64;

    /// Walk the block structure and check its integrity
    fn verify(&self) -> Result<()>;
}

/// Allocator state, stored in the pool directly after the pool header
#[repr(C)]
struct AllocatorData {
    /// Init handshake: 0 = untouched, 1 = initializing, 2 = ready
    initialized: AtomicU64,
    base_object_offset: AtomicU64,
    /// Sum of requested block sizes
    bytes_allocated: AtomicU64,
    /// Sum of effective block sizes (metadata + alignment included)
    bytes_committed: AtomicU64,
    /// First allocated block in address order, 0 if none
    head: AtomicU64,
    /// Last allocated block in address order, 0 if none
    tail: AtomicU64,
}

const DATA_OFFSET: u64 = POOL_HEADER_SIZE;

/// Offset of the first allocatable byte
const ARENA_BASE: u64 = DATA_OFFSET + std::mem::size_of::<AllocatorData>() as u64;

const UNINITIALIZED: u64 = 0;
const INITIALIZING: u64 = 1;
const READY: u64 = 2;

/// Metadata prefix of every block, linking the allocated-block list
#[repr(C)]
struct BlockHeader {
    prev: u64,
    next: u64,
    /// Requested size, stored verbatim so consumers can recover exact
    /// lengths; alignment only affects placement
    size: u64,
}

const BLOCK_HEADER_SIZE: u64 = std::mem::size_of::<BlockHeader>() as u64;

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Bytes a block occupies in the arena: header plus aligned data
fn effective_size(size: u64) -> u64 {
    BLOCK_HEADER_SIZE + align8(size)
}

/// First-fit allocator over a pool's gap structure
pub struct SimpleAllocator {
    pool: Arc<Pool>,
}

impl SimpleAllocator {
    /// Create the allocator state in `pool`, or attach to it if another
    /// process already created it. Re-attachment is idempotent.
    pub fn new(pool: Arc<Pool>) -> Result<Self> {
        pool.check_size_and_remap()?;
        let alloc = Self { pool };

        let data = alloc.data();
        match data.initialized.compare_exchange(
            UNINITIALIZED,
            INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                data.base_object_offset.store(0, Ordering::Relaxed);
                data.bytes_allocated.store(0, Ordering::Relaxed);
                data.bytes_committed.store(0, Ordering::Relaxed);
                data.head.store(0, Ordering::Relaxed);
                data.tail.store(0, Ordering::Relaxed);
                data.initialized.store(READY, Ordering::Release);
            }
            Err(INITIALIZING) => {
                // Another process is mid-initialization; wait it out.
                while alloc.data().initialized.load(Ordering::Acquire) != READY {
                    std::hint::spin_loop();
                }
            }
            Err(READY) => {}
            Err(_) => return Err(Error::Corruption("allocator init state invalid")),
        }

        Ok(alloc)
    }

    /// The allocator header. The reference is transient: it points into the
    /// current mapping and must not be held across a remap.
    fn data(&self) -> &AllocatorData {
        unsafe { &*self.pool.at::<AllocatorData>(DATA_OFFSET) }
    }

    fn block(&self, offset: u64) -> *mut BlockHeader {
        self.pool.at::<BlockHeader>(offset)
    }

    fn block_effective(&self, offset: u64) -> u64 {
        let size = unsafe { (*self.block(offset)).size };
        effective_size(size)
    }

    /// Where the gap after the last block begins
    fn tail_gap_start(&self) -> u64 {
        let tail = self.data().tail.load(Ordering::Acquire);
        if tail == 0 {
            ARENA_BASE
        } else {
            tail + self.block_effective(tail)
        }
    }

    /// Place a block of `effective` bytes in the first gap that fits.
    /// Returns the user offset, or `None` if no gap is large enough.
    fn try_place(&self, size: u64, effective: u64) -> Option<u64> {
        let data = self.data();
        let tail_start = self.tail_gap_start();

        // The blocks occupy [ARENA_BASE, tail_start) minus the committed
        // bytes, so that difference is the total interior gap space. When
        // it cannot hold the request, no single gap can either, and the
        // scan is skipped entirely.
        let committed = data.bytes_committed.load(Ordering::Acquire);
        let interior_free = (tail_start - ARENA_BASE) - committed;
        if interior_free >= effective {
            let mut prev = 0u64;
            let mut gap_start = ARENA_BASE;
            let mut cur = data.head.load(Ordering::Acquire);

            while cur != 0 {
                if cur - gap_start >= effective {
                    return Some(self.link_block(gap_start, prev, cur, size, effective));
                }
                gap_start = cur + self.block_effective(cur);
                prev = cur;
                cur = unsafe { (*self.block(cur)).next };
            }
        }

        if self.pool.size() - tail_start >= effective {
            let tail = data.tail.load(Ordering::Acquire);
            return Some(self.link_block(tail_start, tail, 0, size, effective));
        }
        None
    }

    fn link_block(&self, offset: u64, prev: u64, next: u64, size: u64, effective: u64) -> u64 {
        unsafe {
            let block = self.block(offset);
            (*block).prev = prev;
            (*block).next = next;
            (*block).size = size;
        }

        let data = self.data();
        if prev == 0 {
            data.head.store(offset, Ordering::Release);
        } else {
            unsafe { (*self.block(prev)).next = offset };
        }
        if next == 0 {
            data.tail.store(offset, Ordering::Release);
        } else {
            unsafe { (*self.block(next)).prev = offset };
        }

        data.bytes_allocated.fetch_add(size, Ordering::AcqRel);
        data.bytes_committed.fetch_add(effective, Ordering::AcqRel);
        offset + BLOCK_HEADER_SIZE
    }
}

impl Allocator for SimpleAllocator {
    fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    fn allocate(&self, size: usize) -> Result<u64> {
        self.pool.check_size_and_remap()?;
        let effective = effective_size(size as u64);

        if let Some(offset) = self.try_place(size as u64, effective) {
            return Ok(offset);
        }

        // No gap fits; grow the pool. Doubling bounds the number of
        // expansions; fall back to the exact shortfall when doubling is
        // past the configured maximum.
        let required = self.tail_gap_start() + effective;
        let doubled = self.pool.size().saturating_mul(2).max(required);
        if let Err(e) = self
            .pool
            .expand(doubled)
            .or_else(|_| self.pool.expand(required))
        {
            debug!(error = %e, requested = size, "pool expansion failed");
            return Err(Error::OutOfMemory { requested: size });
        }

        self.try_place(size as u64, effective)
            .ok_or(Error::OutOfMemory { requested: size })
    }

    fn free(&self, offset: u64) -> Result<()> {
        self.pool.check_size_and_remap()?;
        let block_offset = offset - BLOCK_HEADER_SIZE;
        let (prev, next, size) = unsafe {
            let block = self.block(block_offset);
            ((*block).prev, (*block).next, (*block).size)
        };

        let data = self.data();
        // A block that is not linked where its neighbors say it should be
        // was already freed or never allocated.
        debug_assert!(
            if prev == 0 {
                data.head.load(Ordering::Acquire) == block_offset
            } else {
                unsafe { (*self.block(prev)).next == block_offset }
            },
            "freeing unlinked block at {}",
            offset,
        );
        debug_assert!(
            if next == 0 {
                data.tail.load(Ordering::Acquire) == block_offset
            } else {
                unsafe { (*self.block(next)).prev == block_offset }
            },
            "freeing unlinked block at {}",
            offset,
        );

        if prev == 0 {
            data.head.store(next, Ordering::Release);
        } else {
            unsafe { (*self.block(prev)).next = next };
        }
        if next == 0 {
            data.tail.store(prev, Ordering::Release);
        } else {
            unsafe { (*self.block(next)).prev = prev };
        }

        data.bytes_allocated.fetch_sub(size, Ordering::AcqRel);
        data.bytes_committed
            .fetch_sub(effective_size(size), Ordering::AcqRel);
        Ok(())
    }

    fn block_size(&self, offset: u64) -> Result<usize> {
        self.pool.check_size_and_remap()?;
        let size = unsafe { (*self.block(offset - BLOCK_HEADER_SIZE)).size };
        Ok(size as usize)
    }

    fn set_base_object_offset(&self, offset: u64) {
        self.data()
            .base_object_offset
            .store(offset, Ordering::Release);
    }

    fn base_object_offset(&self) -> u64 {
        self.data().base_object_offset.load(Ordering::Acquire)
    }

    fn bytes_allocated(&self) -> u64 {
        self.data().bytes_allocated.load(Ordering::Acquire)
    }

    fn bytes_free(&self) -> u64 {
        let committed = self.data().bytes_committed.load(Ordering::Acquire);
        self.pool.size() - ARENA_BASE - committed
    }

    fn verify(&self) -> Result<()> {
        self.pool.check_size_and_remap()?;
        let data = self.data();
        let pool_size = self.pool.size();

        let mut prev_seen = 0u64;
        let mut end_of_prev = ARENA_BASE;
        let mut sum_size = 0u64;
        let mut sum_effective = 0u64;
        let mut cur = data.head.load(Ordering::Acquire);

        while cur != 0 {
            if cur < end_of_prev {
                return Err(Error::Corruption("block list not in address order"));
            }
            if cur + BLOCK_HEADER_SIZE > pool_size {
                return Err(Error::Corruption("block header out of bounds"));
            }
            let (prev, next, size) = unsafe {
                let block = self.block(cur);
                ((*block).prev, (*block).next, (*block).size)
            };
            if prev != prev_seen {
                return Err(Error::Corruption("block prev link broken"));
            }
            let effective = effective_size(size);
            if cur + effective > pool_size {
                return Err(Error::Corruption("block extends past pool end"));
            }
            sum_size += size;
            sum_effective += effective;
            end_of_prev = cur + effective;
            prev_seen = cur;
            cur = next;
        }

        if data.tail.load(Ordering::Acquire) != prev_seen {
            return Err(Error::Corruption("tail does not match last block"));
        }
        if data.bytes_allocated.load(Ordering::Acquire) != sum_size {
            return Err(Error::Corruption("bytes_allocated does not match blocks"));
        }
        if data.bytes_committed.load(Ordering::Acquire) != sum_effective {
            return Err(Error::Corruption("bytes_committed does not match blocks"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Backing, PoolOptions};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn file_pool(dir: &tempfile::TempDir) -> Arc<Pool> {
        let path = dir.path().join("pool").to_str().unwrap().to_string();
        Arc::new(
            Pool::open(
                &path,
                PoolOptions {
                    max_size: None,
                    backing: Backing::File,
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_allocate_free_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SimpleAllocator::new(file_pool(&dir)).unwrap();

        assert_eq!(alloc.bytes_allocated(), 0);

        let a = alloc.allocate(100).unwrap();
        let b = alloc.allocate(200).unwrap();
        assert_eq!(alloc.bytes_allocated(), 300);
        assert_eq!(alloc.block_size(a).unwrap(), 100);
        assert_eq!(alloc.block_size(b).unwrap(), 200);

        alloc.free(a).unwrap();
        assert_eq!(alloc.bytes_allocated(), 200);
        alloc.free(b).unwrap();
        assert_eq!(alloc.bytes_allocated(), 0);
        alloc.verify().unwrap();
    }

    #[test]
    fn test_zero_size_block() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SimpleAllocator::new(file_pool(&dir)).unwrap();

        let off = alloc.allocate(0).unwrap();
        assert_eq!(alloc.block_size(off).unwrap(), 0);
        assert_eq!(alloc.bytes_allocated(), 0);
        alloc.free(off).unwrap();
        alloc.verify().unwrap();
    }

    #[test]
    fn test_first_fit_reuses_gap() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SimpleAllocator::new(file_pool(&dir)).unwrap();

        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        let _c = alloc.allocate(64).unwrap();

        alloc.free(b).unwrap();
        let reused = alloc.allocate(64).unwrap();
        assert_eq!(reused, b);

        alloc.free(a).unwrap();
        let reused_first = alloc.allocate(32).unwrap();
        assert_eq!(reused_first, a);
        alloc.verify().unwrap();
    }

    #[test]
    fn test_adjacent_gaps_merge() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = SimpleAllocator::new(file_pool(&dir)).unwrap();

        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        let _guard = alloc.allocate(64).unwrap();

        alloc.free(a).unwrap();
        alloc.free(b).unwrap();

        // The two former blocks form one contiguous gap large enough for a
        // request neither could hold alone.
        let merged = alloc.allocate(150).unwrap();
        assert_eq!(merged, a);
        alloc.verify().unwrap();
    }

    #[test]
    fn test_growth_on_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir);
        let initial_size = pool.size();
        let alloc = SimpleAllocator::new(pool.clone()).unwrap();

        let off = alloc.allocate(64 * 1024).unwrap();
        assert!(pool.size() > initial_size);
        assert_eq!(alloc.block_size(off).unwrap(), 64 * 1024);
        alloc.verify().unwrap();
    }

    #[test]
    fn test_out_of_memory_when_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool").to_str().unwrap().to_string();
        let pool = Arc::new(
            Pool::open(
                &path,
                PoolOptions {
                    max_size: Some(8 * 4096),
                    backing: Backing::File,
                },
            )
            .unwrap(),
        );
        let alloc = SimpleAllocator::new(pool).unwrap();

        let before = alloc.bytes_allocated();
        let err = alloc.allocate(1024 * 1024).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        // A failed allocation leaves the accounting untouched.
        assert_eq!(alloc.bytes_allocated(), before);
        alloc.verify().unwrap();
    }

    #[test]
    fn test_base_object_offset_survives_reattach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool").to_str().unwrap().to_string();
        let options = PoolOptions {
            max_size: None,
            backing: Backing::File,
        };

        let alloc1 =
            SimpleAllocator::new(Arc::new(Pool::open(&path, options.clone()).unwrap())).unwrap();
        assert_eq!(alloc1.base_object_offset(), 0);
        let root = alloc1.allocate(48).unwrap();
        alloc1.set_base_object_offset(root);

        let alloc2 =
            SimpleAllocator::new(Arc::new(Pool::open(&path, options).unwrap())).unwrap();
        assert_eq!(alloc2.base_object_offset(), root);
        assert_eq!(alloc2.block_size(root).unwrap(), 48);
    }

    #[test]
    fn test_randomized_growth_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir);
        let alloc = SimpleAllocator::new(pool.clone()).unwrap();

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut live: Vec<(u64, u64)> = Vec::new();
        let mut total = 0u64;

        while pool.size() < 32 * 1024 * 1024 {
            let size = rng.gen_range(0..=1024usize);
            let off = alloc.allocate(size).unwrap();
            live.push((off, size as u64));
            total += size as u64;
            assert_eq!(alloc.bytes_allocated(), total);
        }
        alloc.verify().unwrap();

        live.shuffle(&mut rng);
        for (off, size) in live {
            alloc.free(off).unwrap();
            total -= size;
            assert_eq!(alloc.bytes_allocated(), total);
        }

        assert_eq!(alloc.bytes_allocated(), 0);
        assert_eq!(alloc.bytes_free(), pool.size() - ARENA_BASE);
        alloc.verify().unwrap();
    }
}
