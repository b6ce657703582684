//! Thread-safe bump arena for runtime metadata.
//!
//! A [`GlobalArena`] hands out stable, properly aligned storage that lives
//! until the arena itself is dropped. The `OxObj` runtime keeps one arena per
//! runtime instance and places class records and interned strings in it, so
//! handles to them can be plain pointers.
//!
//! # Architecture
//!
//! - [`GlobalArena`]: list of chunks plus an atomic "current chunk" pointer
//! - `Chunk`: one system allocation with an atomic bump pointer
//!
//! Allocation never moves existing values. The arena does not run
//! destructors: owners that place `Drop` types in it must drop them in place
//! before the arena goes away.
//!
//! # Examples
//!
//! ```
//! use oxobj_mem::arena::GlobalArena;
//!
//! let arena = GlobalArena::new(16 * 1024);
//! let value = arena.alloc(42u32);
//! let name = arena.alloc_str("NSObject");
//!
//! assert_eq!(*value, 42);
//! assert_eq!(name, "NSObject");
//! ```

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Alignment every chunk is allocated with.
const CHUNK_ALIGNMENT: usize = 16;

/// Minimum chunk size (8 KiB).
const MIN_CHUNK_SIZE: usize = 8 * 1024;

/// Maximum chunk size for regular growth (1 MiB).
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Arena allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes handed out to callers (before padding).
    pub total_allocated: usize,
    /// Number of chunks owned by the arena.
    pub chunk_count: usize,
    /// Sum of chunk capacities in bytes.
    pub total_capacity: usize,
}

/// One system allocation with an atomic bump pointer.
///
/// # Safety
///
/// - memory stays valid until the chunk is dropped
/// - the bump pointer only moves forward, via CAS
struct Chunk {
    start: NonNull<u8>,
    ptr: AtomicPtr<u8>,
    end: usize,
    capacity: usize,
}

impl Chunk {
    fn new(size: usize) -> Box<Self> {
        let layout = Layout::from_size_align(size, CHUNK_ALIGNMENT)
            .unwrap_or_else(|_| panic!("Invalid arena chunk size {size}"));

        // SAFETY: layout has non-zero size (size >= MIN_CHUNK_SIZE).
        let raw = unsafe { alloc::alloc(layout) };
        let Some(start) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };

        Box::new(Chunk {
            start,
            ptr: AtomicPtr::new(start.as_ptr()),
            end: start.as_ptr().addr() + size,
            capacity: size,
        })
    }

    /// Bumps `size` bytes aligned to `align`, or returns `None` when full.
    #[inline]
    fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        loop {
            let current = self.ptr.load(Ordering::Acquire);
            let aligned = current.addr().checked_add(align - 1)? & !(align - 1);
            let new_end = aligned.checked_add(size)?;
            if new_end > self.end {
                return None;
            }

            if self
                .ptr
                .compare_exchange_weak(
                    current,
                    current.with_addr(new_end),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: aligned lies inside [start, end) of this chunk and
                // with_addr keeps the chunk's provenance.
                return Some(unsafe { NonNull::new_unchecked(current.with_addr(aligned)) });
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: same layout the chunk was allocated with.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, CHUNK_ALIGNMENT);
            alloc::dealloc(self.start.as_ptr(), layout);
        }
    }
}

/// Thread-safe arena for allocations that live as long as their owner.
///
/// # Thread Safety
///
/// Any number of threads may allocate concurrently. Growing the arena takes
/// a short mutex; the fast path is a single CAS on the current chunk.
///
/// # Lifetime
///
/// References returned by [`alloc`](Self::alloc) and
/// [`alloc_str`](Self::alloc_str) borrow the arena. Callers that need to
/// store them beside the arena (as the runtime does) hold raw pointers and
/// guarantee the arena outlives every use.
pub struct GlobalArena {
    /// Every chunk, oldest first. Boxes keep chunk addresses stable.
    chunks: Mutex<Vec<Box<Chunk>>>,
    /// Chunk used by the fast path.
    current: AtomicPtr<Chunk>,
    chunk_size: usize,
    total_allocated: AtomicUsize,
}

// SAFETY: chunks are only mutated under the mutex, bump pointers are atomic
// and handed-out regions never overlap.
unsafe impl Send for GlobalArena {}
unsafe impl Sync for GlobalArena {}

impl GlobalArena {
    /// Creates an arena whose chunks are at least `chunk_size` bytes.
    ///
    /// The size is clamped to `[8 KiB, 1 MiB]` and rounded to a power of two.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size
            .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
            .next_power_of_two();
        let first = Chunk::new(chunk_size);
        let current = std::ptr::from_ref::<Chunk>(&*first).cast_mut();

        GlobalArena {
            chunks: Mutex::new(vec![first]),
            current: AtomicPtr::new(current),
            chunk_size,
            total_allocated: AtomicUsize::new(0),
        }
    }

    /// Moves `value` into the arena and returns a reference to it.
    ///
    /// The value's destructor is never run by the arena.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> &mut T {
        let ptr = self.alloc_raw(Layout::new::<T>()).cast::<T>();
        // SAFETY: ptr is fresh, aligned for T and exclusively ours.
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Copies `s` into the arena.
    pub fn alloc_str(&self, s: &str) -> &str {
        if s.is_empty() {
            return "";
        }
        let ptr = self.alloc_raw(Layout::for_value(s.as_bytes()));
        // SAFETY: ptr has room for s.len() bytes and the bytes are valid UTF-8.
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(ptr.as_ptr(), s.len()))
        }
    }

    fn alloc_raw(&self, layout: Layout) -> NonNull<u8> {
        // Zero-sized values still get a distinct, aligned address.
        let size = layout.size().max(1);
        let align = layout.align();

        loop {
            let current = self.current.load(Ordering::Acquire);
            // SAFETY: current always points at a chunk owned by self.chunks.
            let chunk = unsafe { &*current };
            if let Some(ptr) = chunk.try_alloc(size, align) {
                self.total_allocated.fetch_add(layout.size(), Ordering::Relaxed);
                return ptr;
            }
            self.grow(current, size + align);
        }
    }

    #[cold]
    fn grow(&self, seen: *mut Chunk, min_size: usize) {
        let mut chunks = self.chunks.lock().unwrap();
        // Another thread already grew the arena.
        if self.current.load(Ordering::Acquire) != seen {
            return;
        }

        let size = (self.chunk_size * 2)
            .min(MAX_CHUNK_SIZE)
            .max(min_size.next_power_of_two());
        let chunk = Chunk::new(size);
        let ptr = std::ptr::from_ref::<Chunk>(&*chunk).cast_mut();
        chunks.push(chunk);
        self.current.store(ptr, Ordering::Release);
    }

    /// Returns allocation statistics.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let chunks = self.chunks.lock().unwrap();
        ArenaStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            chunk_count: chunks.len(),
            total_capacity: chunks.iter().map(|c| c.capacity).sum(),
        }
    }
}

impl std::fmt::Debug for GlobalArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalArena")
            .field("chunk_size", &self.chunk_size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_alloc_values() {
        let arena = GlobalArena::new(8192);
        let a = arena.alloc(1u8);
        let b = arena.alloc(2u64);
        assert_eq!(*a, 1);
        assert_eq!(*b, 2);
        assert_eq!(std::ptr::from_mut(b).addr() % 8, 0);
    }

    #[test]
    fn test_alloc_str() {
        let arena = GlobalArena::new(8192);
        let s = arena.alloc_str("initialize");
        assert_eq!(s, "initialize");
        assert_eq!(arena.alloc_str(""), "");
    }

    #[test]
    fn test_growth_keeps_old_values() {
        let arena = GlobalArena::new(8192);
        let first = arena.alloc([7u8; 64]) as *const [u8; 64];
        for _ in 0..1000 {
            arena.alloc([0u8; 64]);
        }
        assert!(arena.stats().chunk_count > 1);
        // SAFETY: arena is alive and never moves values.
        assert_eq!(unsafe { (*first)[0] }, 7);
    }

    #[test]
    fn test_large_allocation() {
        let arena = GlobalArena::new(8192);
        let big = arena.alloc([1u8; 20_000]);
        assert_eq!(big[19_999], 1);
    }

    #[test]
    fn test_concurrent_alloc() {
        let arena = Arc::new(GlobalArena::new(8192));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    let mut addrs = Vec::new();
                    for i in 0..500u64 {
                        let v = arena.alloc(t * 1000 + i);
                        assert_eq!(*v, t * 1000 + i);
                        addrs.push(std::ptr::from_mut(v).addr());
                    }
                    addrs
                })
            })
            .collect();

        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(arena.stats().total_allocated, total * 8);
    }
}
