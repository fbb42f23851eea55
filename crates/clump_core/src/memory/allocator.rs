//! # Allocators
//!
//! The arena never owns an address range it did not get from an
//! [`Allocator`]. Loads hand the allocator one bulk request for the whole
//! image payload; everything else is one request per block.

use clump_reflect::{align_up, Addr};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ClumpError, ClumpResult};

/// Hands out aligned, non-overlapping address ranges.
pub trait Allocator: Send {
    /// Reserves `size` bytes aligned to `align` (a power of two).
    ///
    /// # Errors
    ///
    /// [`ClumpError::OutOfMemory`] when the request cannot be satisfied.
    fn allocate(&mut self, size: u64, align: u64) -> ClumpResult<Addr>;

    /// Releases a range previously returned by [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// [`ClumpError::BadAddress`] if `addr` is not the start of a live range.
    fn deallocate(&mut self, addr: Addr) -> ClumpResult<()>;
}

/// First address handed out by a default [`BumpAllocator`].
///
/// Kept away from zero so that small offsets never look like valid addresses.
pub const DEFAULT_BASE: u64 = 0x1_0000;

/// A bump-pointer allocator over a fixed address budget.
///
/// Allocations bump a cursor and are never reused; deallocation only
/// retires the range. The allocator keeps a ledger of live ranges so that
/// double frees and interior frees are reported instead of ignored.
///
/// # Example
///
/// ```rust,ignore
/// let mut alloc = BumpAllocator::new(1024 * 1024); // 1MB budget
/// let a = alloc.allocate(64, 16)?;
/// alloc.deallocate(a)?;
/// assert_eq!(alloc.live_count(), 0);
/// ```
#[derive(Debug)]
pub struct BumpAllocator {
    base: u64,
    capacity: u64,
    cursor: u64,
    live: BTreeMap<u64, u64>,
    allocations: u64,
    deallocations: u64,
    rejected: u64,
}

impl BumpAllocator {
    /// Creates an allocator with a budget of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self::with_base(DEFAULT_BASE, capacity)
    }

    /// Creates an allocator whose first range starts at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is zero (the null address).
    #[must_use]
    pub fn with_base(base: u64, capacity: u64) -> Self {
        assert!(base != 0, "Base address must not be null");
        Self {
            base,
            capacity,
            cursor: base,
            live: BTreeMap::new(),
            allocations: 0,
            deallocations: 0,
            rejected: 0,
        }
    }

    /// Returns the total budget in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the consumed budget in bytes, alignment padding included.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.cursor - self.base
    }

    /// Returns the remaining budget in bytes.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.capacity - self.used()
    }

    /// Returns the number of ranges not yet deallocated.
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Checks if `addr` is the start of a live range.
    #[inline]
    #[must_use]
    pub fn is_live(&self, addr: Addr) -> bool {
        self.live.contains_key(&addr.get())
    }

    /// Returns the size of the live range starting at `addr`.
    #[must_use]
    pub fn size_of(&self, addr: Addr) -> Option<u64> {
        self.live.get(&addr.get()).copied()
    }

    /// Returns the number of successful allocations.
    #[inline]
    #[must_use]
    pub const fn allocation_count(&self) -> u64 {
        self.allocations
    }

    /// Returns the number of successful deallocations.
    #[inline]
    #[must_use]
    pub const fn deallocation_count(&self) -> u64 {
        self.deallocations
    }

    /// Returns the number of rejected deallocations.
    #[inline]
    #[must_use]
    pub const fn rejected_count(&self) -> u64 {
        self.rejected
    }
}

impl Allocator for BumpAllocator {
    fn allocate(&mut self, size: u64, align: u64) -> ClumpResult<Addr> {
        let align = align.max(1);
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");

        // Zero-sized requests still get a distinct address.
        let size = size.max(1);
        let start = align_up(self.cursor, align);
        let end = start.checked_add(size);
        match end {
            Some(end) if end - self.base <= self.capacity => {
                self.cursor = end;
                self.live.insert(start, size);
                self.allocations += 1;
                Ok(Addr::new(start))
            }
            _ => Err(ClumpError::OutOfMemory {
                requested: size,
                available: self.remaining(),
            }),
        }
    }

    fn deallocate(&mut self, addr: Addr) -> ClumpResult<()> {
        match self.live.remove(&addr.get()) {
            Some(_) => {
                self.deallocations += 1;
                Ok(())
            }
            None => {
                self.rejected += 1;
                Err(ClumpError::BadAddress { addr, len: 0 })
            }
        }
    }
}

/// A cloneable handle to an allocator shared by several arenas.
///
/// Every clone forwards to the same allocator, so a caller can keep one
/// clone to inspect the allocator while an arena owns another.
pub struct SharedAllocator<A> {
    inner: Arc<Mutex<A>>,
}

impl<A> SharedAllocator<A> {
    /// Wraps an allocator for sharing.
    #[must_use]
    pub fn new(allocator: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    /// Runs `f` with the wrapped allocator locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<A> Clone for SharedAllocator<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Allocator> Allocator for SharedAllocator<A> {
    fn allocate(&mut self, size: u64, align: u64) -> ClumpResult<Addr> {
        self.inner.lock().allocate(size, align)
    }

    fn deallocate(&mut self, addr: Addr) -> ClumpResult<()> {
        self.inner.lock().deallocate(addr)
    }
}
