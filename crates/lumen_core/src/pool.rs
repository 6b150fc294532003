//! # Identifier Pool
//!
//! First-fit range allocator over the bounded identifier space.
//!
//! Identifiers are handed out in contiguous blocks so that one protocol
//! round trip to the session master can delegate allocation authority for
//! a whole range. The free-list coalesces on free to bound fragmentation.

/// A shared-object identifier.
///
/// Identifiers are allocated starting at 1. Zero is never handed out, so a
/// zero range start in a directory reply unambiguously means "not found".
pub type Identifier = u32;

/// Sentinel identifier meaning "unallocated" / "no identifier".
pub const ID_INVALID: Identifier = 0xFFFF_FFFF;

/// Wildcard instance identifier - a command addressed to `ID_ANY` is
/// offered to every attached instance until one accepts it.
pub const ID_ANY: Identifier = 0xFFFF_FFFE;

/// A contiguous block of free identifiers `[start, start + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRange {
    /// First identifier in the block.
    start: Identifier,
    /// Number of identifiers in the block.
    len: u32,
}

/// Allocates contiguous ranges of unique identifiers.
///
/// Every session owns two independent pools: the **master pool**, seeded
/// with [`IdPool::MAX_CAPACITY`] on the session master only, and the
/// **local pool**, seeded empty, which caches sub-ranges fetched from the
/// master so that most allocations never leave the process.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. The session wraps it in a mutex.
pub struct IdPool {
    /// Free blocks, sorted by start, never overlapping, never adjacent
    /// (adjacent blocks are merged on free).
    free: Vec<FreeRange>,
}

impl IdPool {
    /// Total number of allocatable identifiers.
    ///
    /// Slightly below `u32::MAX` so the sentinels [`ID_INVALID`] and
    /// [`ID_ANY`] can never be allocated.
    pub const MAX_CAPACITY: u32 = 0xFFFF_FFF0;

    /// Creates a pool with `initial` free identifiers, starting at 1.
    ///
    /// Pass [`IdPool::MAX_CAPACITY`] for the authoritative master pool and
    /// `0` for a local cache pool that is filled via [`IdPool::free_ids`].
    #[must_use]
    pub fn new(initial: u32) -> Self {
        let initial = initial.min(Self::MAX_CAPACITY);
        let mut free = Vec::new();
        if initial > 0 {
            free.push(FreeRange { start: 1, len: initial });
        }
        Self { free }
    }

    /// Allocates a contiguous block of `range` identifiers.
    ///
    /// First-fit over the free-list; no guarantee which sub-range of a
    /// free block is returned.
    ///
    /// # Returns
    ///
    /// The first identifier of the block, or [`ID_INVALID`] if no free
    /// block of the requested size exists. Exhaustion is a hard failure;
    /// the pool never retries or splits the request.
    pub fn gen_ids(&mut self, range: u32) -> Identifier {
        if range == 0 {
            return ID_INVALID;
        }

        for (index, block) in self.free.iter_mut().enumerate() {
            if block.len >= range {
                let id = block.start;
                block.start += range;
                block.len -= range;
                if block.len == 0 {
                    self.free.remove(index);
                }
                return id;
            }
        }

        ID_INVALID
    }

    /// Returns a block of `range` identifiers starting at `start` to the
    /// free-list, merging with adjacent free blocks.
    ///
    /// Freeing identifiers that are already free is a programming error
    /// and asserts in debug builds.
    pub fn free_ids(&mut self, start: Identifier, range: u32) {
        if range == 0 || start == ID_INVALID {
            return;
        }
        debug_assert!(start >= 1, "identifier 0 is never allocated");
        debug_assert!(
            u64::from(start) + u64::from(range) <= u64::from(Self::MAX_CAPACITY) + 1,
            "freed range exceeds identifier space"
        );

        let pos = self.free.partition_point(|block| block.start < start);

        debug_assert!(
            pos == 0 || self.free[pos - 1].start + self.free[pos - 1].len <= start,
            "double free: range overlaps preceding free block"
        );
        debug_assert!(
            pos == self.free.len() || start + range <= self.free[pos].start,
            "double free: range overlaps following free block"
        );

        self.free.insert(pos, FreeRange { start, len: range });
        self.coalesce(pos);
    }

    /// Number of identifiers currently available.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.free.iter().map(|block| u64::from(block.len)).sum()
    }

    /// Returns true if no identifiers are available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Merges the block at `pos` with its neighbors if they are adjacent.
    fn coalesce(&mut self, pos: usize) {
        // Merge with the following block first so `pos` stays valid.
        if pos + 1 < self.free.len()
            && self.free[pos].start + self.free[pos].len == self.free[pos + 1].start
        {
            self.free[pos].len += self.free[pos + 1].len;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].start + self.free[pos - 1].len == self.free[pos].start {
            self.free[pos - 1].len += self.free[pos].len;
            self.free.remove(pos);
        }
    }
}
