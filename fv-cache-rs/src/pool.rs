//! Fixed-chunk memory pool.
//!
//! A [`ChunkPool`] owns one contiguous allocation split into equally sized
//! chunks. Feature vectors borrow exactly one chunk from each of two pools for
//! their lifetime, so the cache never fragments the heap no matter how often
//! vectors are added, deduplicated or evicted.
//!
//! Free chunks are threaded on an index-based free list kept beside the
//! payload; payload memory is never reinterpreted.

use crate::error::{CacheError, Result};

const NIL: u32 = u32::MAX;

/// Handle to one chunk of a [`ChunkPool`].
///
/// Only meaningful for the pool that issued it, and only until the chunk is
/// returned with [`ChunkPool::put`] or the pool is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u32);

impl ChunkId {
    /// Chunk position inside the pool.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A typed fixed-chunk allocator with an O(1) free list.
///
/// # Examples
///
/// ```
/// use fv_cache_rs::pool::ChunkPool;
///
/// let mut pool: ChunkPool<f32> = ChunkPool::init(2, 4).unwrap();
/// let a = pool.get().unwrap();
/// let b = pool.get().unwrap();
/// assert!(pool.get().is_none());
///
/// pool.chunk_mut(a).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
/// pool.put(b);
/// assert_eq!(pool.num_free(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ChunkPool<T> {
    data: Vec<T>,
    next_free: Vec<u32>,
    free_head: u32,
    chunk_size: usize,
    num_chunks: usize,
    num_free: usize,
    in_use: Vec<bool>,
}

impl<T> Default for ChunkPool<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            next_free: Vec::new(),
            free_head: NIL,
            chunk_size: 0,
            num_chunks: 0,
            num_free: 0,
            in_use: Vec::new(),
        }
    }
}

impl<T: Copy + Default> ChunkPool<T> {
    /// Allocate `num_chunks` chunks of `chunk_size` elements each.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Allocation`] if the total size overflows or the
    /// backing allocation cannot be reserved. Nothing is allocated in that case.
    pub fn init(num_chunks: usize, chunk_size: usize) -> Result<Self> {
        let alloc_err = || CacheError::Allocation {
            chunks: num_chunks,
            chunk_size,
        };

        if num_chunks >= NIL as usize {
            return Err(alloc_err());
        }
        let total = num_chunks.checked_mul(chunk_size).ok_or_else(alloc_err)?;

        let mut data = Vec::new();
        data.try_reserve_exact(total).map_err(|_| alloc_err())?;
        data.resize(total, T::default());

        let mut next_free = Vec::new();
        next_free
            .try_reserve_exact(num_chunks)
            .map_err(|_| alloc_err())?;
        #[allow(clippy::cast_possible_truncation)]
        next_free.extend((1..=num_chunks).map(|i| if i == num_chunks { NIL } else { i as u32 }));

        Ok(Self {
            data,
            next_free,
            free_head: if num_chunks == 0 { NIL } else { 0 },
            chunk_size,
            num_chunks,
            num_free: num_chunks,
            in_use: vec![false; num_chunks],
        })
    }

    /// Pop a chunk off the free list, or `None` when the pool is exhausted.
    pub fn get(&mut self) -> Option<ChunkId> {
        if self.free_head == NIL {
            return None;
        }
        let id = self.free_head;
        self.free_head = self.next_free[id as usize];
        self.num_free -= 1;
        self.in_use[id as usize] = true;
        Some(ChunkId(id))
    }

    /// Return a chunk to the free list.
    ///
    /// Each acquired chunk must be returned at most once.
    pub fn put(&mut self, id: ChunkId) {
        let i = id.index();
        debug_assert!(i < self.num_chunks, "chunk {i} not issued by this pool");
        debug_assert!(self.in_use[i], "chunk {i} released twice");
        self.in_use[i] = false;
        self.next_free[i] = self.free_head;
        self.free_head = id.0;
        self.num_free += 1;
    }

    /// Release the whole allocation; all outstanding ids become invalid.
    pub fn free(&mut self) {
        *self = Self::default();
    }
}

impl<T> ChunkPool<T> {
    /// Read a chunk.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range for this pool.
    #[must_use]
    pub fn chunk(&self, id: ChunkId) -> &[T] {
        let start = id.index() * self.chunk_size;
        &self.data[start..start + self.chunk_size]
    }

    /// Write a chunk.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range for this pool.
    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut [T] {
        let start = id.index() * self.chunk_size;
        &mut self.data[start..start + self.chunk_size]
    }

    /// Elements per chunk.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total number of chunks.
    #[must_use]
    pub const fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    /// Number of chunks currently on the free list.
    #[must_use]
    pub const fn num_free(&self) -> usize {
        self.num_free
    }

    /// Number of chunks currently handed out.
    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.num_chunks - self.num_free
    }
}
