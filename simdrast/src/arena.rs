//! Frame-scoped memory.
//!
//! [`Arena`] is a lock-free bump allocator shared by all workers. Allocations
//! are identified by typed handles ([`ArenaSlice`]) which carry the arena's
//! generation number, so a handle kept across [`Arena::reset`] is detected
//! instead of silently aliasing new data.
//!
//! [`LocalAllocator`] amortizes the atomic operation by claiming large blocks
//! from the arena and sub-allocating from them without synchronization.
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fmt,
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};
use zerocopy::{AsBytes, FromBytes};

use crate::error::RenderError;

/// The alignment of every allocation.
pub const ARENA_ALIGN: usize = 64;

/// The size of the blocks claimed by [`LocalAllocator`].
pub const LOCAL_BLOCK_SIZE: usize = 16 * 1024;

#[inline]
fn align_up(x: usize, align: usize) -> Option<usize> {
    Some(x.checked_add(align - 1)? & !(align - 1))
}

pub struct Arena {
    storage: NonNull<u8>,
    capacity: usize,
    offset: AtomicUsize,
    generation: u32,
}

// The storage is plain bytes. Aliasing is controlled by the `unsafe`
// accessors.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .field("generation", &self.generation)
            .finish()
    }
}

/// A typed reference to `len` elements of type `T` in an [`Arena`].
pub struct ArenaSlice<T> {
    offset: usize,
    len: usize,
    generation: u32,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for ArenaSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaSlice<T> {}

impl<T> fmt::Debug for ArenaSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArenaSlice({:#x}, len = {}, gen = {})",
            self.offset, self.len, self.generation
        )
    }
}

impl<T> ArenaSlice<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The byte offset of the first element from the start of the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Get whether `self` was created since the last reset of `arena`.
    pub fn is_current(&self, arena: &Arena) -> bool {
        self.generation == arena.generation
    }

    /// A handle to the elements `range` of `self`.
    pub fn subslice(self, range: std::ops::Range<usize>) -> Self {
        assert!(range.start <= range.end && range.end <= self.len);
        Self {
            offset: self.offset + range.start * std::mem::size_of::<T>(),
            len: range.end - range.start,
            generation: self.generation,
            _phantom: PhantomData,
        }
    }

    /// Reinterpret the allocation as elements of another type. The byte size
    /// must be a multiple of `U`'s size.
    pub fn cast<U>(self) -> ArenaSlice<U> {
        let bytes = self.len * std::mem::size_of::<T>();
        assert_eq!(bytes % std::mem::size_of::<U>().max(1), 0);
        assert!(std::mem::align_of::<U>() <= ARENA_ALIGN);
        ArenaSlice {
            offset: self.offset,
            len: bytes / std::mem::size_of::<U>().max(1),
            generation: self.generation,
            _phantom: PhantomData,
        }
    }
}

impl Arena {
    /// Allocate a zero-initialized arena of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self, RenderError> {
        let capacity = align_up(capacity.max(ARENA_ALIGN), ARENA_ALIGN)
            .ok_or(RenderError::InvalidConfig("arena capacity overflows"))?;
        let layout = Layout::from_size_align(capacity, ARENA_ALIGN)
            .map_err(|_| RenderError::InvalidConfig("arena capacity overflows"))?;

        // Safety: `layout` has a non-zero size
        let storage = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(RenderError::ArenaExhausted(capacity, 0))?;

        log::debug!("Allocated an arena of {} bytes", capacity);

        Ok(Self {
            storage,
            capacity,
            offset: AtomicUsize::new(0),
            generation: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of bytes allocated so far. Failed allocations do not count.
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Allocate `len` elements of type `T`. The contents are unspecified (but
    /// valid for `T` because `T: FromBytes`).
    pub fn allocate<T: FromBytes>(&self, len: usize) -> Result<ArenaSlice<T>, RenderError> {
        assert!(std::mem::align_of::<T>() <= ARENA_ALIGN);
        let size = len
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|x| align_up(x, ARENA_ALIGN))
            .ok_or(RenderError::ArenaExhausted(usize::max_value(), self.capacity))?;
        let offset = self.allocate_bytes(size)?;
        Ok(ArenaSlice {
            offset,
            len,
            generation: self.generation,
            _phantom: PhantomData,
        })
    }

    /// Reserve `size` bytes (a multiple of `ARENA_ALIGN`). Returns the offset.
    fn allocate_bytes(&self, size: usize) -> Result<usize, RenderError> {
        debug_assert_eq!(size % ARENA_ALIGN, 0);
        let capacity = self.capacity;
        self.offset
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |offset| {
                offset.checked_add(size).filter(|&end| end <= capacity)
            })
            .map_err(|_| RenderError::ArenaExhausted(size, capacity))
    }

    /// Copy `src` into the arena. Returns `None` if `src` is empty.
    pub fn clone_from_slice<T: FromBytes + AsBytes + Copy>(
        &self,
        src: &[T],
    ) -> Result<Option<ArenaSlice<T>>, RenderError> {
        if src.is_empty() {
            return Ok(None);
        }
        let slice = self.allocate::<T>(src.len())?;
        // Safety: `slice` was just allocated and is not shared yet
        unsafe { self.slice_mut(slice) }.copy_from_slice(src);
        Ok(Some(slice))
    }

    /// Rewind the arena and invalidate every outstanding handle.
    pub fn reset(&mut self) {
        *self.offset.get_mut() = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    #[inline]
    fn check<T>(&self, slice: &ArenaSlice<T>) -> *mut T {
        assert_eq!(
            slice.generation, self.generation,
            "stale arena handle: {:?}",
            slice
        );
        let bytes = slice.len * std::mem::size_of::<T>();
        assert!(slice.offset <= self.capacity && bytes <= self.capacity - slice.offset);
        // Safety: in bounds (checked above)
        unsafe { self.storage.as_ptr().add(slice.offset) as *mut T }
    }

    /// Borrow the elements referenced by `slice`.
    ///
    /// # Panics
    ///
    /// Panics if `slice` was created before the last `reset` or is out of
    /// bounds.
    ///
    /// # Safety
    ///
    /// The referenced elements must not be mutated for the lifetime of the
    /// returned reference.
    #[inline]
    pub unsafe fn slice<T: FromBytes>(&self, slice: ArenaSlice<T>) -> &[T] {
        std::slice::from_raw_parts(self.check(&slice), slice.len)
    }

    /// Mutably borrow the elements referenced by `slice`.
    ///
    /// # Panics
    ///
    /// See [`Arena::slice`].
    ///
    /// # Safety
    ///
    /// The referenced elements must not be accessed by anyone else for the
    /// lifetime of the returned reference.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut<T: FromBytes>(&self, slice: ArenaSlice<T>) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.check(&slice), slice.len)
    }

    /// Borrow bytes as atomics. Can be used concurrently with other atomic
    /// views of the same bytes.
    ///
    /// # Safety
    ///
    /// The referenced bytes must not be accessed non-atomically for the
    /// lifetime of the returned reference.
    #[inline]
    pub unsafe fn atomic_bytes(&self, slice: ArenaSlice<u8>) -> &[AtomicU8] {
        std::slice::from_raw_parts(self.check(&slice) as *const AtomicU8, slice.len)
    }

    /// The number of 32-bit words in the arena.
    fn num_words(&self) -> usize {
        self.capacity / 4
    }

    /// Read the 32-bit word at index `i`.
    ///
    /// # Safety
    ///
    /// The word must not be written concurrently.
    #[inline]
    pub(crate) unsafe fn read_word(&self, i: usize) -> u32 {
        assert!(i < self.num_words());
        (self.storage.as_ptr() as *const u32).add(i).read()
    }

    /// Write the 32-bit word at index `i`.
    ///
    /// # Safety
    ///
    /// The word must not be accessed concurrently.
    #[inline]
    pub(crate) unsafe fn write_word(&self, i: usize, value: u32) {
        assert!(i < self.num_words());
        (self.storage.as_ptr() as *mut u32).add(i).write(value)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Safety: allocated by `with_capacity` with the same layout
        unsafe {
            dealloc(
                self.storage.as_ptr(),
                Layout::from_size_align_unchecked(self.capacity, ARENA_ALIGN),
            );
        }
    }
}

/// A per-worker sub-allocator. Not thread-safe; every worker owns one.
#[derive(Debug, Default)]
pub struct LocalAllocator {
    /// The current block, as the byte range `offset..offset + remaining`.
    offset: usize,
    remaining: usize,
    generation: u32,
}

impl LocalAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` elements of type `T` from the current block, claiming a
    /// new block from `arena` if the current one is too small.
    pub fn allocate<T: FromBytes>(
        &mut self,
        arena: &Arena,
        len: usize,
    ) -> Result<ArenaSlice<T>, RenderError> {
        assert!(std::mem::align_of::<T>() <= ARENA_ALIGN);
        let size = len
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|x| align_up(x, ARENA_ALIGN))
            .ok_or(RenderError::ArenaExhausted(usize::max_value(), arena.capacity))?;

        if self.generation != arena.generation || self.remaining < size {
            let block_size = align_up(size, LOCAL_BLOCK_SIZE)
                .ok_or(RenderError::ArenaExhausted(size, arena.capacity))?;
            self.offset = arena.allocate_bytes(block_size)?;
            self.remaining = block_size;
            self.generation = arena.generation;
        }

        let slice = ArenaSlice {
            offset: self.offset,
            len,
            generation: self.generation,
            _phantom: PhantomData,
        };
        self.offset += size;
        self.remaining -= size;
        Ok(slice)
    }

    /// Forget the current block.
    pub fn reset(&mut self) {
        self.remaining = 0;
    }
}
