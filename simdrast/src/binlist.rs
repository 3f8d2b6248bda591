//! Per-worker, per-tile bin lists.
//!
//! A bin list is a stream of 32-bit words stored in blocks of
//! [`BIN_BLOCK_WORDS`] words allocated from the frame arena:
//!
//! | word                          | meaning                                     |
//! |-------------------------------|---------------------------------------------|
//! | `draw_call \| 0x8000_0000`    | the following triangles belong to `draw_call` |
//! | `triangle`, `zmin`            | a binned triangle and its nearest depth     |
//! | `next \| 0x4000_0000`         | continue at the word index `next`           |
//! | `0x8fff_ffff`                 | end of the list                             |
//!
//! Every worker owns a separate set of lists, so writing needs no
//! synchronization. Lists are lazily reset by comparing a frame number.
use std::sync::{
    atomic::{AtomicU32, Ordering},
    RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::{
    arena::{Arena, LocalAllocator},
    error::RenderError,
    FAR_Z, TILE, TILE_SHIFT,
};

/// The number of words in a block, including the link word.
pub(crate) const BIN_BLOCK_WORDS: usize = 128;

/// Marks a draw call word.
pub(crate) const DRAW_CALL_BIT: u32 = 0x8000_0000;
/// Marks a link word.
const LINK_BIT: u32 = 0x4000_0000;
/// The end of a list.
pub(crate) const END_OF_LIST: u32 = 0x8fff_ffff;

const NO_BLOCK: u32 = u32::max_value();

#[derive(Debug, Clone, Copy)]
pub(crate) struct BinList {
    frame_number: u32,
    /// The word index of the first block.
    first: u32,
    /// The word index of the next word to be written.
    cursor: u32,
    /// The number of words left in the current block, excluding the word
    /// reserved for the link.
    remaining: u16,
    draw_call: u16,
}

impl Default for BinList {
    fn default() -> Self {
        Self {
            frame_number: 0,
            first: NO_BLOCK,
            cursor: NO_BLOCK,
            remaining: 0,
            draw_call: 0,
        }
    }
}

impl BinList {
    fn reset(&mut self, frame_number: u32) {
        *self = Self {
            frame_number,
            ..Self::default()
        };
    }

    /// Start appending triangles of `draw_call`. Up to `max_triangles`
    /// triangles may be written through the returned writer, which must be
    /// passed to [`BinList::end_write`] afterwards.
    pub fn start_write<'a>(
        &mut self,
        arena: &'a Arena,
        allocator: &mut LocalAllocator,
        draw_call: u16,
        max_triangles: usize,
    ) -> Result<BinWriter<'a>, RenderError> {
        let needed = 2 + max_triangles * 2;
        debug_assert!(needed < BIN_BLOCK_WORDS);

        if (self.remaining as usize) < needed {
            let block = allocator.allocate::<u32>(arena, BIN_BLOCK_WORDS)?;
            let block = (block.offset() / 4) as u32;
            if self.first == NO_BLOCK {
                self.first = block;
            } else {
                // Safety: `cursor` is inside a block owned by this list
                unsafe { arena.write_word(self.cursor as usize, block | LINK_BIT) };
            }
            self.cursor = block;
            self.remaining = (BIN_BLOCK_WORDS - 1) as u16;
        }

        let mut writer = BinWriter {
            arena,
            start: self.cursor,
            pos: self.cursor,
        };

        if self.draw_call != draw_call || self.cursor == self.first {
            writer.push(draw_call as u32 | DRAW_CALL_BIT);
        }

        Ok(writer)
    }

    /// Commit the words written through `writer`. A write consisting of
    /// nothing but a draw call word is discarded.
    pub fn end_write(&mut self, writer: BinWriter<'_>) {
        let written = writer.pos - writer.start;
        if written > 1 {
            if written & 1 != 0 {
                // Safety: the word was written by `writer`
                let word = unsafe { writer.arena.read_word(writer.start as usize) };
                self.draw_call = (word & !DRAW_CALL_BIT) as u16;
            }
            self.cursor += written;
            self.remaining -= written as u16;
        }
    }

    /// Terminate the list and get a reader positioned at its first entry.
    ///
    /// # Safety
    ///
    /// No one may write the list concurrently.
    unsafe fn finalize<'a>(&self, arena: &'a Arena) -> BinReader<'a> {
        if self.first == NO_BLOCK {
            return BinReader::empty(arena);
        }
        arena.write_word(self.cursor as usize, END_OF_LIST);
        BinReader::new(arena, self.first)
    }
}

/// Appends words to a bin list.
pub(crate) struct BinWriter<'a> {
    arena: &'a Arena,
    start: u32,
    pos: u32,
}

impl BinWriter<'_> {
    fn push(&mut self, word: u32) {
        // Safety: `BinList::start_write` reserved room for the words
        unsafe { self.arena.write_word(self.pos as usize, word) };
        self.pos += 1;
    }

    #[inline]
    pub fn write_triangle(&mut self, triangle: u32, zmin_bits: u32) {
        debug_assert_eq!(triangle & DRAW_CALL_BIT, 0);
        self.push(triangle);
        self.push(zmin_bits);
    }
}

/// Reads a finalized bin list.
#[derive(Clone, Copy)]
pub(crate) struct BinReader<'a> {
    arena: &'a Arena,
    /// The word index following the current word.
    pos: u32,
    word: u32,
}

impl<'a> BinReader<'a> {
    pub fn empty(arena: &'a Arena) -> Self {
        Self {
            arena,
            pos: 0,
            word: END_OF_LIST,
        }
    }

    fn new(arena: &'a Arena, first: u32) -> Self {
        let mut this = Self {
            arena,
            pos: first,
            word: 0,
        };
        this.advance();
        this
    }

    /// The current word: a triangle index, a draw call word, or
    /// [`END_OF_LIST`].
    #[inline]
    pub fn word(&self) -> u32 {
        self.word
    }

    /// Move to the next entry. Must not be called at the end of the list.
    #[inline]
    pub fn advance(&mut self) {
        debug_assert_ne!(self.word, END_OF_LIST);
        // Safety: the list was finalized, so every word up to `END_OF_LIST`
        // is initialized
        unsafe {
            self.word = self.arena.read_word(self.pos as usize);
            self.pos += 1;
            if self.word & (DRAW_CALL_BIT | LINK_BIT) == LINK_BIT {
                self.pos = self.word & !LINK_BIT;
                self.word = self.arena.read_word(self.pos as usize);
                self.pos += 1;
            }
        }
    }

    /// Read the depth word following a triangle index.
    #[inline]
    pub fn read_depth(&mut self) -> u32 {
        // Safety: see `advance`
        let z = unsafe { self.arena.read_word(self.pos as usize) };
        self.pos += 1;
        z
    }
}

/// The bin lists of every tile for every worker, and the per-tile depth
/// bounds.
#[derive(Debug, Default)]
pub(crate) struct BinListArray {
    width: usize,
    height: usize,
    /// `threads[worker][tile]`
    threads: Box<[RwLock<Vec<BinList>>]>,
    /// The farthest depth of each tile (as `f32` bits) known to be fully
    /// covered by opaque geometry.
    zmax: Box<[AtomicU32]>,
}

impl BinListArray {
    pub fn new(num_threads: usize) -> Self {
        Self {
            width: 0,
            height: 0,
            threads: (0..num_threads).map(|_| RwLock::new(Vec::new())).collect(),
            zmax: Box::new([]),
        }
    }

    /// The size in tiles.
    pub fn size(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    /// Resize for a frame buffer of `width × height` pixels. All lists are
    /// cleared if the size changes.
    pub fn resize(&mut self, width: usize, height: usize) {
        let width = (width + TILE - 1) >> TILE_SHIFT;
        let height = (height + TILE - 1) >> TILE_SHIFT;
        if width == self.width && height == self.height {
            return;
        }
        log::debug!("Resizing the bin list array to {}×{} tiles", width, height);
        self.width = width;
        self.height = height;
        self.zmax = (0..width * height)
            .map(|_| AtomicU32::new(FAR_Z.to_bits()))
            .collect();
        self.clear();
    }

    /// Invalidate every list regardless of its frame number.
    pub fn clear(&mut self) {
        let num_tiles = self.width * self.height;
        for lists in self.threads.iter_mut() {
            let lists = lists.get_mut().unwrap_or_else(|e| e.into_inner());
            lists.clear();
            lists.resize(num_tiles, BinList::default());
        }
    }

    /// Reset the depth bound of every tile to the far plane.
    pub fn clear_z(&self) {
        for z in self.zmax.iter() {
            z.store(FAR_Z.to_bits(), Ordering::Relaxed);
        }
    }

    /// The index of the tile containing the pixel `(x, y)`.
    #[inline]
    pub fn tile_index(&self, x: usize, y: usize) -> usize {
        (y >> TILE_SHIFT) * self.width + (x >> TILE_SHIFT)
    }

    /// Lock the lists of `worker` for writing.
    pub fn lock_worker(&self, worker: usize) -> WorkerBins<'_> {
        WorkerBins {
            width: self.width,
            lists: self.threads[worker]
                .write()
                .unwrap_or_else(|e| e.into_inner()),
            zmax: &self.zmax,
        }
    }

    /// Lock the lists of every worker for reading.
    pub fn lock_all(&self) -> Vec<RwLockReadGuard<'_, Vec<BinList>>> {
        self.threads
            .iter()
            .map(|l| l.read().unwrap_or_else(|e| e.into_inner()))
            .collect()
    }

    /// The current depth bound of a tile.
    pub fn zmax(&self, tile: usize) -> u32 {
        self.zmax[tile].load(Ordering::Relaxed)
    }

    /// Terminate the lists of `tile` and get a reader for each worker's list.
    /// Lists not written during the frame `frame_number` yield empty readers.
    ///
    /// # Safety
    ///
    /// No one may write the lists of `tile` concurrently.
    pub unsafe fn finalize<'a>(
        lists: &[RwLockReadGuard<'_, Vec<BinList>>],
        arena: &'a Arena,
        tile: usize,
        frame_number: u32,
        out: &mut Vec<BinReader<'a>>,
    ) {
        out.clear();
        out.extend(lists.iter().map(|lists| {
            let list = &lists[tile];
            if list.frame_number != frame_number {
                BinReader::empty(arena)
            } else {
                list.finalize(arena)
            }
        }));
    }
}

/// The lists of one worker, locked for writing.
pub(crate) struct WorkerBins<'a> {
    width: usize,
    lists: RwLockWriteGuard<'a, Vec<BinList>>,
    zmax: &'a [AtomicU32],
}

impl WorkerBins<'_> {
    /// Get the list of `tile`, resetting it if it was last written in another
    /// frame.
    #[inline]
    pub fn list(&mut self, tile: usize, frame_number: u32) -> &mut BinList {
        let list = &mut self.lists[tile];
        if list.frame_number != frame_number {
            list.reset(frame_number);
        }
        list
    }

    /// Get the list and the depth bound of the tile containing the pixel
    /// `(x, y)`.
    #[inline]
    pub fn tile(&mut self, x: usize, y: usize, frame_number: u32) -> (&mut BinList, &AtomicU32) {
        let tile = (y >> TILE_SHIFT) * self.width + (x >> TILE_SHIFT);
        let zmax = self.zmax;
        (self.list(tile, frame_number), &zmax[tile])
    }
}

/// Move the depth bound at `target` toward the viewer to `new_bits`. Never
/// moves it away from the viewer.
pub(crate) fn tighten_zmax(target: &AtomicU32, new_bits: u32, mut current: u32) {
    // Non-negative floats compare like their bit patterns
    while new_bits > current {
        match target.compare_exchange_weak(current, new_bits, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(x) => current = x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn read_all(mut r: BinReader<'_>) -> Vec<(u32, Option<u32>)> {
        let mut out = Vec::new();
        while r.word() != END_OF_LIST {
            let w = r.word();
            if w & DRAW_CALL_BIT != 0 {
                out.push((w, None));
            } else {
                out.push((w, Some(r.read_depth())));
            }
            r.advance();
        }
        out
    }

    #[test]
    fn marker_only_writes_are_discarded() {
        let arena = Arena::with_capacity(1 << 20).unwrap();
        let mut alloc = LocalAllocator::new();
        let mut list = BinList::default();
        list.reset(1);

        let w = list.start_write(&arena, &mut alloc, 3, 8).unwrap();
        list.end_write(w);

        let mut w = list.start_write(&arena, &mut alloc, 4, 8).unwrap();
        w.write_triangle(10, 100);
        list.end_write(w);

        let r = unsafe { list.finalize(&arena) };
        assert_eq!(
            read_all(r),
            vec![(4 | DRAW_CALL_BIT, None), (10, Some(100))]
        );
    }

    #[test]
    fn draw_call_word_only_on_change() {
        let arena = Arena::with_capacity(1 << 20).unwrap();
        let mut alloc = LocalAllocator::new();
        let mut list = BinList::default();
        list.reset(1);

        for &(dc, tri) in &[(0u16, 1u32), (0, 2), (2, 0), (2, 5)] {
            let mut w = list.start_write(&arena, &mut alloc, dc, 8).unwrap();
            w.write_triangle(tri, tri * 10);
            list.end_write(w);
        }

        let r = unsafe { list.finalize(&arena) };
        assert_eq!(
            read_all(r),
            vec![
                (DRAW_CALL_BIT, None),
                (1, Some(10)),
                (2, Some(20)),
                (2 | DRAW_CALL_BIT, None),
                (0, Some(0)),
                (5, Some(50)),
            ]
        );
    }

    /// The stream survives any number of block boundaries.
    #[quickcheck]
    fn spans_blocks(batches: Vec<(u8, u8)>) -> bool {
        let arena = Arena::with_capacity(8 << 20).unwrap();
        let mut alloc = LocalAllocator::new();
        let mut list = BinList::default();
        list.reset(7);

        let mut expected = Vec::new();
        let mut last_dc = None;
        let mut next_tri = 0;
        for &(dc, count) in &batches {
            let dc = (dc % 4) as u16;
            let count = (count % 9) as u32;
            let mut w = list.start_write(&arena, &mut alloc, dc, 8).unwrap();
            let mut tris = Vec::new();
            for _ in 0..count {
                w.write_triangle(next_tri, !next_tri);
                tris.push((next_tri, Some(!next_tri)));
                next_tri += 1;
            }
            list.end_write(w);
            if count > 0 {
                if last_dc != Some(dc) {
                    expected.push((dc as u32 | DRAW_CALL_BIT, None));
                    last_dc = Some(dc);
                }
                expected.extend(tris);
            }
        }

        read_all(unsafe { list.finalize(&arena) }) == expected
    }

    #[test]
    fn stale_lists_read_as_empty() {
        let arena = Arena::with_capacity(1 << 20).unwrap();
        let mut array = BinListArray::new(2);
        array.resize(20, 10);
        assert_eq!(array.size(), [3, 2]);

        {
            let mut bins = array.lock_worker(1);
            let tile = 4;
            let list = bins.list(tile, 1);
            let mut alloc = LocalAllocator::new();
            let mut w = list.start_write(&arena, &mut alloc, 0, 8).unwrap();
            w.write_triangle(9, 0);
            list.end_write(w);
        }

        let lists = array.lock_all();
        let mut readers = Vec::new();
        unsafe { BinListArray::finalize(&lists, &arena, 4, 1, &mut readers) };
        assert_eq!(readers[0].word(), END_OF_LIST);
        assert_eq!(readers[1].word(), DRAW_CALL_BIT);

        unsafe { BinListArray::finalize(&lists, &arena, 4, 2, &mut readers) };
        assert!(readers.iter().all(|r| r.word() == END_OF_LIST));
    }

    #[test]
    fn zmax_only_tightens() {
        let z = AtomicU32::new(0.25f32.to_bits());
        tighten_zmax(&z, 0.5f32.to_bits(), 0.25f32.to_bits());
        assert_eq!(f32::from_bits(z.load(Ordering::Relaxed)), 0.5);
        tighten_zmax(&z, 0.375f32.to_bits(), 0.25f32.to_bits());
        assert_eq!(f32::from_bits(z.load(Ordering::Relaxed)), 0.5);
    }
}
