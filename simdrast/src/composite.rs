//! Merges the bin lists of all workers for a single tile.
use std::sync::RwLockReadGuard;

use crate::{
    arena::Arena,
    binlist::{BinList, BinListArray, BinReader, DRAW_CALL_BIT, END_OF_LIST},
};

/// An entry produced by [`CompositeBinList::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinEntry {
    /// The following triangles belong to the draw call.
    DrawCall(u16),
    /// A triangle and its nearest depth (as `f32` bits).
    Triangle(u32, u32),
    End,
}

impl BinEntry {
    fn from_word(word: u32, depth: u32) -> Self {
        if word == END_OF_LIST {
            BinEntry::End
        } else if word & DRAW_CALL_BIT != 0 {
            BinEntry::DrawCall((word & !DRAW_CALL_BIT) as u16)
        } else {
            BinEntry::Triangle(word, depth)
        }
    }
}

/// A view of the bin lists of a tile as a single stream.
///
/// The readers are kept sorted by their current word. Since every list
/// starts with a draw call word and both draw calls and triangles are
/// appended in ascending order, the merged stream visits the draw calls in
/// submission order and, inside a draw call, the triangles in ascending
/// order.
#[derive(Default)]
pub(crate) struct CompositeBinList<'a> {
    readers: Vec<BinReader<'a>>,
}

impl<'a> CompositeBinList<'a> {
    pub fn new() -> Self {
        Self {
            readers: Vec::new(),
        }
    }

    /// Prepare to read the lists of `tile`. Returns the tile's depth bound
    /// (as `f32` bits).
    ///
    /// # Safety
    ///
    /// No one may write the lists of `tile` concurrently.
    pub unsafe fn setup(
        &mut self,
        array: &BinListArray,
        lists: &[RwLockReadGuard<'_, Vec<BinList>>],
        arena: &'a Arena,
        tile: usize,
        frame_number: u32,
    ) -> u32 {
        BinListArray::finalize(lists, arena, tile, frame_number, &mut self.readers);
        for i in (0..self.readers.len().saturating_sub(1)).rev() {
            self.maintain_order(i);
        }
        array.zmax(tile)
    }

    /// Get the next entry.
    ///
    /// A draw call entry advances every list positioned at the same draw
    /// call.
    pub fn next(&mut self) -> BinEntry {
        let first = match self.readers.first_mut() {
            Some(r) => r,
            None => return BinEntry::End,
        };
        let word = first.word();

        if word & DRAW_CALL_BIT == 0 {
            let depth = first.read_depth();
            first.advance();
            self.maintain_order(0);
            return BinEntry::Triangle(word, depth);
        }

        if word == END_OF_LIST {
            return BinEntry::End;
        }

        let mut activated = 1;
        first.advance();
        while activated < self.readers.len() && self.readers[activated].word() == word {
            self.readers[activated].advance();
            activated += 1;
        }
        // `readers[activated..]` is still sorted
        for i in (0..activated).rev() {
            self.maintain_order(i);
        }

        BinEntry::from_word(word, 0)
    }

    /// Move the reader at `i` toward the end until the readers are sorted.
    fn maintain_order(&mut self, mut i: usize) {
        while i + 1 < self.readers.len() && self.readers[i + 1].word() < self.readers[i].word() {
            self.readers.swap(i, i + 1);
            i += 1;
        }
    }
}
