//! The hierarchical importance map.
//!
//! The map stores one byte per pixel of a `2^L × 2^L` grid. A byte holds the
//! *level* at which its pixel becomes important: the pixel at `(x, y)` whose
//! both coordinates are multiples of `2^l` stands for the square region
//! `[x, x + 2^l) × [y, y + 2^l)`, and that region contains at least one
//! important pixel iff the byte is `≤ l`. Pixels seeded as important at level
//! 0 hold `0`; unimportant ones hold [`NOT_IMPORTANT`].
//!
//! [`ImportanceMap::build`] propagates the seeds upwards. Rows of super-tiles
//! are independent and can be built by different workers; the levels above
//! the super-tile size are built serially.
//!
//! Cells are atomics so that seeding (by silhouette rasterization) and the
//! marking of early-out pixels (by the resolve stage) may happen from many
//! workers at once.
use std::sync::atomic::{AtomicU8, Ordering};

/// The value of unimportant cells.
pub const NOT_IMPORTANT: u8 = 0xdf;

/// `log2` of the maximum super-tile size.
const SUPER_TILE_SHIFT: u32 = 7;

/// The highest level built by the fixed 2×2 kernel.
const KERNEL_LEVELS: u32 = 3;

#[derive(Debug)]
pub struct ImportanceMap {
    width: usize,
    height: usize,
    max_level: u32,
    cells: Box<[AtomicU8]>,
}

impl Default for ImportanceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ImportanceMap {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            max_level: 0,
            cells: vec![AtomicU8::new(NOT_IMPORTANT)].into_boxed_slice(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// `L`, the smallest integer such that `2^L ≥ max(width, height)`.
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Resize the map and clear it. The storage is reallocated only if the
    /// maximum level changes. Returns `true` if it was reallocated.
    pub fn resize(&mut self, width: usize, height: usize) -> bool {
        let size = width.max(height).max(1);
        let max_level = size.next_power_of_two().trailing_zeros();

        self.width = width;
        self.height = height;

        let realloc = max_level != self.max_level || self.cells.len() != 1 << (max_level * 2);
        if realloc {
            log::debug!(
                "Resizing the importance map to {}×{} (level {})",
                width,
                height,
                max_level
            );
            self.max_level = max_level;
            self.cells = (0..1usize << (max_level * 2))
                .map(|_| AtomicU8::new(NOT_IMPORTANT))
                .collect();
        } else {
            self.clear();
        }
        realloc
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        (y << self.max_level) + x
    }

    /// Mark every pixel unimportant.
    pub fn clear(&self) {
        for c in self.cells.iter() {
            c.store(NOT_IMPORTANT, Ordering::Relaxed);
        }
    }

    /// Mark every region important at every level (dense mode).
    pub fn fill(&self) {
        for c in self.cells.iter() {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Mark the pixel at `(x, y)` important.
    #[inline]
    pub fn set(&self, x: usize, y: usize) {
        self.set_to(x, y, 0);
    }

    /// Mark the pixel with the linear index `(y << max_level) + x` important.
    /// Out-of-range indices are ignored.
    #[inline]
    pub fn set_index(&self, i: usize) {
        if let Some(c) = self.cells.get(i) {
            c.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn set_to(&self, x: usize, y: usize, value: u8) {
        self.cells[self.index(x, y)].store(value, Ordering::Relaxed);
    }

    /// Mark the pixel at `(x, y)` unimportant.
    #[inline]
    pub fn clear_at(&self, x: usize, y: usize) {
        self.set_to(x, y, NOT_IMPORTANT);
    }

    #[inline]
    pub fn value(&self, x: usize, y: usize) -> u8 {
        self.cells[self.index(x, y)].load(Ordering::Relaxed)
    }

    /// Get whether the region of size `2^level` at `(x, y)` contains an
    /// important pixel. `x` and `y` must be multiples of `2^level`.
    #[inline]
    pub fn is_set(&self, level: u32, x: usize, y: usize) -> bool {
        self.value(x, y) as u32 <= level
    }

    /// The edge length of a super-tile.
    fn super_tile_shift(&self) -> u32 {
        self.max_level.min(SUPER_TILE_SHIFT)
    }

    /// The number of super-tile rows. Each row is processed by
    /// [`ImportanceMap::build_super_tile_row`].
    pub fn num_super_tile_rows(&self) -> usize {
        let shift = self.super_tile_shift();
        (self.height + (1 << shift) - 1) >> shift
    }

    /// Build the map pyramid on the calling thread.
    pub fn build(&self) {
        for row in 0..self.num_super_tile_rows() {
            self.build_super_tile_row(row);
        }
        self.build_upper_levels();
    }

    /// Build the levels `1..=min(7, L)` of the super-tiles in the row `row`.
    pub fn build_super_tile_row(&self, row: usize) {
        let shift = self.super_tile_shift();
        let size = 1usize << shift;
        let y = row << shift;
        let mut x = 0;
        while x < self.width {
            self.build_super_tile(x, y, shift);
            x += size;
        }
    }

    fn build_super_tile(&self, x0: usize, y0: usize, shift: u32) {
        let size = 1usize << shift;

        for level in 1..=shift.min(KERNEL_LEVELS) {
            self.reduce_kernel(x0, y0, size, level);
        }

        for level in KERNEL_LEVELS + 1..=shift {
            self.reduce_level(x0..x0 + size, y0..y0 + size, level);
        }
    }

    /// The 2×2 reduction kernel: each cell takes the minimum of its own value
    /// and its three siblings' values clamped to at least `level`.
    fn reduce_kernel(&self, x0: usize, y0: usize, size: usize, level: u32) {
        let step = 1usize << level;
        let half = step >> 1;
        let l = level as u8;
        for y in (y0..y0 + size).step_by(step) {
            for x in (x0..x0 + size).step_by(step) {
                let mut v = self.value(x, y);
                for &(dx, dy) in &[(half, 0), (0, half), (half, half)] {
                    v = v.min(self.value(x + dx, y + dy).max(l));
                }
                self.set_to(x, y, v);
            }
        }
    }

    /// Mark the cells at `level` whose children contain an important pixel.
    fn reduce_level(
        &self,
        xs: std::ops::Range<usize>,
        ys: std::ops::Range<usize>,
        level: u32,
    ) {
        let step = 1usize << level;
        let half = step >> 1;
        let l = level as u8;
        for y in ys.step_by(step) {
            for x in xs.clone().step_by(step) {
                let v = self.value(x, y);
                if v <= l {
                    continue;
                }
                let child_set = [(half, 0), (0, half), (half, half)]
                    .iter()
                    .any(|&(dx, dy)| self.value(x + dx, y + dy) < l);
                if child_set {
                    self.set_to(x, y, l);
                }
            }
        }
    }

    /// Build the levels above the super-tile size.
    pub fn build_upper_levels(&self) {
        for level in self.super_tile_shift() + 1..=self.max_level {
            self.reduce_level(0..self.width, 0..self.height, level);
        }
    }
}
