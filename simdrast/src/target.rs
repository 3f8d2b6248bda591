use rgb::RGBA8;
use std::sync::atomic::{AtomicU32, Ordering};

/// The pixel format of a [`FrameBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameBufferFormat {
    /// 32-bit pixels. Red occupies the least significant byte and alpha the
    /// most significant one.
    Rgba8,
}

impl FrameBufferFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameBufferFormat::Rgba8 => 4,
        }
    }
}

/// A render target.
///
/// The first row in memory is the top row of the image. Pixels are atomics
/// because tiles are resolved by many workers at once; every pixel is
/// written by at most one worker per frame.
#[derive(Debug)]
pub struct FrameBuffer {
    format: FrameBufferFormat,
    width: usize,
    height: usize,
    /// The distance between rows, measured in pixels.
    pitch: usize,
    pixels: Box<[AtomicU32]>,
}

impl FrameBuffer {
    /// Construct a `FrameBuffer` filled with zero (transparent black).
    ///
    /// # Panics
    ///
    /// Panics if `pitch < width`.
    pub fn new(format: FrameBufferFormat, width: usize, height: usize, pitch: usize) -> Self {
        assert!(pitch >= width, "pitch must be at least as large as width");
        Self {
            format,
            width,
            height,
            pitch,
            pixels: (0..pitch * height).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn format(&self) -> FrameBufferFormat {
        self.format
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn size(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    /// Get the pixel at `(x, y)`, where `y = 0` is the top row.
    pub fn get(&self, x: usize, y: usize) -> u32 {
        assert!(x < self.width && y < self.height);
        self.pixels[y * self.pitch + x].load(Ordering::Relaxed)
    }

    /// Set the pixel at `(x, y)`, where `y = 0` is the top row.
    pub fn set(&self, x: usize, y: usize, value: u32) {
        assert!(x < self.width && y < self.height);
        self.pixels[y * self.pitch + x].store(value, Ordering::Relaxed);
    }

    /// Fill the whole buffer, including the padding between rows.
    pub fn fill(&self, value: u32) {
        for p in self.pixels.iter() {
            p.store(value, Ordering::Relaxed);
        }
    }

    /// Copy out the pixels, including the padding between rows.
    pub fn to_vec(&self) -> Vec<u32> {
        self.pixels
            .iter()
            .map(|p| p.load(Ordering::Relaxed))
            .collect()
    }

    /// Copy out the visible pixels as a tightly packed, top-down image.
    pub fn to_rgba8(&self) -> Vec<RGBA8> {
        let mut out = Vec::with_capacity(self.width * self.height);
        for row in self.pixels.chunks(self.pitch).take(self.height) {
            out.extend(row[..self.width].iter().map(|p| unpack(p.load(Ordering::Relaxed))));
        }
        out
    }

    /// Store a pixel from the resolve stage. `(x, y)` is measured from the
    /// bottom-left corner.
    #[inline]
    pub(crate) fn store_bottom_up(&self, x: usize, y: usize, value: u32) {
        self.pixels[(self.height - y - 1) * self.pitch + x].store(value, Ordering::Relaxed);
    }
}

/// Convert a packed pixel to `RGBA8`.
#[inline]
pub fn unpack(x: u32) -> RGBA8 {
    let [r, g, b, a] = x.to_le_bytes();
    RGBA8::new(r, g, b, a)
}

/// Convert `RGBA8` to a packed pixel.
#[inline]
pub fn pack(x: RGBA8) -> u32 {
    u32::from_le_bytes([x.r, x.g, x.b, x.a])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing() {
        let c = RGBA8::new(1, 2, 3, 4);
        assert_eq!(pack(c), 0x0403_0201);
        assert_eq!(unpack(0x0403_0201), c);
    }

    #[test]
    fn bottom_up_store() {
        let fb = FrameBuffer::new(FrameBufferFormat::Rgba8, 3, 2, 4);
        fb.store_bottom_up(1, 0, 7);
        fb.store_bottom_up(2, 1, 9);
        assert_eq!(fb.get(1, 1), 7);
        assert_eq!(fb.get(2, 0), 9);
        assert_eq!(fb.to_vec(), vec![0, 0, 9, 0, 0, 7, 0, 0]);
    }

    #[test]
    fn to_rgba8_skips_padding() {
        let fb = FrameBuffer::new(FrameBufferFormat::Rgba8, 2, 2, 3);
        fb.fill(0xffff_ffff);
        fb.set(0, 1, pack(RGBA8::new(10, 20, 30, 40)));
        let img = fb.to_rgba8();
        assert_eq!(img.len(), 4);
        assert_eq!(img[2], RGBA8::new(10, 20, 30, 40));
        assert_eq!(img[3], RGBA8::new(255, 255, 255, 255));
    }

    #[test]
    #[should_panic]
    fn pitch_too_small() {
        FrameBuffer::new(FrameBufferFormat::Rgba8, 4, 1, 3);
    }
}
