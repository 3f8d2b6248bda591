use checked::Checked;
use std::{fmt, sync::Arc};
use zerocopy::{AsBytes, FromBytes};

use crate::error::RenderError;

/// 16 bytes with the alignment shaders may rely on.
#[repr(C, align(16))]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub(crate) struct Chunk(pub [u8; 16]);

/// An immutable, shared, 16-byte aligned byte buffer holding vertex,
/// attribute, or index data.
///
/// Clones refer to the same storage. The storage's identity is used as the
/// key of the adjacency cache.
#[derive(Clone)]
pub struct DataBuffer {
    chunks: Arc<[Chunk]>,
    len: usize,
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBuffer")
            .field("ptr", &self.chunks.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

impl DataBuffer {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut chunks = vec![Chunk([0; 16]); (bytes.len() + 15) / 16];
        chunks.as_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        Self {
            chunks: chunks.into(),
            len: bytes.len(),
        }
    }

    /// Construct a `DataBuffer` from plain data, such as `[f32; 4]` or `u16`.
    pub fn from_slice<T: AsBytes>(data: &[T]) -> Self {
        Self::from_bytes(data.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.chunks.as_bytes()[..self.len]
    }

    /// Get whether `self` and `other` share the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.chunks, &other.chunks)
    }

    /// The identity of the storage.
    pub(crate) fn key(&self) -> usize {
        self.chunks.as_ptr() as usize
    }
}

/// A buffer binding: `count` elements of `stride` bytes starting at `offset`.
#[derive(Debug, Clone)]
pub(crate) struct BufferBinding {
    pub buffer: DataBuffer,
    pub offset: usize,
    pub stride: usize,
    pub count: usize,
}

impl BufferBinding {
    /// Validate the alignment and the range. `what` names the buffer kind in
    /// errors.
    pub fn new(
        buffer: &DataBuffer,
        offset: usize,
        stride: usize,
        count: usize,
        what: &'static str,
        misaligned: RenderError,
    ) -> Result<Self, RenderError> {
        if offset % 16 != 0 || stride % 16 != 0 {
            return Err(misaligned);
        }
        let end = Checked::from(stride) * count + offset;
        let end = end.ok_or(RenderError::BufferOutOfRange(what))?;
        if end > buffer.len() {
            return Err(RenderError::BufferOutOfRange(what));
        }
        Ok(Self {
            buffer: buffer.clone(),
            offset,
            stride,
            count,
        })
    }

    /// The bytes of the elements `range`.
    pub fn elements(&self, range: std::ops::Range<usize>) -> &[u8] {
        let bytes = self.buffer.as_bytes();
        &bytes[self.offset + range.start * self.stride..self.offset + range.end * self.stride]
    }

    /// The bytes of the element `i`.
    pub fn element(&self, i: usize) -> &[u8] {
        self.elements(i..i + 1)
    }
}

/// The size of index buffer elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexWidth {
    U8,
    U16,
    U32,
}

impl IndexWidth {
    /// Get the `IndexWidth` for an element size in bytes.
    pub fn from_size(size: usize) -> Result<Self, RenderError> {
        match size {
            1 => Ok(IndexWidth::U8),
            2 => Ok(IndexWidth::U16),
            4 => Ok(IndexWidth::U32),
            _ => Err(RenderError::InvalidIndexBufferStride(size)),
        }
    }

    pub fn size(self) -> usize {
        match self {
            IndexWidth::U8 => 1,
            IndexWidth::U16 => 2,
            IndexWidth::U32 => 4,
        }
    }
}

/// A bound index buffer.
#[derive(Debug, Clone)]
pub(crate) struct IndexBuffer {
    pub buffer: DataBuffer,
    pub offset: usize,
    pub width: IndexWidth,
    /// The number of indices.
    pub count: usize,
}

impl IndexBuffer {
    pub fn new(
        buffer: &DataBuffer,
        offset: usize,
        size: usize,
        count: usize,
    ) -> Result<Self, RenderError> {
        let width = IndexWidth::from_size(size)?;
        let end = Checked::from(count) * size + offset;
        let end = end.ok_or(RenderError::BufferOutOfRange("index"))?;
        if end > buffer.len() {
            return Err(RenderError::BufferOutOfRange("index"));
        }
        Ok(Self {
            buffer: buffer.clone(),
            offset,
            width,
            count,
        })
    }

    #[inline]
    pub fn get(&self, i: usize) -> u32 {
        let bytes = &self.buffer.as_bytes()[self.offset..];
        match self.width {
            IndexWidth::U8 => bytes[i] as u32,
            IndexWidth::U16 => {
                let b = &bytes[i * 2..i * 2 + 2];
                u16::from_ne_bytes([b[0], b[1]]) as u32
            }
            IndexWidth::U32 => {
                let b = &bytes[i * 4..i * 4 + 4];
                u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
            }
        }
    }

    /// Decode every index. Used for adjacency generation.
    pub fn to_vec(&self) -> Vec<u32> {
        (0..self.count).map(|i| self.get(i)).collect()
    }
}

/// Where the vertex indices of triangles come from.
#[derive(Debug, Clone)]
pub(crate) enum IndexSource {
    /// Every three consecutive vertices form a triangle.
    List { num_vertices: usize },
    Indexed(IndexBuffer),
}

impl IndexSource {
    pub fn num_triangles(&self) -> usize {
        match self {
            IndexSource::List { num_vertices } => num_vertices / 3,
            IndexSource::Indexed(ib) => ib.count / 3,
        }
    }

    /// The vertex indices of the triangle `i`.
    #[inline]
    pub fn triangle(&self, i: usize) -> [usize; 3] {
        match self {
            IndexSource::List { .. } => [i * 3, i * 3 + 1, i * 3 + 2],
            IndexSource::Indexed(ib) => [
                ib.get(i * 3) as usize,
                ib.get(i * 3 + 1) as usize,
                ib.get(i * 3 + 2) as usize,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        let buf = DataBuffer::from_slice(&[1u8, 2, 3]);
        assert_eq!(buf.as_bytes().as_ptr() as usize % 16, 0);
        assert_eq!(buf.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn identity() {
        let a = DataBuffer::from_slice(&[0u32; 4]);
        let b = DataBuffer::from_slice(&[0u32; 4]);
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn index_widths() {
        let data = DataBuffer::from_slice(&[0x0201u16, 0x0403, 0x0605]);
        let ib = IndexBuffer::new(&data, 0, 2, 3).unwrap();
        assert_eq!(ib.to_vec(), vec![0x0201, 0x0403, 0x0605]);

        let ib = IndexBuffer::new(&data, 0, 1, 6).unwrap();
        assert_eq!(ib.get(0), 1);

        assert_eq!(
            IndexBuffer::new(&data, 0, 3, 1).unwrap_err(),
            RenderError::InvalidIndexBufferStride(3)
        );
        assert_eq!(
            IndexBuffer::new(&data, 0, 4, 2).unwrap_err(),
            RenderError::BufferOutOfRange("index")
        );
    }

    #[test]
    fn binding_validation() {
        let data = DataBuffer::from_slice(&[[0.0f32; 4]; 4]);
        let e = RenderError::InvalidVertexBufferAlignment;
        assert!(BufferBinding::new(&data, 0, 16, 4, "vertex", e.clone()).is_ok());
        assert_eq!(
            BufferBinding::new(&data, 8, 16, 1, "vertex", e.clone()).unwrap_err(),
            e
        );
        assert_eq!(
            BufferBinding::new(&data, 0, 16, 5, "vertex", e.clone()).unwrap_err(),
            RenderError::BufferOutOfRange("vertex")
        );
    }
}
