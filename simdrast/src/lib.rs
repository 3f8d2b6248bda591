//! A multi-threaded, lane-parallel software rasterizer.
//!
//! Triangle meshes are rendered into an RGBA8 pixel buffer in four phases,
//! each of which is driven by the caller through [`Renderer`]:
//!
//!  1. **Front end (shade)**: Vertex shading, triangle setup, and (optionally)
//!     seeding of the importance map by a [`HimRasterizer`].
//!  2. **Front end (bin)**: The importance map pyramid is built, and every
//!     triangle is inserted into the per-worker bin lists of the 8×8 tiles it
//!     may cover, with opaque geometry tightening a per-tile depth bound.
//!  3. **Back end**: Tiles are resolved independently: the bin lists of all
//!     workers are merged, samples are tested, fragments are shaded and
//!     blended, and the 16 samples of every pixel are box-filtered.
//!  4. **Finish**: Frame-scoped memory is released.
//!
//! Depth uses the reversed-Z convention: `1.0` is the near plane and `0.0` is
//! the far plane, and "nearer" means "numerically greater".
//!
//! # Restrictions
//!
//!  - At most 65535 draw calls per frame and 2²⁴ triangles per draw call.
//!  - At most 8192 triangles may touch a single tile.
//!  - Vertex, attribute, and index data must be 16-byte aligned.
//!  - The only supported pixel format is RGBA8888.
//!
pub mod adjacency;
pub mod arena;
mod binlist;
mod binning;
mod buffer;
mod composite;
mod config;
mod drawcall;
mod error;
pub mod himap;
pub mod lanes;
pub mod pool;
mod renderer;
mod resolve;
mod setup;
mod shade;
mod shader;
pub mod silhouette;
mod state;
mod target;

pub use self::{
    buffer::{DataBuffer, IndexWidth},
    config::{LaneWidth, RendererConfig},
    drawcall::FaceFlags,
    error::RenderError,
    himap::ImportanceMap,
    renderer::Renderer,
    shader::{Shader, ShaderKind},
    silhouette::{HimRasterizer, HimTarget, SilhouetteRasterizer},
    state::{BlendMode, CullMode, DepthMode, FragmentMode, VertexMode},
    target::{FrameBuffer, FrameBufferFormat},
};

/// `log2(TILE)`
pub const TILE_SHIFT: u32 = 3;
/// The tile size.
pub const TILE: usize = 1 << TILE_SHIFT;

/// The number of samples per pixel.
pub const SAMPLES: usize = 16;

/// The depth value of the near plane.
pub const NEAR_Z: f32 = 1.0;
/// The depth value of the far plane.
pub const FAR_Z: f32 = 0.0;

/// The half-extent of the guard band, measured in pixels.
const GUARD_BAND: f32 = 1920.0;

/// The number of subpixel steps per pixel. Vertices are snapped to this grid.
const SUBPIXEL: f32 = 16.0;

/// The edge bias implementing the top-left fill rule.
const FILL_BIAS: f64 = -1.0 / 512.0;

/// The maximum number of draw calls in a frame.
pub const MAX_DRAW_CALLS: usize = 0xffff;

/// The maximum number of triangles in a draw call.
pub const MAX_TRIANGLES_PER_DRAW: usize = 1 << 24;

/// The maximum number of triangles that may be binned into a single tile.
pub const MAX_TRIANGLES_PER_TILE: usize = 8192;

/// The maximum width and height of a frame buffer. Pixel bounding boxes are
/// stored as `i16`.
pub const MAX_FRAME_BUFFER_SIZE: usize = i16::max_value() as usize;

/// The maximum size of a vertex's attributes, measured in bytes.
pub const MAX_ATTRIBUTE_STRIDE: usize = 128;

/// Reversed-Z depth comparisons. "Less" means "nearer", which is numerically
/// greater.
mod zmode {
    /// `a` is nearer than `b`.
    #[inline]
    pub fn is_nearer(a: f32, b: f32) -> bool {
        a > b
    }

    /// The per-sample depth test. Samples at or beyond the near plane are
    /// clipped.
    #[inline]
    pub fn passes(z: f32, old: f32) -> bool {
        z < super::NEAR_Z && is_nearer(z, old)
    }

    /// The nearer of `a` and `b`.
    #[inline]
    pub fn nearer(a: f32, b: f32) -> f32 {
        a.max(b)
    }

    /// The farther of `a` and `b`.
    #[inline]
    pub fn farther(a: f32, b: f32) -> f32 {
        a.min(b)
    }
}
