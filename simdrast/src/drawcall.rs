use bitflags::bitflags;
use std::sync::{atomic::AtomicU8, Arc};
use zerocopy::{AsBytes, FromBytes};

use crate::{
    arena::{Arena, ArenaSlice},
    buffer::{BufferBinding, IndexSource},
    state::RenderStates,
};

bitflags! {
    /// Per-triangle classification produced by triangle setup.
    pub struct FaceFlags: u8 {
        /// The triangle produces no samples: culled, back-facing after
        /// snapping, degenerate, or off-screen.
        const BACK = 1 << 0;
        /// The triangle survived frustum culling.
        const VALID = 1 << 1;
        /// The triangle faces away from the viewer before vertex snapping.
        const BACK_BEFORE_SNAP = 1 << 2;
        /// The triangle lies on a silhouette. Such triangles are never
        /// skipped by the resolve stage's early-out.
        const IMPORTANT = 1 << 3;
    }
}

/// The setup result of a triangle, consumed by binning and resolve.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes)]
pub(crate) struct SetupTriangle {
    /// For each edge `k`, `[a, b, c, dz]`. A point `(x, y)` in
    /// center-relative pixel coordinates is inside the edge if
    /// `a·x + b·y + c ≥ 0`. The fourth elements form the depth plane
    /// `z = dz₀·x + dz₁·y + dz₂`.
    pub edges: [[f32; 4]; 3],
    /// The pixel bounding box (inclusive minimum). The origin is the
    /// bottom-left corner of the frame buffer and `y` points up.
    pub bb_min: [i16; 2],
    /// The pixel bounding box (exclusive maximum).
    pub bb_max: [i16; 2],
    /// The depth of the nearest vertex.
    pub zmin_vertex: f32,
    /// The depth of the farthest vertex, clamped to the far plane.
    pub zmax_vertex: f32,
}

/// The frame-scoped arrays of a draw call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DrawCallArrays {
    /// Clip-space positions, one per vertex.
    pub positions: ArenaSlice<[f32; 4]>,
    pub triangles: ArenaSlice<SetupTriangle>,
    /// The constant terms of the edge equations (including the fill rule
    /// bias) in double precision.
    pub hpez: ArenaSlice<[f64; 3]>,
    /// [`FaceFlags`] bits.
    pub flags: ArenaSlice<u8>,
}

impl DrawCallArrays {
    pub fn allocate(
        arena: &Arena,
        num_vertices: usize,
        num_triangles: usize,
    ) -> Result<Self, crate::RenderError> {
        Ok(Self {
            positions: arena.allocate(num_vertices)?,
            triangles: arena.allocate(num_triangles)?,
            hpez: arena.allocate(num_triangles)?,
            flags: arena.allocate(num_triangles)?,
        })
    }
}

/// A recorded draw call.
#[derive(Debug, Clone)]
pub(crate) struct DrawCall {
    pub states: RenderStates,
    pub vertices: BufferBinding,
    pub attributes: BufferBinding,
    pub indices: IndexSource,
    /// See [`crate::adjacency`]. `None` for non-indexed draws and in dense
    /// mode.
    pub adjacency: Option<Arc<[u32]>>,
    pub arrays: DrawCallArrays,
}

impl DrawCall {
    pub fn num_triangles(&self) -> usize {
        self.indices.num_triangles()
    }

    pub fn is_opaque(&self) -> bool {
        self.states.fragment_mode.is_opaque()
    }

    /// Opaque and writes depth. Only such draw calls tighten the per-tile
    /// depth bound during binning.
    pub fn is_occluder(&self) -> bool {
        self.is_opaque() && self.states.fragment_mode.depth_write
    }

    /// # Safety
    ///
    /// Vertex shading of this draw call must be complete.
    pub unsafe fn positions<'a>(&self, arena: &'a Arena) -> &'a [[f32; 4]] {
        arena.slice(self.arrays.positions)
    }

    /// # Safety
    ///
    /// Triangle setup of this draw call must be complete.
    pub unsafe fn triangles<'a>(&self, arena: &'a Arena) -> &'a [SetupTriangle] {
        arena.slice(self.arrays.triangles)
    }

    /// # Safety
    ///
    /// Triangle setup of this draw call must be complete.
    pub unsafe fn hpez<'a>(&self, arena: &'a Arena) -> &'a [[f64; 3]] {
        arena.slice(self.arrays.hpez)
    }

    /// # Safety
    ///
    /// Triangle setup of this draw call must be complete, and no one may
    /// access the flags non-atomically for the lifetime of the result.
    pub unsafe fn atomic_flags<'a>(&self, arena: &'a Arena) -> &'a [AtomicU8] {
        arena.atomic_bytes(self.arrays.flags)
    }

    /// # Safety
    ///
    /// Triangle setup and silhouette rasterization of this draw call must be
    /// complete.
    pub unsafe fn flags<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        arena.slice(self.arrays.flags)
    }
}
