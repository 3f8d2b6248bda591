//! Seeding the importance map from geometry.
//!
//! Without [`Renderer::force_dense`](crate::Renderer::force_dense), only the
//! pixels marked in the importance map are resolved. A [`HimRasterizer`] is
//! run for every draw call once its triangles are set up and decides which
//! pixels are important. [`SilhouetteRasterizer`] marks the pixels along the
//! silhouette edges of meshes, which is where a coarser renderer (e.g., a GPU
//! pass without multisampling) would produce the most visible artifacts.
use std::{
    ops::Range,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::{
    adjacency::NO_NEIGHBOR, buffer::IndexSource, drawcall::FaceFlags, himap::ImportanceMap,
};

/// Marks important pixels and triangles. See the [module-level
/// documentation](self).
pub trait HimRasterizer: Send + Sync {
    /// Process the triangles `triangles` of the draw call described by
    /// `target`. Called from worker threads, possibly for many ranges of the
    /// same draw call at once.
    fn rasterize(&self, target: &HimTarget<'_>, triangles: Range<usize>);
}

/// The data of a draw call available to [`HimRasterizer`].
pub struct HimTarget<'a> {
    pub(crate) positions: &'a [[f32; 4]],
    pub(crate) indices: &'a IndexSource,
    pub(crate) flags: &'a [AtomicU8],
    pub(crate) adjacency: Option<&'a [u32]>,
    pub(crate) himap: &'a ImportanceMap,
    pub(crate) size: [usize; 2],
    pub(crate) opaque: bool,
    pub(crate) transparent_importance: bool,
}

impl HimTarget<'_> {
    pub fn num_triangles(&self) -> usize {
        self.flags.len()
    }

    /// The vertex indices of the triangle `i`.
    pub fn triangle(&self, i: usize) -> [usize; 3] {
        self.indices.triangle(i)
    }

    /// The clip-space position of the vertex `i`, as produced by the vertex
    /// shader.
    pub fn position(&self, i: usize) -> [f32; 4] {
        self.positions[i]
    }

    pub fn flags(&self, i: usize) -> FaceFlags {
        FaceFlags::from_bits_truncate(self.flags[i].load(Ordering::Relaxed))
    }

    /// Flag the triangle `i` [`FaceFlags::IMPORTANT`].
    pub fn mark_important(&self, i: usize) {
        self.flags[i].fetch_or(FaceFlags::IMPORTANT.bits(), Ordering::Relaxed);
    }

    /// The triangle sharing the edge `j` (from the vertex `j` to the vertex
    /// `(j + 1) % 3`) of the triangle `i`. Returns `None` if the edge is open
    /// or the draw call has no adjacency information.
    pub fn neighbor(&self, i: usize, j: usize) -> Option<usize> {
        let adj = self.adjacency?[i * 3 + j];
        if adj == NO_NEIGHBOR {
            None
        } else {
            Some(adj as usize)
        }
    }

    pub fn importance_map(&self) -> &ImportanceMap {
        self.himap
    }

    /// The frame buffer size in pixels.
    pub fn frame_size(&self) -> [usize; 2] {
        self.size
    }

    /// Get whether the draw call should contribute importance. Only opaque
    /// draw calls do unless transparent importance is forced.
    pub fn wants_silhouettes(&self) -> bool {
        self.opaque || self.transparent_importance
    }
}

/// Marks the silhouette edges of meshes. Uses adjacency information, so it
/// should be used with indexed draw calls.
///
/// A front-facing triangle is flagged [`FaceFlags::IMPORTANT`] if any of its
/// neighbors is culled for facing away or if it has an open edge. An edge
/// between a triangle facing the viewer (before snapping) and one facing away
/// from it (or an open edge) is clipped to the view frustum and walked across
/// the importance map.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilhouetteRasterizer;

impl SilhouetteRasterizer {
    pub fn new() -> Self {
        Self
    }
}

impl HimRasterizer for SilhouetteRasterizer {
    fn rasterize(&self, target: &HimTarget<'_>, triangles: Range<usize>) {
        if !target.wants_silhouettes() {
            return;
        }

        let himap = target.importance_map();
        let [width, height] = target.frame_size();
        let half = [width as f32 * 0.5, height as f32 * 0.5];
        let culled = FaceFlags::BACK | FaceFlags::VALID;
        let silhouette_neighbor = FaceFlags::VALID | FaceFlags::BACK_BEFORE_SNAP;

        for i in triangles {
            let flags = target.flags(i);

            if !flags.contains(FaceFlags::BACK) {
                let important = (0..3).any(|j| match target.neighbor(i, j) {
                    Some(adj) => target.flags(adj) & culled == culled,
                    None => true,
                });
                if important {
                    target.mark_important(i);
                }
            }

            // Only valid triangles facing the viewer before snapping
            if flags & silhouette_neighbor != FaceFlags::VALID {
                continue;
            }

            let ind = target.triangle(i);
            for j in 0..3 {
                if let Some(adj) = target.neighbor(i, j) {
                    if target.flags(adj) & silhouette_neighbor != silhouette_neighbor {
                        continue;
                    }
                }

                let p0 = target.position(ind[j]);
                let p1 = target.position(ind[(j + 1) % 3]);

                if let Some([start, end]) = project_edge(p0, p1, half, [width, height]) {
                    rasterize_edge(start, end, himap);
                }
            }
        }
    }
}

/// Clip the edge `p0 → p1` against the view frustum and convert it to
/// window coordinates in 1/16 pixels. Returns `None` if the edge is outside.
fn project_edge(
    mut p0: [f32; 4],
    mut p1: [f32; 4],
    half: [f32; 2],
    size: [usize; 2],
) -> Option<[[i32; 2]; 2]> {
    let (w0, w1) = (p0[3], p1[3]);

    // Both endpoints outside the same plane
    if (0..3).any(|k| (w0 <= p0[k] && w1 <= p1[k]) || (w0 <= -p0[k] && w1 <= -p1[k])) {
        return None;
    }

    if (0..3).any(|k| w0 < p0[k].abs() || w1 < p1[k].abs()) {
        let mut s0 = 0.0f32;
        let mut s1 = 0.0f32;
        for k in 0..3 {
            let (a0, a1) = (w0 - p0[k], w1 - p1[k]);
            let (b0, b1) = (w0 + p0[k], w1 + p1[k]);
            let sp = a0 / (a0 - a1);
            let sn = b0 / (b0 - b1);

            // The parameter at which the edge leaves or enters the plane
            // measured from either endpoint
            if a0 < a1 && sp > 0.0 {
                s0 = s0.max(sp);
            }
            if b0 < b1 && sn > 0.0 {
                s0 = s0.max(sn);
            }
            if a0 > a1 && 1.0 - sp > 0.0 {
                s1 = s1.max(1.0 - sp);
            }
            if b0 > b1 && 1.0 - sn > 0.0 {
                s1 = s1.max(1.0 - sn);
            }
        }

        if s0 >= 1.0 || s1 >= 1.0 || s0 + s1 >= 1.0 {
            return None;
        }

        let op0 = p0;
        if s0 > 0.0 {
            p0 = lerp(p0, p1, s0);
        }
        if s1 > 0.0 {
            p1 = lerp(p1, op0, s1);
        }
    }

    let (width, height) = (size[0] as i32, size[1] as i32);
    let to_window = |p: [f32; 4]| {
        let rw = 16.0 / p[3];
        let x = (p[0] * half[0] * rw).round() as i32 + (width << 3);
        let y = (p[1] * half[1] * rw).round() as i32 + (height << 3);
        [
            x.max(1).min((width << 4) - 1),
            y.max(1).min((height << 4) - 1),
        ]
    };

    Some([to_window(p0), to_window(p1)])
}

fn lerp(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

/// Mark every importance map cell crossed by the line segment from `start`
/// to `end`, given in 1/16 pixels from the bottom-left corner.
///
/// The walk moves one cell at a time, horizontally or vertically, so
/// diagonal neighbors are connected by an extra cell.
pub(crate) fn rasterize_edge(mut start: [i32; 2], mut end: [i32; 2], himap: &ImportanceMap) {
    if start[0] > end[0] {
        std::mem::swap(&mut start, &mut end);
    }

    let x = start[0] >> 4;
    let y = start[1] >> 4;
    let v = [end[0] - start[0], end[1] - start[1]];

    let step_y: i64 = if v[1] < 0 { -1 } else { 1 };

    let tmax_x = (16 - (start[0] & 0xf)) as i64;
    let tmax_y = (if step_y > 0 { 16 } else { 0 }) - (start[1] & 0xf) as i64;

    let (mut fx, mut fy) = (v[1] as i64, v[0] as i64);
    if v[1] < 0 {
        fx = -fx;
        fy = -fy;
    }

    let tdelta_x = fx << 4;
    let tdelta_y = fy.abs() << 4;
    let mut error = tmax_x * fx - tmax_y * fy;

    let shift = himap.max_level();
    let step_y = step_y << shift;

    let last_x = end[0] >> 4;
    let last_y = end[1] >> 4;
    let steps = (last_x - x) + (last_y - y).abs();

    let mut idx = ((y as i64) << shift) + x as i64;
    himap.set_index(idx as usize);

    for _ in 0..steps {
        if error <= 0 {
            error += tdelta_x;
            idx += 1;
        } else {
            error -= tdelta_y;
            idx += step_y;
        }
        if idx >= 0 {
            himap.set_index(idx as usize);
        }
    }
}
