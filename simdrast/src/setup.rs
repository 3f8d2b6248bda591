//! Triangle setup.
//!
//! Converts clip-space triangles into edge equations, depth planes, and pixel
//! bounding boxes, `W` triangles at a time. Triangles that are culled, face
//! away from the viewer, have zero area after snapping, or cover no pixel
//! centers' bounding box are flagged [`FaceFlags::BACK`] and ignored by the
//! later stages.
//!
//! Coordinates are *center-relative*: the origin is the center of the frame
//! buffer, `x` points right, and `y` points up (in pixels). Vertices are
//! snapped to a 1/16-pixel grid.
//!
//! Triangles whose vertices lie outside the guard band or behind the near
//! plane take the *clipped* path: each edge is clipped individually and its
//! equation is derived from the clipped endpoints. If an edge misses the
//! viewport entirely, its homogeneous form is used instead and the bounding
//! box is widened conservatively.
use std::ops::Range;

use crate::{
    buffer::IndexSource,
    drawcall::{FaceFlags, SetupTriangle},
    lanes::{full_mask, F32s, F64s, Mask},
    zmode, FAR_Z, FILL_BIAS, GUARD_BAND, NEAR_Z, SUBPIXEL,
};

/// The number of triangles processed by a single setup work item.
pub(crate) const SETUP_GRANULARITY: usize = 1024;

/// The output of [`setup_triangles`] for a range of triangles.
pub(crate) struct SetupOutput<'a> {
    pub triangles: &'a mut [SetupTriangle],
    pub hpez: &'a mut [[f64; 3]],
    pub flags: &'a mut [u8],
}

/// A homogeneous 2D vertex `(x, y, w)`.
#[derive(Clone, Copy)]
struct Vert<const W: usize> {
    x: F32s<W>,
    y: F32s<W>,
    w: F32s<W>,
}

impl<const W: usize> Vert<W> {
    fn lerp(self, other: Self, t: F32s<W>) -> Self {
        Self {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            w: self.w + (other.w - self.w) * t,
        }
    }

    fn select(mask: Mask, a: Self, b: Self) -> Self {
        Self {
            x: F32s::select(mask, a.x, b.x),
            y: F32s::select(mask, a.y, b.y),
            w: F32s::select(mask, a.w, b.w),
        }
    }

    /// Project and snap to the subpixel grid. The result has `w = 1`.
    fn snap(self) -> Self {
        let rz = F32s::splat(SUBPIXEL) / self.w;
        let inv = 1.0 / SUBPIXEL;
        Self {
            x: (self.x * rz).round() * inv,
            y: (self.y * rz).round() * inv,
            w: F32s::splat(1.0),
        }
    }

    fn dot(self, e: &Edge<W>) -> F32s<W> {
        self.x * e.a + self.y * e.b + self.w * e.c
    }
}

/// An edge equation `a·x + b·y + c·w` and the weight `w` used to build the
/// depth plane.
#[derive(Clone, Copy)]
struct Edge<const W: usize> {
    a: F32s<W>,
    b: F32s<W>,
    c: F32s<W>,
    w: F32s<W>,
}

impl<const W: usize> Edge<W> {
    /// The edge from `p0` to `p1`.
    fn through(p0: Vert<W>, p1: Vert<W>, w: F32s<W>) -> Self {
        Self {
            a: p0.y * p1.w - p1.y * p0.w,
            b: p1.x * p0.w - p0.x * p1.w,
            c: p0.x * p1.y - p1.x * p0.y,
            w,
        }
    }

    /// The lanes where the fill rule excludes points exactly on this edge.
    fn fill_bias_mask(&self) -> Mask {
        self.a.sign_mask() | (self.a.eq_mask(F32s::splat(0.0)) & self.b.sign_mask())
    }

    fn is_degenerate(&self) -> Mask {
        let zero = F32s::splat(0.0);
        self.a.eq_mask(zero) & self.b.eq_mask(zero)
    }
}

/// The constant term of the edge through `p0` and `p1` in double precision,
/// with the fill rule bias applied to `biased` lanes.
fn hp_edge<const W: usize>(p0: Vert<W>, p1: Vert<W>, biased: Mask) -> F64s<W> {
    let (x0, y0, x1, y1) = (p0.x.to_f64(), p0.y.to_f64(), p1.x.to_f64(), p1.y.to_f64());
    let bias = F64s(std::array::from_fn(|i| {
        if biased & (1 << i) != 0 {
            FILL_BIAS
        } else {
            0.0
        }
    }));
    x0 * y1 - x1 * y0 + bias
}

/// A bounding box `[x0, y0, x1, y1]`.
type BBox<const W: usize> = [F32s<W>; 4];

fn bbox_add<const W: usize>(bb: &mut Option<BBox<W>>, p0: [F32s<W>; 2], p1: [F32s<W>; 2]) {
    let init = [p0[0].min(p1[0]), p0[1].min(p1[1]), p0[0].max(p1[0]), p0[1].max(p1[1])];
    *bb = Some(match *bb {
        None => init,
        Some([x0, y0, x1, y1]) => [x0.min(init[0]), y0.min(init[1]), x1.max(init[2]), y1.max(init[3])],
    });
}

/// The guard band distances of a vertex: `[w·G - x, w·G - y]` and
/// `[w·G + x, w·G + y, w - ε]`. A negative component means the vertex is
/// outside the corresponding plane.
struct GuardBand<const W: usize> {
    a: [F32s<W>; 2],
    b: [F32s<W>; 3],
}

impl<const W: usize> GuardBand<W> {
    fn new(v: &Vert<W>) -> Self {
        let gw = v.w * GUARD_BAND;
        Self {
            a: [gw - v.x, gw - v.y],
            b: [gw + v.x, gw + v.y, v.w - 1.0e-3],
        }
    }

    fn outside(&self) -> Mask {
        self.a[0].sign_mask()
            | self.a[1].sign_mask()
            | self.b[0].sign_mask()
            | self.b[1].sign_mask()
            | self.b[2].sign_mask()
    }
}

struct ClippedEdge<const W: usize> {
    edge: Edge<W>,
    hpez: F64s<W>,
    /// The first endpoint after clipping, or a bounding box corner if the
    /// edge misses the viewport.
    first: Vert<W>,
}

/// Compute the equation of the edge `v0 → v1`, clipping it against the guard
/// band and the near plane.
fn clipped_edge<const W: usize>(
    v0: Vert<W>,
    g0: &GuardBand<W>,
    v1: Vert<W>,
    g1: &GuardBand<W>,
    half: [f32; 2],
    bb: &mut Option<BBox<W>>,
) -> ClippedEdge<W> {
    let zero = F32s::splat(0.0);
    let (hw, hh) = (half[0], half[1]);

    // Both endpoints outside the same viewport plane
    let (ww0, wh0, ww1, wh1) = (v0.w * hw, v0.w * hh, v1.w * hw, v1.w * hh);
    let trivial_reject = ((ww0 + v0.x).sign_mask() & (ww1 + v1.x).sign_mask())
        | ((ww0 - v0.x).sign_mask() & (ww1 - v1.x).sign_mask())
        | ((wh0 + v0.y).sign_mask() & (wh1 + v1.y).sign_mask())
        | ((wh0 - v0.y).sign_mask() & (wh1 - v1.y).sign_mask());

    // The line passes between the viewport corners
    let corner_accept = (v0.x * v1.y - v1.x * v0.y).le(
        (v0.y * v1.w - v1.y * v0.w).abs() * hw + (v1.x * v0.w - v0.x * v1.w).abs() * hh,
    );

    let mut inside = !trivial_reject & corner_accept;

    let ratio = |a0: F32s<W>, a1: F32s<W>| {
        let ne = !a0.eq_mask(a1);
        F32s::select(ne, (a0 - a1).recip(), zero)
    };

    // The clip parameters measured from each endpoint
    let mut s0 = zero;
    let mut s1 = zero;
    for (&c0, &c1) in g0.a.iter().chain(g0.b.iter()).zip(g1.a.iter().chain(g1.b.iter())) {
        let r = ratio(c0, c1);
        let toward_1 = c0.lt(c1);
        s0 = s0.max((c0 * r).keep(toward_1));
        s1 = s1.max((-c1 * r).keep(!toward_1));
    }

    let p0 = v0.lerp(v1, s0);
    let p1 = v1.lerp(v0, s1);
    inside &= (s0 + s1).lt(F32s::splat(1.0));

    let w = (p0.w * p1.w) / (F32s::splat(1.0) - s0 - s1);

    let p0 = Vert::select(inside, p0.snap(), v0);
    let p1 = Vert::select(inside, p1.snap(), v1);

    let edge = Edge::through(p0, p1, F32s::select(inside, w, F32s::splat(1.0)));
    let hpez = hp_edge(p0, p1, edge.fill_bias_mask() & inside);

    // Rejected edges contribute the corner of the guard band they point to
    let xc0 = F32s::select(edge.a.sign_mask(), F32s::splat(GUARD_BAND), F32s::splat(-GUARD_BAND));
    let yc0 = F32s::select(edge.b.sign_mask(), F32s::splat(GUARD_BAND), F32s::splat(-GUARD_BAND));
    let behind = g0.b[2].sign_mask() | g1.b[2].sign_mask();
    let xc1 = F32s::select(behind, -xc0, xc0);
    let yc1 = F32s::select(behind, -yc0, yc0);

    let first = Vert {
        x: F32s::select(inside, p0.x, xc0),
        y: F32s::select(inside, p0.y, yc0),
        w: p0.w,
    };
    let second = [
        F32s::select(inside, p1.x, xc1),
        F32s::select(inside, p1.y, yc1),
    ];
    bbox_add(bb, [first.x, first.y], second);

    ClippedEdge { edge, hpez, first }
}

/// Set up the triangles `range` of a draw call whose clip-space vertex
/// positions are `positions`. `out` receives the elements for `range`
/// (i.e., `out.triangles[0]` is the triangle `range.start`).
///
/// `size` is the size of the frame buffer in pixels.
pub(crate) fn setup_triangles<const W: usize>(
    positions: &[[f32; 4]],
    indices: &IndexSource,
    range: Range<usize>,
    size: [usize; 2],
    mut out: SetupOutput<'_>,
) {
    debug_assert_eq!(out.triangles.len(), range.len());
    let half = [size[0] as f32 * 0.5, size[1] as f32 * 0.5];

    let mut start = range.start;
    while start < range.end {
        let count = (range.end - start).min(W);
        let base = start - range.start;
        let flags = setup_batch::<W>(
            positions,
            indices,
            start,
            count,
            half,
            size,
            &mut out.triangles[base..base + count],
            &mut out.hpez[base..base + count],
        );
        out.flags[base..base + count].copy_from_slice(&flags[..count]);
        start += count;
    }
}

/// Set up `count ≤ W` triangles starting at `first`. Returns the flags of
/// each lane.
#[allow(clippy::too_many_arguments)]
fn setup_batch<const W: usize>(
    positions: &[[f32; 4]],
    indices: &IndexSource,
    first: usize,
    count: usize,
    half: [f32; 2],
    size: [usize; 2],
    triangles: &mut [SetupTriangle],
    hpez_out: &mut [[f64; 3]],
) -> [u8; W] {
    let zero = F32s::<W>::splat(0.0);
    let mut lane_mask = full_mask(count);

    // Gather. Padding lanes duplicate the first triangle.
    let tris: [[usize; 3]; W] = std::array::from_fn(|i| indices.triangle(first + i.min(count - 1)));
    let mut v = [Vert { x: zero, y: zero, w: zero }; 3];
    let mut z = [zero; 3];
    for k in 0..3 {
        let [x, y, zz, w] = crate::lanes::soa4::<W>(|i| positions[tris[i][k]]);
        v[k] = Vert { x, y, w };
        z[k] = zz;
    }

    // Frustum culling. Only needed if the first vertex is outside.
    let v0 = v[0];
    let first_outside = ((v0.w - v0.x.abs()).sign_mask()
        | (v0.w - v0.y.abs()).sign_mask()
        | (v0.w - z[0].abs()).sign_mask())
        & lane_mask;
    if first_outside != 0 {
        let all_outside = |f: &dyn Fn(usize) -> F32s<W>| {
            f(0).sign_mask() & f(1).sign_mask() & f(2).sign_mask()
        };
        let culled = all_outside(&|k| v[k].w - v[k].x)
            | all_outside(&|k| v[k].w + v[k].x)
            | all_outside(&|k| v[k].w - v[k].y)
            | all_outside(&|k| v[k].w + v[k].y)
            | all_outside(&|k| v[k].w - z[k])
            | all_outside(&|k| v[k].w + z[k]);
        lane_mask &= !culled;
    }

    let valid_face = lane_mask;

    // The orientation in homogeneous coordinates, before snapping
    let (v1, v2) = (v[1], v[2]);
    let adj11 = v1.y * v2.w - v2.y * v1.w;
    let adj12 = v1.x * v2.w - v1.w * v2.x;
    let adj13 = v1.x * v2.y - v1.y * v2.x;
    let back_before_snap = (v0.x * adj11 - v0.y * adj12 + v0.w * adj13).sign_mask() & lane_mask;

    if lane_mask != 0 {
        for vk in v.iter_mut() {
            vk.x *= half[0];
            vk.y *= half[1];
        }

        let guard: [GuardBand<W>; 3] = std::array::from_fn(|k| GuardBand::new(&v[k]));
        let needs_clipping =
            (guard[0].outside() | guard[1].outside() | guard[2].outside()) & lane_mask;

        let edges: [Edge<W>; 3];
        let hpez: [F64s<W>; 3];
        let mut bb: Option<BBox<W>> = None;

        if needs_clipping == 0 {
            let p = [v[0].snap(), v[1].snap(), v[2].snap()];
            bbox_add(&mut bb, [p[0].x, p[0].y], [p[1].x, p[1].y]);
            bbox_add(&mut bb, [p[2].x, p[2].y], [p[2].x, p[2].y]);

            // Edge `k` is opposite to the vertex `k`
            let e = [
                Edge::through(p[1], p[2], v[1].w * v[2].w),
                Edge::through(p[2], p[0], v[0].w * v[2].w),
                Edge::through(p[0], p[1], v[0].w * v[1].w),
            ];

            // Back faces and zero-area triangles
            lane_mask &= !p[0].dot(&e[0]).sign_mask();

            hpez = [
                hp_edge(p[1], p[2], e[0].fill_bias_mask()),
                hp_edge(p[2], p[0], e[1].fill_bias_mask()),
                hp_edge(p[0], p[1], e[2].fill_bias_mask()),
            ];
            edges = e;
        } else {
            let c0 = clipped_edge(v[1], &guard[1], v[2], &guard[2], half, &mut bb);
            let c1 = clipped_edge(v[2], &guard[2], v[0], &guard[0], half, &mut bb);
            let c2 = clipped_edge(v[0], &guard[0], v[1], &guard[1], half, &mut bb);

            let back = c0.first.dot(&c1.edge).sign_mask()
                & c1.first.dot(&c2.edge).sign_mask()
                & c2.first.dot(&c0.edge).sign_mask();
            lane_mask &= !back;

            hpez = [c0.hpez, c1.hpez, c2.hpez];
            edges = [c0.edge, c1.edge, c2.edge];
        }

        for e in edges.iter() {
            lane_mask &= !e.is_degenerate();
        }

        // Move the origin to the bottom-left corner and clamp to the viewport
        let [mut x0, mut y0, mut x1, mut y1] = bb.unwrap_or([zero; 4]);
        x0 = (x0 + half[0]).max(zero);
        y0 = (y0 + half[1]).max(zero);
        x1 = (x1 + half[0]).min(F32s::splat(size[0] as f32));
        y1 = (y1 + half[1]).min(F32s::splat(size[1] as f32));
        lane_mask &= x0.lt(x1) & y0.lt(y1);

        if lane_mask != 0 {
            let bb_min = [x0.floor().to_i16_sat(), y0.floor().to_i16_sat()];
            let bb_max = [x1.ceil().to_i16_sat(), y1.ceil().to_i16_sat()];

            // The depth plane
            let zz: [F32s<W>; 3] = std::array::from_fn(|k| (v[k].w - z[k]) * 0.5);
            let zw: [F32s<W>; 3] = std::array::from_fn(|k| zz[k] * edges[k].w);
            let mut ez = [
                edges[0].a * zw[0] + edges[1].a * zw[1] + edges[2].a * zw[2],
                edges[0].b * zw[0] + edges[1].b * zw[1] + edges[2].b * zw[2],
                edges[0].c * zw[0] + edges[1].c * zw[1] + edges[2].c * zw[2],
            ];
            let det = v.iter().fold(zero, |acc, vk| {
                acc + ez[0] * vk.x + ez[1] * vk.y + ez[2] * vk.w
            });
            let inv_det = (zz[0] + zz[1] + zz[2]) / det;
            for e in ez.iter_mut() {
                *e *= inv_det;
            }

            let pz: [F32s<W>; 3] = std::array::from_fn(|k| {
                F32s::select(v[k].w.gt(zero), zz[k] / v[k].w, F32s::splat(NEAR_Z))
            });

            for i in 0..count {
                let zmin = zmode::nearer(pz[0][i], zmode::nearer(pz[1][i], pz[2][i]));
                let zfar = zmode::farther(pz[0][i], zmode::farther(pz[1][i], pz[2][i]));
                triangles[i] = SetupTriangle {
                    edges: std::array::from_fn(|k| {
                        [edges[k].a[i], edges[k].b[i], edges[k].c[i], ez[k][i]]
                    }),
                    bb_min: [bb_min[0][i], bb_min[1][i]],
                    bb_max: [bb_max[0][i], bb_max[1][i]],
                    zmin_vertex: zmin,
                    zmax_vertex: zmode::nearer(zfar, FAR_Z),
                };
                hpez_out[i] = [hpez[0][i], hpez[1][i], hpez[2][i]];
            }
        }
    }

    let mut flags = [0u8; W];
    for (i, f) in flags.iter_mut().enumerate().take(count) {
        let bit = 1 << i;
        let mut x = FaceFlags::empty();
        x.set(FaceFlags::BACK, lane_mask & bit == 0);
        x.set(FaceFlags::VALID, valid_face & bit != 0);
        x.set(FaceFlags::BACK_BEFORE_SNAP, back_before_snap & bit != 0);
        *f = x.bits();
    }
    flags
}

/// Iterate through the triangles not flagged [`FaceFlags::BACK`].
pub(crate) fn front_faces(flags: &[u8]) -> impl Iterator<Item = usize> + '_ {
    flags
        .iter()
        .enumerate()
        .filter(|(_, &f)| f & FaceFlags::BACK.bits() == 0)
        .map(|(i, _)| i)
}

/// Evaluate the edge functions of `tri` at the center-relative point `p`
/// with the double-precision constants.
#[cfg(test)]
pub(crate) fn edge_values(tri: &SetupTriangle, hpez: &[f64; 3], p: [f64; 2]) -> [f64; 3] {
    std::array::from_fn(|k| {
        tri.edges[k][0] as f64 * p[0] + tri.edges[k][1] as f64 * p[1] + hpez[k]
    })
}
