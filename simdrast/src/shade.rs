//! Fragment shading and blending.
//!
//! The resolve stage collects *fragments*, each of which is a triangle's
//! coverage of a pixel, packed into a `u64`:
//!
//! ```text
//!   draw_call << 48 | triangle << 24 | pixel << 16 | samples
//! ```
//!
//! Sorting them groups the fragments by draw call and then by triangle, so
//! the attribute shader runs once per triangle and the fragment shader once
//! per fragment (not per sample).
use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    arena::Arena, buffer::Chunk, drawcall::DrawCall, lanes::lanes_of, FAR_Z, SAMPLES,
};

/// The sample mask with every sample set.
pub(crate) const ALL_SAMPLES: u32 = (1 << SAMPLES) - 1;

/// Sorts after every real fragment. The draw call field (`0xffff`) is never
/// a valid draw call index.
const END_OF_FRAGMENTS: u64 = !0;

/// The draw call and triangle part of a fragment.
#[inline]
pub(crate) fn triangle_fragment(draw_call: u16, triangle: u32) -> u64 {
    (draw_call as u64) << 48 | (triangle as u64) << 24
}

/// A fragment produced by a non-opaque draw call. Only the lane is known
/// until [`shade_and_blend`] substitutes the triangle.
#[inline]
pub(crate) fn lane_fragment(lane: usize, pixel: usize, samples: u32) -> u64 {
    lane as u64 | ((samples | (pixel as u32) << 16) as u64) << 24
}

#[inline]
fn draw_call_of(f: u64) -> usize {
    (f >> 48) as usize
}

#[inline]
fn triangle_of(f: u64) -> usize {
    ((f >> 24) & 0xff_ffff) as usize
}

#[inline]
fn pixel_of(f: u64) -> usize {
    ((f >> 16) & 0xff) as usize
}

#[inline]
fn samples_of(f: u64) -> u32 {
    f as u32 & ALL_SAMPLES
}

/// The state of a pixel being resolved.
#[derive(Debug, Clone)]
pub(crate) struct PixelSamples {
    /// Pending fragments, not shaded yet.
    pub fragments: ArrayVec<[u64; SAMPLES]>,
    /// The samples covered by opaque geometry.
    pub sample_mask: u32,
    /// The pixel may be left to a coarser renderer. Cleared as soon as the
    /// pixel turns out to need shading.
    pub early_out: bool,
    /// The pixel is touched by an [`IMPORTANT`](crate::FaceFlags::IMPORTANT)
    /// triangle.
    pub important: bool,
    /// The farthest depth among `z`.
    pub zmax: f32,
    pub z: [f32; SAMPLES],
    pub c: [u32; SAMPLES],
}

impl PixelSamples {
    pub fn new(clear_color: u32, early_out: bool) -> Self {
        Self {
            fragments: ArrayVec::new(),
            sample_mask: 0,
            early_out,
            important: false,
            zmax: FAR_Z,
            z: [FAR_Z; SAMPLES],
            c: [clear_color; SAMPLES],
        }
    }
}

/// A pixel resolved by the current tile.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TargetPixel {
    /// The position from the bottom-left corner of the frame buffer.
    pub x: usize,
    pub y: usize,
    /// The position of the pixel's bottom-left corner relative to the tile
    /// center.
    pub offset: [f32; 2],
}

/// What shading needs to know about the frame and the tile.
pub(crate) struct ShadeInput<'a> {
    pub arena: &'a Arena,
    pub draw_calls: &'a [DrawCall],
    /// The center of the tile in center-relative pixel coordinates.
    pub tile_center: [f32; 2],
    /// Half the frame buffer size.
    pub half: [f32; 2],
}

#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, FromBytes, AsBytes)]
struct Vec4([f32; 4]);

/// Reusable buffers for shading.
#[derive(Default)]
pub(crate) struct ShadeScratch {
    fragments: Vec<u64>,
    buffers: ShadeBuffers,
}

#[derive(Default)]
struct ShadeBuffers {
    /// The distinct triangles of the fragments being shaded.
    triangles: Vec<u32>,
    /// The index into `triangles` of each fragment.
    slots: Vec<u32>,
    interp: Vec<Interp>,
    attr_in: Vec<Chunk>,
    attr_out: Vec<Vec4>,
    frag_in: Vec<Vec4>,
    colors: Vec<Chunk>,
}

impl ShadeBuffers {
    fn color(&self, i: usize) -> u32 {
        let b = &self.colors.as_bytes()[i * 4..i * 4 + 4];
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }
}

/// Perspective-correct interpolation over a triangle.
///
/// `e[k]` is the 2D homogeneous edge function opposite to the vertex `k`,
/// scaled to pixel units. At a pixel `p`, `λₖ = eₖ(p) / Σ e(p)`.
#[derive(Debug, Clone, Copy)]
struct Interp {
    e: [[f32; 3]; 3],
    sum: [f32; 2],
}

impl Interp {
    fn new(p: [[f32; 4]; 3], half: [f32; 2]) -> Self {
        let [hw, hh] = half;
        let e: [[f32; 3]; 3] = std::array::from_fn(|k| {
            let v0 = p[(k + 1) % 3];
            let v1 = p[(k + 2) % 3];
            [
                (v0[1] * v1[3] - v1[1] * v0[3]) * hh,
                (v1[0] * v0[3] - v0[0] * v1[3]) * hw,
                (v0[0] * v1[1] - v1[0] * v0[1]) * hh * hw,
            ]
        });
        Self {
            e,
            sum: [
                e[0][0] + e[1][0] + e[2][0],
                e[0][1] + e[1][1] + e[2][1],
            ],
        }
    }

    /// The barycentric coordinates at `p` and their derivatives along `x`
    /// and `y`.
    fn eval(&self, p: [f32; 2]) -> [[f32; 3]; 3] {
        let e = &self.e;
        let d: [f32; 3] = std::array::from_fn(|k| e[k][0] * p[0] + e[k][1] * p[1] + e[k][2]);
        let w = 1.0 / (d[0] + d[1] + d[2]);
        let l = [d[0] * w, d[1] * w, d[2] * w];
        [
            l,
            std::array::from_fn(|k| (e[k][0] - self.sum[0] * l[k]) * w),
            std::array::from_fn(|k| (e[k][1] - self.sum[1] * l[k]) * w),
        ]
    }
}

/// Shade the fragments of the draw call of `fragments[0]`, which must be
/// grouped by triangle and followed by a fragment of another draw call (or
/// [`END_OF_FRAGMENTS`]). Returns the number of the fragments shaded. Their
/// colors are left in `buf`.
fn shade_draw_call(
    input: &ShadeInput<'_>,
    pixels: &[TargetPixel],
    fragments: &[u64],
    buf: &mut ShadeBuffers,
) -> usize {
    let draw_call_index = draw_call_of(fragments[0]);
    let count = fragments
        .iter()
        .position(|&f| draw_call_of(f) != draw_call_index)
        .unwrap_or(fragments.len());
    let fragments = &fragments[..count];

    let draw_call = &input.draw_calls[draw_call_index];
    let arena = input.arena;
    // Safety: vertex shading is complete
    let positions = unsafe { draw_call.positions(arena) };

    let attribute = &draw_call.states.attribute;
    let in_chunks = draw_call.attributes.stride / 16;
    let out_vecs = attribute.shader.output_stride() / 16;

    buf.triangles.clear();
    buf.slots.clear();
    for &f in fragments {
        let tri = triangle_of(f) as u32;
        if buf.triangles.last() != Some(&tri) {
            buf.triangles.push(tri);
        }
        buf.slots.push(buf.triangles.len() as u32 - 1);
    }

    // Gather the vertex attributes of every triangle
    let num_vertices = buf.triangles.len() * 3;
    buf.attr_in.clear();
    buf.attr_in.resize(num_vertices * in_chunks, Chunk([0; 16]));
    buf.interp.clear();
    for (j, &tri) in buf.triangles.iter().enumerate() {
        let vertices = draw_call.indices.triangle(tri as usize);
        for (k, &v) in vertices.iter().enumerate() {
            let start = (j * 3 + k) * in_chunks;
            buf.attr_in[start..start + in_chunks]
                .as_bytes_mut()
                .copy_from_slice(draw_call.attributes.element(v));
        }
        buf.interp
            .push(Interp::new(vertices.map(|v| positions[v]), input.half));
    }

    buf.attr_out.clear();
    buf.attr_out.resize(num_vertices * out_vecs, Vec4::default());
    attribute.shader.execute(
        buf.attr_in.as_bytes(),
        buf.attr_out.as_bytes_mut(),
        num_vertices,
        attribute.uniform_bytes(arena),
    );

    // Interpolate. The first vector receives the screen-space derivatives.
    buf.frag_in.clear();
    buf.frag_in.resize(count * out_vecs, Vec4::default());
    for (i, &f) in fragments.iter().enumerate() {
        let slot = buf.slots[i] as usize;
        let pixel = &pixels[pixel_of(f)];
        let p = [
            input.tile_center[0] + pixel.offset[0] + 0.5,
            input.tile_center[1] + pixel.offset[1] + 0.5,
        ];
        let [l, dldx, dldy] = buf.interp[slot].eval(p);

        let attrs = &buf.attr_out[slot * 3 * out_vecs..(slot + 1) * 3 * out_vecs];
        let out = &mut buf.frag_in[i * out_vecs..(i + 1) * out_vecs];
        let (first, rest) = match out.split_first_mut() {
            Some(x) => x,
            None => continue,
        };

        for k in 0..3 {
            let a = &attrs[k * out_vecs..(k + 1) * out_vecs];
            let d = [dldx[k], dldx[k], dldy[k], dldy[k]];
            for c in 0..4 {
                first.0[c] += a[0].0[c] * d[c];
            }
            for (o, a) in rest.iter_mut().zip(a[1..].iter()) {
                for c in 0..4 {
                    o.0[c] += a.0[c] * l[k];
                }
            }
        }
    }

    let fragment = &draw_call.states.fragment;
    buf.colors.clear();
    buf.colors.resize((count + 3) / 4, Chunk([0; 16]));
    fragment.shader.execute(
        buf.frag_in.as_bytes(),
        &mut buf.colors.as_bytes_mut()[..count * 4],
        count,
        fragment.uniform_bytes(arena),
    );

    count
}

/// Get whether the visible surface of a fully covered pixel is a single
/// triangle, or two adjacent triangles of a draw call, or contains no
/// important triangle. The shading of such a pixel can be left to a coarser
/// renderer.
fn is_simple_surface(draw_calls: &[DrawCall], samples: &PixelSamples) -> bool {
    if !samples.important || samples.fragments.len() == 1 {
        return true;
    }

    if let [a, b] = samples.fragments[..] {
        if draw_call_of(a) == draw_call_of(b) {
            let (ta, tb) = (triangle_of(a), triangle_of(b));
            if let Some(adj) = &draw_calls[draw_call_of(a)].adjacency {
                return adj[ta * 3..ta * 3 + 3].contains(&(tb as u32));
            }
        }
    }

    false
}

/// Shade the pending fragments of every pixel and overwrite the covered
/// samples with the results.
///
/// If `early_out` is set, pixels flagged `early_out` whose surface is
/// simple (see [`is_simple_surface`]) are skipped and keep their fragments
/// and flag. Every other pixel loses the flag.
pub(crate) fn shade_tile(
    input: &ShadeInput<'_>,
    scratch: &mut ShadeScratch,
    pixels: &[TargetPixel],
    samples: &mut [PixelSamples],
    early_out: bool,
) {
    let ShadeScratch { fragments, buffers } = scratch;

    fragments.clear();
    for ps in samples.iter_mut() {
        if ps.fragments.is_empty() {
            continue;
        }

        if ps.early_out {
            if early_out
                && ps.sample_mask == ALL_SAMPLES
                && is_simple_surface(input.draw_calls, ps)
            {
                continue;
            }
            ps.early_out = false;
        }

        fragments.extend(ps.fragments.drain(..));
    }

    fragments.sort_unstable();
    let count = fragments.len();
    fragments.push(END_OF_FRAGMENTS);

    let mut first = 0;
    while first < count {
        let n = shade_draw_call(input, pixels, &fragments[first..], buffers);

        for (i, &f) in fragments[first..first + n].iter().enumerate() {
            let color = buffers.color(i);
            let c = &mut samples[pixel_of(f)].c;
            for s in lanes_of(samples_of(f)) {
                c[s] = color;
            }
        }

        first += n;
    }
}

/// Shade the lane-local fragments (see [`lane_fragment`]) produced by a
/// batch of triangles of a non-opaque draw call and blend them over the
/// samples. `triangles[lane]` is the [`triangle_fragment`] of each lane.
pub(crate) fn shade_and_blend<const W: usize>(
    input: &ShadeInput<'_>,
    scratch: &mut ShadeScratch,
    pixels: &[TargetPixel],
    samples: &mut [PixelSamples],
    triangles: &[u64; W],
) {
    let ShadeScratch { fragments, buffers } = scratch;

    // Group by lane. Within a pixel, this preserves the order of triangles.
    fragments.clear();
    for (lane, &tri) in triangles.iter().enumerate() {
        for ps in samples.iter() {
            fragments.extend(
                ps.fragments
                    .iter()
                    .filter(|&&f| (f & 0xff_ffff) as usize == lane)
                    .map(|&f| f >> 24 | tri),
            );
        }
    }
    for ps in samples.iter_mut() {
        ps.fragments.clear();
    }

    let count = fragments.len();
    if count == 0 {
        return;
    }
    fragments.push(END_OF_FRAGMENTS);

    let n = shade_draw_call(input, pixels, fragments, buffers);
    debug_assert_eq!(n, count);

    for (i, &f) in fragments[..n].iter().enumerate() {
        let src = buffers.color(i);
        let c = &mut samples[pixel_of(f)].c;

        // Samples sharing a destination color share the result
        let mut mask = samples_of(f);
        while mask != 0 {
            let dst = c[mask.trailing_zeros() as usize];
            let out = blend(src, dst);
            for s in lanes_of(mask) {
                if c[s] == dst {
                    c[s] = out;
                    mask &= !(1 << s);
                }
            }
        }
    }
}

/// `src + dst * (1 - src.a)` on premultiplied RGBA8, rounded to nearest.
#[inline]
pub(crate) fn blend(src: u32, dst: u32) -> u32 {
    let inv_alpha = 255 - (src >> 24);
    let mut out = 0;
    for shift in (0..32).step_by(8) {
        let s = (src >> shift) & 0xff;
        let d = (dst >> shift) & 0xff;
        let r = 255 * s + inv_alpha * d + 127;
        let c = ((r + 1 + (r >> 8)) >> 8).min(255);
        out |= c << shift;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn channel(x: u32, i: u32) -> u32 {
        (x >> (i * 8)) & 0xff
    }

    #[test]
    fn blend_extremes() {
        let dst = 0xff20_4060;
        assert_eq!(blend(0, dst), dst);
        assert_eq!(blend(0xff01_0203, dst), 0xff01_0203);
    }

    #[test]
    fn blend_half_white_over_black() {
        assert_eq!(blend(0x8080_8080, 0xff00_0000), 0xff80_8080);
    }

    #[quickcheck]
    fn blend_matches_rounded_division(s: u8, a: u8, d: u8) -> bool {
        // Premultiplied, hence `s ≤ a`
        let s = s.min(a) as u32;
        let (a, d) = (a as u32, d as u32);
        let src = s | a << 24;
        let dst = d | 0xff << 24;
        let expected = (255 * s + (255 - a) * d + 127) / 255;
        let out = blend(src, dst);
        channel(out, 0) == expected && channel(out, 3) == 255
    }

    #[test]
    fn fragments_sort_by_draw_call_then_triangle() {
        let mut f = vec![
            triangle_fragment(1, 0) | 3 << 16 | 0x1,
            triangle_fragment(0, 7) | 0x2,
            triangle_fragment(0, 2) | 5 << 16 | 0x4,
        ];
        f.sort_unstable();
        assert_eq!(f.iter().map(|&f| draw_call_of(f)).collect::<Vec<_>>(), [0, 0, 1]);
        assert_eq!(f.iter().map(|&f| triangle_of(f)).collect::<Vec<_>>(), [2, 7, 0]);
        assert_eq!(f.iter().map(|&f| pixel_of(f)).collect::<Vec<_>>(), [5, 0, 3]);
        assert_eq!(f.iter().map(|&f| samples_of(f)).collect::<Vec<_>>(), [4, 2, 1]);
    }

    #[test]
    fn lane_fragment_substitution() {
        let f = lane_fragment(3, 42, 0x8001);
        assert_eq!(f & 0xff_ffff, 3);
        let full = f >> 24 | triangle_fragment(9, 1234);
        assert_eq!(draw_call_of(full), 9);
        assert_eq!(triangle_of(full), 1234);
        assert_eq!(pixel_of(full), 42);
        assert_eq!(samples_of(full), 0x8001);
    }

    fn assert_close(a: [f32; 3], b: [f32; 3]) {
        for k in 0..3 {
            assert!((a[k] - b[k]).abs() < 1e-4, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn interpolation_at_vertices() {
        let half = [8.0, 8.0];
        // Screen positions (-4, -4), (4, -4), (0, 4). The second vertex is
        // scaled by `w = 2`, which moves nothing on screen.
        let p = [
            [-0.5, -0.5, 0.0, 1.0],
            [1.0, -1.0, 0.0, 2.0],
            [0.0, 0.5, 0.0, 1.0],
        ];
        let interp = Interp::new(p, half);
        assert_close(interp.eval([-4.0, -4.0])[0], [1.0, 0.0, 0.0]);
        assert_close(interp.eval([4.0, -4.0])[0], [0.0, 1.0, 0.0]);
        assert_close(interp.eval([0.0, 4.0])[0], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn affine_derivatives() {
        let half = [8.0, 8.0];
        let p = [
            [-0.5, -0.5, 0.0, 1.0],
            [0.5, -0.5, 0.0, 1.0],
            [0.0, 0.5, 0.0, 1.0],
        ];
        let [l, dx, dy] = Interp::new(p, half).eval([0.0, 0.0]);
        assert!((l.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        // λ₂ only depends on y
        assert_close(dx, [-0.125, 0.125, 0.0]);
        assert_close(dy, [-0.0625, -0.0625, 0.125]);
    }
}
