//! The back end: resolves the pixels of a tile.
//!
//! The tile's target pixels are the ones marked at level 0 in the importance
//! map. The merged bin lists are consumed a draw call at a time. Opaque draw
//! calls sharing a fragment mode are resolved together, nearest triangles
//! first, and only record which triangle is visible at each sample; shading
//! is deferred until a non-opaque draw call (or the end of the list) needs
//! the colors. Non-opaque draw calls are shaded and blended immediately, `W`
//! triangles at a time.
use arrayvec::ArrayVec;
use itertools::izip;
use std::sync::RwLockReadGuard;

use crate::{
    arena::Arena,
    binlist::{BinList, BinListArray},
    composite::{BinEntry, CompositeBinList},
    drawcall::{DrawCall, FaceFlags, SetupTriangle},
    error::RenderError,
    himap::ImportanceMap,
    lanes::{full_mask, lanes_of, F32s, Mask},
    shade::{
        lane_fragment, shade_and_blend, shade_tile, triangle_fragment, PixelSamples, ShadeInput,
        ShadeScratch, TargetPixel, ALL_SAMPLES,
    },
    target::FrameBuffer,
    zmode, FAR_Z, MAX_TRIANGLES_PER_TILE, NEAR_Z, SAMPLES, TILE, TILE_SHIFT,
};

/// The number of tiles processed by a single resolve work item.
pub(crate) const RESOLVE_GRANULARITY: usize = 8;

/// The maximum number of opaque draw calls resolved together.
const MAX_BATCHED_DRAW_CALLS: usize = 256;

/// Sample positions, measured from the bottom-left corner of a pixel. Every
/// row and every column of the 16×16 grid holds exactly one sample.
const SAMPLE_X: [f32; SAMPLES] = [
    0.03125, 0.09375, 0.15625, 0.21875, 0.28125, 0.34375, 0.40625, 0.46875, 0.53125, 0.59375,
    0.65625, 0.71875, 0.78125, 0.84375, 0.90625, 0.96875,
];
const SAMPLE_Y: [f32; SAMPLES] = [
    0.34375, 0.84375, 0.53125, 0.09375, 0.71875, 0.46875, 0.21875, 0.96875, 0.59375, 0.28125,
    0.78125, 0.03125, 0.40625, 0.90625, 0.15625, 0.65625,
];

/// The frame as seen by the resolve stage.
pub(crate) struct ResolveFrame<'a> {
    pub arena: &'a Arena,
    pub draw_calls: &'a [DrawCall],
    pub himap: &'a ImportanceMap,
    pub bins: &'a BinListArray,
    pub lists: &'a [RwLockReadGuard<'a, Vec<BinList>>],
    pub target: &'a FrameBuffer,
    pub frame_number: u32,
    pub clear_color: u32,
    pub dense: bool,
    /// Allow pixels with simple surfaces to be skipped.
    pub early_out: bool,
    pub transparent_importance: bool,
}

type PixelVec<T> = ArrayVec<[T; TILE * TILE]>;

/// Per-worker scratch memory.
#[derive(Default)]
pub(crate) struct ResolveContext {
    pixels: PixelVec<TargetPixel>,
    samples: PixelVec<PixelSamples>,
    entries: Vec<Entry>,
    shade: ShadeScratch,
}

/// A binned triangle. `key` is `triangle | draw_call_slot << 24`.
#[derive(Debug, Clone, Copy)]
struct Entry {
    key: u32,
    depth: f32,
}

/// Resolve the tile `tile` (in row-major order) and write its pixels to the
/// frame buffer.
pub(crate) fn resolve_tile<'a, const W: usize>(
    frame: &ResolveFrame<'a>,
    ctx: &mut ResolveContext,
    bin: &mut CompositeBinList<'a>,
    tile: usize,
) -> Result<(), RenderError> {
    let [tiles_x, _] = frame.bins.size();
    let tx = (tile % tiles_x) << TILE_SHIFT;
    let ty = (tile / tiles_x) << TILE_SHIFT;
    let himap = frame.himap;

    if !himap.is_set(TILE_SHIFT, tx, ty) {
        return Ok(());
    }

    let [width, height] = frame.target.size();
    let center = [(tx + TILE / 2) as f32, (ty + TILE / 2) as f32];
    let ResolveContext {
        pixels,
        samples,
        entries,
        shade,
    } = ctx;

    pixels.clear();
    samples.clear();
    let early_out = frame.early_out && !frame.dense;
    for y in ty..(ty + TILE).min(height) {
        for x in tx..(tx + TILE).min(width) {
            if himap.is_set(0, x, y) {
                pixels.push(TargetPixel {
                    x,
                    y,
                    offset: [x as f32 - center[0], y as f32 - center[1]],
                });
                samples.push(PixelSamples::new(frame.clear_color, early_out));
            }
        }
    }
    if pixels.is_empty() {
        return Ok(());
    }

    // Safety: binning is complete
    let zmax = unsafe {
        bin.setup(
            frame.bins,
            frame.lists,
            frame.arena,
            tile,
            frame.frame_number,
        )
    };

    let mut t = Tile {
        input: ShadeInput {
            arena: frame.arena,
            draw_calls: frame.draw_calls,
            tile_center: [
                center[0] - width as f32 * 0.5,
                center[1] - height as f32 * 0.5,
            ],
            half: [width as f32 * 0.5, height as f32 * 0.5],
        },
        pixels,
        samples,
        entries,
        shade,
        zmax: f32::from_bits(zmax),
    };

    let mut entry = bin.next();
    let mut shaded = true;

    while let BinEntry::DrawCall(dc) = entry {
        let mode = frame.draw_calls[dc as usize].states.fragment_mode;

        if mode.is_opaque() {
            shaded = false;
            entry = if mode.depth_write {
                t.resolve::<W, true, true>(dc, bin)?
            } else {
                t.resolve::<W, true, false>(dc, bin)?
            };
            continue;
        }

        if !shaded {
            shaded = true;
            let early_out = !frame.transparent_importance;
            shade_tile(&t.input, t.shade, t.pixels, t.samples, early_out);

            if early_out {
                t.drop_early_outs(himap);
                if t.pixels.is_empty() {
                    return Ok(());
                }
            }
        }

        entry = if mode.depth_write {
            t.resolve::<W, false, true>(dc, bin)?
        } else {
            t.resolve::<W, false, false>(dc, bin)?
        };
    }

    if !shaded {
        shade_tile(&t.input, t.shade, t.pixels, t.samples, true);
    }

    for (px, ps) in izip!(t.pixels.iter(), t.samples.iter()) {
        if ps.early_out {
            himap.set_to(px.x, px.y, TILE_SHIFT as u8);
        } else {
            frame.target.store_bottom_up(px.x, px.y, box_filter(&ps.c));
        }
    }

    Ok(())
}

/// The average of samples, channel by channel (truncated).
pub(crate) fn box_filter(c: &[u32; SAMPLES]) -> u32 {
    let mut out = 0;
    for shift in (0..32).step_by(8) {
        let sum: u32 = c.iter().map(|&x| (x >> shift) & 0xff).sum();
        out |= (sum >> SAMPLES.trailing_zeros()) << shift;
    }
    out
}

struct Tile<'t, 'a> {
    input: ShadeInput<'a>,
    pixels: &'t mut PixelVec<TargetPixel>,
    samples: &'t mut PixelVec<PixelSamples>,
    entries: &'t mut Vec<Entry>,
    shade: &'t mut ShadeScratch,
    /// The tile's depth bound from binning.
    zmax: f32,
}

impl Tile<'_, '_> {
    /// Remove the pixels still flagged `early_out` and mark them in the
    /// importance map.
    fn drop_early_outs(&mut self, himap: &ImportanceMap) {
        let mut kept = 0;
        for i in 0..self.pixels.len() {
            if self.samples[i].early_out {
                let px = &self.pixels[i];
                himap.set_to(px.x, px.y, TILE_SHIFT as u8);
            } else {
                self.pixels.swap(kept, i);
                self.samples.swap(kept, i);
                kept += 1;
            }
        }
        self.pixels.truncate(kept);
        self.samples.truncate(kept);
    }

    /// Resolve the triangles of the draw call `first`, which was just read
    /// from `bin`. Opaque draw calls that follow with the same fragment mode
    /// are resolved together. Returns the first entry not consumed.
    fn resolve<const W: usize, const OPAQUE: bool, const ZWRITE: bool>(
        &mut self,
        first: u16,
        bin: &mut CompositeBinList<'_>,
    ) -> Result<BinEntry, RenderError> {
        let Tile {
            input,
            pixels,
            samples,
            entries,
            shade,
            zmax,
        } = self;
        let draw_calls = input.draw_calls;
        let arena = input.arena;
        let mode = draw_calls[first as usize].states.fragment_mode;

        let mut map: ArrayVec<[u16; MAX_BATCHED_DRAW_CALLS]> = ArrayVec::new();
        map.push(first);
        entries.clear();

        let next = loop {
            match bin.next() {
                BinEntry::Triangle(tri, depth) => {
                    let depth = f32::from_bits(depth);
                    // Ties are kept. The triangle that tightened the bound
                    // may lie exactly at it.
                    if !zmode::is_nearer(*zmax, depth) {
                        if entries.len() >= MAX_TRIANGLES_PER_TILE {
                            return Err(RenderError::CapacityExceeded(
                                "triangles in a tile",
                                MAX_TRIANGLES_PER_TILE,
                            ));
                        }
                        let slot = (map.len() - 1) as u32;
                        entries.push(Entry {
                            key: tri | slot << 24,
                            depth,
                        });
                    }
                }
                BinEntry::DrawCall(dc)
                    if OPAQUE
                        && !map.is_full()
                        && draw_calls[dc as usize].states.fragment_mode == mode =>
                {
                    map.push(dc);
                }
                e => break e,
            }
        };

        if OPAQUE && ZWRITE {
            // Front to back
            entries.sort_unstable_by(|a, b| {
                b.depth.total_cmp(&a.depth).then(a.key.cmp(&b.key))
            });
        }

        let num_pixels = pixels.len();
        let mut active: u64 = if num_pixels >= 64 {
            !0
        } else {
            (1 << num_pixels) - 1
        };
        let tile_center = input.tile_center;
        let tile_center_d = [tile_center[0] as f64, tile_center[1] as f64];
        let zero = F32s::<W>::splat(0.0);

        for batch in entries.chunks(W) {
            let lane_mask = full_mask(batch.len());

            // Gather
            let mut tris = [SetupTriangle::default(); W];
            let mut hpez = [[0.0f64; 3]; W];
            let mut tz = F32s::<W>::splat(FAR_Z);
            let mut fragments = [0u64; W];
            let mut important: Mask = 0;
            for (l, e) in batch.iter().enumerate() {
                let dc = map[(e.key >> 24) as usize];
                let tri = (e.key & 0xff_ffff) as usize;
                let draw_call = &draw_calls[dc as usize];
                // Safety: the front end is complete
                unsafe {
                    tris[l] = draw_call.triangles(arena)[tri];
                    hpez[l] = draw_call.hpez(arena)[tri];
                    if draw_call.flags(arena)[tri] & FaceFlags::IMPORTANT.bits() != 0 {
                        important |= 1 << l;
                    }
                }
                tz[l] = e.depth;
                fragments[l] = triangle_fragment(dc, tri as u32);
            }

            // Move the origin to the tile center. The constant terms are
            // recomputed in double precision.
            let a: [F32s<W>; 3] =
                std::array::from_fn(|k| F32s::from_fn(|l| tris[l].edges[k][0]));
            let b: [F32s<W>; 3] =
                std::array::from_fn(|k| F32s::from_fn(|l| tris[l].edges[k][1]));
            let c: [F32s<W>; 3] = std::array::from_fn(|k| {
                F32s::from_fn(|l| {
                    (hpez[l][k]
                        + tile_center_d[0] * a[k][l] as f64
                        + tile_center_d[1] * b[k][l] as f64) as f32
                })
            });
            let z0 = F32s::<W>::from_fn(|l| tris[l].edges[0][3]);
            let z1 = F32s::<W>::from_fn(|l| tris[l].edges[1][3]);
            let z2 = F32s::<W>::from_fn(|l| tris[l].edges[2][3])
                + z0 * tile_center[0]
                + z1 * tile_center[1];

            let lut: [[[f32; SAMPLES]; W]; 3] = std::array::from_fn(|k| {
                std::array::from_fn(|l| {
                    std::array::from_fn(|s| SAMPLE_X[s] * a[k][l] + (SAMPLE_Y[s] * b[k][l] + c[k][l]))
                })
            });
            let lutz: [[f32; SAMPLES]; W] = std::array::from_fn(|l| {
                std::array::from_fn(|s| SAMPLE_X[s] * z0[l] + (SAMPLE_Y[s] * z1[l] + z2[l]))
            });

            // Evaluated at a pixel's bottom-left corner, these give the
            // maximum over the pixel
            let cc: [F32s<W>; 3] =
                std::array::from_fn(|k| c[k] + a[k].max(zero) + b[k].max(zero));

            for p in 0..num_pixels {
                let bit = 1u64 << p;
                if OPAQUE && ZWRITE && active & bit == 0 {
                    continue;
                }

                let ps = &mut samples[p];
                let mut pixel_mask = lane_mask & tz.gt(F32s::splat(ps.zmax));
                if pixel_mask == 0 {
                    // The remaining triangles are even farther
                    if OPAQUE && ZWRITE {
                        active &= !bit;
                    }
                    continue;
                }

                let [ox, oy] = pixels[p].offset;
                let tl: [F32s<W>; 3] = std::array::from_fn(|k| a[k] * ox + b[k] * oy);
                pixel_mask &= !((tl[0] + cc[0]).sign_mask()
                    | (tl[1] + cc[1]).sign_mask()
                    | (tl[2] + cc[2]).sign_mask());
                if pixel_mask == 0 {
                    continue;
                }
                let tlz = z0 * ox + z1 * oy;

                if OPAQUE && pixel_mask & important != 0 {
                    ps.important = true;
                }

                for l in lanes_of(pixel_mask) {
                    if !zmode::is_nearer(tz[l], ps.zmax) {
                        continue;
                    }

                    let mut covered = 0u32;
                    for s in 0..SAMPLES {
                        let d0 = lut[0][l][s] + tl[0][l];
                        let d1 = lut[1][l][s] + tl[1][l];
                        let d2 = lut[2][l][s] + tl[2][l];
                        let z = lutz[l][s] + tlz[l];
                        let inside = !(d0.is_sign_negative()
                            || d1.is_sign_negative()
                            || d2.is_sign_negative());
                        if inside && zmode::passes(z, ps.z[s]) {
                            if ZWRITE {
                                ps.z[s] = z;
                            }
                            covered |= 1 << s;
                        }
                    }

                    if covered == 0 {
                        continue;
                    }

                    if ZWRITE {
                        ps.zmax = ps.z.iter().fold(NEAR_Z, |m, &z| zmode::farther(m, z));
                    }

                    if OPAQUE {
                        // Replace the covered samples of older fragments
                        ps.sample_mask |= covered;
                        let keep = !(covered as u64);
                        ps.fragments.retain(|f| {
                            *f &= keep;
                            *f & ALL_SAMPLES as u64 != 0
                        });
                        ps.fragments
                            .push(fragments[l] | (p as u64) << 16 | covered as u64);
                    } else {
                        ps.fragments.push(lane_fragment(l, p, covered));
                    }
                }
            }

            if !OPAQUE {
                shade_and_blend::<W>(input, shade, pixels, samples, &fragments);
            }

            if OPAQUE && ZWRITE && active == 0 {
                break;
            }
        }

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_pattern_is_a_latin_square() {
        let mut rows = [false; SAMPLES];
        let mut cols = [false; SAMPLES];
        for s in 0..SAMPLES {
            let x = (SAMPLE_X[s] * 32.0) as usize;
            let y = (SAMPLE_Y[s] * 32.0) as usize;
            assert_eq!(x % 2, 1);
            assert_eq!(y % 2, 1);
            cols[x / 2] = true;
            rows[y / 2] = true;
        }
        assert!(rows.iter().all(|&x| x));
        assert!(cols.iter().all(|&x| x));
    }

    #[test]
    fn depth_test_clips_near_plane() {
        assert!(zmode::passes(0.5, FAR_Z));
        assert!(!zmode::passes(0.5, 0.5));
        assert!(!zmode::passes(0.25, 0.5));
        assert!(!zmode::passes(NEAR_Z, FAR_Z));
        assert!(!zmode::passes(1.9, FAR_Z));
    }

    #[test]
    fn box_filter_averages_channels() {
        let mut c = [0u32; SAMPLES];
        for (i, x) in c.iter_mut().enumerate() {
            *x = if i < 8 { 0xff00_00ff } else { 0xff00_ff00 };
        }
        assert_eq!(box_filter(&c), 0xff00_7f7f);
        assert_eq!(box_filter(&[0x1234_5678; SAMPLES]), 0x1234_5678);
    }
}
