//! Binning: inserts triangles into the bin lists of the tiles they may cover.
//!
//! `W` triangles are processed at once. The traversal starts at the smallest
//! aligned power-of-two square enclosing the union of their bounding boxes
//! and recursively subdivides it, skipping squares whose importance map
//! region is empty and lanes whose triangle provably misses the square.
//! Opaque depth-writing triangles that fully cover a tile tighten the tile's
//! depth bound, and triangles entirely behind the bound are not binned.
use arrayvec::ArrayVec;
use std::{ops::Range, sync::atomic::Ordering};

use crate::{
    arena::{Arena, LocalAllocator},
    binlist::{tighten_zmax, WorkerBins},
    drawcall::{FaceFlags, SetupTriangle},
    error::RenderError,
    himap::ImportanceMap,
    lanes::{lanes_of, F32s, Mask},
    FAR_Z, NEAR_Z, TILE, TILE_SHIFT,
};

/// The number of triangles processed by a single binning work item.
pub(crate) const BIN_GRANULARITY: usize = 1024;

/// The state shared by the binning of a worker.
pub(crate) struct BinTarget<'a> {
    pub arena: &'a Arena,
    pub allocator: &'a mut LocalAllocator,
    pub bins: WorkerBins<'a>,
    pub himap: &'a ImportanceMap,
    pub frame_number: u32,
    /// The frame buffer size in pixels.
    pub size: [usize; 2],
    /// The level of the square enclosing the whole frame buffer.
    pub max_level: u32,
}

/// The traversal level for a frame buffer: the smallest `l` such that
/// `2^l > max(width, height)`.
pub(crate) fn max_bin_level(size: [usize; 2]) -> u32 {
    bit_length(size[0].max(size[1]))
}

fn bit_length(x: usize) -> u32 {
    (std::mem::size_of::<usize>() * 8) as u32 - x.leading_zeros()
}

#[derive(Clone, Copy)]
struct Square {
    lane_mask: Mask,
    level: u32,
    left: usize,
    top: usize,
}

/// Bin the triangles `range` of the draw call `draw_call`.
///
/// `occluder` enables the tightening of the per-tile depth bounds. It must
/// be set only for opaque draw calls that write depth.
pub(crate) fn bin_triangles<const W: usize>(
    target: &mut BinTarget<'_>,
    draw_call: u16,
    triangles: &[SetupTriangle],
    flags: &[u8],
    range: Range<usize>,
    occluder: bool,
) -> Result<(), RenderError> {
    let back = FaceFlags::BACK.bits();
    let hw = target.size[0] as f32 * 0.5;
    let hh = target.size[1] as f32 * 0.5;
    let (width, height) = (target.size[0], target.size[1]);

    let mut i = range.start;
    loop {
        // Gather up to `W` front faces
        let mut lane_mask: Mask = 0;
        let mut indices = [0u32; W];
        let mut lanes = [SetupTriangle::default(); W];
        let mut count = 0;
        while count < W && i < range.end {
            if flags[i] & back == 0 {
                indices[count] = i as u32;
                lanes[count] = triangles[i];
                lane_mask |= 1 << count;
                count += 1;
            }
            i += 1;
        }
        if lane_mask == 0 {
            break;
        }

        let bb_min = [
            F32s::<W>::from_fn(|l| lanes[l].bb_min[0] as f32),
            F32s::<W>::from_fn(|l| lanes[l].bb_min[1] as f32),
        ];
        let bb_max = [
            F32s::<W>::from_fn(|l| lanes[l].bb_max[0] as f32),
            F32s::<W>::from_fn(|l| lanes[l].bb_max[1] as f32),
        ];

        let live = &lanes[..count];
        let min_x = live.iter().map(|t| t.bb_min[0]).min().unwrap_or(0).max(0) as usize;
        let min_y = live.iter().map(|t| t.bb_min[1]).min().unwrap_or(0).max(0) as usize;
        let max_x = live.iter().map(|t| t.bb_max[0]).max().unwrap_or(0).max(0) as usize;
        let max_y = live.iter().map(|t| t.bb_max[1]).max().unwrap_or(0).max(0) as usize;

        let mut level = bit_length((max_x - min_x).max(max_y - min_y))
            .min(target.max_level)
            .max(TILE_SHIFT);
        let level_mask = !((1usize << level) - 1);
        let left = min_x & level_mask;
        let top = min_y & level_mask;

        if left + (1 << level) <= max_x || top + (1 << level) <= max_y {
            // Straddles a boundary of the aligned grid
            level += 1;
        } else if !target.himap.is_set(level, left, top) {
            continue;
        }

        // Rebase the edge equations on the bottom-left corner
        let col = |k: usize, j: usize| F32s::<W>::from_fn(|l| lanes[l].edges[k][j]);
        let ea: [F32s<W>; 3] = [col(0, 0), col(1, 0), col(2, 0)];
        let eb: [F32s<W>; 3] = [col(0, 1), col(1, 1), col(2, 1)];
        let mut ec: [F32s<W>; 3] = [col(0, 2), col(1, 2), col(2, 2)];
        for k in 0..3 {
            ec[k] -= ea[k] * hw + eb[k] * hh;
        }
        let ez0 = col(0, 3);
        let ez1 = col(1, 3);
        let ez2 = col(2, 3) - (ez0 * hw + ez1 * hh);

        let zero = F32s::<W>::splat(0.0);
        let tile = TILE as f32;

        // The increments to the corners maximizing and minimizing each edge
        let incr: [F32s<W>; 3] = std::array::from_fn(|k| ea[k].max(zero) + eb[k].max(zero));
        let decr: [F32s<W>; 3] =
            std::array::from_fn(|k| (ea[k].min(zero) + eb[k].min(zero)) * tile);

        // The corners of a tile with the nearest and the farthest depth
        let ez2min = ez2 + (ez0.max(zero) + ez1.max(zero)) * tile;
        let ez2max = ez2 + (ez0.min(zero) + ez1.min(zero)) * tile;

        let zmin_vertex = F32s::<W>::from_fn(|l| lanes[l].zmin_vertex);
        let zmax_vertex = F32s::<W>::from_fn(|l| lanes[l].zmax_vertex);

        let mut stack: ArrayVec<[Square; 64]> = ArrayVec::new();
        let mut sq = Square {
            lane_mask,
            level,
            left,
            top,
        };

        loop {
            let size = (1usize << sq.level) as f32;
            let (bx, by) = (sq.left as f32, sq.top as f32);

            let tl: [F32s<W>; 3] = std::array::from_fn(|k| ea[k] * bx + eb[k] * by + ec[k]);

            // Reject lanes missing the square
            sq.lane_mask &= !((tl[0] + incr[0] * size).sign_mask()
                | (tl[1] + incr[1] * size).sign_mask()
                | (tl[2] + incr[2] * size).sign_mask());

            let mut descend = false;

            if sq.lane_mask != 0 {
                if sq.level == TILE_SHIFT {
                    let (list, zmax_cell) = target.bins.tile(sq.left, sq.top, target.frame_number);
                    let mut writer =
                        list.start_write(target.arena, target.allocator, draw_call, W)?;

                    let old_zmax = zmax_cell.load(Ordering::Relaxed);
                    let mut bin_zmax = old_zmax;

                    let tlz = ez0 * bx + ez1 * by;
                    let zmin = (tlz + ez2min).min(zmin_vertex).max(F32s::splat(FAR_Z));

                    let lane_mask = sq.lane_mask & zmin.gt(F32s::splat(f32::from_bits(bin_zmax)));

                    if lane_mask != 0 {
                        // `> 0` rather than a sign test; tiny triangles
                        // would be misclassified otherwise
                        let cover_mask = lane_mask
                            & (tl[0] + decr[0]).gt(zero)
                            & (tl[1] + decr[1]).gt(zero)
                            & (tl[2] + decr[2]).gt(zero)
                            & zmin.lt(F32s::splat(NEAR_Z));

                        let zmax = (tlz + ez2max).max(zmax_vertex);

                        for l in lanes_of(lane_mask) {
                            let zmin_bits = zmin[l].to_bits();
                            let zmax_bits = zmax[l].to_bits();
                            if bin_zmax > zmin_bits {
                                continue;
                            }
                            if occluder && cover_mask & (1 << l) != 0 && zmax_bits > bin_zmax {
                                bin_zmax = zmax_bits;
                            }
                            writer.write_triangle(indices[l], zmin_bits);
                        }

                        if bin_zmax > old_zmax {
                            tighten_zmax(zmax_cell, bin_zmax, old_zmax);
                        }
                    }

                    list.end_write(writer);
                } else {
                    sq.level -= 1;
                    let stride = 1usize << sq.level;
                    let cx = F32s::splat((sq.left + stride) as f32);
                    let cy = F32s::splat((sq.top + stride) as f32);

                    let m = sq.lane_mask;
                    let neg_x = bb_min[0].lt(cx) & m;
                    let pos_x = if sq.left + stride < width {
                        bb_max[0].gt(cx) & m
                    } else {
                        0
                    };
                    let neg_y = bb_min[1].lt(cy) & m;
                    let pos_y = if sq.top + stride < height {
                        bb_max[1].gt(cy) & m
                    } else {
                        0
                    };

                    let himap = target.himap;
                    let mut push = |mask: Mask, left: usize, top: usize| {
                        if mask != 0 && himap.is_set(sq.level, left, top) {
                            stack.push(Square {
                                lane_mask: mask,
                                level: sq.level,
                                left,
                                top,
                            });
                        }
                    };
                    push(pos_x & neg_y, sq.left + stride, sq.top);
                    push(neg_x & pos_y, sq.left, sq.top + stride);
                    push(pos_x & pos_y, sq.left + stride, sq.top + stride);

                    sq.lane_mask = neg_x & neg_y;
                    descend = sq.lane_mask != 0 && himap.is_set(sq.level, sq.left, sq.top);
                }
            }

            if !descend {
                match stack.pop() {
                    Some(x) => sq = x,
                    None => break,
                }
            }
        }
    }

    Ok(())
}
