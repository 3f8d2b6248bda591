use rgb::RGBA8;
use simdrast::{
    BlendMode, DataBuffer, FragmentMode, LaneWidth, RenderError, Renderer, SilhouetteRasterizer,
    TILE_SHIFT,
};
use std::sync::Arc;

mod common;
use common::*;

const SIZE: usize = 64;

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

fn pixel(img: &[RGBA8], x: usize, y: usize) -> RGBA8 {
    img[y * SIZE + x]
}

fn setup(num_threads: usize, lanes: LaneWidth, early_out: bool) -> Renderer {
    let mut r = new_renderer(num_threads, lanes, early_out);
    r.bind_frame_buffer(frame_buffer(SIZE, SIZE)).unwrap();
    bind_color_shaders(&mut r);
    r
}

/// Overlapping geometry of every kind resolve handles.
fn busy_scene() -> Mesh {
    let mut mesh = Mesh::default();
    mesh.rect([-2.0, -2.0], [2.0, 2.0], 0.9, [0.2, 0.2, 0.2, 1.0]);
    for i in 0..12 {
        let t = i as f32 / 12.0;
        let (s, c) = (t * 6.283).sin_cos();
        mesh.triangle(
            [
                [c * 0.9, s * 0.9, 0.2 + t * 0.5, 1.0],
                [-s * 0.7, c * 0.7, 0.7 - t * 0.4, 1.0],
                [0.1 * t, -0.2, 0.4, 1.0],
            ],
            [t, 1.0 - t, 0.5, 1.0],
        );
    }
    // Counter-clockwise in either orientation
    let mut fixed = Mesh::default();
    for tri in mesh.indices.chunks_exact(3) {
        let p = [
            mesh.positions[tri[0] as usize],
            mesh.positions[tri[1] as usize],
            mesh.positions[tri[2] as usize],
        ];
        let area = (p[1][0] - p[0][0]) * (p[2][1] - p[0][1])
            - (p[2][0] - p[0][0]) * (p[1][1] - p[0][1]);
        let p = if area < 0.0 { [p[0], p[2], p[1]] } else { p };
        fixed.triangle(p, mesh.colors[tri[0] as usize]);
    }
    fixed
}

#[test]
fn dense_clear() {
    let mut r = setup(2, LaneWidth::X8, false);
    r.force_dense().unwrap();
    r.set_clear_color(RGBA8::new(10, 20, 30, 255)).unwrap();
    let img = render(&mut r);
    assert!(img.iter().all(|&p| p == RGBA8::new(10, 20, 30, 255)));
}

#[test]
fn dense_opaque_rect() {
    let mut r = setup(3, LaneWidth::X8, false);
    r.force_dense().unwrap();
    Mesh::default()
        .rect([-2.0, -2.0], [2.0, 2.0], 0.5, RED)
        .draw(&mut r);
    let img = render(&mut r);
    assert!(img.iter().all(|&p| p == RGBA8::new(255, 0, 0, 255)));
}

#[test]
fn occlusion_is_order_independent() {
    let mut images = Vec::new();
    for &near_first in &[false, true] {
        let mut r = setup(2, LaneWidth::X4, false);
        r.force_dense().unwrap();

        let mut far = Mesh::default();
        far.rect([-2.0, -2.0], [2.0, 2.0], 0.75, GREEN);
        let mut near = Mesh::default();
        near.rect([-2.0, -2.0], [0.0, 2.0], 0.25, RED);

        if near_first {
            near.draw(&mut r);
            far.draw(&mut r);
        } else {
            far.draw(&mut r);
            near.draw(&mut r);
        }

        let img = render(&mut r);
        assert_eq!(pixel(&img, 10, 20), RGBA8::new(255, 0, 0, 255));
        assert_eq!(pixel(&img, 50, 20), RGBA8::new(0, 255, 0, 255));
        images.push(img);
    }
    assert_eq!(images[0], images[1]);
}

#[test]
fn premultiplied_blend() {
    let mut r = setup(2, LaneWidth::X8, false);
    r.force_dense().unwrap();

    Mesh::default()
        .rect([-2.0, -2.0], [2.0, 2.0], 0.5, BLUE)
        .draw(&mut r);

    *r.fragment_render_state_mut() = FragmentMode {
        blend: BlendMode::PremulAlpha,
        depth_write: false,
        ..FragmentMode::default()
    };
    let half = 128.0 / 255.0;
    // In front of the background on the left, behind it on the right
    Mesh::default()
        .rect([-2.0, -2.0], [0.0, 2.0], 0.25, [half, 0.0, 0.0, half])
        .draw(&mut r);
    Mesh::default()
        .rect([0.0, -2.0], [2.0, 2.0], 0.75, [half, 0.0, 0.0, half])
        .draw(&mut r);
    *r.fragment_render_state_mut() = FragmentMode::default();

    let img = render(&mut r);
    assert_eq!(pixel(&img, 10, 30), RGBA8::new(128, 0, 127, 255));
    assert_eq!(pixel(&img, 50, 30), RGBA8::new(0, 0, 255, 255));
}

/// A full-viewport quad whose depth is `1 - x` in NDC. Its left half lies
/// beyond the near plane.
fn near_crossing_quad(color: [f32; 4]) -> Mesh {
    let (bl, br) = ([-1.0, -1.0, -3.0, 1.0], [1.0, -1.0, 1.0, 1.0]);
    let (tl, tr) = ([-1.0, 1.0, -3.0, 1.0], [1.0, 1.0, 1.0, 1.0]);
    let mut mesh = Mesh::default();
    mesh.triangle([bl, br, tr], color).triangle([bl, tr, tl], color);
    mesh
}

#[test]
fn samples_beyond_near_plane_are_clipped() {
    let clear = RGBA8::new(10, 20, 30, 255);
    let mut r = setup(2, LaneWidth::X8, false);
    r.force_dense().unwrap();
    r.set_clear_color(clear).unwrap();
    near_crossing_quad(RED).draw(&mut r);

    let img = render(&mut r);
    for &y in &[8, 32, 56] {
        for &x in &[4, 20, 28] {
            assert_eq!(pixel(&img, x, y), clear, "({}, {})", x, y);
        }
        for &x in &[36, 44, 60] {
            assert_eq!(pixel(&img, x, y), RGBA8::new(255, 0, 0, 255), "({}, {})", x, y);
        }
    }
}

#[test]
fn clipped_samples_do_not_occlude() {
    for &quad_first in &[false, true] {
        let mut r = setup(2, LaneWidth::X4, false);
        r.force_dense().unwrap();

        // Depth 0.05, behind the quad wherever the quad is visible
        let mut far = Mesh::default();
        far.rect([-2.0, -2.0], [2.0, 2.0], 0.9, GREEN);
        let quad = near_crossing_quad(RED);

        if quad_first {
            quad.draw(&mut r);
            far.draw(&mut r);
        } else {
            far.draw(&mut r);
            quad.draw(&mut r);
        }

        let img = render(&mut r);
        for &y in &[8, 32, 56] {
            for &x in &[4, 20, 28] {
                assert_eq!(pixel(&img, x, y), RGBA8::new(0, 255, 0, 255), "({}, {})", x, y);
            }
            for &x in &[36, 44, 60] {
                assert_eq!(pixel(&img, x, y), RGBA8::new(255, 0, 0, 255), "({}, {})", x, y);
            }
        }
    }
}

#[test]
fn non_indexed_draw() {
    let mut r = setup(1, LaneWidth::X8, false);
    r.force_dense().unwrap();

    let positions = DataBuffer::from_slice(&[
        [-1.0f32, -1.0, 0.5, 1.0],
        [1.0, -1.0, 0.5, 1.0],
        [-1.0, 1.0, 0.5, 1.0],
    ]);
    let colors = DataBuffer::from_slice(&[GREEN; 3]);
    r.bind_vertex_buffer(&positions, 0, 16, 3).unwrap();
    r.bind_attribute_buffer(&colors, 0, 16, 3).unwrap();
    r.draw_list().unwrap();

    let img = render(&mut r);
    // The bottom-left half
    assert_eq!(pixel(&img, 4, SIZE - 5), RGBA8::new(0, 255, 0, 255));
    assert_eq!(pixel(&img, SIZE - 5, 4), RGBA8::new(0, 0, 0, 0));
}

#[test]
fn frames_do_not_leak() {
    let mut r = setup(4, LaneWidth::X8, false);

    r.force_dense().unwrap();
    Mesh::default()
        .rect([-2.0, -2.0], [0.0, 2.0], 0.5, RED)
        .draw(&mut r);
    let img = render(&mut r);
    assert_eq!(pixel(&img, 10, 10), RGBA8::new(255, 0, 0, 255));
    assert_eq!(r.frame_number(), 1);

    r.force_dense().unwrap();
    Mesh::default()
        .rect([0.0, -2.0], [2.0, 2.0], 0.5, GREEN)
        .draw(&mut r);
    let img = render(&mut r);
    assert_eq!(pixel(&img, 10, 10), RGBA8::new(0, 0, 0, 0));
    assert_eq!(pixel(&img, 50, 10), RGBA8::new(0, 255, 0, 255));
    assert_eq!(r.frame_number(), 2);
}

#[test]
fn lane_widths_and_thread_counts_agree() {
    let scene = busy_scene();
    let configs = [
        (1, LaneWidth::X4),
        (1, LaneWidth::X8),
        (3, LaneWidth::X4),
        (4, LaneWidth::X8),
    ];
    let images: Vec<_> = configs
        .iter()
        .map(|&(threads, lanes)| {
            let mut r = setup(threads, lanes, false);
            r.force_dense().unwrap();
            scene.draw(&mut r);
            render(&mut r)
        })
        .collect();

    for (img, config) in images.iter().zip(configs.iter()).skip(1) {
        assert!(img == &images[0], "{:?} differs", config);
    }
}

#[test]
fn silhouette_marks_edges_only() {
    let sentinel = RGBA8::new(1, 2, 3, 4);
    let mut mesh = Mesh::default();
    mesh.rect([-0.5, -0.5], [0.5, 0.5], 0.5, RED);

    let mut r = setup(2, LaneWidth::X8, false);
    r.force_dense().unwrap();
    mesh.draw(&mut r);
    let dense = render(&mut r);

    r.setup_him_rasterization(Arc::new(SilhouetteRasterizer::new()))
        .unwrap();
    mesh.draw(&mut r);
    r.frame_buffer()
        .unwrap()
        .fill(u32::from_le_bytes([1, 2, 3, 4]));
    let sparse = render(&mut r);

    let mut num_resolved = 0;
    for (i, (&s, &d)) in sparse.iter().zip(dense.iter()).enumerate() {
        if s != sentinel {
            assert_eq!(s, d, "pixel {}", i);
            num_resolved += 1;
        }
    }
    // About the perimeter of the 32×32 square
    assert!(num_resolved >= 4 * 30, "{}", num_resolved);
    assert!(num_resolved < SIZE * SIZE / 4, "{}", num_resolved);

    // The interior and the surroundings are left alone
    assert_eq!(pixel(&sparse, 32, 32), sentinel);
    assert_eq!(pixel(&sparse, 24, 40), sentinel);
    assert_eq!(pixel(&sparse, 2, 2), sentinel);

    let himap = r.importance_map();
    assert!(!himap.is_set(0, 32, 32));
    assert!((20..44).any(|y| himap.is_set(0, 16, y) || himap.is_set(0, 15, y)));
}

#[test]
fn early_out_only_skips_pixels() {
    let scene = busy_scene();
    let sentinel = u32::from_le_bytes([1, 2, 3, 4]);

    let render_with = |early_out: bool| {
        let mut r = setup(2, LaneWidth::X8, early_out);
        r.setup_him_rasterization(Arc::new(SilhouetteRasterizer::new()))
            .unwrap();
        scene.draw(&mut r);
        r.frame_buffer().unwrap().fill(sentinel);
        let img = render(&mut r);
        let skipped: Vec<bool> = (0..SIZE * SIZE)
            .map(|i| {
                let (x, y) = (i % SIZE, SIZE - 1 - i / SIZE);
                r.importance_map().value(x, y) == TILE_SHIFT as u8
            })
            .collect();
        (img, skipped)
    };

    let (baseline, _) = render_with(false);
    let (img, skipped) = render_with(true);

    let sentinel = RGBA8::new(1, 2, 3, 4);
    for i in 0..SIZE * SIZE {
        if img[i] != baseline[i] {
            assert_eq!(img[i], sentinel, "pixel {}", i);
            assert!(skipped[i], "pixel {}", i);
        }
    }
}

#[test]
fn tile_overflow_is_reported() {
    let mut r = new_renderer(2, LaneWidth::X8, false);
    r.bind_frame_buffer(frame_buffer(8, 8)).unwrap();
    bind_color_shaders(&mut r);
    r.force_dense().unwrap();

    let mut mesh = Mesh::default();
    for _ in 0..8200 {
        mesh.triangle(
            [
                [-1.0, -1.0, 0.5, 1.0],
                [3.0, -1.0, 0.5, 1.0],
                [-1.0, 3.0, 0.5, 1.0],
            ],
            RED,
        );
    }
    mesh.draw(&mut r);

    assert_eq!(
        r.render_frame(),
        Err(RenderError::CapacityExceeded("triangles in a tile", 8192))
    );

    // The renderer recovers
    r.force_dense().unwrap();
    r.render_frame().unwrap();
    assert_eq!(r.frame_number(), 2);
}

#[test]
fn buffer_bindings_are_validated() {
    let mut r = new_renderer(1, LaneWidth::X8, false);
    let data = DataBuffer::from_slice(&[[0.0f32; 4]; 8]);

    assert_eq!(
        r.bind_vertex_buffer(&data, 8, 16, 1),
        Err(RenderError::InvalidVertexBufferAlignment)
    );
    assert_eq!(
        r.bind_vertex_buffer(&data, 0, 20, 1),
        Err(RenderError::InvalidVertexBufferAlignment)
    );
    assert_eq!(
        r.bind_attribute_buffer(&data, 4, 16, 1),
        Err(RenderError::InvalidAttributeBufferAlignment)
    );
    assert_eq!(
        r.bind_vertex_buffer(&data, 16, 16, 8),
        Err(RenderError::BufferOutOfRange("vertex"))
    );
    assert_eq!(
        r.bind_index_buffer(&data, 0, 2, 100),
        Err(RenderError::BufferOutOfRange("index"))
    );
    r.bind_vertex_buffer(&data, 16, 32, 3).unwrap();
    r.bind_attribute_buffer(&data, 0, 16, 8).unwrap();
}
