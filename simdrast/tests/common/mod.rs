#![allow(dead_code)]
use rgb::RGBA8;
use simdrast::{
    DataBuffer, FrameBuffer, FrameBufferFormat, LaneWidth, Renderer, RendererConfig, Shader,
    ShaderKind,
};
use std::{sync::Arc, time::Duration};
use zerocopy::LayoutVerified;

/// Abort the test process if a frame deadlocks.
pub fn set_timelimit_default() {
    std::thread::spawn(|| {
        std::thread::sleep(Duration::from_secs(60));
        eprintln!("!!! Time limit exceeed.");
        std::process::abort();
    });
}

pub fn try_init_logger_for_default_harness() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn new_renderer(num_threads: usize, lane_width: LaneWidth, early_out: bool) -> Renderer {
    try_init_logger_for_default_harness();
    Renderer::new(RendererConfig {
        num_threads,
        arena_capacity: 32 << 20,
        lane_width,
        early_out,
        ..RendererConfig::default()
    })
    .unwrap()
}

pub fn frame_buffer(width: usize, height: usize) -> FrameBuffer {
    FrameBuffer::new(FrameBufferFormat::Rgba8, width, height, width)
}

pub fn rgba(r: u8, g: u8, b: u8, a: u8) -> u32 {
    u32::from_le_bytes([r, g, b, a])
}

/// Passes `[f32; 4]` clip-space positions through.
pub struct PositionShader;

impl Shader for PositionShader {
    fn execute(&self, input: &[u8], output: &mut [u8], count: usize, _: &[u8]) {
        let input = LayoutVerified::<_, [[f32; 4]]>::new_slice(&input[..count * 16]).unwrap();
        let output =
            LayoutVerified::<_, [[f32; 4]]>::new_slice(&mut output[..count * 16]).unwrap();
        output
            .into_mut_slice()
            .copy_from_slice(input.into_slice());
    }
}

/// Takes an RGBA color (`[f32; 4]`, premultiplied) per vertex. Outputs no
/// derivatives followed by the color.
pub struct ColorAttributeShader;

impl Shader for ColorAttributeShader {
    fn output_stride(&self) -> usize {
        32
    }

    fn execute(&self, input: &[u8], output: &mut [u8], count: usize, _: &[u8]) {
        let input = LayoutVerified::<_, [[f32; 4]]>::new_slice(&input[..count * 16]).unwrap();
        let output =
            LayoutVerified::<_, [[f32; 4]]>::new_slice(&mut output[..count * 32]).unwrap();
        for (out, color) in output
            .into_mut_slice()
            .chunks_exact_mut(2)
            .zip(input.into_slice())
        {
            out[0] = [0.0; 4];
            out[1] = *color;
        }
    }
}

/// Converts the interpolated color to RGBA8.
pub struct ColorFragmentShader;

impl Shader for ColorFragmentShader {
    fn execute(&self, input: &[u8], output: &mut [u8], count: usize, _: &[u8]) {
        let input = LayoutVerified::<_, [[f32; 4]]>::new_slice(&input[..count * 32]).unwrap();
        let output = LayoutVerified::<_, [u32]>::new_slice(&mut output[..count * 4]).unwrap();
        for (out, attrs) in output
            .into_mut_slice()
            .iter_mut()
            .zip(input.into_slice().chunks_exact(2))
        {
            let c = attrs[1].map(|x| (x.max(0.0).min(1.0) * 255.0).round() as u8);
            *out = rgba(c[0], c[1], c[2], c[3]);
        }
    }
}

/// Writes the color given as the uniforms (a little-endian `u32`).
pub struct SolidShader;

impl Shader for SolidShader {
    fn execute(&self, _: &[u8], output: &mut [u8], count: usize, uniforms: &[u8]) {
        for px in output[..count * 4].chunks_exact_mut(4) {
            px.copy_from_slice(&uniforms[..4]);
        }
    }
}

/// Bind the shaders of [`Mesh`]es with per-vertex colors.
pub fn bind_color_shaders(r: &mut Renderer) {
    r.bind_shader(ShaderKind::Vertex, Arc::new(PositionShader), &[])
        .unwrap();
    r.bind_shader(ShaderKind::Attribute, Arc::new(ColorAttributeShader), &[])
        .unwrap();
    r.bind_shader(ShaderKind::Fragment, Arc::new(ColorFragmentShader), &[])
        .unwrap();
}

/// Bind the shaders for a single color.
pub fn bind_solid_shaders(r: &mut Renderer, color: RGBA8) {
    r.bind_shader(ShaderKind::Vertex, Arc::new(PositionShader), &[])
        .unwrap();
    r.bind_shader(ShaderKind::Attribute, Arc::new(ColorAttributeShader), &[])
        .unwrap();
    r.bind_shader(
        ShaderKind::Fragment,
        Arc::new(SolidShader),
        &rgba(color.r, color.g, color.b, color.a).to_le_bytes(),
    )
    .unwrap();
}

/// An indexed triangle mesh with per-vertex colors.
#[derive(Debug, Default, Clone)]
pub struct Mesh {
    pub positions: Vec<[f32; 4]>,
    pub colors: Vec<[f32; 4]>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Append an axis-aligned rectangle at depth `z` in normalized device
    /// coordinates, made of two counter-clockwise triangles sharing a
    /// diagonal.
    pub fn rect(&mut self, min: [f32; 2], max: [f32; 2], z: f32, color: [f32; 4]) -> &mut Self {
        let base = self.positions.len() as u32;
        self.positions.extend_from_slice(&[
            [min[0], min[1], z, 1.0],
            [max[0], min[1], z, 1.0],
            [max[0], max[1], z, 1.0],
            [min[0], max[1], z, 1.0],
        ]);
        self.colors.extend_from_slice(&[color; 4]);
        self.indices
            .extend([0, 1, 2, 0, 2, 3].iter().map(|i| base + i));
        self
    }

    /// Append a triangle. The vertices must be in counter-clockwise order.
    pub fn triangle(&mut self, p: [[f32; 4]; 3], color: [f32; 4]) -> &mut Self {
        let base = self.positions.len() as u32;
        self.positions.extend_from_slice(&p);
        self.colors.extend_from_slice(&[color; 3]);
        self.indices.extend_from_slice(&[base, base + 1, base + 2]);
        self
    }

    /// Bind the buffers and issue an indexed draw call.
    pub fn draw(&self, r: &mut Renderer) {
        let positions = DataBuffer::from_slice(&self.positions);
        let colors = DataBuffer::from_slice(&self.colors);
        let indices = DataBuffer::from_slice(&self.indices);
        r.bind_vertex_buffer(&positions, 0, 16, self.positions.len())
            .unwrap();
        r.bind_attribute_buffer(&colors, 0, 16, self.colors.len())
            .unwrap();
        r.bind_index_buffer(&indices, 0, 4, self.indices.len())
            .unwrap();
        r.draw_indexed().unwrap();
    }
}

/// Render the current frame and copy out the pixels (top-down).
pub fn render(r: &mut Renderer) -> Vec<RGBA8> {
    r.render_frame().unwrap();
    r.frame_buffer().unwrap().to_rgba8()
}
