//! Renders a field of spinning cubes behind a pane of tinted glass and writes
//! the last frame to a PNG file.
use cgmath::{prelude::*, vec3, Deg, Matrix4, Point3, Rad, Vector3, Vector4};
use log::info;
use rgb::ComponentBytes;
use simdrast::{
    BlendMode, DataBuffer, FragmentMode, FrameBuffer, FrameBufferFormat, LaneWidth, Renderer,
    RendererConfig, Shader, ShaderKind, SilhouetteRasterizer,
};
use std::{error::Error, fs::File, io::BufWriter, path::PathBuf, sync::Arc, time::Instant};
use structopt::StructOpt;
use zerocopy::{AsBytes, LayoutVerified};

#[derive(StructOpt, Debug)]
#[structopt(name = "simdrast_demo")]
struct Opt {
    /// The output PNG file.
    #[structopt(short = "o", long = "output", parse(from_os_str), default_value = "simdrast.png")]
    output: PathBuf,

    #[structopt(long = "width", default_value = "640")]
    width: usize,

    #[structopt(long = "height", default_value = "480")]
    height: usize,

    /// The number of frames to render. Only the last one is saved.
    #[structopt(short = "n", long = "frames", default_value = "1")]
    frames: usize,

    /// The number of cubes along each axis of the grid.
    #[structopt(short = "c", long = "cubes", default_value = "6")]
    cubes: usize,

    /// The number of worker threads. Defaults to `SIMDRAST_NUM_THREADS` or
    /// the number of processors.
    #[structopt(short = "t", long = "threads")]
    threads: Option<usize>,

    /// The lane width (4 or 8).
    #[structopt(short = "l", long = "lanes", possible_values = &["4", "8"])]
    lanes: Option<usize>,

    /// Only resolve the pixels along silhouette edges.
    #[structopt(short = "s", long = "silhouettes")]
    silhouettes: bool,

    /// Skip the pixels whose surface is simple (with `--silhouettes`).
    #[structopt(short = "e", long = "early_out")]
    early_out: bool,
}

/// Transforms `[f32; 4]` object-space positions by the matrix given as the
/// uniforms.
struct TransformShader;

impl Shader for TransformShader {
    fn execute(&self, input: &[u8], output: &mut [u8], count: usize, uniforms: &[u8]) {
        let m = match LayoutVerified::<_, [[f32; 4]; 4]>::new(&uniforms[..64]) {
            Some(m) => Matrix4::from(*m),
            None => return,
        };
        let input = LayoutVerified::<_, [[f32; 4]]>::new_slice(&input[..count * 16]);
        let output = LayoutVerified::<_, [[f32; 4]]>::new_slice(&mut output[..count * 16]);
        if let (Some(input), Some(output)) = (input, output) {
            for (o, i) in output.into_mut_slice().iter_mut().zip(input.into_slice()) {
                *o = (m * Vector4::from(*i)).into();
            }
        }
    }
}

/// Takes a premultiplied color per vertex.
struct ColorAttributeShader;

impl Shader for ColorAttributeShader {
    fn output_stride(&self) -> usize {
        32
    }

    fn execute(&self, input: &[u8], output: &mut [u8], count: usize, _: &[u8]) {
        let input = LayoutVerified::<_, [[f32; 4]]>::new_slice(&input[..count * 16]);
        let output = LayoutVerified::<_, [[f32; 4]]>::new_slice(&mut output[..count * 32]);
        if let (Some(input), Some(output)) = (input, output) {
            for (o, i) in output
                .into_mut_slice()
                .chunks_exact_mut(2)
                .zip(input.into_slice())
            {
                o[0] = [0.0; 4];
                o[1] = *i;
            }
        }
    }
}

struct ColorFragmentShader;

impl Shader for ColorFragmentShader {
    fn execute(&self, input: &[u8], output: &mut [u8], count: usize, _: &[u8]) {
        let input = LayoutVerified::<_, [[f32; 4]]>::new_slice(&input[..count * 32]);
        let output = LayoutVerified::<_, [u32]>::new_slice(&mut output[..count * 4]);
        if let (Some(input), Some(output)) = (input, output) {
            for (o, i) in output
                .into_mut_slice()
                .iter_mut()
                .zip(input.into_slice().chunks_exact(2))
            {
                let c = i[1].map(|x| (x.max(0.0).min(1.0) * 255.0 + 0.5) as u8);
                *o = u32::from_le_bytes(c);
            }
        }
    }
}

#[derive(Default)]
struct Mesh {
    positions: Vec<[f32; 4]>,
    colors: Vec<[f32; 4]>,
    indices: Vec<u32>,
}

impl Mesh {
    /// Append a quad with the corners `c ± u ± v`, facing `u × v`.
    fn quad(&mut self, c: Vector3<f32>, u: Vector3<f32>, v: Vector3<f32>, color: [f32; 4]) {
        let base = self.positions.len() as u32;
        for &(su, sv) in &[(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            self.positions.push((c + u * su + v * sv).extend(1.0).into());
            self.colors.push(color);
        }
        self.indices
            .extend([0, 1, 2, 0, 2, 3].iter().map(|i| base + i));
    }

    fn cube(&mut self, c: Vector3<f32>, r: f32, color: [f32; 3]) {
        let (x, y, z) = (Vector3::unit_x() * r, Vector3::unit_y() * r, Vector3::unit_z() * r);
        let faces = [
            (x, y, z, 1.0),
            (-x, z, y, 0.55),
            (y, z, x, 0.9),
            (-y, x, z, 0.4),
            (z, x, y, 0.75),
            (-z, y, x, 0.65),
        ];
        for &(n, u, v, light) in faces.iter() {
            let shade = [color[0] * light, color[1] * light, color[2] * light, 1.0];
            self.quad(c + n, u, v, shade);
        }
    }

    fn draw(&self, r: &mut Renderer) -> Result<(), Box<dyn Error>> {
        let positions = DataBuffer::from_slice(&self.positions);
        let colors = DataBuffer::from_slice(&self.colors);
        let indices = DataBuffer::from_slice(&self.indices);
        r.bind_vertex_buffer(&positions, 0, 16, self.positions.len())?;
        r.bind_attribute_buffer(&colors, 0, 16, self.colors.len())?;
        r.bind_index_buffer(&indices, 0, 4, self.indices.len())?;
        r.draw_indexed()?;
        Ok(())
    }
}

/// A perspective projection with infinite depth. The rasterizer's depth
/// `(w - z) / 2w` becomes `near / distance`: 1 at the near plane, 0 at
/// infinity.
fn reversed_z_perspective(fovy: Rad<f32>, aspect: f32, near: f32) -> Matrix4<f32> {
    let f = 1.0 / (fovy.0 * 0.5).tan();
    #[rustfmt::skip]
    let m = Matrix4::new(
        f / aspect, 0.0, 0.0, 0.0,
        0.0, f, 0.0, 0.0,
        0.0, 0.0, -1.0, -1.0,
        0.0, 0.0, -2.0 * near, 0.0,
    );
    m
}

fn hue(t: f32) -> [f32; 3] {
    let channel = |phase: f32| 0.5 + 0.5 * (std::f32::consts::PI * 2.0 * (t + phase)).cos();
    [channel(0.0), channel(1.0 / 3.0), channel(2.0 / 3.0)]
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opt = Opt::from_args();

    let mut config = RendererConfig::from_env();
    if let Some(threads) = opt.threads {
        config.num_threads = threads;
    }
    match opt.lanes {
        Some(4) => config.lane_width = LaneWidth::X4,
        Some(_) => config.lane_width = LaneWidth::X8,
        None => {}
    }
    if opt.early_out {
        config.early_out = true;
    }

    let mut renderer = Renderer::new(config)?;
    info!("Rendering with {} thread(s)", renderer.thread_count());

    renderer.bind_frame_buffer(FrameBuffer::new(
        FrameBufferFormat::Rgba8,
        opt.width,
        opt.height,
        opt.width,
    ))?;

    // The geometry is static; only the transformation changes
    let mut cubes = Mesh::default();
    let n = opt.cubes.max(1);
    for i in 0..n * n {
        let (gx, gz) = ((i % n) as f32, (i / n) as f32);
        let center = vec3(gx - (n - 1) as f32 * 0.5, 0.0, gz - (n - 1) as f32 * 0.5) * 1.6;
        cubes.cube(center, 0.5, hue(i as f32 / (n * n) as f32));
    }

    let mut glass = Mesh::default();
    let extent = n as f32 * 0.5;
    glass.quad(
        vec3(0.0, 0.3, n as f32 * 0.9),
        Vector3::unit_x() * extent,
        Vector3::unit_y() * extent * 0.5,
        [0.05, 0.1, 0.25, 0.35],
    );

    let aspect = opt.width as f32 / opt.height.max(1) as f32;
    let projection = reversed_z_perspective(Deg(50.0).into(), aspect, 0.1);
    let eye = Point3::new(0.0, n as f32 * 1.4, n as f32 * 2.6);
    let view = Matrix4::look_at(eye, Point3::origin(), Vector3::unit_y());

    renderer.bind_shader(ShaderKind::Attribute, Arc::new(ColorAttributeShader), &[])?;
    renderer.bind_shader(ShaderKind::Fragment, Arc::new(ColorFragmentShader), &[])?;

    for frame in 0..opt.frames.max(1) {
        let angle = Deg(frame as f32 * 3.0);

        if opt.silhouettes {
            renderer.setup_him_rasterization(Arc::new(SilhouetteRasterizer::new()))?;
            if let Some(fb) = renderer.frame_buffer() {
                fb.fill(0xff40_4040);
            }
        } else {
            renderer.force_dense()?;
        }
        renderer.set_clear_color(rgb::RGBA8::new(230, 235, 240, 255))?;

        let model = Matrix4::from_angle_y(angle);
        let mvp: [[f32; 4]; 4] = (projection * view * model).into();
        renderer.bind_shader(ShaderKind::Vertex, Arc::new(TransformShader), mvp.as_bytes())?;
        cubes.draw(&mut renderer)?;

        let mvp: [[f32; 4]; 4] = (projection * view).into();
        renderer.bind_shader(ShaderKind::Vertex, Arc::new(TransformShader), mvp.as_bytes())?;
        *renderer.fragment_render_state_mut() = FragmentMode {
            blend: BlendMode::PremulAlpha,
            depth_write: false,
            ..FragmentMode::default()
        };
        glass.draw(&mut renderer)?;
        *renderer.fragment_render_state_mut() = FragmentMode::default();

        let start = Instant::now();
        renderer.render_frame()?;
        info!("Frame {}: {:?}", renderer.frame_number(), start.elapsed());
    }

    let pixels = match renderer.take_frame_buffer()? {
        Some(fb) => fb.to_rgba8(),
        None => return Ok(()),
    };

    let file = BufWriter::new(File::create(&opt.output)?);
    let mut encoder = png::Encoder::new(file, opt.width as u32, opt.height as u32);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(ComponentBytes::as_bytes(&pixels[..]))?;

    info!("Wrote {}", opt.output.display());
    Ok(())
}
