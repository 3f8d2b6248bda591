//! The frame driver.
//!
//! [`Renderer`] records draw calls and then runs a frame in four phases,
//! each of which enqueues tasks on the worker pool and returns immediately:
//!
//! ```text
//!   Idle ──begin_front_end_shade_and_him_rast──▶ FrontEnd
//!        ──begin_front_end_bin──▶ Bin ──begin_back_end──▶ BackEnd
//!        ──finish──▶ Idle
//! ```
//!
//! Every phase transition waits for the previous phase's tasks. The state
//! shared with the tasks lives in [`Core`], which the renderer mutates only
//! between barriers.
use rgb::RGBA8;
use std::{
    collections::HashMap,
    ops::Range,
    sync::{Arc, Mutex, MutexGuard},
};
use zerocopy::AsBytes;

use crate::{
    adjacency,
    arena::{Arena, ArenaSlice, LocalAllocator},
    binlist::BinListArray,
    binning::{bin_triangles, max_bin_level, BinTarget, BIN_GRANULARITY},
    buffer::{BufferBinding, DataBuffer, IndexBuffer, IndexSource, IndexWidth},
    composite::CompositeBinList,
    config::{LaneWidth, RendererConfig},
    drawcall::{DrawCall, DrawCallArrays},
    error::RenderError,
    himap::ImportanceMap,
    pool::{Spawner, Task, ThreadPool},
    resolve::{resolve_tile, ResolveContext, ResolveFrame, RESOLVE_GRANULARITY},
    setup::{setup_triangles, SetupOutput, SETUP_GRANULARITY},
    shader::{Shader, ShaderKind},
    silhouette::{HimRasterizer, HimTarget},
    state::{FragmentMode, RenderStates, ShaderBinding, VertexMode},
    target::{pack, FrameBuffer},
    MAX_ATTRIBUTE_STRIDE, MAX_DRAW_CALLS, MAX_FRAME_BUFFER_SIZE, MAX_TRIANGLES_PER_DRAW,
};

/// The number of vertices processed by a single vertex shading work item.
const VERTEX_GRANULARITY: usize = 1024;

/// The number of triangles processed by a single importance map seeding
/// work item.
const HIM_GRANULARITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    FrontEnd,
    Bin,
    BackEnd,
    /// A phase transition reported a fault. Only `finish` is accepted.
    Failed,
}

/// A multi-threaded software rasterizer. See the [crate-level
/// documentation](crate).
pub struct Renderer {
    pool: ThreadPool,
    core: Arc<Core>,
    phase: Phase,

    vertex_shader: Option<BoundShader>,
    attribute_shader: Option<BoundShader>,
    fragment_shader: Option<BoundShader>,
    vertex_mode: VertexMode,
    fragment_mode: FragmentMode,

    vertex_buffer: Option<BufferBinding>,
    attribute_buffer: Option<BufferBinding>,
    index_buffer: Option<IndexBuffer>,

    /// Adjacency buffers of the index buffers bound so far. The `DataBuffer`
    /// keeps the storage (and thus the key) alive.
    adjacency: HashMap<AdjacencyKey, (DataBuffer, Arc<[u32]>)>,
}

/// `(storage, offset, count, width)`
type AdjacencyKey = (usize, usize, usize, IndexWidth);

/// A bound shader. The uniforms are copied into the arena by the first draw
/// call of every frame that uses them.
struct BoundShader {
    shader: Arc<dyn Shader>,
    uniforms: Vec<u8>,
    in_arena: Option<ArenaSlice<u8>>,
}

impl BoundShader {
    fn binding(&mut self, arena: &Arena) -> Result<ShaderBinding, RenderError> {
        let stale = match self.in_arena {
            Some(slice) => !slice.is_current(arena),
            None => !self.uniforms.is_empty(),
        };
        if stale {
            self.in_arena = arena.clone_from_slice(&self.uniforms)?;
        }
        Ok(ShaderBinding {
            shader: Arc::clone(&self.shader),
            uniforms: self.in_arena,
        })
    }
}

/// The state shared by the renderer and its tasks.
struct Core {
    config: RendererConfig,
    arena: Arena,
    locals: Box<[Mutex<LocalAllocator>]>,
    contexts: Box<[Mutex<ResolveContext>]>,
    himap: ImportanceMap,
    bins: BinListArray,
    target: Option<FrameBuffer>,
    draw_calls: Vec<DrawCall>,
    him: Option<Arc<dyn HimRasterizer>>,
    frame_number: u32,
    max_level: u32,
    clear_color: u32,
    dense: bool,
    transparent_importance: bool,
    /// The first error raised by a task during the current frame.
    fault: Mutex<Option<RenderError>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Core {
    fn record_fault(&self, e: RenderError) {
        let mut fault = lock(&self.fault);
        if fault.is_none() {
            log::error!("Frame {} failed: {}", self.frame_number, e);
            *fault = Some(e);
        } else {
            log::warn!("Frame {}: dropping a subsequent fault: {}", self.frame_number, e);
        }
    }

    fn take_fault(&self) -> Option<RenderError> {
        lock(&self.fault).take()
    }

    fn frame_size(&self) -> [usize; 2] {
        self.target.as_ref().map_or([0, 0], |t| t.size())
    }
}

impl Renderer {
    /// Construct a `Renderer` and spawn its worker threads.
    pub fn new(config: RendererConfig) -> Result<Self, RenderError> {
        config.validate()?;

        let num_threads = config.num_threads;
        let pool = ThreadPool::new(num_threads, config.max_tasks)?;
        let arena = Arena::with_capacity(config.arena_capacity)?;

        log::debug!(
            "Creating a renderer: {} thread(s), {:?} lanes, {} byte arena",
            num_threads,
            config.lane_width,
            arena.capacity()
        );

        let core = Core {
            arena,
            locals: (0..num_threads)
                .map(|_| Mutex::new(LocalAllocator::new()))
                .collect(),
            contexts: (0..num_threads)
                .map(|_| Mutex::new(ResolveContext::default()))
                .collect(),
            himap: ImportanceMap::new(),
            bins: BinListArray::new(num_threads),
            target: None,
            draw_calls: Vec::new(),
            him: None,
            frame_number: 0,
            max_level: 0,
            clear_color: 0,
            dense: false,
            transparent_importance: false,
            fault: Mutex::new(None),
            config,
        };

        Ok(Self {
            pool,
            core: Arc::new(core),
            phase: Phase::Idle,
            vertex_shader: None,
            attribute_shader: None,
            fragment_shader: None,
            vertex_mode: VertexMode::default(),
            fragment_mode: FragmentMode::default(),
            vertex_buffer: None,
            attribute_buffer: None,
            index_buffer: None,
            adjacency: HashMap::new(),
        })
    }

    fn expect_phase(&self, phase: Phase, operation: &'static str) -> Result<(), RenderError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(RenderError::PhaseOrder(operation))
        }
    }

    /// Get a mutable reference to the core while no frame is in flight.
    fn core_mut<'a>(
        core: &'a mut Arc<Core>,
        phase: Phase,
        operation: &'static str,
    ) -> Result<&'a mut Core, RenderError> {
        if phase != Phase::Idle {
            return Err(RenderError::PhaseOrder(operation));
        }
        Arc::get_mut(core).ok_or(RenderError::FrameInFlight)
    }

    /// The number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.pool.num_threads()
    }

    /// The number of the last frame started. Starts at `1` and wraps around
    /// to `1`.
    pub fn frame_number(&self) -> u32 {
        self.core.frame_number
    }

    /// The importance map of the current (or the last) frame. After the back
    /// end completes, the pixels skipped by the early-out test hold
    /// [`TILE_SHIFT`](crate::TILE_SHIFT).
    pub fn importance_map(&self) -> &ImportanceMap {
        &self.core.himap
    }

    /// Set the color of the pixels not covered by anything. Reverts to
    /// transparent black at the end of the frame.
    pub fn set_clear_color(&mut self, color: RGBA8) -> Result<(), RenderError> {
        Self::core_mut(&mut self.core, self.phase, "set_clear_color")?.clear_color = pack(color);
        Ok(())
    }

    /// Resolve every pixel of the next frame instead of only the important
    /// ones.
    pub fn force_dense(&mut self) -> Result<(), RenderError> {
        Self::core_mut(&mut self.core, self.phase, "force_dense")?.dense = true;
        Ok(())
    }

    /// Let non-opaque draw calls of the next frame contribute importance and
    /// disable the early-out test for pixels behind them.
    pub fn force_transparent_importance(&mut self) -> Result<(), RenderError> {
        Self::core_mut(&mut self.core, self.phase, "force_transparent_importance")?
            .transparent_importance = true;
        Ok(())
    }

    /// Seed the importance map of the next frame with `him`. Ignored in dense
    /// mode.
    pub fn setup_him_rasterization(
        &mut self,
        him: Arc<dyn HimRasterizer>,
    ) -> Result<(), RenderError> {
        Self::core_mut(&mut self.core, self.phase, "setup_him_rasterization")?.him = Some(him);
        Ok(())
    }

    /// Bind the render target. Returns the previously bound one.
    pub fn bind_frame_buffer(
        &mut self,
        frame_buffer: FrameBuffer,
    ) -> Result<Option<FrameBuffer>, RenderError> {
        let core = Self::core_mut(&mut self.core, self.phase, "bind_frame_buffer")?;
        let [width, height] = frame_buffer.size();
        if width > MAX_FRAME_BUFFER_SIZE || height > MAX_FRAME_BUFFER_SIZE {
            return Err(RenderError::InvalidFrameBufferSize(width, height));
        }
        core.himap.resize(width, height);
        core.bins.resize(width, height);
        Ok(core.target.replace(frame_buffer))
    }

    pub fn frame_buffer(&self) -> Option<&FrameBuffer> {
        self.core.target.as_ref()
    }

    /// Unbind the render target and return it.
    pub fn take_frame_buffer(&mut self) -> Result<Option<FrameBuffer>, RenderError> {
        Ok(Self::core_mut(&mut self.core, self.phase, "take_frame_buffer")?
            .target
            .take())
    }

    /// Bind `count` vertices of `stride` bytes starting at `offset`. Each
    /// vertex is passed to the vertex shader.
    pub fn bind_vertex_buffer(
        &mut self,
        buffer: &DataBuffer,
        offset: usize,
        stride: usize,
        count: usize,
    ) -> Result<(), RenderError> {
        self.vertex_buffer = Some(BufferBinding::new(
            buffer,
            offset,
            stride,
            count,
            "vertex",
            RenderError::InvalidVertexBufferAlignment,
        )?);
        Ok(())
    }

    /// Bind `count` vertex attribute records of `stride` bytes starting at
    /// `offset`. Each record is passed to the attribute shader.
    pub fn bind_attribute_buffer(
        &mut self,
        buffer: &DataBuffer,
        offset: usize,
        stride: usize,
        count: usize,
    ) -> Result<(), RenderError> {
        if stride == 0 {
            return Err(RenderError::InvalidAttributeBufferAlignment);
        }
        self.attribute_buffer = Some(BufferBinding::new(
            buffer,
            offset,
            stride,
            count,
            "attribute",
            RenderError::InvalidAttributeBufferAlignment,
        )?);
        Ok(())
    }

    /// Bind `count` indices of `size` (1, 2, or 4) bytes starting at
    /// `offset`. The adjacency of the triangles is calculated and cached
    /// unless the frame is dense.
    pub fn bind_index_buffer(
        &mut self,
        buffer: &DataBuffer,
        offset: usize,
        size: usize,
        count: usize,
    ) -> Result<(), RenderError> {
        let ib = IndexBuffer::new(buffer, offset, size, count)?;
        if !self.core.dense {
            self.adjacency_of(&ib);
        }
        self.index_buffer = Some(ib);
        Ok(())
    }

    /// Forget the cached adjacency of `buffer`. Must be called when the
    /// contents of an index buffer change, i.e., a new `DataBuffer` is created
    /// in place of an old one that was dropped.
    pub fn invalidate_index_buffer(&mut self, buffer: &DataBuffer) {
        let key = buffer.key();
        self.adjacency.retain(|k, _| k.0 != key);
    }

    fn adjacency_of(&mut self, ib: &IndexBuffer) -> Arc<[u32]> {
        let key = (ib.buffer.key(), ib.offset, ib.count, ib.width);
        let entry = self
            .adjacency
            .entry(key)
            .or_insert_with(|| (ib.buffer.clone(), adjacency::generate(&ib.to_vec()).into()));
        Arc::clone(&entry.1)
    }

    /// Bind a shader and its uniforms. The uniforms are copied.
    pub fn bind_shader(
        &mut self,
        kind: ShaderKind,
        shader: Arc<dyn Shader>,
        uniforms: &[u8],
    ) -> Result<(), RenderError> {
        if kind == ShaderKind::Attribute {
            let stride = shader.output_stride();
            if stride == 0 || stride % 16 != 0 || stride > MAX_ATTRIBUTE_STRIDE {
                return Err(RenderError::InvalidAttributeOutput(stride));
            }
        }

        let bound = BoundShader {
            shader,
            uniforms: uniforms.to_vec(),
            in_arena: None,
        };
        *match kind {
            ShaderKind::Vertex => &mut self.vertex_shader,
            ShaderKind::Attribute => &mut self.attribute_shader,
            ShaderKind::Fragment => &mut self.fragment_shader,
        } = Some(bound);
        Ok(())
    }

    pub fn vertex_render_state_mut(&mut self) -> &mut VertexMode {
        &mut self.vertex_mode
    }

    pub fn fragment_render_state_mut(&mut self) -> &mut FragmentMode {
        &mut self.fragment_mode
    }

    /// Draw the triangles formed by the bound index buffer.
    pub fn draw_indexed(&mut self) -> Result<(), RenderError> {
        self.expect_phase(Phase::Idle, "draw_indexed")?;
        let ib = self.index_buffer.clone().ok_or(RenderError::NoIndexBuffer)?;
        let (vertices, attributes) = self.vertex_inputs()?;

        if let Some(max) = (0..ib.count).map(|i| ib.get(i) as usize).max() {
            if max >= vertices.count {
                return Err(RenderError::BufferOutOfRange("vertex"));
            }
            if max >= attributes.count {
                return Err(RenderError::BufferOutOfRange("attribute"));
            }
        }

        let adjacency = if self.core.dense {
            None
        } else {
            Some(self.adjacency_of(&ib))
        };

        self.draw(vertices, attributes, IndexSource::Indexed(ib), adjacency)
    }

    /// Draw the triangles formed by every three consecutive vertices of the
    /// bound vertex buffer.
    pub fn draw_list(&mut self) -> Result<(), RenderError> {
        self.expect_phase(Phase::Idle, "draw_list")?;
        let (vertices, attributes) = self.vertex_inputs()?;
        if attributes.count < vertices.count {
            return Err(RenderError::BufferOutOfRange("attribute"));
        }
        let num_vertices = vertices.count;
        self.draw(
            vertices,
            attributes,
            IndexSource::List { num_vertices },
            None,
        )
    }

    fn vertex_inputs(&self) -> Result<(BufferBinding, BufferBinding), RenderError> {
        if self.vertex_shader.is_none() {
            return Err(RenderError::NoShader(ShaderKind::Vertex));
        }
        if self.attribute_shader.is_none() {
            return Err(RenderError::NoShader(ShaderKind::Attribute));
        }
        if self.fragment_shader.is_none() {
            return Err(RenderError::NoShader(ShaderKind::Fragment));
        }
        let vertices = self.vertex_buffer.clone().ok_or(RenderError::NoVertexBuffer)?;
        let attributes = self
            .attribute_buffer
            .clone()
            .ok_or(RenderError::NoAttributeBuffer)?;
        Ok((vertices, attributes))
    }

    fn draw(
        &mut self,
        vertices: BufferBinding,
        attributes: BufferBinding,
        indices: IndexSource,
        adjacency: Option<Arc<[u32]>>,
    ) -> Result<(), RenderError> {
        let core = Self::core_mut(&mut self.core, self.phase, "draw")?;

        if core.draw_calls.len() >= MAX_DRAW_CALLS {
            return Err(RenderError::CapacityExceeded("draw calls", MAX_DRAW_CALLS));
        }
        let num_triangles = indices.num_triangles();
        if num_triangles > MAX_TRIANGLES_PER_DRAW {
            return Err(RenderError::CapacityExceeded(
                "triangles per draw call",
                MAX_TRIANGLES_PER_DRAW,
            ));
        }

        let arena = &core.arena;
        let (vs, attr, fs) = match (
            &mut self.vertex_shader,
            &mut self.attribute_shader,
            &mut self.fragment_shader,
        ) {
            (Some(vs), Some(attr), Some(fs)) => (vs, attr, fs),
            _ => return Err(RenderError::NoShader(ShaderKind::Vertex)),
        };
        let states = RenderStates {
            vertex: vs.binding(arena)?,
            vertex_mode: self.vertex_mode,
            attribute: attr.binding(arena)?,
            fragment: fs.binding(arena)?,
            fragment_mode: self.fragment_mode,
        };

        let arrays = DrawCallArrays::allocate(arena, vertices.count, num_triangles)?;

        core.draw_calls.push(DrawCall {
            states,
            vertices,
            attributes,
            indices,
            adjacency,
            arrays,
        });
        Ok(())
    }

    /// Start vertex shading, triangle setup, and importance map seeding of
    /// the recorded draw calls.
    pub fn begin_front_end_shade_and_him_rast(&mut self) -> Result<(), RenderError> {
        const OP: &str = "begin_front_end_shade_and_him_rast";
        let core = Self::core_mut(&mut self.core, self.phase, OP)?;
        let size = match &core.target {
            Some(target) => target.size(),
            None => return Err(RenderError::NoFrameBuffer),
        };

        core.max_level = max_bin_level(size);
        if core.frame_number == u32::max_value() {
            log::debug!("Frame number wrapped around; clearing all bin lists");
            core.bins.clear();
            core.frame_number = 0;
        }
        core.frame_number += 1;
        core.bins.clear_z();
        core.himap.clear();

        log::debug!(
            "Frame {}: front end (shade) for {} draw call(s)",
            core.frame_number,
            core.draw_calls.len()
        );

        self.phase = Phase::FrontEnd;
        for draw_call in 0..self.core.draw_calls.len() {
            let task = Arc::new(VertexShadeTask {
                core: Arc::clone(&self.core),
                draw_call,
            });
            let size = self.core.draw_calls[draw_call].arrays.positions.len();
            if let Err(e) = self
                .pool
                .start_task(task, size, VERTEX_GRANULARITY, true)
            {
                self.phase = Phase::Failed;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait for the front end (shade), build the importance map, and start
    /// binning.
    pub fn begin_front_end_bin(&mut self) -> Result<(), RenderError> {
        self.expect_phase(Phase::FrontEnd, "begin_front_end_bin")?;
        self.pool.barrier();
        self.check_fault()?;

        log::debug!("Frame {}: front end (bin)", self.core.frame_number);

        let core = &self.core;
        if core.dense {
            core.himap.fill();
        } else {
            let task = Arc::new(HimBuildTask {
                core: Arc::clone(core),
            });
            let rows = core.himap.num_super_tile_rows();
            self.pool.start_task(task, rows, 1, false).map_err(|e| self.fail(e))?;
            self.pool.barrier();
            self.core.himap.build_upper_levels();
        }

        self.phase = Phase::Bin;
        for draw_call in 0..self.core.draw_calls.len() {
            let task = Arc::new(BinTask {
                core: Arc::clone(&self.core),
                draw_call,
            });
            let size = self.core.draw_calls[draw_call].num_triangles();
            self.pool
                .start_task(task, size, BIN_GRANULARITY, false)
                .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// Wait for binning and start resolving the tiles.
    pub fn begin_back_end(&mut self) -> Result<(), RenderError> {
        self.expect_phase(Phase::Bin, "begin_back_end")?;
        self.pool.barrier();
        self.check_fault()?;

        log::debug!("Frame {}: back end", self.core.frame_number);

        let [tiles_x, tiles_y] = self.core.bins.size();
        let task = Arc::new(ResolveTask {
            core: Arc::clone(&self.core),
        });
        self.phase = Phase::BackEnd;
        self.pool
            .start_task(task, tiles_x * tiles_y, RESOLVE_GRANULARITY, false)
            .map_err(|e| self.fail(e))
    }

    /// Wait for the frame to complete and release the frame-scoped state.
    /// Returns the first fault raised by a worker, if any.
    ///
    /// May be called in any phase after the frame was started, which aborts
    /// the frame. The draw calls, the clear color, dense mode, transparent
    /// importance, and the importance map seeder are reset. Bindings are
    /// kept.
    pub fn finish(&mut self) -> Result<(), RenderError> {
        if self.phase == Phase::Idle {
            return Err(RenderError::PhaseOrder("finish"));
        }
        self.pool.barrier();
        self.phase = Phase::Idle;

        let core = Arc::get_mut(&mut self.core).ok_or(RenderError::FrameInFlight)?;
        core.arena.reset();
        for local in core.locals.iter_mut() {
            local
                .get_mut()
                .unwrap_or_else(|e| e.into_inner())
                .reset();
        }
        core.draw_calls.clear();
        core.dense = false;
        core.transparent_importance = false;
        core.clear_color = 0;
        core.him = None;

        log::debug!("Frame {}: finished", core.frame_number);

        match core.take_fault() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run every phase of a frame and wait for its completion.
    pub fn render_frame(&mut self) -> Result<(), RenderError> {
        self.expect_phase(Phase::Idle, "render_frame")?;
        let result = self
            .begin_front_end_shade_and_him_rast()
            .and_then(|()| self.begin_front_end_bin())
            .and_then(|()| self.begin_back_end());
        match result {
            Ok(()) => self.finish(),
            Err(e) => {
                if self.phase != Phase::Idle {
                    let _ = self.finish();
                }
                Err(e)
            }
        }
    }

    fn fail(&mut self, e: RenderError) -> RenderError {
        self.phase = Phase::Failed;
        e
    }

    fn check_fault(&mut self) -> Result<(), RenderError> {
        match self.core.take_fault() {
            Some(e) => Err(self.fail(e)),
            None => Ok(()),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if self.phase != Phase::Idle {
            self.pool.barrier();
        }
    }
}

struct VertexShadeTask {
    core: Arc<Core>,
    draw_call: usize,
}

impl Task for VertexShadeTask {
    fn run(&self, range: Range<usize>, _worker: usize) {
        let core = &*self.core;
        let dc = &core.draw_calls[self.draw_call];
        let shader = &dc.states.vertex;
        let count = range.len();

        let input = dc.vertices.elements(range.clone());
        // Safety: work items cover disjoint ranges
        let output = unsafe { core.arena.slice_mut(dc.arrays.positions.subslice(range)) };
        shader.shader.execute(
            input,
            output.as_bytes_mut(),
            count,
            shader.uniform_bytes(&core.arena),
        );
    }

    fn finished(&self, spawner: &Spawner<'_>) {
        let core = &*self.core;
        let num_triangles = core.draw_calls[self.draw_call].num_triangles();
        let task = Arc::new(SetupTask {
            core: Arc::clone(&self.core),
            draw_call: self.draw_call,
        });
        let seed = core.him.is_some() && !core.dense;
        if let Err(e) = spawner.start_task(task, num_triangles, SETUP_GRANULARITY, seed) {
            core.record_fault(e);
        }
    }
}

struct SetupTask {
    core: Arc<Core>,
    draw_call: usize,
}

impl Task for SetupTask {
    fn run(&self, range: Range<usize>, _worker: usize) {
        let core = &*self.core;
        let dc = &core.draw_calls[self.draw_call];
        let arena = &core.arena;
        let arrays = &dc.arrays;

        // Safety: vertex shading is complete, and work items cover disjoint
        // ranges
        let (positions, out) = unsafe {
            (
                dc.positions(arena),
                SetupOutput {
                    triangles: arena.slice_mut(arrays.triangles.subslice(range.clone())),
                    hpez: arena.slice_mut(arrays.hpez.subslice(range.clone())),
                    flags: arena.slice_mut(arrays.flags.subslice(range.clone())),
                },
            )
        };

        let size = core.frame_size();
        match core.config.lane_width {
            LaneWidth::X4 => setup_triangles::<4>(positions, &dc.indices, range, size, out),
            LaneWidth::X8 => setup_triangles::<8>(positions, &dc.indices, range, size, out),
        }
    }

    fn finished(&self, spawner: &Spawner<'_>) {
        let core = &*self.core;
        let task = Arc::new(HimTask {
            core: Arc::clone(&self.core),
            draw_call: self.draw_call,
        });
        let num_triangles = core.draw_calls[self.draw_call].num_triangles();
        if let Err(e) = spawner.start_task(task, num_triangles, HIM_GRANULARITY, false) {
            core.record_fault(e);
        }
    }
}

/// Seeds the importance map from a draw call.
struct HimTask {
    core: Arc<Core>,
    draw_call: usize,
}

impl Task for HimTask {
    fn run(&self, range: Range<usize>, _worker: usize) {
        let core = &*self.core;
        let him = match &core.him {
            Some(him) => him,
            None => return,
        };
        let dc = &core.draw_calls[self.draw_call];

        // Safety: triangle setup is complete, and the flags are only accessed
        // through atomics until binning
        let target = unsafe {
            HimTarget {
                positions: dc.positions(&core.arena),
                indices: &dc.indices,
                flags: dc.atomic_flags(&core.arena),
                adjacency: dc.adjacency.as_deref(),
                himap: &core.himap,
                size: core.frame_size(),
                opaque: dc.is_opaque(),
                transparent_importance: core.transparent_importance,
            }
        };
        him.rasterize(&target, range);
    }
}

struct HimBuildTask {
    core: Arc<Core>,
}

impl Task for HimBuildTask {
    fn run(&self, range: Range<usize>, _worker: usize) {
        for row in range {
            self.core.himap.build_super_tile_row(row);
        }
    }
}

struct BinTask {
    core: Arc<Core>,
    draw_call: usize,
}

impl Task for BinTask {
    fn run(&self, range: Range<usize>, worker: usize) {
        let core = &*self.core;
        let dc = &core.draw_calls[self.draw_call];
        let arena = &core.arena;
        let mut allocator = lock(&core.locals[worker]);

        let mut target = BinTarget {
            arena,
            allocator: &mut allocator,
            bins: core.bins.lock_worker(worker),
            himap: &core.himap,
            frame_number: core.frame_number,
            size: core.frame_size(),
            max_level: core.max_level,
        };

        // Safety: triangle setup and importance map seeding are complete
        let (triangles, flags) = unsafe { (dc.triangles(arena), dc.flags(arena)) };
        let draw_call = self.draw_call as u16;
        let occluder = dc.is_occluder();

        let result = match core.config.lane_width {
            LaneWidth::X4 => {
                bin_triangles::<4>(&mut target, draw_call, triangles, flags, range, occluder)
            }
            LaneWidth::X8 => {
                bin_triangles::<8>(&mut target, draw_call, triangles, flags, range, occluder)
            }
        };
        if let Err(e) = result {
            core.record_fault(e);
        }
    }
}

struct ResolveTask {
    core: Arc<Core>,
}

impl Task for ResolveTask {
    fn run(&self, range: Range<usize>, worker: usize) {
        let core = &*self.core;
        let target = match &core.target {
            Some(target) => target,
            None => return,
        };

        let lists = core.bins.lock_all();
        let mut ctx = lock(&core.contexts[worker]);
        let frame = ResolveFrame {
            arena: &core.arena,
            draw_calls: &core.draw_calls,
            himap: &core.himap,
            bins: &core.bins,
            lists: &lists,
            target,
            frame_number: core.frame_number,
            clear_color: core.clear_color,
            dense: core.dense,
            early_out: core.config.early_out,
            transparent_importance: core.transparent_importance,
        };
        let mut bin = CompositeBinList::new();

        for tile in range {
            let result = match core.config.lane_width {
                LaneWidth::X4 => resolve_tile::<4>(&frame, &mut ctx, &mut bin, tile),
                LaneWidth::X8 => resolve_tile::<8>(&frame, &mut ctx, &mut bin, tile),
            };
            if let Err(e) = result {
                core.record_fault(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::FrameBufferFormat;

    /// Passes `[f32; 4]` positions through.
    struct Passthrough;

    impl Shader for Passthrough {
        fn execute(&self, input: &[u8], output: &mut [u8], count: usize, _: &[u8]) {
            output[..count * 16].copy_from_slice(&input[..count * 16]);
        }
    }

    /// Writes the color given as the uniforms.
    struct Solid;

    impl Shader for Solid {
        fn execute(&self, _: &[u8], output: &mut [u8], count: usize, uniforms: &[u8]) {
            for px in output[..count * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&uniforms[..4]);
            }
        }
    }

    struct WideAttributes;

    impl Shader for WideAttributes {
        fn output_stride(&self) -> usize {
            24
        }

        fn execute(&self, _: &[u8], _: &mut [u8], _: usize, _: &[u8]) {}
    }

    fn renderer() -> Renderer {
        let _ = env_logger::builder().is_test(true).try_init();
        Renderer::new(RendererConfig {
            num_threads: 2,
            arena_capacity: 1 << 20,
            ..RendererConfig::default()
        })
        .unwrap()
    }

    fn bind_everything(r: &mut Renderer, color: u32) {
        let vertices = DataBuffer::from_slice(&[
            [-1.0f32, -1.0, 0.5, 1.0],
            [1.0, -1.0, 0.5, 1.0],
            [-1.0, 1.0, 0.5, 1.0],
        ]);
        r.bind_vertex_buffer(&vertices, 0, 16, 3).unwrap();
        r.bind_attribute_buffer(&vertices, 0, 16, 3).unwrap();
        r.bind_shader(ShaderKind::Vertex, Arc::new(Passthrough), &[])
            .unwrap();
        r.bind_shader(ShaderKind::Attribute, Arc::new(Passthrough), &[])
            .unwrap();
        r.bind_shader(ShaderKind::Fragment, Arc::new(Solid), &color.to_le_bytes())
            .unwrap();
    }

    #[test]
    fn phases_must_be_ordered() {
        let mut r = renderer();
        r.bind_frame_buffer(FrameBuffer::new(FrameBufferFormat::Rgba8, 16, 16, 16))
            .unwrap();

        assert_eq!(
            r.begin_front_end_bin(),
            Err(RenderError::PhaseOrder("begin_front_end_bin"))
        );
        assert_eq!(
            r.begin_back_end(),
            Err(RenderError::PhaseOrder("begin_back_end"))
        );
        assert_eq!(r.finish(), Err(RenderError::PhaseOrder("finish")));

        r.begin_front_end_shade_and_him_rast().unwrap();
        assert_eq!(
            r.begin_back_end(),
            Err(RenderError::PhaseOrder("begin_back_end"))
        );
        assert_eq!(r.draw_list(), Err(RenderError::PhaseOrder("draw_list")));
        assert!(r.set_clear_color(RGBA8::new(0, 0, 0, 0)).is_err());

        // Aborting the frame is allowed
        r.finish().unwrap();
        r.render_frame().unwrap();
    }

    #[test]
    fn frame_buffer_required() {
        let mut r = renderer();
        assert_eq!(
            r.begin_front_end_shade_and_him_rast(),
            Err(RenderError::NoFrameBuffer)
        );
        assert_eq!(r.render_frame(), Err(RenderError::NoFrameBuffer));
        assert_eq!(r.frame_number(), 0);
    }

    #[test]
    fn frame_buffer_swap() {
        let mut r = renderer();
        let fb = FrameBuffer::new(FrameBufferFormat::Rgba8, 4, 4, 4);
        assert!(r.bind_frame_buffer(fb).unwrap().is_none());
        let fb = FrameBuffer::new(FrameBufferFormat::Rgba8, 8, 2, 8);
        assert_eq!(r.bind_frame_buffer(fb).unwrap().unwrap().size(), [4, 4]);
        assert_eq!(r.frame_buffer().unwrap().size(), [8, 2]);
        assert_eq!(r.importance_map().width(), 8);
        assert_eq!(r.take_frame_buffer().unwrap().unwrap().size(), [8, 2]);
        assert!(r.frame_buffer().is_none());
    }

    #[test]
    fn frame_buffer_size_is_limited() {
        let mut r = renderer();
        let n = MAX_FRAME_BUFFER_SIZE;
        let fb = FrameBuffer::new(FrameBufferFormat::Rgba8, n + 1, 1, n + 1);
        assert_eq!(
            r.bind_frame_buffer(fb),
            Err(RenderError::InvalidFrameBufferSize(n + 1, 1))
        );
        let fb = FrameBuffer::new(FrameBufferFormat::Rgba8, 1, n + 1, 1);
        assert_eq!(
            r.bind_frame_buffer(fb),
            Err(RenderError::InvalidFrameBufferSize(1, n + 1))
        );
        assert!(r.frame_buffer().is_none());
        assert_eq!(r.importance_map().width(), 0);

        let fb = FrameBuffer::new(FrameBufferFormat::Rgba8, 16, 16, 16);
        assert!(r.bind_frame_buffer(fb).unwrap().is_none());
    }

    #[test]
    fn draw_requires_shaders_and_buffers() {
        let mut r = renderer();
        assert_eq!(
            r.draw_list(),
            Err(RenderError::NoShader(ShaderKind::Vertex))
        );
        r.bind_shader(ShaderKind::Vertex, Arc::new(Passthrough), &[])
            .unwrap();
        r.bind_shader(ShaderKind::Attribute, Arc::new(Passthrough), &[])
            .unwrap();
        assert_eq!(
            r.draw_list(),
            Err(RenderError::NoShader(ShaderKind::Fragment))
        );
        r.bind_shader(ShaderKind::Fragment, Arc::new(Solid), &[0; 4])
            .unwrap();
        assert_eq!(r.draw_list(), Err(RenderError::NoVertexBuffer));

        bind_everything(&mut r, 0);
        assert_eq!(r.draw_indexed(), Err(RenderError::NoIndexBuffer));
        r.draw_list().unwrap();
    }

    #[test]
    fn attribute_output_stride() {
        let mut r = renderer();
        assert_eq!(
            r.bind_shader(ShaderKind::Attribute, Arc::new(WideAttributes), &[]),
            Err(RenderError::InvalidAttributeOutput(24))
        );
        // Other kinds don't care
        r.bind_shader(ShaderKind::Fragment, Arc::new(WideAttributes), &[])
            .unwrap();
    }

    #[test]
    fn index_values_are_validated() {
        let mut r = renderer();
        bind_everything(&mut r, 0);

        let indices = DataBuffer::from_slice(&[0u16, 1, 3]);
        r.bind_index_buffer(&indices, 0, 2, 3).unwrap();
        assert_eq!(
            r.draw_indexed(),
            Err(RenderError::BufferOutOfRange("vertex"))
        );

        let indices = DataBuffer::from_slice(&[0u16, 1, 2]);
        r.bind_index_buffer(&indices, 0, 2, 3).unwrap();
        r.draw_indexed().unwrap();

        assert_eq!(
            r.bind_index_buffer(&indices, 0, 3, 1),
            Err(RenderError::InvalidIndexBufferStride(3))
        );
    }

    #[test]
    fn adjacency_cache() {
        let mut r = renderer();
        let indices = DataBuffer::from_slice(&[0u32, 1, 2, 2, 1, 3]);
        r.bind_index_buffer(&indices, 0, 4, 6).unwrap();
        assert_eq!(r.adjacency.len(), 1);

        let ib = r.index_buffer.clone().unwrap();
        let adj = r.adjacency_of(&ib);
        assert_eq!(adj[0], adjacency::NO_NEIGHBOR);
        assert_eq!(adj[1], 1);
        assert_eq!(adj[3], 0);

        // Another view of the same buffer
        r.bind_index_buffer(&indices, 0, 4, 3).unwrap();
        assert_eq!(r.adjacency.len(), 2);

        r.invalidate_index_buffer(&indices);
        assert!(r.adjacency.is_empty());
    }

    #[test]
    fn uniforms_survive_arena_reset() {
        let mut r = renderer();
        r.bind_frame_buffer(FrameBuffer::new(FrameBufferFormat::Rgba8, 8, 8, 8))
            .unwrap();
        bind_everything(&mut r, 0xff00_00ff);

        for frame in 1..=3 {
            r.force_dense().unwrap();
            r.draw_list().unwrap();
            r.render_frame().unwrap();
            assert_eq!(r.frame_number(), frame);

            // The triangle covers the bottom-left half
            let fb = r.frame_buffer().unwrap();
            assert_eq!(fb.get(0, 7), 0xff00_00ff);
            assert_eq!(fb.get(7, 0), 0);
        }
    }

    #[test]
    fn settings_reset_after_frame() {
        let mut r = renderer();
        r.bind_frame_buffer(FrameBuffer::new(FrameBufferFormat::Rgba8, 8, 8, 8))
            .unwrap();

        r.force_dense().unwrap();
        r.set_clear_color(RGBA8::new(1, 2, 3, 4)).unwrap();
        r.render_frame().unwrap();
        assert_eq!(r.frame_buffer().unwrap().get(3, 3), 0x0403_0201);

        // The clear color reverted to zero
        r.force_dense().unwrap();
        r.render_frame().unwrap();
        assert_eq!(r.frame_buffer().unwrap().get(3, 3), 0);

        // Not dense anymore; nothing is resolved
        r.frame_buffer().unwrap().fill(7);
        r.render_frame().unwrap();
        assert_eq!(r.frame_buffer().unwrap().get(3, 3), 7);
    }

    #[test]
    fn frame_number_wraps() {
        let mut r = renderer();
        r.bind_frame_buffer(FrameBuffer::new(FrameBufferFormat::Rgba8, 8, 8, 8))
            .unwrap();
        Arc::get_mut(&mut r.core).unwrap().frame_number = u32::max_value() - 1;
        r.render_frame().unwrap();
        assert_eq!(r.frame_number(), u32::max_value());
        r.render_frame().unwrap();
        assert_eq!(r.frame_number(), 1);
    }

    #[test]
    fn arena_exhaustion_is_reported_by_draw() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut r = Renderer::new(RendererConfig {
            num_threads: 1,
            arena_capacity: 1024,
            ..RendererConfig::default()
        })
        .unwrap();
        bind_everything(&mut r, 0);
        let result = (0..100).try_for_each(|_| r.draw_list());
        assert!(matches!(result, Err(RenderError::ArenaExhausted(_, 1024))));
    }
}
