use quick_error::quick_error;

use crate::shader::ShaderKind;

quick_error! {
    /// Errors reported by the rasterizer.
    ///
    /// Binding and drawing operations report configuration errors
    /// immediately. Errors encountered by worker threads in the middle of a
    /// frame are deferred and reported by the next phase transition.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RenderError {
        /// The configuration is invalid.
        InvalidConfig(reason: &'static str) {
            display("invalid configuration: {}", reason)
        }
        /// An index element size other than 1, 2, or 4 bytes was given.
        InvalidIndexBufferStride(size: usize) {
            display("invalid index buffer stride: {}", size)
        }
        /// A vertex buffer's address or stride is not 16-byte aligned.
        InvalidVertexBufferAlignment {
            display("invalid vertex buffer alignment")
        }
        /// An attribute buffer's address or stride is not 16-byte aligned.
        InvalidAttributeBufferAlignment {
            display("invalid attribute buffer alignment")
        }
        /// The attribute shader's output stride is not a multiple of 16 or is
        /// too large.
        InvalidAttributeOutput(stride: usize) {
            display("invalid attribute shader output stride: {}", stride)
        }
        /// A buffer binding refers to bytes past the end of the buffer.
        BufferOutOfRange(what: &'static str) {
            display("{} buffer binding is out of range", what)
        }
        /// `draw_indexed` was called without an index buffer.
        NoIndexBuffer {
            display("no index buffer bound")
        }
        /// A draw was issued without a required shader.
        NoShader(kind: ShaderKind) {
            display("no {:?} shader bound", kind)
        }
        /// A draw was issued without a vertex buffer.
        NoVertexBuffer {
            display("no vertex buffer bound")
        }
        /// A draw was issued without an attribute buffer.
        NoAttributeBuffer {
            display("no attribute buffer bound")
        }
        /// The frame buffer is wider or taller than `MAX_FRAME_BUFFER_SIZE`.
        InvalidFrameBufferSize(width: usize, height: usize) {
            display("frame buffer size {}x{} is too large", width, height)
        }
        /// The frame buffer must be bound before rendering.
        NoFrameBuffer {
            display("no frame buffer bound")
        }
        /// The task queue is full.
        TooManyTasks(limit: usize) {
            display("too many tasks (the limit is {})", limit)
        }
        /// A task was started with a zero granularity.
        InvalidGranularity {
            display("task granularity must be non-zero")
        }
        /// The frame arena ran out of memory.
        ArenaExhausted(requested: usize, capacity: usize) {
            display("arena exhausted: {} bytes requested, capacity is {} bytes", requested, capacity)
        }
        /// A fixed-size structure overflowed.
        CapacityExceeded(what: &'static str, limit: usize) {
            display("too many {} (the limit is {})", what, limit)
        }
        /// Frame phases were invoked in the wrong order.
        PhaseOrder(operation: &'static str) {
            display("`{}` was called in the wrong frame phase", operation)
        }
        /// The renderer state is still referenced by a running task.
        FrameInFlight {
            display("the frame is still in flight")
        }
        /// A worker thread could not be spawned.
        WorkerSpawn(reason: String) {
            display("could not spawn a worker thread: {}", reason)
        }
    }
}
