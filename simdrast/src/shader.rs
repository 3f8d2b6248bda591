/// A user-supplied program run by the rasterizer.
///
/// Shaders process `count` elements at once. Inputs and outputs are raw,
/// 16-byte aligned bytes; implementations usually reinterpret them with
/// `zerocopy::LayoutVerified`.
///
/// | kind      | input                                   | output                          |
/// |-----------|-----------------------------------------|---------------------------------|
/// | vertex    | vertex buffer elements                  | clip-space `[f32; 4]` positions |
/// | attribute | attribute buffer elements               | `output_stride()` bytes each    |
/// | fragment  | interpolated attributes (see below)     | `u32` RGBA8 colors              |
///
/// The first 16 bytes of the attribute shader output are interpolated
/// specially: a fragment receives `[Σ a.x·∂λ/∂x, Σ a.y·∂λ/∂x, Σ a.z·∂λ/∂y,
/// Σ a.w·∂λ/∂y]` where `λ` are the perspective-correct barycentric
/// coordinates. Writing `[u, v, u, v]` there thus yields the screen-space
/// derivatives of `(u, v)`, which are useful for texture filtering. The
/// remaining bytes are interpolated as `f32` values.
///
/// Fragment colors are premultiplied by alpha when blending is enabled.
pub trait Shader: Send + Sync {
    /// The number of output bytes per element. Only meaningful for attribute
    /// shaders, whose output stride must be a multiple of 16.
    fn output_stride(&self) -> usize {
        16
    }

    /// Process `count` elements. `uniforms` is the blob supplied to
    /// `Renderer::bind_shader`.
    fn execute(&self, input: &[u8], output: &mut [u8], count: usize, uniforms: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Vertex,
    Attribute,
    Fragment,
}
