use std::sync::Arc;

use crate::{
    arena::{Arena, ArenaSlice},
    shader::Shader,
};

/// The face culling mode. Only back faces (clockwise in window coordinates)
/// can be culled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Overwrite. Draw calls using this are opaque.
    Replace,
    /// `dst = src + dst * (1 - src.a)`
    PremulAlpha,
}

/// The depth comparison. Depth is reversed: `1` is near and `0` is far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthMode {
    /// Pass if nearer than the stored depth.
    Less,
}

/// The fixed-function state of the vertex stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexMode {
    pub cull: CullMode,
}

impl Default for VertexMode {
    fn default() -> Self {
        Self {
            cull: CullMode::Back,
        }
    }
}

/// The fixed-function state of the fragment stage. Opaque draw calls with
/// equal `FragmentMode`s are resolved together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentMode {
    pub blend: BlendMode,
    pub depth: DepthMode,
    pub depth_write: bool,
}

impl Default for FragmentMode {
    fn default() -> Self {
        Self {
            blend: BlendMode::Replace,
            depth: DepthMode::Less,
            depth_write: true,
        }
    }
}

impl FragmentMode {
    pub fn is_opaque(&self) -> bool {
        self.blend == BlendMode::Replace
    }
}

/// A shader and its uniforms, copied into the frame arena.
#[derive(Clone)]
pub(crate) struct ShaderBinding {
    pub shader: Arc<dyn Shader>,
    pub uniforms: Option<ArenaSlice<u8>>,
}

impl ShaderBinding {
    /// The uniform blob, or an empty slice if none was supplied.
    pub fn uniform_bytes<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        match self.uniforms {
            // Safety: uniforms are never written after being copied into the
            // arena
            Some(u) => unsafe { arena.slice(u) },
            None => &[],
        }
    }
}

impl std::fmt::Debug for ShaderBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderBinding")
            .field("uniforms", &self.uniforms)
            .finish()
    }
}

/// The render states captured by a draw call.
#[derive(Debug, Clone)]
pub(crate) struct RenderStates {
    pub vertex: ShaderBinding,
    pub vertex_mode: VertexMode,
    pub attribute: ShaderBinding,
    pub fragment: ShaderBinding,
    pub fragment_mode: FragmentMode,
}
