use std::env::var_os;

use crate::error::RenderError;

/// The number of lanes processed together by triangle setup, binning, and
/// resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneWidth {
    X4,
    X8,
}

impl LaneWidth {
    pub fn lanes(self) -> usize {
        match self {
            LaneWidth::X4 => 4,
            LaneWidth::X8 => 8,
        }
    }
}

/// Construction parameters of a [`Renderer`](crate::Renderer).
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// The number of worker threads. Must be non-zero.
    pub num_threads: usize,
    /// The size of the frame-scoped arena in bytes.
    pub arena_capacity: usize,
    pub lane_width: LaneWidth,
    /// Skip the shading of pixels whose visibility is fully explained by a
    /// single triangle (or two adjacent ones) of the same draw call. Such
    /// pixels are left unwritten and are marked in the importance map instead.
    /// Has no effect in dense mode.
    pub early_out: bool,
    /// The capacity of the task queue.
    pub max_tasks: usize,
}

/// The largest supported arena. Bin list links store word indices in 30 bits.
const MAX_ARENA_CAPACITY: u64 = 1 << 32;

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism()
                .map(|x| x.get())
                .unwrap_or(1),
            arena_capacity: 256 << 20,
            lane_width: LaneWidth::X8,
            early_out: false,
            max_tasks: 64 * 1024,
        }
    }
}

impl RendererConfig {
    /// Construct a `RendererConfig` from the default values, overridden by
    /// the following environment variables:
    ///
    ///  - `SIMDRAST_NUM_THREADS`: the number of worker threads
    ///  - `SIMDRAST_ARENA_MB`: the arena capacity in mebibytes
    ///  - `SIMDRAST_LANES`: `4` or `8`
    ///  - `SIMDRAST_EARLY_OUT`: `0` or `1`
    ///
    /// Malformed values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut this = Self::default();

        if let Some(x) = env_usize("SIMDRAST_NUM_THREADS") {
            this.num_threads = x;
        }
        if let Some(x) = env_usize("SIMDRAST_ARENA_MB") {
            this.arena_capacity = x << 20;
        }
        match env_usize("SIMDRAST_LANES") {
            Some(4) => this.lane_width = LaneWidth::X4,
            Some(8) => this.lane_width = LaneWidth::X8,
            Some(x) => log::warn!("SIMDRAST_LANES: unsupported lane count {}", x),
            None => {}
        }
        if let Some(x) = env_usize("SIMDRAST_EARLY_OUT") {
            this.early_out = x != 0;
        }

        this
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.num_threads == 0 {
            return Err(RenderError::InvalidConfig("num_threads must be non-zero"));
        }
        if self.arena_capacity < 64 || self.arena_capacity as u64 > MAX_ARENA_CAPACITY {
            return Err(RenderError::InvalidConfig(
                "arena_capacity must be in range 64..=4GiB",
            ));
        }
        if self.max_tasks == 0 {
            return Err(RenderError::InvalidConfig("max_tasks must be non-zero"));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let value = var_os(name)?;
    let parsed = value.to_str().and_then(|s| s.trim().parse().ok());
    if parsed.is_none() {
        log::warn!("{}: ignoring malformed value {:?}", name, value);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        RendererConfig::default().validate().unwrap();
    }

    #[test]
    fn reject_zero_threads() {
        let config = RendererConfig {
            num_threads: 0,
            ..RendererConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(RenderError::InvalidConfig("num_threads must be non-zero"))
        );
    }

    #[test]
    fn reject_tiny_arena() {
        let config = RendererConfig {
            arena_capacity: 1,
            ..RendererConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
