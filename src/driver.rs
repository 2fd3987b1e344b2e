use std::sync::Arc;

use glam::Vec3;

use crate::{error::GlintResult, jit::ShaderHandle, loader::SceneDatabase};

/// A single ray for trace-mode sessions.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    pub tmin: f32,
    pub tmax: f32,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            tmin: 0.0,
            tmax: f32::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebugMode {
    #[default]
    Normal,
    Normals,
    Uv,
}

/// Per-session counters owned by the driver. Only meaningful when statistics
/// acquisition was requested at setup.
#[derive(Clone, Copy, Debug, Default)]
pub struct Statistics {
    pub iterations: u32,
    pub rays_traced: u64,
    pub render_time_ms: f64,
}

/// Everything a driver needs to bring a render session up: the baked scene
/// database plus the JIT-compiled shader handles.
pub struct DriverSetupSettings {
    pub database: Arc<SceneDatabase>,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub acquire_stats: bool,
    pub ray_generation_shader: ShaderHandle,
    pub miss_shader: ShaderHandle,
    pub hit_shaders: Vec<ShaderHandle>,
}

/// Per-call render parameters. Constructed fresh for every `render`
/// invocation and never mutated afterwards.
#[derive(Clone, Copy, Debug)]
pub struct DriverRenderSettings<'a> {
    pub eye: Vec3,
    pub dir: Vec3,
    pub up: Vec3,
    pub right: Vec3,
    pub width: u32,
    pub height: u32,
    pub tmin: f32,
    pub tmax: f32,
    pub device: u32,
    pub spi: u32,
    pub debug_mode: DebugMode,
    /// Raw ray stream for trace mode; `None` for camera-driven rendering.
    pub rays: Option<&'a [Ray]>,
}

/// The capability contract every backend driver implements.
///
/// One concrete type per hardware target. `render` is blocking and completes
/// one full iteration before returning; the driver's internal concurrency
/// (worker pool or device command stream) is opaque to the caller.
pub trait Driver: Send {
    fn setup(&mut self, settings: DriverSetupSettings) -> GlintResult<()>;

    fn render(&mut self, settings: &DriverRenderSettings<'_>, iteration: u32);

    /// Read-only view of one AOV, valid until the next `render` call.
    /// `None` if the AOV index has no framebuffer.
    fn framebuffer(&self, aov: usize) -> Option<&[f32]>;

    fn clear_framebuffer(&mut self, aov: usize);

    fn statistics(&self) -> &Statistics;

    fn shutdown(&mut self);
}

/// Factory registered with the Driver Manager for built-in backends.
pub type DriverFactory = fn() -> Box<dyn Driver>;
