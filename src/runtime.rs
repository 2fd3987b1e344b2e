//! Runtime orchestration: resolves the hardware target, drives scene
//! loading and shader generation, JIT-compiles the generated source and owns
//! the driver through the render/trace lifecycle.
//!
//! A `Runtime` is single-threaded from the caller's perspective: `setup`,
//! `step`, `trace` and `shutdown` are blocking and must not overlap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::{Mat4, Vec3};
use tracing::{debug, error, info, warn};

use crate::{
    camera::Camera,
    driver::{DebugMode, Driver, DriverRenderSettings, DriverSetupSettings, Ray, Statistics},
    error::{GlintError, GlintResult},
    jit,
    loader::{self, LoaderOptions},
    manager::DriverManager,
    scene::Scene,
    target::Target,
};

const DEFAULT_FILM_WIDTH: u32 = 800;
const DEFAULT_FILM_HEIGHT: u32 = 600;
const DEFAULT_FOV: f32 = 60.0;
const DEFAULT_TMIN: f32 = 0.0;
const DEFAULT_TMAX: f32 = 10_000.0;

const CPU_RECOMMENDED_SPI: u32 = 2;
const GPU_RECOMMENDED_SPI: u32 = 8;

#[derive(Clone, Debug, Default)]
pub struct RuntimeOptions {
    /// Explicit target; `None` asks the Driver Manager for a recommendation.
    pub desired_target: Option<Target>,
    pub recommend_cpu: bool,
    pub recommend_gpu: bool,
    /// Device index for multi-device GPU targets.
    pub device: u32,
    /// Samples per iteration; `None` selects a target-dependent default.
    pub samples_per_iteration: Option<u32>,
    pub override_technique: Option<String>,
    pub override_camera: Option<String>,
    pub acquire_stats: bool,
    /// Dump the generated shader source next to the working directory.
    pub dump_shader: bool,
    /// Extra directory to scan for shared driver modules.
    pub module_directory: Option<PathBuf>,
}

/// Camera/film configuration derived from the scene at construction.
#[derive(Clone, Copy, Debug)]
pub struct LoadedRenderSettings {
    pub film_width: u32,
    pub film_height: u32,
    pub fov: f32,
    pub eye: Vec3,
    pub dir: Vec3,
    pub up: Vec3,
    pub tmin: f32,
    pub tmax: f32,
}

impl Default for LoadedRenderSettings {
    fn default() -> Self {
        Self {
            film_width: DEFAULT_FILM_WIDTH,
            film_height: DEFAULT_FILM_HEIGHT,
            fov: DEFAULT_FOV,
            eye: Vec3::ZERO,
            dir: Vec3::Z,
            up: Vec3::Y,
            tmin: DEFAULT_TMIN,
            tmax: DEFAULT_TMAX,
        }
    }
}

pub struct Runtime {
    manager: DriverManager,
    driver: Box<dyn Driver>,
    target: Target,
    device: u32,
    samples_per_iteration: u32,
    iteration: u32,
    init: bool,
    is_trace: bool,
    is_debug: bool,
    acquire_stats: bool,
    technique_type: String,
    camera_type: String,
    loaded_settings: LoadedRenderSettings,
    database: Arc<loader::SceneDatabase>,
    ray_generation_source: String,
    miss_source: String,
    hit_sources: Vec<String>,
    framebuffer_width: u32,
    framebuffer_height: u32,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("target", &self.target)
            .field("device", &self.device)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Construct a fully configured runtime from a scene file. Any failure
    /// (module enumeration, scene parse, driver load, scene load) aborts
    /// construction; no partial runtime is ever returned.
    pub fn new(scene_path: impl AsRef<Path>, opts: RuntimeOptions) -> GlintResult<Self> {
        let scene_path = scene_path.as_ref();
        let manager = DriverManager::init(opts.module_directory.as_deref())?;

        let requested = match opts.desired_target {
            Some(t) => t,
            None => {
                let recommended = if opts.recommend_cpu && !opts.recommend_gpu {
                    manager.recommend_cpu_target()
                } else if opts.recommend_gpu && !opts.recommend_cpu {
                    manager.recommend_gpu_target()
                } else {
                    manager.recommend_target()
                };
                recommended.ok_or_else(|| {
                    GlintError::config("no backend driver satisfies the requested class")
                })?
            }
        };

        debug!(scene = %scene_path.display(), "parsing scene");
        let scene = Scene::from_file(scene_path)?;

        let technique_type = derive_technique(&scene, &opts);
        let camera_type = derive_camera_type(&scene, &opts);
        let loaded_settings = derive_render_settings(&scene);

        let target = manager.resolve_target(requested).ok_or_else(|| {
            GlintError::config(format!("target '{requested}' cannot be satisfied"))
        })?;
        if target != requested {
            warn!("switched from target '{requested}' to '{target}'");
        }

        info!(%target, technique = %technique_type, camera = %camera_type, "loading driver");
        let driver = manager.load(target)?;

        let samples_per_iteration = opts
            .samples_per_iteration
            .filter(|spi| *spi > 0)
            .unwrap_or(if target.is_cpu() {
                CPU_RECOMMENDED_SPI
            } else {
                GPU_RECOMMENDED_SPI
            });
        debug!(spi = samples_per_iteration, "samples per iteration resolved");

        let result = loader::load(&LoaderOptions {
            file_path: scene_path.to_path_buf(),
            target,
            technique_type: technique_type.clone(),
            camera_type: camera_type.clone(),
            samples_per_iteration,
            scene,
        })?;

        if opts.dump_shader {
            dump_shader("rayGeneration.art", &result.ray_generation_shader)?;
            dump_shader("missShader.art", &result.miss_shader)?;
            for (i, shader) in result.hit_shaders.iter().enumerate() {
                dump_shader(&format!("hitShader{i}.art"), shader)?;
            }
        }

        let is_debug = technique_type == "debug";
        let is_trace = camera_type == "list";

        // Consistent and fast float behavior for every kernel of this
        // session; process-wide for its whole lifetime.
        enable_flush_to_zero();

        Ok(Self {
            manager,
            driver,
            target,
            device: opts.device,
            samples_per_iteration,
            iteration: 0,
            init: false,
            is_trace,
            is_debug,
            acquire_stats: opts.acquire_stats,
            technique_type,
            camera_type,
            loaded_settings,
            database: Arc::new(result.database),
            ray_generation_source: result.ray_generation_shader,
            miss_source: result.miss_shader,
            hit_sources: result.hit_shaders,
            framebuffer_width: 0,
            framebuffer_height: 0,
        })
    }

    /// Compile the generated shaders and bring the driver up. Framebuffer
    /// dimensions of zero are clamped to one, never rejected.
    pub fn setup(&mut self, framebuffer_width: u32, framebuffer_height: u32) -> GlintResult<()> {
        let module_path = self
            .manager
            .module_path(self.target)
            .ok_or_else(|| {
                GlintError::config(format!("no module path for target '{}'", self.target))
            })?
            .to_path_buf();

        debug!(module = %module_path.display(), "initializing JIT");
        jit::init_jit(module_path)?;

        debug!("compiling ray generation shader");
        let ray_generation_shader =
            jit::compile_source(&self.ray_generation_source, "ray_generation_shader")?;

        debug!("compiling miss shader");
        let miss_shader = jit::compile_source(&self.miss_source, "miss_shader")?;

        let mut hit_shaders = Vec::with_capacity(self.hit_sources.len());
        for (i, source) in self.hit_sources.iter().enumerate() {
            debug!(index = i, "compiling hit shader");
            hit_shaders.push(jit::compile_source(source, "hit_shader")?);
        }

        self.framebuffer_width = framebuffer_width.max(1);
        self.framebuffer_height = framebuffer_height.max(1);
        self.driver.setup(DriverSetupSettings {
            database: Arc::clone(&self.database),
            framebuffer_width: self.framebuffer_width,
            framebuffer_height: self.framebuffer_height,
            acquire_stats: self.acquire_stats,
            ray_generation_shader,
            miss_shader,
            hit_shaders,
        })?;
        self.init = true;

        self.clear_framebuffer(0);
        Ok(())
    }

    /// Render one iteration through `camera`. Valid only for an initialized,
    /// non-trace session; misuse is logged and performs no rendering.
    pub fn step(&mut self, camera: &Camera) {
        if !self.init {
            error!("step() called before setup()");
            return;
        }
        if self.is_trace {
            error!("step() is not available in a trace session");
            return;
        }

        let settings = DriverRenderSettings {
            eye: camera.eye,
            dir: camera.direction,
            up: camera.up * (camera.sensor_height * 0.5),
            right: camera.right * (camera.sensor_width * 0.5),
            width: self.framebuffer_width,
            height: self.framebuffer_height,
            tmin: camera.tmin,
            tmax: camera.tmax,
            device: self.device,
            spi: self.samples_per_iteration,
            debug_mode: if self.is_debug {
                DebugMode::Uv
            } else {
                DebugMode::Normal
            },
            rays: None,
        };

        self.driver.render(&settings, self.iteration);
        self.iteration += 1;
    }

    /// Trace an explicit ray stream and copy the resulting colors (3 floats
    /// per ray) into `data`. A silent no-op before `setup`; logged misuse
    /// outside trace sessions.
    ///
    /// The stream capacity is the pixel count requested at `setup`; rays
    /// beyond it are not traced and their output slots stay zero.
    pub fn trace(&mut self, rays: &[Ray], data: &mut Vec<f32>) {
        if !self.init {
            return;
        }
        if !self.is_trace {
            error!("trace() is not available in a camera session");
            return;
        }

        let capacity = self.framebuffer_width as usize * self.framebuffer_height as usize;
        if rays.len() > capacity {
            warn!(
                rays = rays.len(),
                capacity, "ray stream exceeds the framebuffer capacity, overflow rays stay zero"
            );
        }

        let settings = DriverRenderSettings {
            eye: Vec3::ZERO,
            dir: Vec3::Z,
            up: Vec3::Y,
            right: Vec3::X,
            width: rays.len() as u32,
            height: 1,
            tmin: self.loaded_settings.tmin,
            tmax: self.loaded_settings.tmax,
            device: self.device,
            spi: self.samples_per_iteration,
            debug_mode: DebugMode::Normal,
            rays: Some(rays),
        };

        self.driver.render(&settings, self.iteration);
        self.iteration += 1;

        data.resize(3 * rays.len(), 0.0);
        if let Some(fb) = self.driver.framebuffer(0) {
            let n = data.len().min(fb.len());
            data[..n].copy_from_slice(&fb[..n]);
        }
    }

    /// Read-only view of one AOV, valid until the next render call.
    pub fn framebuffer(&self, aov: usize) -> Option<&[f32]> {
        self.driver.framebuffer(aov)
    }

    pub fn clear_framebuffer(&mut self, aov: usize) {
        self.driver.clear_framebuffer(aov);
    }

    /// `None` unless statistics acquisition was enabled at construction.
    pub fn statistics(&self) -> Option<&Statistics> {
        self.acquire_stats.then(|| self.driver.statistics())
    }

    /// Release the driver. Must not be called twice; disposal performs it
    /// automatically when the caller has not.
    pub fn shutdown(&mut self) {
        debug_assert!(self.init, "shutdown without setup");
        self.driver.shutdown();
        self.init = false;
    }

    /// A camera matching the scene's declared parameters and the configured
    /// film aspect ratio.
    pub fn scene_camera(&self) -> Camera {
        let s = &self.loaded_settings;
        let aspect = s.film_width as f32 / s.film_height.max(1) as f32;
        Camera::new(s.eye, s.dir, s.up, s.fov, aspect, s.tmin, s.tmax)
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn samples_per_iteration(&self) -> u32 {
        self.samples_per_iteration
    }

    pub fn is_trace_session(&self) -> bool {
        self.is_trace
    }

    pub fn is_debug_session(&self) -> bool {
        self.is_debug
    }

    pub fn technique_type(&self) -> &str {
        &self.technique_type
    }

    pub fn camera_type(&self) -> &str {
        &self.camera_type
    }

    pub fn loaded_render_settings(&self) -> &LoadedRenderSettings {
        &self.loaded_settings
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.init {
            self.shutdown();
        }
    }
}

fn derive_technique(scene: &Scene, opts: &RuntimeOptions) -> String {
    if let Some(t) = &opts.override_technique {
        return t.clone();
    }
    scene
        .technique
        .as_ref()
        .map(|t| t.plugin_type.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "path".to_string())
}

fn derive_camera_type(scene: &Scene, opts: &RuntimeOptions) -> String {
    if let Some(c) = &opts.override_camera {
        return c.clone();
    }
    scene
        .camera
        .as_ref()
        .map(|c| c.plugin_type.clone())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "perspective".to_string())
}

fn derive_render_settings(scene: &Scene) -> LoadedRenderSettings {
    let mut settings = LoadedRenderSettings::default();

    if let Some(film) = &scene.film {
        let size = film.vector2_or(
            "size",
            glam::Vec2::new(settings.film_width as f32, settings.film_height as f32),
        );
        settings.film_width = (size.x as u32).max(1);
        settings.film_height = (size.y as u32).max(1);
    }

    if let Some(camera) = &scene.camera {
        let transform: Mat4 = camera.transform_or_identity("transform");
        settings.eye = transform.transform_point3(Vec3::ZERO);
        settings.dir = transform.transform_vector3(Vec3::Z).normalize_or_zero();
        settings.up = transform.transform_vector3(Vec3::Y).normalize_or_zero();
        settings.fov = camera.number_or("fov", settings.fov);
        settings.tmin = camera.number_or("near_clip", settings.tmin);
        settings.tmax = camera.number_or("far_clip", settings.tmax);
    }

    if settings.tmax < settings.tmin {
        std::mem::swap(&mut settings.tmin, &mut settings.tmax);
    }

    settings
}

fn dump_shader(filename: &str, shader: &str) -> GlintResult<()> {
    std::fs::write(filename, shader)
        .map_err(|e| GlintError::load(filename, format!("cannot dump shader: {e}")))
}

/// Flush-to-zero and denormals-are-zero for the whole process. Global
/// mutable float state; enabled once before the first render and left on for
/// the session.
fn enable_flush_to_zero() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: only alters the MXCSR denormal handling bits.
    unsafe {
        use std::arch::x86_64::{_MM_FLUSH_ZERO_ON, _mm_getcsr, _mm_setcsr};
        // Removed from std::arch; DAZ bit of MXCSR.
        const _MM_DENORMALS_ZERO_ON: u32 = 0x0040;
        #[allow(deprecated)]
        _mm_setcsr(_mm_getcsr() | _MM_FLUSH_ZERO_ON | _MM_DENORMALS_ZERO_ON);
    }
}
