//! CPU backend driver.
//!
//! One render iteration evaluates the compiled shaders for every pixel (or
//! every supplied ray in trace mode) and accumulates into the color AOV.
//! The scene database carries no geometry, so the primary-hit surface is an
//! implicit ground plane at `y = 0`: rays reaching it are shaded by the
//! first hit shader, everything else by the miss shader.
//! Parallelism is a rayon worker pool over disjoint pixel slots; the caller
//! only ever sees `render` as one blocking call.

use std::sync::Arc;
use std::time::Instant;

use glam::{Vec2, Vec3};
use rayon::prelude::*;
use tracing::debug;

use crate::{
    driver::{DebugMode, Driver, DriverRenderSettings, DriverSetupSettings, Ray, Statistics},
    error::{GlintError, GlintResult},
    jit::{ShaderCtx, ShaderHandle},
    loader::SceneDatabase,
};

pub fn create() -> Box<dyn Driver> {
    Box::new(CpuDriver::default())
}

#[derive(Default)]
pub struct CpuDriver {
    session: Option<Session>,
    stats: Statistics,
}

struct Session {
    database: Arc<SceneDatabase>,
    width: u32,
    height: u32,
    acquire_stats: bool,
    ray_generation: ShaderHandle,
    miss: ShaderHandle,
    hits: Vec<ShaderHandle>,
    /// AOV 0: accumulated RGB, 3 floats per pixel.
    color: Vec<f32>,
}

impl Driver for CpuDriver {
    fn setup(&mut self, settings: DriverSetupSettings) -> GlintResult<()> {
        if settings.framebuffer_width == 0 || settings.framebuffer_height == 0 {
            return Err(GlintError::config(
                "framebuffer dimensions must be non-zero",
            ));
        }
        let pixels = settings.framebuffer_width as usize * settings.framebuffer_height as usize;
        self.session = Some(Session {
            database: settings.database,
            width: settings.framebuffer_width,
            height: settings.framebuffer_height,
            acquire_stats: settings.acquire_stats,
            ray_generation: settings.ray_generation_shader,
            miss: settings.miss_shader,
            hits: settings.hit_shaders,
            color: vec![0.0; 3 * pixels],
        });
        self.stats = Statistics::default();
        debug!(
            width = settings.framebuffer_width,
            height = settings.framebuffer_height,
            "cpu driver ready"
        );
        Ok(())
    }

    fn render(&mut self, settings: &DriverRenderSettings<'_>, iteration: u32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let start = Instant::now();

        let rays_this_call = match settings.rays {
            Some(rays) => {
                session.trace(rays);
                rays.len() as u64
            }
            None => {
                session.render_camera(settings);
                u64::from(settings.width) * u64::from(settings.height) * u64::from(settings.spi)
            }
        };

        if session.acquire_stats {
            self.stats.iterations = iteration + 1;
            self.stats.rays_traced += rays_this_call;
            self.stats.render_time_ms += start.elapsed().as_secs_f64() * 1000.0;
        }
    }

    fn framebuffer(&self, aov: usize) -> Option<&[f32]> {
        match (aov, &self.session) {
            (0, Some(session)) => Some(&session.color),
            _ => None,
        }
    }

    fn clear_framebuffer(&mut self, aov: usize) {
        if aov != 0 {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.color.fill(0.0);
        }
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn shutdown(&mut self) {
        self.session = None;
        debug!("cpu driver shut down");
    }
}

impl Session {
    fn render_camera(&mut self, settings: &DriverRenderSettings<'_>) {
        let width = settings.width.min(self.width) as usize;
        let height = settings.height.min(self.height) as usize;
        let spi = settings.spi.max(1) as f32;
        let debug_mode = settings.debug_mode;
        let fb_width = self.width as usize;

        let database = &self.database;
        let ray_generation = &self.ray_generation;
        let miss = &self.miss;
        let hits = &self.hits;

        self.color
            .par_chunks_mut(3)
            .enumerate()
            .for_each(|(k, slot)| {
                let (x, y) = (k % fb_width, k / fb_width);
                if x >= width || y >= height {
                    return;
                }
                let uv = Vec2::new(
                    (x as f32 + 0.5) / width as f32,
                    (y as f32 + 0.5) / height as f32,
                );

                let sample = match debug_mode {
                    DebugMode::Uv => [uv.x, uv.y, 0.0],
                    DebugMode::Normals => {
                        let dir = pixel_direction(settings, uv);
                        [dir.x.abs(), dir.y.abs(), dir.z.abs()]
                    }
                    DebugMode::Normal => {
                        let ctx =
                            ShaderCtx::without_surface(uv, &database.textures, &database.params);
                        let weight = ray_generation.eval(&ctx);
                        let dir = pixel_direction(settings, uv);
                        let color = match ground_hit(settings.eye, dir, settings.tmin, settings.tmax)
                            .and_then(|p| hits.first().map(|h| (p, h)))
                        {
                            Some((point, hit)) => {
                                let ctx = ShaderCtx {
                                    uv: Vec2::new(point.x.rem_euclid(1.0), point.z.rem_euclid(1.0)),
                                    point,
                                    normal: Vec3::Y,
                                    textures: &database.textures,
                                    params: &database.params,
                                };
                                hit.eval(&ctx)
                            }
                            None => miss.eval(&ctx),
                        };
                        [
                            color[0] * weight[0],
                            color[1] * weight[1],
                            color[2] * weight[2],
                        ]
                    }
                };

                for (dst, s) in slot.iter_mut().zip(sample) {
                    *dst += s * spi;
                }
            });
    }

    fn trace(&mut self, rays: &[Ray]) {
        let count = rays.len().min(self.color.len() / 3);
        let database = &self.database;
        let ray_generation = &self.ray_generation;
        let miss = &self.miss;
        let hits = &self.hits;

        self.color[..3 * count]
            .par_chunks_mut(3)
            .enumerate()
            .for_each(|(k, slot)| {
                let ray = rays[k];
                let dir = ray.direction.normalize_or_zero();
                let uv = direction_uv(dir);
                let ctx = ShaderCtx::without_surface(uv, &database.textures, &database.params);
                let weight = ray_generation.eval(&ctx);
                let color = match ground_hit(ray.origin, dir, ray.tmin, ray.tmax)
                    .and_then(|p| hits.first().map(|h| (p, h)))
                {
                    Some((point, hit)) => {
                        let ctx = ShaderCtx {
                            uv: Vec2::new(point.x.rem_euclid(1.0), point.z.rem_euclid(1.0)),
                            point,
                            normal: Vec3::Y,
                            textures: &database.textures,
                            params: &database.params,
                        };
                        hit.eval(&ctx)
                    }
                    None => miss.eval(&ctx),
                };
                slot[0] = color[0] * weight[0];
                slot[1] = color[1] * weight[1];
                slot[2] = color[2] * weight[2];
            });
    }
}

/// Primary-hit surface for hit shading: an implicit ground plane at `y = 0`.
/// Returns the hit point when a downward ray reaches the plane strictly
/// inside `(tmin, tmax)`; rays starting on the plane never hit it.
fn ground_hit(origin: Vec3, direction: Vec3, tmin: f32, tmax: f32) -> Option<Vec3> {
    if direction.y >= -1e-6 {
        return None;
    }
    let t = -origin.y / direction.y;
    if t <= tmin.max(1e-4) || t >= tmax {
        return None;
    }
    Some(origin + direction * t)
}

/// Camera ray direction for a pixel; `right`/`up` in the settings carry the
/// sensor half-extents.
fn pixel_direction(settings: &DriverRenderSettings<'_>, uv: Vec2) -> Vec3 {
    let px = 2.0 * uv.x - 1.0;
    let py = 1.0 - 2.0 * uv.y;
    (settings.dir + settings.right * px + settings.up * py).normalize_or_zero()
}

/// Equirectangular UV for an arbitrary ray direction (trace mode has no
/// sensor to derive screen coordinates from).
fn direction_uv(dir: Vec3) -> Vec2 {
    let u = dir.z.atan2(dir.x) / (2.0 * std::f32::consts::PI) + 0.5;
    let v = dir.y.clamp(-1.0, 1.0).acos() / std::f32::consts::PI;
    Vec2::new(u, v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit;
    use std::collections::BTreeMap;

    fn handle(source: &str, entry: &str) -> ShaderHandle {
        jit::test_compile(source, entry)
    }

    fn setup_driver(width: u32, height: u32) -> CpuDriver {
        let mut driver = CpuDriver::default();
        driver
            .setup(DriverSetupSettings {
                database: Arc::new(SceneDatabase::default()),
                framebuffer_width: width,
                framebuffer_height: height,
                acquire_stats: true,
                ray_generation_shader: handle(
                    "shader rg { make_color(1.0, 1.0, 1.0) }",
                    "rg",
                ),
                miss_shader: handle("shader m { make_color(0.5, 0.25, 0.125) }", "m"),
                hit_shaders: vec![],
            })
            .unwrap();
        driver
    }

    fn camera_settings() -> DriverRenderSettings<'static> {
        DriverRenderSettings {
            eye: Vec3::ZERO,
            dir: Vec3::Z,
            up: Vec3::Y,
            right: Vec3::X,
            width: 4,
            height: 4,
            tmin: 0.0,
            tmax: 100.0,
            device: 0,
            spi: 2,
            debug_mode: DebugMode::Normal,
            rays: None,
        }
    }

    #[test]
    fn camera_render_accumulates_weighted_samples() {
        let mut driver = setup_driver(4, 4);
        driver.render(&camera_settings(), 0);
        let fb = driver.framebuffer(0).unwrap();
        // One iteration at spi=2 of a constant miss shader.
        assert!((fb[0] - 1.0).abs() < 1e-6);
        assert!((fb[1] - 0.5).abs() < 1e-6);

        driver.render(&camera_settings(), 1);
        let fb = driver.framebuffer(0).unwrap();
        assert!((fb[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn clear_resets_accumulation() {
        let mut driver = setup_driver(4, 4);
        driver.render(&camera_settings(), 0);
        driver.clear_framebuffer(0);
        assert!(driver.framebuffer(0).unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn trace_writes_one_color_per_ray() {
        let mut driver = setup_driver(8, 1);
        let rays: Vec<Ray> = (0..5).map(|_| Ray::new(Vec3::ZERO, Vec3::Z)).collect();
        let settings = DriverRenderSettings {
            width: rays.len() as u32,
            height: 1,
            rays: Some(&rays),
            ..camera_settings()
        };
        driver.render(&settings, 0);
        let fb = driver.framebuffer(0).unwrap();
        for k in 0..5 {
            assert!((fb[3 * k] - 0.5).abs() < 1e-6);
        }
        // Pixels beyond the ray count stay untouched.
        assert_eq!(fb[3 * 5], 0.0);
    }

    fn setup_driver_with_hit(width: u32, height: u32) -> CpuDriver {
        let mut driver = CpuDriver::default();
        driver
            .setup(DriverSetupSettings {
                database: Arc::new(SceneDatabase::default()),
                framebuffer_width: width,
                framebuffer_height: height,
                acquire_stats: false,
                ray_generation_shader: handle(
                    "shader rg { make_color(1.0, 1.0, 1.0) }",
                    "rg",
                ),
                miss_shader: handle("shader m { make_color(0.5, 0.25, 0.125) }", "m"),
                hit_shaders: vec![handle("shader h { make_color(0.2, 0.3, 0.4) }", "h")],
            })
            .unwrap();
        driver
    }

    #[test]
    fn downward_camera_rays_shade_the_hit_shader() {
        let mut driver = setup_driver_with_hit(2, 2);
        let settings = DriverRenderSettings {
            eye: Vec3::new(0.0, 1.0, 0.0),
            dir: Vec3::NEG_Y,
            up: Vec3::Z * 0.1,
            right: Vec3::X * 0.1,
            width: 2,
            height: 2,
            spi: 1,
            ..camera_settings()
        };
        driver.render(&settings, 0);
        let fb = driver.framebuffer(0).unwrap();
        for pixel in fb.chunks(3) {
            assert!((pixel[0] - 0.2).abs() < 1e-6);
            assert!((pixel[1] - 0.3).abs() < 1e-6);
            assert!((pixel[2] - 0.4).abs() < 1e-6);
        }
    }

    #[test]
    fn traced_rays_split_between_hit_and_miss() {
        let mut driver = setup_driver_with_hit(2, 1);
        let rays = [
            Ray::new(Vec3::new(0.0, 2.0, 0.0), Vec3::NEG_Y),
            Ray::new(Vec3::new(0.0, 2.0, 0.0), Vec3::Y),
        ];
        let settings = DriverRenderSettings {
            width: 2,
            height: 1,
            rays: Some(&rays),
            ..camera_settings()
        };
        driver.render(&settings, 0);
        let fb = driver.framebuffer(0).unwrap();
        assert!((fb[0] - 0.2).abs() < 1e-6);
        assert!((fb[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn statistics_track_rays_and_iterations() {
        let mut driver = setup_driver(4, 4);
        driver.render(&camera_settings(), 0);
        driver.render(&camera_settings(), 1);
        let stats = driver.statistics();
        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.rays_traced, 2 * 4 * 4 * 2);
    }

    #[test]
    fn framebuffer_is_unbound_before_setup_and_for_unknown_aovs() {
        let driver = CpuDriver::default();
        assert!(driver.framebuffer(0).is_none());
        let driver = setup_driver(2, 2);
        assert!(driver.framebuffer(1).is_none());
    }

    #[test]
    fn uv_debug_mode_bypasses_shading() {
        let mut driver = setup_driver(2, 2);
        let settings = DriverRenderSettings {
            width: 2,
            height: 2,
            spi: 1,
            debug_mode: DebugMode::Uv,
            ..camera_settings()
        };
        driver.render(&settings, 0);
        let fb = driver.framebuffer(0).unwrap();
        assert!((fb[0] - 0.25).abs() < 1e-6);
        assert!((fb[1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn textures_flow_from_database_to_shading() {
        let mut tex = crate::image::Image::new(1, 1);
        tex.pixels = vec![0.0, 1.0, 0.0, 1.0];
        let mut textures = BTreeMap::new();
        textures.insert("grass".to_string(), tex);
        let database = SceneDatabase {
            textures,
            ..Default::default()
        };

        let mut driver = CpuDriver::default();
        driver
            .setup(DriverSetupSettings {
                database: Arc::new(database),
                framebuffer_width: 2,
                framebuffer_height: 2,
                acquire_stats: false,
                ray_generation_shader: handle(
                    "shader rg { make_color(1.0, 1.0, 1.0) }",
                    "rg",
                ),
                miss_shader: handle("shader m { tex_lookup(\"grass\", uv) }", "m"),
                hit_shaders: vec![],
            })
            .unwrap();
        let settings = DriverRenderSettings {
            width: 2,
            height: 2,
            spi: 1,
            ..camera_settings()
        };
        driver.render(&settings, 0);
        let fb = driver.framebuffer(0).unwrap();
        assert_eq!(&fb[0..3], &[0.0, 1.0, 0.0]);
    }
}
