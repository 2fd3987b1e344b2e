//! End-to-end camera render sessions on the built-in CPU driver.

use std::path::PathBuf;

use glint::{Runtime, RuntimeOptions};

// Capture the runtime's log output so failing tests show it; level via
// RUST_LOG.
fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn write_scene(name: &str, contents: &str) -> PathBuf {
    init_logging();
    let path = std::env::temp_dir().join(format!(
        "glint_lifecycle_{}_{name}.json",
        std::process::id()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

fn camera_scene() -> &'static str {
    r#"{
        "technique": { "type": "path" },
        "camera": { "type": "perspective", "fov": 45, "near_clip": 0.1, "far_clip": 100 },
        "film": { "size": [64, 64] },
        "background": "color(0.25, 0.5, 0.75)",
        "materials": [
            { "type": "diffuse", "name": "ground", "albedo": "color(0.8, 0.8, 0.8)" }
        ]
    }"#
}

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-4,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn progressive_render_accumulates_per_iteration() {
    let path = write_scene("progressive", camera_scene());
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    rt.setup(64, 64).unwrap();

    let camera = rt.scene_camera();
    rt.step(&camera);
    rt.step(&camera);
    assert_eq!(rt.iteration(), 2);

    let fb = rt.framebuffer(0).unwrap();
    assert_eq!(fb.len(), 3 * 64 * 64);

    // Every ray misses, so each iteration adds background * spi.
    let weight = 2.0 * rt.samples_per_iteration() as f32;
    assert_close(fb[0], 0.25 * weight);
    assert_close(fb[1], 0.5 * weight);
    assert_close(fb[2], 0.75 * weight);

    rt.shutdown();
}

#[test]
fn clear_framebuffer_resets_the_accumulator() {
    let path = write_scene("clear", camera_scene());
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    rt.setup(32, 32).unwrap();

    let camera = rt.scene_camera();
    rt.step(&camera);
    assert!(rt.framebuffer(0).unwrap().iter().any(|v| *v != 0.0));

    rt.clear_framebuffer(0);
    assert!(rt.framebuffer(0).unwrap().iter().all(|v| *v == 0.0));
}

#[test]
fn statistics_are_gated_on_the_acquisition_flag() {
    let path = write_scene("stats_off", camera_scene());
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    rt.setup(16, 16).unwrap();
    let camera = rt.scene_camera();
    rt.step(&camera);
    assert!(rt.statistics().is_none());

    let path = write_scene("stats_on", camera_scene());
    let mut rt = Runtime::new(
        &path,
        RuntimeOptions {
            acquire_stats: true,
            ..Default::default()
        },
    )
    .unwrap();
    rt.setup(16, 16).unwrap();
    let camera = rt.scene_camera();
    rt.step(&camera);

    let stats = rt.statistics().unwrap();
    assert_eq!(stats.iterations, 1);
    assert_eq!(
        stats.rays_traced,
        16 * 16 * u64::from(rt.samples_per_iteration())
    );
}

#[test]
fn zero_framebuffer_dimensions_are_clamped_to_one() {
    let path = write_scene("clamp", camera_scene());
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    rt.setup(0, 0).unwrap();
    assert_eq!(rt.framebuffer(0).unwrap().len(), 3);
}

#[test]
fn debug_technique_renders_pixel_coordinates() {
    let path = write_scene("debug", camera_scene());
    let mut rt = Runtime::new(
        &path,
        RuntimeOptions {
            override_technique: Some("debug".to_string()),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(rt.is_debug_session());
    rt.setup(4, 4).unwrap();

    let camera = rt.scene_camera();
    rt.step(&camera);

    let fb = rt.framebuffer(0).unwrap();
    let spi = rt.samples_per_iteration() as f32;
    // First pixel of a 4x4 film sits at uv (0.125, 0.125).
    assert_close(fb[0], 0.125 * spi);
    assert_close(fb[1], 0.125 * spi);
    assert_close(fb[2], 0.0);
}

#[test]
fn sparse_scene_resolves_to_the_documented_defaults() {
    let path = write_scene(
        "sparse",
        r#"{
            "camera": { "type": "perspective", "near_clip": 10, "far_clip": 1 },
            "film": { "size": [64, 64] }
        }"#,
    );
    let rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();

    assert_eq!(rt.technique_type(), "path");
    assert_eq!(rt.camera_type(), "perspective");
    let s = rt.loaded_render_settings();
    assert_eq!((s.film_width, s.film_height), (64, 64));
    assert_eq!((s.tmin, s.tmax), (1.0, 10.0));
}

#[test]
fn framebuffer_is_unavailable_before_setup() {
    let path = write_scene("uninit", camera_scene());
    let rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    assert!(rt.framebuffer(0).is_none());
}
