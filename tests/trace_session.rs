//! Explicit ray-stream sessions (camera type "list") on the CPU driver.

use std::path::PathBuf;

use glam::Vec3;
use glint::{Ray, Runtime, RuntimeOptions};

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
    let path = std::env::temp_dir().join(format!("glint_trace_{}_{name}.json", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

fn trace_scene() -> &'static str {
    r#"{
        "camera": { "type": "list" },
        "background": "color(0.25, 0.5, 0.75)"
    }"#
}

fn rays(n: usize) -> Vec<Ray> {
    (0..n)
        .map(|i| Ray::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0 + i as f32)))
        .collect()
}

#[test]
fn trace_yields_three_floats_per_ray() {
    let path = write_scene("shape", trace_scene());
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    assert!(rt.is_trace_session());
    rt.setup(16, 1).unwrap();

    let mut data = Vec::new();
    rt.trace(&rays(10), &mut data);

    assert_eq!(data.len(), 30);
    assert_eq!(rt.iteration(), 1);

    // Constant background, so every ray reports the same miss color.
    for chunk in data.chunks(3) {
        assert!((chunk[0] - 0.25).abs() < 1e-4);
        assert!((chunk[1] - 0.5).abs() < 1e-4);
        assert!((chunk[2] - 0.75).abs() < 1e-4);
    }
}

#[test]
fn trace_overwrites_instead_of_accumulating() {
    let path = write_scene("overwrite", trace_scene());
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    rt.setup(8, 1).unwrap();

    let mut first = Vec::new();
    rt.trace(&rays(4), &mut first);
    let mut second = Vec::new();
    rt.trace(&rays(4), &mut second);

    assert_eq!(first, second);
    assert_eq!(rt.iteration(), 2);
}

#[test]
fn step_is_rejected_in_a_trace_session() {
    let path = write_scene("step", trace_scene());
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    rt.setup(8, 1).unwrap();

    let before: Vec<f32> = rt.framebuffer(0).unwrap().to_vec();
    let camera = rt.scene_camera();
    rt.step(&camera);

    assert_eq!(rt.iteration(), 0);
    assert_eq!(rt.framebuffer(0).unwrap(), &before[..]);
}

#[test]
fn overflow_rays_come_back_zeroed() {
    let path = write_scene("overflow", trace_scene());
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    rt.setup(4, 1).unwrap();

    let mut data = Vec::new();
    rt.trace(&rays(6), &mut data);

    assert_eq!(data.len(), 18);
    for chunk in data[..12].chunks(3) {
        assert!((chunk[0] - 0.25).abs() < 1e-4);
    }
    assert!(data[12..].iter().all(|v| *v == 0.0));
}

#[test]
fn rays_reaching_a_surface_shade_the_material() {
    let path = write_scene(
        "surface",
        r#"{
            "camera": { "type": "list" },
            "background": "color(0.25, 0.5, 0.75)",
            "materials": [
                { "type": "diffuse", "name": "floor", "albedo": "color(0.2, 0.3, 0.4)" }
            ]
        }"#,
    );
    let mut rt = Runtime::new(&path, RuntimeOptions::default()).unwrap();
    rt.setup(4, 1).unwrap();

    let mut data = Vec::new();
    rt.trace(
        &[
            Ray::new(Vec3::new(0.0, 2.0, 0.0), Vec3::NEG_Y),
            Ray::new(Vec3::new(0.0, 2.0, 0.0), Vec3::Y),
        ],
        &mut data,
    );

    assert!((data[0] - 0.2).abs() < 1e-4);
    assert!((data[3] - 0.25).abs() < 1e-4);
}

#[test]
fn trace_counts_rays_in_statistics() {
    let path = write_scene("stats", trace_scene());
    let mut rt = Runtime::new(
        &path,
        RuntimeOptions {
            acquire_stats: true,
            ..Default::default()
        },
    )
    .unwrap();
    rt.setup(16, 1).unwrap();

    let mut data = Vec::new();
    rt.trace(&rays(10), &mut data);
    rt.trace(&rays(6), &mut data);

    let stats = rt.statistics().unwrap();
    assert_eq!(stats.rays_traced, 16);
    assert_eq!(stats.iterations, 2);
}
