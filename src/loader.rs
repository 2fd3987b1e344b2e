//! Drives a parsed scene into the runtime's form: a baked [`SceneDatabase`]
//! plus the three categories of generated shader source the JIT consumes
//! (ray generation, miss, one hit shader per material).

use std::collections::BTreeMap;
use std::path::PathBuf;

use glam::Vec3;
use tracing::debug;

use crate::{
    error::{GlintError, GlintResult},
    image::Image,
    jit::ShaderParams,
    scene::Scene,
    target::Target,
    transpiler::Transpiler,
};

pub const DEFAULT_BACKGROUND_EXPR: &str = "color(0.0, 0.0, 0.0)";
pub const DEFAULT_ALBEDO_EXPR: &str = "color(0.8, 0.8, 0.8)";

#[derive(Clone, Debug)]
pub struct LoaderOptions {
    /// Scene file location; texture paths resolve relative to its directory.
    pub file_path: PathBuf,
    pub target: Target,
    pub technique_type: String,
    pub camera_type: String,
    pub samples_per_iteration: u32,
    pub scene: Scene,
}

/// Baked, read-only scene data handed to the driver once at setup.
#[derive(Debug, Default)]
pub struct SceneDatabase {
    /// Texture bindings actually referenced by the generated shaders.
    pub textures: BTreeMap<String, Image>,
    pub params: ShaderParams,
    pub material_names: Vec<String>,
}

#[derive(Debug)]
pub struct LoaderResult {
    pub database: SceneDatabase,
    pub ray_generation_shader: String,
    pub miss_shader: String,
    pub hit_shaders: Vec<String>,
}

pub fn load(opts: &LoaderOptions) -> GlintResult<LoaderResult> {
    let scene = &opts.scene;

    let mut transpiler = Transpiler::new();
    for name in scene.parameters.bools.keys() {
        transpiler.register_custom_bool(name);
    }
    for name in scene.parameters.numbers.keys() {
        transpiler.register_custom_number(name);
    }
    for name in scene.parameters.vectors.keys() {
        transpiler.register_custom_vector(name);
    }
    for name in scene.parameters.colors.keys() {
        transpiler.register_custom_color(name);
    }

    let mut referenced_textures = std::collections::BTreeSet::new();

    // Miss shader: the background expression, evaluated without surface
    // info. The UV access resolves to the ray's screen coordinates.
    let background = scene
        .background
        .as_deref()
        .unwrap_or(DEFAULT_BACKGROUND_EXPR);
    let miss = transpiler
        .transpile(background, "uv", false)
        .map_err(|e| GlintError::expression(format!("background expression: {e}")))?;
    referenced_textures.extend(miss.textures.iter().cloned());
    let miss_shader = format!(
        "shader miss_shader {{\n    {}\n}}\n",
        as_color_fragment(&miss.expr, miss.scalar_output)
    );

    // Hit shaders: one per material, surface info available.
    let mut hit_shaders = Vec::with_capacity(scene.materials.len());
    let mut material_names = Vec::with_capacity(scene.materials.len());
    for (index, material) in scene.materials.iter().enumerate() {
        let name = material.string_or("name", &format!("material{index}"));
        let albedo = material.string_or("albedo", DEFAULT_ALBEDO_EXPR);
        let hit = transpiler.transpile(&albedo, "uv", true).map_err(|e| {
            GlintError::expression(format!("material '{name}' albedo expression: {e}"))
        })?;
        referenced_textures.extend(hit.textures.iter().cloned());
        hit_shaders.push(format!(
            "shader hit_shader {{\n    {}\n}}\n",
            as_color_fragment(&hit.expr, hit.scalar_output)
        ));
        material_names.push(name);
    }

    // Ray generation shader: the per-camera initial throughput weight. The
    // camera basis itself travels through the render settings, not the
    // shader.
    let ray_generation_shader =
        "shader ray_generation_shader {\n    make_color(1.0, 1.0, 1.0)\n}\n".to_string();

    // Bind exactly the referenced textures.
    let declared: BTreeMap<&str, &str> = scene
        .textures
        .iter()
        .map(|t| (t.name.as_str(), t.path.as_str()))
        .collect();
    let base_dir = opts
        .file_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();

    let mut textures = BTreeMap::new();
    for name in &referenced_textures {
        let Some(rel) = declared.get(name.as_str()) else {
            return Err(GlintError::config(format!(
                "shading expressions reference undeclared texture '{name}'"
            )));
        };
        let path = base_dir.join(rel);
        let mut img = Image::load(&path)?;
        if path.extension().and_then(|e| e.to_str()) != Some("exr") {
            img.apply_gamma_correction(true, true);
        }
        textures.insert(name.clone(), img);
    }
    debug!(
        textures = textures.len(),
        materials = material_names.len(),
        "scene database baked"
    );

    let params = ShaderParams {
        bools: scene.parameters.bools.clone(),
        numbers: scene.parameters.numbers.clone(),
        vectors: scene
            .parameters
            .vectors
            .iter()
            .map(|(k, v)| (k.clone(), Vec3::from_array(*v)))
            .collect(),
        colors: scene.parameters.colors.clone(),
    };

    Ok(LoaderResult {
        database: SceneDatabase {
            textures,
            params,
            material_names,
        },
        ray_generation_shader,
        miss_shader,
        hit_shaders,
    })
}

fn as_color_fragment(expr: &str, scalar_output: bool) -> String {
    if scalar_output {
        format!("color_splat({expr})")
    } else {
        expr.to_string()
    }
}
