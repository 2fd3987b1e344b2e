//! Scene description object model.
//!
//! The runtime only needs a thin view of the scene: a technique, a film and
//! a camera (each a named entity with a property bag), the background
//! expression, material entities and texture declarations. Properties are
//! JSON values read through typed accessors with defaults.

use std::collections::BTreeMap;
use std::path::Path;

use glam::{Mat4, Vec2, Vec3};

use crate::error::{GlintError, GlintResult};

/// One scene object: a plugin type plus a property bag.
#[derive(Clone, Debug, Default)]
pub struct SceneEntity {
    pub plugin_type: String,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl SceneEntity {
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn number_or(&self, key: &str, default: f32) -> f32 {
        self.property(key)
            .and_then(serde_json::Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.property(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(default)
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.property(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn vector2_or(&self, key: &str, default: Vec2) -> Vec2 {
        match self.numbers(key) {
            Some(v) if v.len() == 2 => Vec2::new(v[0], v[1]),
            _ => default,
        }
    }

    pub fn vector3_or(&self, key: &str, default: Vec3) -> Vec3 {
        match self.numbers(key) {
            Some(v) if v.len() == 3 => Vec3::new(v[0], v[1], v[2]),
            _ => default,
        }
    }

    /// A 16-float row-major array; identity when absent or malformed.
    pub fn transform_or_identity(&self, key: &str) -> Mat4 {
        match self.numbers(key) {
            Some(v) if v.len() == 16 => {
                let mut arr = [0.0f32; 16];
                arr.copy_from_slice(&v);
                Mat4::from_cols_array(&arr).transpose()
            }
            _ => Mat4::IDENTITY,
        }
    }

    fn numbers(&self, key: &str) -> Option<Vec<f32>> {
        let arr = self.property(key)?.as_array()?;
        arr.iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<_>>>()
    }
}

/// Texture declaration baked into the scene database at load time.
#[derive(Clone, Debug)]
pub struct TextureDecl {
    pub name: String,
    pub path: String,
}

/// Scene-wide custom variables, grouped by type. Loaders register the names
/// with the transpiler and hand the values to the driver's parameter table.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct SceneParameters {
    pub bools: BTreeMap<String, bool>,
    pub numbers: BTreeMap<String, f32>,
    pub vectors: BTreeMap<String, [f32; 3]>,
    pub colors: BTreeMap<String, [f32; 3]>,
}

#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub technique: Option<SceneEntity>,
    pub camera: Option<SceneEntity>,
    pub film: Option<SceneEntity>,
    /// Shading expression for rays that leave the scene.
    pub background: Option<String>,
    /// Material entities in declaration order; each carries a `name` and an
    /// `albedo` expression.
    pub materials: Vec<SceneEntity>,
    pub textures: Vec<TextureDecl>,
    pub parameters: SceneParameters,
}

impl Scene {
    pub fn from_file(path: impl AsRef<Path>) -> GlintResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GlintError::load(path, format!("cannot read scene file: {e}")))?;
        Self::from_json_str(&text)
            .map_err(|e| GlintError::load(path, format!("cannot parse scene: {e}")))
    }

    pub fn from_json_str(text: &str) -> GlintResult<Self> {
        let root: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| GlintError::config(format!("invalid JSON: {e}")))?;
        let obj = root
            .as_object()
            .ok_or_else(|| GlintError::config("scene root must be an object"))?;

        let entity = |key: &str| -> GlintResult<Option<SceneEntity>> {
            match obj.get(key) {
                None => Ok(None),
                Some(v) => parse_entity(v)
                    .map(Some)
                    .map_err(|e| GlintError::config(format!("{key}: {e}"))),
            }
        };

        let mut materials = Vec::new();
        if let Some(list) = obj.get("materials") {
            let list = list
                .as_array()
                .ok_or_else(|| GlintError::config("materials must be an array"))?;
            for (i, v) in list.iter().enumerate() {
                materials.push(
                    parse_entity(v)
                        .map_err(|e| GlintError::config(format!("materials[{i}]: {e}")))?,
                );
            }
        }

        let mut textures = Vec::new();
        if let Some(list) = obj.get("textures") {
            let list = list
                .as_array()
                .ok_or_else(|| GlintError::config("textures must be an array"))?;
            for (i, v) in list.iter().enumerate() {
                let tex = parse_entity(v)
                    .map_err(|e| GlintError::config(format!("textures[{i}]: {e}")))?;
                let name = tex.string_or("name", "");
                let path = tex.string_or("path", "");
                if name.is_empty() || path.is_empty() {
                    return Err(GlintError::config(format!(
                        "textures[{i}] needs both 'name' and 'path'"
                    )));
                }
                textures.push(TextureDecl { name, path });
            }
        }

        let parameters = match obj.get("parameters") {
            None => SceneParameters::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| GlintError::config(format!("parameters: {e}")))?,
        };

        Ok(Scene {
            technique: entity("technique")?,
            camera: entity("camera")?,
            film: entity("film")?,
            background: obj
                .get("background")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            materials,
            textures,
            parameters,
        })
    }
}

fn parse_entity(value: &serde_json::Value) -> Result<SceneEntity, String> {
    let obj = value.as_object().ok_or("entity must be an object")?;
    let mut entity = SceneEntity::default();
    for (k, v) in obj {
        if k == "type" {
            entity.plugin_type = v.as_str().ok_or("'type' must be a string")?.to_string();
        } else {
            entity.properties.insert(k.clone(), v.clone());
        }
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = r#"{
        "technique": { "type": "path", "max_depth": 4 },
        "camera": {
            "type": "perspective",
            "fov": 45,
            "near_clip": 0.5,
            "far_clip": 80,
            "transform": [1,0,0,3, 0,1,0,2, 0,0,1,1, 0,0,0,1]
        },
        "film": { "size": [128, 96] },
        "background": "color(0.1, 0.2, 0.3)",
        "materials": [ { "type": "diffuse", "name": "wall", "albedo": "tex(\"brick\")" } ],
        "textures": [ { "name": "brick", "path": "brick.png" } ],
        "parameters": { "numbers": { "brightness": 1.5 } }
    }"#;

    #[test]
    fn parses_top_level_entities() {
        let scene = Scene::from_json_str(SCENE).unwrap();
        assert_eq!(scene.technique.as_ref().unwrap().plugin_type, "path");
        assert_eq!(scene.camera.as_ref().unwrap().plugin_type, "perspective");
        assert_eq!(
            scene.film.as_ref().unwrap().vector2_or("size", Vec2::ZERO),
            Vec2::new(128.0, 96.0)
        );
        assert_eq!(scene.background.as_deref(), Some("color(0.1, 0.2, 0.3)"));
        assert_eq!(scene.materials.len(), 1);
        assert_eq!(scene.textures[0].name, "brick");
        assert_eq!(scene.parameters.numbers["brightness"], 1.5);
    }

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let scene = Scene::from_json_str(SCENE).unwrap();
        let cam = scene.camera.unwrap();
        assert_eq!(cam.number_or("fov", 60.0), 45.0);
        assert_eq!(cam.number_or("missing", 60.0), 60.0);
        assert!(cam.bool_or("missing", true));
        assert_eq!(cam.string_or("missing", "x"), "x");
    }

    #[test]
    fn row_major_transform_places_translation_in_last_column() {
        let scene = Scene::from_json_str(SCENE).unwrap();
        let m = scene.camera.unwrap().transform_or_identity("transform");
        let eye = m.transform_point3(Vec3::ZERO);
        assert_eq!(eye, Vec3::new(3.0, 2.0, 1.0));
    }

    #[test]
    fn missing_file_and_bad_json_are_load_errors() {
        assert!(Scene::from_file("/nonexistent/scene.json").is_err());
        assert!(Scene::from_json_str("not json").is_err());
        assert!(Scene::from_json_str("[]").is_err());
    }

    #[test]
    fn texture_declarations_require_name_and_path() {
        let err = Scene::from_json_str(r#"{ "textures": [ { "name": "x" } ] }"#).unwrap_err();
        assert!(err.to_string().contains("textures[0]"));
    }
}
