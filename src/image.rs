//! Float RGBA image storage with the pixel kernels the runtime's
//! collaborators need: gamma transforms, vertical flip and packing, each
//! parallelized over the flat pixel range (disjoint slots per partition),
//! plus raster load and layered-HDR save.

use std::path::Path;

use exr::prelude::{
    AttributeValue, Encoding, Layer, LayerAttributes, SpecificChannels, Text, WritableImage,
    read_first_rgba_layer_from_file,
};
use glam::{Vec2, Vec3};
use rayon::prelude::*;

use crate::error::{GlintError, GlintResult};

#[derive(Clone, Debug, Default)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// Interleaved RGBA, `4 * width * height` floats.
    pub pixels: Vec<f32>,
}

/// Render-session info carried as custom attributes in layered-HDR headers,
/// so saved frames are self-describing. Every field is optional; absent
/// attributes stay `None` on load.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageMetadata {
    pub camera_type: Option<String>,
    pub technique_type: Option<String>,
    pub camera_eye: Option<Vec3>,
    pub camera_up: Option<Vec3>,
    pub camera_dir: Option<Vec3>,
    pub samples_per_pixel: Option<u32>,
}

fn srgb_gamma(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn srgb_invgamma(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0.0; 4 * width as usize * height as usize],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.pixels.len() == 4 * self.width as usize * self.height as usize
    }

    /// Gamma-correct the color channels in place. `srgb` selects the exact
    /// sRGB curve, otherwise a plain 2.2 power curve; `inverse` goes from
    /// display space back to linear.
    pub fn apply_gamma_correction(&mut self, inverse: bool, srgb: bool) {
        debug_assert!(self.is_valid());

        let f: fn(f32) -> f32 = match (inverse, srgb) {
            (false, true) => srgb_gamma,
            (true, true) => srgb_invgamma,
            (false, false) => |c| c.powf(1.0 / 2.2),
            (true, false) => |c| c.powf(2.2),
        };

        self.pixels.par_chunks_mut(4).for_each(|pix| {
            for c in &mut pix[..3] {
                *c = f(*c);
            }
        });
    }

    pub fn flip_y(&mut self) {
        let stride = 4 * self.width as usize;
        let height = self.height as usize;
        for y in 0..height / 2 {
            let (top, rest) = self.pixels.split_at_mut((height - y - 1) * stride);
            top[y * stride..y * stride + stride].swap_with_slice(&mut rest[..stride]);
        }
    }

    /// Convert to packed 8-bit RGBA words.
    pub fn to_packed(&self) -> Vec<u32> {
        let mut out = vec![0u32; self.width as usize * self.height as usize];
        out.par_iter_mut().enumerate().for_each(|(k, dst)| {
            let pix = &self.pixels[4 * k..4 * k + 4];
            let b = |c: f32| (c.clamp(0.0, 1.0) * 255.0) as u32;
            *dst = b(pix[0]) | (b(pix[1]) << 8) | (b(pix[2]) << 16) | (b(pix[3]) << 24);
        });
        out
    }

    /// Nearest-neighbor sample with wrap-around addressing, color channels
    /// only.
    pub fn sample(&self, uv: Vec2) -> [f32; 3] {
        if !self.is_valid() {
            return [0.0; 3];
        }
        let x = (uv.x.rem_euclid(1.0) * self.width as f32) as usize % self.width as usize;
        let y = (uv.y.rem_euclid(1.0) * self.height as f32) as usize % self.height as usize;
        let k = 4 * (y * self.width as usize + x);
        [self.pixels[k], self.pixels[k + 1], self.pixels[k + 2]]
    }

    /// Load from any supported raster format. LDR sources are returned as
    /// stored (display space); callers wanting linear light apply the
    /// inverse gamma correction.
    pub fn load(path: impl AsRef<Path>) -> GlintResult<Self> {
        Ok(Self::load_with_metadata(path)?.0)
    }

    /// Like [`load`](Self::load), additionally reading the session metadata
    /// from the header of layered-HDR input. Other formats carry no header
    /// attributes and yield default metadata.
    pub fn load_with_metadata(path: impl AsRef<Path>) -> GlintResult<(Self, ImageMetadata)> {
        let path = path.as_ref();
        if is_exr(path) {
            return load_exr(path);
        }
        let img = image::open(path)
            .map_err(|e| GlintError::load(path, format!("failed to decode image: {e}")))?;
        let buf = img.into_rgba32f();
        Ok((
            Self {
                width: buf.width(),
                height: buf.height(),
                pixels: buf.into_raw(),
            },
            ImageMetadata::default(),
        ))
    }

    /// Persist as layered HDR (OpenEXR). Only this format is accepted for
    /// save.
    pub fn save(&self, path: impl AsRef<Path>) -> GlintResult<()> {
        self.save_with_metadata(path, &ImageMetadata::default())
    }

    /// Persist as layered HDR with the session metadata written into the
    /// header's custom attributes.
    pub fn save_with_metadata(
        &self,
        path: impl AsRef<Path>,
        metadata: &ImageMetadata,
    ) -> GlintResult<()> {
        let path = path.as_ref();
        if !is_exr(path) {
            return Err(GlintError::load(
                path,
                "only the .exr layered format is supported for save",
            ));
        }
        debug_assert!(self.is_valid());

        let width = self.width as usize;
        let pixels = &self.pixels;
        let channels = SpecificChannels::rgba(|pos: exr::math::Vec2<usize>| {
            let k = 4 * (pos.1 * width + pos.0);
            (pixels[k], pixels[k + 1], pixels[k + 2], pixels[k + 3])
        });
        let layer = Layer::new(
            (width, self.height as usize),
            LayerAttributes::default(),
            Encoding::SMALL_LOSSLESS,
            channels,
        );
        let mut file = exr::prelude::Image::from_layer(layer);
        write_attributes(&mut file.attributes.other, metadata);
        file.write()
            .to_file(path)
            .map_err(|e| GlintError::load(path, format!("failed to encode EXR: {e}")))
    }
}

fn is_exr(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("exr")
}

fn load_exr(path: &Path) -> GlintResult<(Image, ImageMetadata)> {
    let decoded = read_first_rgba_layer_from_file(
        path,
        |size, _channels| Image::new(size.0 as u32, size.1 as u32),
        |img: &mut Image, pos, (r, g, b, a): (f32, f32, f32, f32)| {
            let k = 4 * (pos.1 * img.width as usize + pos.0);
            img.pixels[k] = r;
            img.pixels[k + 1] = g;
            img.pixels[k + 2] = b;
            img.pixels[k + 3] = a;
        },
    )
    .map_err(|e| GlintError::load(path, format!("failed to decode EXR: {e}")))?;

    let mut metadata = ImageMetadata::default();
    for (name, value) in &decoded.attributes.other {
        match (name.to_string().as_str(), value) {
            ("igCameraType", AttributeValue::Text(t)) => {
                metadata.camera_type = Some(t.to_string());
            }
            ("igTechniqueType", AttributeValue::Text(t)) => {
                metadata.technique_type = Some(t.to_string());
            }
            ("igCameraEye", AttributeValue::FloatVec3((x, y, z))) => {
                metadata.camera_eye = Some(Vec3::new(*x, *y, *z));
            }
            ("igCameraUp", AttributeValue::FloatVec3((x, y, z))) => {
                metadata.camera_up = Some(Vec3::new(*x, *y, *z));
            }
            ("igCameraDir", AttributeValue::FloatVec3((x, y, z))) => {
                metadata.camera_dir = Some(Vec3::new(*x, *y, *z));
            }
            ("igSPP", AttributeValue::I32(v)) => {
                metadata.samples_per_pixel = Some(*v as u32);
            }
            _ => {}
        }
    }
    Ok((decoded.layer_data.channel_data.pixels, metadata))
}

fn write_attributes(
    attributes: &mut std::collections::HashMap<Text, AttributeValue>,
    metadata: &ImageMetadata,
) {
    if let Some(v) = &metadata.camera_type {
        attributes.insert(
            Text::from("igCameraType"),
            AttributeValue::Text(Text::from(v.as_str())),
        );
    }
    if let Some(v) = &metadata.technique_type {
        attributes.insert(
            Text::from("igTechniqueType"),
            AttributeValue::Text(Text::from(v.as_str())),
        );
    }
    for (name, vec) in [
        ("igCameraEye", metadata.camera_eye),
        ("igCameraUp", metadata.camera_up),
        ("igCameraDir", metadata.camera_dir),
    ] {
        if let Some(v) = vec {
            attributes.insert(Text::from(name), AttributeValue::FloatVec3((v.x, v.y, v.z)));
        }
    }
    if let Some(v) = metadata.samples_per_pixel {
        attributes.insert(Text::from("igSPP"), AttributeValue::I32(v as i32));
    }
}
