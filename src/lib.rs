//! Glint is the runtime orchestration core of an offline ray tracer.
//!
//! Glint turns a scene description (JSON) into pixels through a small,
//! explicit pipeline handled by [`Runtime`]:
//!
//! 1. **Resolve**: pick a hardware [`Target`] (CPU vector width or GPU
//!    vendor) from the installed driver modules, with in-class fallback.
//! 2. **Load**: parse the scene and transpile its material expressions into
//!    shader source (generation is deterministic for a given scene).
//! 3. **Compile**: JIT the generated source against the resolved driver
//!    module; the JIT is initialized once per process.
//! 4. **Render**: drive the [`Driver`] through `setup`/`step` (progressive
//!    camera rendering) or `trace` (explicit ray streams).
//!
//! Drivers are either built in (CPU, feature-detected at startup) or
//! discovered as shared modules exposing a [`DriverDeclaration`].
//!
//! `unsafe` is confined to shared-module symbol resolution and the denormal
//! control word; everything above the driver boundary is safe code.

mod camera;
mod driver;
mod drivers;
mod error;
mod image;
mod jit;
mod library;
mod loader;
mod manager;
mod runtime;
mod scene;
mod target;
mod transpiler;

pub use camera::Camera;
pub use driver::{
    DebugMode, Driver, DriverFactory, DriverRenderSettings, DriverSetupSettings, Ray, Statistics,
};
pub use error::{GlintError, GlintResult};
pub use image::{Image, ImageMetadata};
pub use jit::{ShaderCtx, ShaderHandle, ShaderParams, compile_source, init_jit};
pub use library::{
    DRIVER_DECL_SYMBOL, DriverDeclaration, GLINT_DRIVER_ABI_VERSION, SharedLibrary,
    module_extension,
};
pub use loader::{LoaderOptions, LoaderResult, SceneDatabase, load};
pub use manager::DriverManager;
pub use runtime::{LoadedRenderSettings, Runtime, RuntimeOptions};
pub use scene::{Scene, SceneEntity, SceneParameters, TextureDecl};
pub use target::Target;
pub use transpiler::{TranspileResult, Transpiler};
