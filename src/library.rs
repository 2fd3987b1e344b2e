//! Shared-module loading for externally built backend drivers.
//!
//! A driver module is a dynamic library (`.so`/`.dylib`/`.dll`) exporting a
//! [`DriverDeclaration`] under the `GLINT_DRIVER` symbol. The library is
//! reference-counted: the JIT context and every driver instance created from
//! the module hold a clone, so the code stays mapped for the whole render
//! session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use crate::{
    driver::Driver,
    error::{GlintError, GlintResult},
    target::Target,
};

/// Bumped whenever [`DriverDeclaration`] or the [`Driver`] trait changes
/// shape. A module built against a different version is rejected at load.
pub const GLINT_DRIVER_ABI_VERSION: u32 = 1;

/// Exported symbol every driver module must provide.
pub const DRIVER_DECL_SYMBOL: &[u8] = b"GLINT_DRIVER\0";

/// Static declaration a driver module exports under [`DRIVER_DECL_SYMBOL`].
pub struct DriverDeclaration {
    pub abi_version: u32,
    pub target: Target,
    pub create: fn() -> Box<dyn Driver>,
}

/// A loaded shared module with shared ownership.
///
/// Cloning is cheap and keeps the module resident until the last clone is
/// dropped, at which point it is unloaded.
#[derive(Clone, Debug)]
pub struct SharedLibrary {
    path: PathBuf,
    inner: Arc<Library>,
}

impl SharedLibrary {
    pub fn open(path: impl Into<PathBuf>) -> GlintResult<Self> {
        let path = path.into();
        // SAFETY: loading runs the module's initializers; a driver module is
        // trusted code selected by the host configuration.
        let lib = unsafe { Library::new(&path) }
            .map_err(|e| GlintError::load(&path, format!("failed to open module: {e}")))?;
        Ok(Self {
            path,
            inner: Arc::new(lib),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a named symbol, `None` if the module does not export it.
    ///
    /// # Safety
    /// The caller must supply the correct type for the symbol; getting it
    /// wrong is undefined behavior on first use.
    pub unsafe fn symbol<T>(&self, name: &[u8]) -> Option<libloading::Symbol<'_, T>> {
        unsafe { self.inner.get::<T>(name).ok() }
    }

    /// Look up and validate the module's driver declaration.
    pub fn driver_declaration(&self) -> GlintResult<&DriverDeclaration> {
        // SAFETY: GLINT_DRIVER is specified to be a static DriverDeclaration;
        // the ABI version check below guards against layout drift.
        let decl: &DriverDeclaration = unsafe {
            let symbol = self
                .inner
                .get::<*const DriverDeclaration>(DRIVER_DECL_SYMBOL)
                .map_err(|_| {
                    GlintError::load(&self.path, "module does not export GLINT_DRIVER")
                })?;
            &**symbol
        };

        if decl.abi_version != GLINT_DRIVER_ABI_VERSION {
            return Err(GlintError::load(
                &self.path,
                format!(
                    "driver ABI mismatch: module has v{}, host expects v{}",
                    decl.abi_version, GLINT_DRIVER_ABI_VERSION
                ),
            ));
        }

        Ok(decl)
    }
}

/// File extension a driver module must carry on the current platform.
pub fn module_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_missing_module_is_a_load_error() {
        let err = SharedLibrary::open("/nonexistent/driver.so").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/driver.so"));
    }

    #[test]
    fn module_extension_is_platform_shaped() {
        assert!(matches!(module_extension(), "so" | "dylib" | "dll"));
    }
}
