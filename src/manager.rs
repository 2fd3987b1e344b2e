//! Enumerates installed backend drivers, recommends and resolves targets,
//! and binds drivers for the runtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    driver::{Driver, DriverFactory},
    drivers,
    error::{GlintError, GlintResult},
    library::{SharedLibrary, module_extension},
    target::{CPU_PREFERENCE, GPU_PREFERENCE, Target},
};

#[derive(Debug)]
enum DriverModule {
    Builtin { factory: DriverFactory, path: PathBuf },
    Shared { library: SharedLibrary },
}

impl DriverModule {
    fn path(&self) -> &Path {
        match self {
            DriverModule::Builtin { path, .. } => path,
            DriverModule::Shared { library } => library.path(),
        }
    }
}

/// Registry of every backend module the process can use. Owns the loaded
/// shared libraries; drivers created from them keep the module resident
/// through their [`SharedLibrary`] clone.
#[derive(Debug, Default)]
pub struct DriverManager {
    modules: BTreeMap<Target, DriverModule>,
}

impl DriverManager {
    /// An empty registry. Hosts embedding their own backend call
    /// [`register_builtin`](Self::register_builtin) afterwards.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate everything installed: built-in CPU drivers supported by the
    /// running machine plus any driver modules found in `module_dir`.
    pub fn init(module_dir: Option<&Path>) -> GlintResult<Self> {
        let mut manager = Self::new();

        let host_path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("glint"));
        for (target, factory) in drivers::builtin_drivers() {
            manager.register_builtin(target, factory, host_path.clone());
        }

        if let Some(dir) = module_dir {
            manager.scan_module_dir(dir)?;
        }

        if manager.modules.is_empty() {
            return Err(GlintError::config("no backend driver module is available"));
        }
        debug!(installed = manager.modules.len(), "driver modules enumerated");
        Ok(manager)
    }

    pub fn register_builtin(&mut self, target: Target, factory: DriverFactory, path: PathBuf) {
        self.modules
            .insert(target, DriverModule::Builtin { factory, path });
    }

    /// Load every driver module in `dir`. A module that fails to load or
    /// declares an incompatible ABI is skipped with a warning; only an
    /// unreadable directory is an error.
    fn scan_module_dir(&mut self, dir: &Path) -> GlintResult<()> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| GlintError::load(dir, format!("cannot read driver directory: {e}")))?;

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(module_extension()) {
                continue;
            }
            match SharedLibrary::open(&path).and_then(|lib| {
                let target = lib.driver_declaration()?.target;
                Ok((lib, target))
            }) {
                Ok((library, target)) => {
                    debug!(target = %target, module = %path.display(), "driver module registered");
                    self.modules.insert(target, DriverModule::Shared { library });
                }
                Err(e) => warn!(module = %path.display(), "skipping driver module: {e}"),
            }
        }
        Ok(())
    }

    pub fn is_installed(&self, target: Target) -> bool {
        self.modules.contains_key(&target)
    }

    pub fn installed_targets(&self) -> impl Iterator<Item = Target> + '_ {
        self.modules.keys().copied()
    }

    /// Best installed target with no device-class preference. Policy: a GPU
    /// module wins over any CPU module when both are installed.
    pub fn recommend_target(&self) -> Option<Target> {
        self.recommend_gpu_target()
            .or_else(|| self.recommend_cpu_target())
    }

    /// Widest installed CPU vector width.
    pub fn recommend_cpu_target(&self) -> Option<Target> {
        CPU_PREFERENCE.iter().copied().find(|t| self.is_installed(*t))
    }

    /// First installed GPU device class.
    pub fn recommend_gpu_target(&self) -> Option<Target> {
        GPU_PREFERENCE.iter().copied().find(|t| self.is_installed(*t))
    }

    /// Map a requested target to the nearest installed one: the target
    /// itself, then its in-class fallback chain, then the other device
    /// class. Idempotent for any resolvable input; `None` only when nothing
    /// is installed at all.
    pub fn resolve_target(&self, requested: Target) -> Option<Target> {
        if self.is_installed(requested) {
            return Some(requested);
        }
        if let Some(found) = requested
            .fallback_chain()
            .iter()
            .copied()
            .find(|t| self.is_installed(*t))
        {
            return Some(found);
        }
        if requested.is_gpu() {
            self.recommend_cpu_target()
        } else {
            self.recommend_gpu_target()
        }
    }

    /// Bind a driver for `target`. Fails when no module backs the target; on
    /// failure no driver state exists at all.
    pub fn load(&self, target: Target) -> GlintResult<Box<dyn Driver>> {
        let module = self.modules.get(&target).ok_or_else(|| {
            GlintError::config(format!("no driver module installed for target '{target}'"))
        })?;
        match module {
            DriverModule::Builtin { factory, .. } => Ok(factory()),
            DriverModule::Shared { library } => {
                let decl = library.driver_declaration()?;
                Ok((decl.create)())
            }
        }
    }

    /// On-disk module location backing `target`; the JIT binds its backend
    /// to this path.
    pub fn module_path(&self, target: Target) -> Option<&Path> {
        self.modules.get(&target).map(DriverModule::path)
    }
}
