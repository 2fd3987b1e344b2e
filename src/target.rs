use std::fmt;
use std::str::FromStr;

use crate::error::GlintError;

/// A concrete hardware backend the renderer can execute on.
///
/// CPU variants imply a vector width, GPU variants a device API. There is no
/// "invalid" variant: an unset target is `Option<Target>` at the options
/// layer and is always resolved to a concrete value before a driver is
/// loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum Target {
    Generic,
    Sse42,
    Avx,
    Avx2,
    Avx512,
    Asimd,
    Nvvm,
    Amdgpu,
}

/// CPU targets from widest vector width down to scalar. Recommendation and
/// fallback both walk this order.
pub const CPU_PREFERENCE: [Target; 6] = [
    Target::Avx512,
    Target::Avx2,
    Target::Avx,
    Target::Sse42,
    Target::Asimd,
    Target::Generic,
];

/// GPU targets in recommendation order.
pub const GPU_PREFERENCE: [Target; 2] = [Target::Nvvm, Target::Amdgpu];

impl Target {
    pub fn is_cpu(self) -> bool {
        !self.is_gpu()
    }

    pub fn is_gpu(self) -> bool {
        matches!(self, Target::Nvvm | Target::Amdgpu)
    }

    /// Targets to try, in order, when this one is not installed. The chain
    /// stays inside the same device class; crossing over to the other class
    /// is the Driver Manager's decision.
    pub fn fallback_chain(self) -> &'static [Target] {
        match self {
            Target::Avx512 => &[Target::Avx2, Target::Avx, Target::Sse42, Target::Generic],
            Target::Avx2 => &[Target::Avx, Target::Sse42, Target::Generic],
            Target::Avx => &[Target::Sse42, Target::Generic],
            Target::Sse42 => &[Target::Generic],
            Target::Asimd => &[Target::Generic],
            Target::Generic => &[],
            Target::Nvvm => &[Target::Amdgpu],
            Target::Amdgpu => &[Target::Nvvm],
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Target::Generic => "generic",
            Target::Sse42 => "sse4.2",
            Target::Avx => "avx",
            Target::Avx2 => "avx2",
            Target::Avx512 => "avx512",
            Target::Asimd => "asimd",
            Target::Nvvm => "nvvm",
            Target::Amdgpu => "amdgpu",
        };
        f.write_str(s)
    }
}

impl FromStr for Target {
    type Err = GlintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" => Ok(Target::Generic),
            "sse4.2" | "sse42" => Ok(Target::Sse42),
            "avx" => Ok(Target::Avx),
            "avx2" => Ok(Target::Avx2),
            "avx512" => Ok(Target::Avx512),
            "asimd" => Ok(Target::Asimd),
            "nvvm" => Ok(Target::Nvvm),
            "amdgpu" => Ok(Target::Amdgpu),
            other => Err(GlintError::config(format!("unknown target '{other}'"))),
        }
    }
}
