//! Built-in backend drivers.
//!
//! CPU drivers ship inside the host and are registered with the Driver
//! Manager according to what the running machine supports; GPU drivers only
//! ever arrive as shared modules.

pub mod cpu;

use crate::{driver::DriverFactory, target::Target};

/// Every built-in driver the current process can run, widest first.
pub(crate) fn builtin_drivers() -> Vec<(Target, DriverFactory)> {
    let mut drivers: Vec<(Target, DriverFactory)> = Vec::new();

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx512f") {
            drivers.push((Target::Avx512, cpu::create));
        }
        if is_x86_feature_detected!("avx2") {
            drivers.push((Target::Avx2, cpu::create));
        }
        if is_x86_feature_detected!("avx") {
            drivers.push((Target::Avx, cpu::create));
        }
        if is_x86_feature_detected!("sse4.2") {
            drivers.push((Target::Sse42, cpu::create));
        }
    }

    #[cfg(target_arch = "aarch64")]
    drivers.push((Target::Asimd, cpu::create));

    // The scalar driver runs everywhere.
    drivers.push((Target::Generic, cpu::create));
    drivers
}
