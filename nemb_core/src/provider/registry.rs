//! Process-global factory registry (spec §9): a `name -> constructor` mapping that enables
//! `create(name)` dispatch and `detect()`, iterating every registered constructor and
//! keeping the ones that initialize successfully. Exposed as an explicit registration call
//! (`builtin()`) rather than a hidden startup side-effect, per spec §9's guidance.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, info};
use once_cell::sync::Lazy;

use super::EnergyProvider;

type Constructor = fn() -> Box<dyn EnergyProvider>;

static REGISTRY: Lazy<Mutex<HashMap<&'static str, Constructor>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers the five built-in provider kinds. Safe to call more than once; later calls
/// for an already-registered name are no-ops.
pub fn register_builtins() {
    register("cpu-rapl", || Box::new(super::cpu_rapl::CpuRaplProvider::new()));
    register("amd-msr", || Box::new(super::amd_msr::AmdMsrProvider::new()));
    register("arm-soc", || Box::new(super::arm_soc::ArmSocProvider::new()));
    register("amd-gpu", || Box::new(super::amd_gpu::AmdGpuProvider::new()));
    #[cfg(feature = "nvidia_gpu")]
    register("nvidia-gpu", || Box::new(super::nvidia_gpu::NvidiaGpuProvider::new()));
}

pub fn register(name: &'static str, ctor: Constructor) {
    let mut reg = REGISTRY.lock().expect("registry mutex poisoned");
    reg.entry(name).or_insert(ctor);
}

pub fn create(name: &str) -> Option<Box<dyn EnergyProvider>> {
    let reg = REGISTRY.lock().expect("registry mutex poisoned");
    reg.get(name).map(|ctor| ctor())
}

pub fn registered_names() -> Vec<&'static str> {
    let reg = REGISTRY.lock().expect("registry mutex poisoned");
    reg.keys().copied().collect()
}

/// Attempts to initialize one instance of every registered provider kind, keeping the
/// ones that succeed.
pub fn detect() -> Vec<Box<dyn EnergyProvider>> {
    register_builtins();
    let names = registered_names();
    let mut found = Vec::new();
    for name in names {
        let Some(mut provider) = create(name) else { continue };
        debug!("probing provider '{name}'");
        if provider.initialize() {
            info!("provider '{name}' detected and initialized");
            found.push(provider);
        } else {
            debug!("provider '{name}' not available on this host");
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_all_builtins() {
        register_builtins();
        let names = registered_names();
        assert!(names.contains(&"cpu-rapl"));
        assert!(names.contains(&"amd-msr"));
        assert!(names.contains(&"arm-soc"));
        assert!(names.contains(&"amd-gpu"));
    }
}
