//! Host load sampling for the `/health` endpoint.

use std::sync::Mutex;
use sysinfo::System;

/// CPU and memory utilisation, both as percentages in `0.0..=100.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> HostLoad;
}

/// Samples the real host through `sysinfo`.
///
/// CPU usage is computed between consecutive refreshes, so the very first sample
/// after startup may read as zero.
pub struct SystemLoadSampler {
    system: Mutex<System>,
}

impl SystemLoadSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemLoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemLoadSampler {
    fn sample(&self) -> HostLoad {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };

        HostLoad {
            cpu_percent: (system.global_cpu_info().cpu_usage() as f64).clamp(0.0, 100.0),
            memory_percent: memory_percent.clamp(0.0, 100.0),
        }
    }
}

/// Reports a constant load. Useful for tests and for nodes that should advertise
/// a fixed weight instead of their real utilisation.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub HostLoad);

impl LoadSampler for FixedLoad {
    fn sample(&self) -> HostLoad {
        self.0
    }
}
