//! Fargate task sizing
//!
//! Fargate accepts only a fixed set of CPU units and, per CPU size, a memory
//! range with a fixed step. Requested sizes are rounded up to the nearest
//! valid combination.

use crate::container::ContainerSpec;

/// Valid task CPU units, ascending
const CPU_UNITS: [u32; 7] = [256, 512, 1024, 2048, 4096, 8192, 16384];

/// Memory each container contributes at minimum (MiB)
const MIN_CONTAINER_MIB: f64 = 6.0;

const MIB: f64 = 1024.0 * 1024.0;

/// Smallest valid CPU size that fits `vcpu`, capped at the largest
pub fn fixup_cpu(vcpu: f64) -> u32 {
    let units = vcpu * 1024.0;
    CPU_UNITS
        .iter()
        .copied()
        .find(|&cpu| units <= cpu as f64)
        .unwrap_or(CPU_UNITS[CPU_UNITS.len() - 1])
}

/// `min` for NaN or anything at or below it; otherwise rounded up to a
/// multiple of `step` and capped at `max`
pub fn make_min_max_ceil(value: f64, min: u32, max: u32, step: u32) -> u32 {
    if value.is_nan() || value <= min as f64 {
        return min;
    }
    let stepped = (value / step as f64).ceil() * step as f64;
    (stepped as u32).min(max)
}

/// Round `mib` into the memory range allowed for `cpu`
pub fn fixup_memory(cpu: u32, mib: f64) -> u32 {
    match cpu {
        256 => make_min_max_ceil(mib, 512, 2048, 1024),
        512 => make_min_max_ceil(mib, 1024, 4096, 1024),
        1024 => make_min_max_ceil(mib, 2048, 8192, 1024),
        2048 => make_min_max_ceil(mib, 4096, 16384, 1024),
        4096 => make_min_max_ceil(mib, 8192, 30720, 1024),
        8192 => make_min_max_ceil(mib, 16384, 61440, 4096),
        _ => make_min_max_ceil(mib, 32768, 122880, 8192),
    }
}

/// `(cpu units, memory MiB)` for a task needing `vcpu` and `mib`
pub fn fixup_config(vcpu: f64, mib: f64) -> (u32, u32) {
    let cpu = fixup_cpu(vcpu);
    (cpu, fixup_memory(cpu, mib))
}

/// Task-level size for a set of containers
pub fn task_size(containers: &[ContainerSpec]) -> (u32, u32) {
    let (vcpu, mib) = containers.iter().fold((0.0, 0.0), |(vcpu, mib), c| {
        (
            vcpu + c.cpus as f64,
            mib + (c.memory as f64 / MIB).max(MIN_CONTAINER_MIB),
        )
    });
    fixup_config(vcpu, mib)
}
