//! # Boot-time resource layout
//!
//! Decides what each shard gets before any shard thread exists: which CPU
//! it pins to, how much memory its heap maps, and which NUMA node that
//! memory binds to. CPU discovery intersects the machine's online set with
//! cgroup restrictions and the user's cpuset; memory splits what remains
//! after the OS reserve, with an optional larger share for shard 0.

mod cpuset;
mod topology;

pub use cpuset::{cgroup_cpus, online_cpus, parse_cpuset, usable_cpus};
pub use topology::NumaTopology;

/// Errors from resource discovery and layout.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// A cpuset argument did not parse.
    #[error("bad cpuset {input:?} (expected e.g. \"0-3,7\")")]
    CpuSetParse {
        /// The offending input.
        input: String,
    },
    /// Fewer usable CPUs than requested shards.
    #[error("{requested} shards requested but only {available} usable cpus")]
    NotEnoughCpus {
        /// Shards requested.
        requested: usize,
        /// CPUs in the usable set.
        available: usize,
    },
    /// Memory budget does not cover the shards.
    #[error("insufficient memory: {available} bytes usable for {shards} shards")]
    NotEnoughMemory {
        /// Bytes left after the reserve.
        available: u64,
        /// Shard count.
        shards: usize,
    },
}

/// What the caller asks for at boot.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    /// Shard count; default one per usable CPU.
    pub shards: Option<usize>,
    /// Explicit CPU restriction.
    pub cpuset: Option<Vec<usize>>,
    /// Total memory budget; default is machine memory minus the reserve.
    pub memory: Option<u64>,
    /// Bytes withheld for the OS; default `max(1 GiB, 7%)` of machine
    /// memory.
    pub reserve_memory: Option<u64>,
    /// Relative memory weight of shard 0 (1.0 = equal shares).
    pub shard0_mem_multiplier: f64,
}

/// One shard's slice of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    /// CPU the shard pins to.
    pub cpu: usize,
    /// Bytes of heap backing the shard maps at boot.
    pub memory: usize,
    /// NUMA node of that CPU.
    pub numa_node: usize,
}

/// Total bytes of machine memory.
#[must_use]
pub fn total_machine_memory() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    if let Some(kb) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|v| v.parse::<u64>().ok())
                    {
                        return kb * 1024;
                    }
                }
            }
        }
    }
    // Unknown platform: assume a small machine rather than overcommitting.
    4 << 30
}

fn default_reserve(total: u64) -> u64 {
    std::cmp::max(1 << 30, total * 7 / 100)
}

/// Computes the per-shard layout for a request.
///
/// # Errors
///
/// `NotEnoughCpus` / `NotEnoughMemory` when the machine cannot satisfy it.
pub fn compute_layout(request: &ResourceRequest) -> Result<Vec<ShardLayout>, ResourceError> {
    let cpus = usable_cpus(request.cpuset.as_deref());
    if cpus.is_empty() {
        return Err(ResourceError::NotEnoughCpus {
            requested: request.shards.unwrap_or(1),
            available: 0,
        });
    }
    let shards = request.shards.unwrap_or(cpus.len());
    if shards == 0 || shards > cpus.len() {
        return Err(ResourceError::NotEnoughCpus {
            requested: shards,
            available: cpus.len(),
        });
    }

    let machine = total_machine_memory();
    let reserve = request
        .reserve_memory
        .unwrap_or_else(|| default_reserve(machine));
    let available = request
        .memory
        .unwrap_or_else(|| machine.saturating_sub(reserve));
    // Each shard needs at least its bootstrap map.
    let min_per_shard = 64u64 << 20;
    if available < min_per_shard * shards as u64 {
        return Err(ResourceError::NotEnoughMemory {
            available,
            shards,
        });
    }

    // Shard 0 may get a larger share: split into weighted parts.
    let multiplier = if request.shard0_mem_multiplier > 0.0 {
        request.shard0_mem_multiplier
    } else {
        1.0
    };
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let weights: Vec<f64> = (0..shards)
        .map(|i| if i == 0 { multiplier } else { 1.0 })
        .collect();
    let weight_sum: f64 = weights.iter().sum();
    let topo = NumaTopology::detect();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let layouts = cpus
        .iter()
        .take(shards)
        .enumerate()
        .map(|(i, &cpu)| ShardLayout {
            cpu,
            memory: ((available as f64) * weights[i] / weight_sum) as usize,
            numa_node: topo.node_for_cpu(cpu),
        })
        .collect();
    Ok(layouts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_request(shards: usize) -> ResourceRequest {
        ResourceRequest {
            shards: Some(shards),
            memory: Some(1 << 30),
            reserve_memory: Some(0),
            shard0_mem_multiplier: 1.0,
            ..ResourceRequest::default()
        }
    }

    #[test]
    fn layout_assigns_distinct_cpus() {
        let layouts = compute_layout(&small_request(1)).unwrap();
        assert_eq!(layouts.len(), 1);
        assert!(layouts[0].memory >= 64 << 20);
    }

    #[test]
    fn zero_shards_is_rejected() {
        assert!(matches!(
            compute_layout(&small_request(0)),
            Err(ResourceError::NotEnoughCpus { .. })
        ));
    }

    #[test]
    fn too_many_shards_is_rejected() {
        let err = compute_layout(&small_request(100_000)).unwrap_err();
        assert!(matches!(err, ResourceError::NotEnoughCpus { .. }));
    }

    #[test]
    fn starved_memory_is_rejected() {
        let mut req = small_request(1);
        req.memory = Some(1 << 20);
        assert!(matches!(
            compute_layout(&req),
            Err(ResourceError::NotEnoughMemory { .. })
        ));
    }

    #[test]
    fn shard0_multiplier_skews_the_split() {
        if usable_cpus(None).len() < 2 {
            return; // single-cpu machine: nothing to compare
        }
        let mut req = small_request(2);
        req.shard0_mem_multiplier = 3.0;
        let layouts = compute_layout(&req).unwrap();
        assert!(layouts[0].memory > 2 * layouts[1].memory);
    }

    #[test]
    fn default_reserve_floors_at_one_gib() {
        assert_eq!(default_reserve(1 << 30), 1 << 30);
        assert!(default_reserve(100 << 30) > 1 << 30);
    }
}
