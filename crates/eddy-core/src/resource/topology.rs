//! NUMA topology detection.
//!
//! Reads sysfs on Linux; everything else gets a single-node fallback. Never
//! fails: a machine we cannot read is treated as one node owning all CPUs.

/// CPU-to-node mapping for the machine.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    num_nodes: usize,
    cpu_to_node: Vec<usize>,
}

impl NumaTopology {
    /// Detects the topology, falling back to a single node.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some(topo) = Self::detect_sysfs() {
                return topo;
            }
        }
        Self::single_node()
    }

    #[cfg(target_os = "linux")]
    fn detect_sysfs() -> Option<Self> {
        use std::fs;
        use std::path::Path;

        let node_root = Path::new("/sys/devices/system/node");
        if !node_root.exists() {
            return None;
        }
        let mut node_ids = Vec::new();
        for entry in fs::read_dir(node_root).ok()? {
            let name = entry.ok()?.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("node") {
                if let Ok(id) = rest.parse::<usize>() {
                    node_ids.push(id);
                }
            }
        }
        if node_ids.is_empty() {
            return None;
        }
        let num_nodes = node_ids.iter().max().copied()? + 1;
        let num_cpus = num_cpus::get();
        let mut cpu_to_node = vec![0usize; num_cpus];
        for id in node_ids {
            let cpulist = node_root.join(format!("node{id}/cpulist"));
            if let Ok(list) = fs::read_to_string(cpulist) {
                for part in list.trim().split(',') {
                    if let Some((a, b)) = part.split_once('-') {
                        if let (Ok(a), Ok(b)) = (a.parse::<usize>(), b.parse::<usize>()) {
                            for cpu in a..=b {
                                if cpu < num_cpus {
                                    cpu_to_node[cpu] = id;
                                }
                            }
                        }
                    } else if let Ok(cpu) = part.trim().parse::<usize>() {
                        if cpu < num_cpus {
                            cpu_to_node[cpu] = id;
                        }
                    }
                }
            }
        }
        Some(Self {
            num_nodes,
            cpu_to_node,
        })
    }

    fn single_node() -> Self {
        Self {
            num_nodes: 1,
            cpu_to_node: vec![0; num_cpus::get()],
        }
    }

    /// Number of NUMA nodes.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Node owning `cpu` (0 for unknown CPUs).
    #[must_use]
    pub fn node_for_cpu(&self, cpu: usize) -> usize {
        self.cpu_to_node.get(cpu).copied().unwrap_or(0)
    }

    /// Whether the machine has more than one node.
    #[must_use]
    pub fn is_numa(&self) -> bool {
        self.num_nodes > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_never_fails() {
        let topo = NumaTopology::detect();
        assert!(topo.num_nodes() >= 1);
        assert!(topo.node_for_cpu(0) < topo.num_nodes());
    }

    #[test]
    fn unknown_cpu_maps_to_node_zero() {
        let topo = NumaTopology::detect();
        assert_eq!(topo.node_for_cpu(100_000), 0);
    }
}
