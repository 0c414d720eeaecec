//! CPU set discovery and parsing.
//!
//! The usable CPU list is the intersection of the machine's online CPUs,
//! any cgroup cpuset restriction, and the user's `--cpuset` argument.

use std::fs;

use super::ResourceError;

/// Parses a kernel-style CPU list such as `0-3,7,16-23`.
///
/// # Errors
///
/// `ResourceError::CpuSetParse` on malformed input.
pub fn parse_cpuset(s: &str) -> Result<Vec<usize>, ResourceError> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let (start, end) = (
                start
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| bad_cpuset(s))?,
                end.trim().parse::<usize>().map_err(|_| bad_cpuset(s))?,
            );
            if end < start {
                return Err(bad_cpuset(s));
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(part.parse::<usize>().map_err(|_| bad_cpuset(s))?);
        }
    }
    if cpus.is_empty() {
        return Err(bad_cpuset(s));
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

fn bad_cpuset(s: &str) -> ResourceError {
    ResourceError::CpuSetParse {
        input: s.to_string(),
    }
}

/// Lenient variant for kernel-provided lists: drops malformed parts.
fn parse_cpulist_lenient(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// CPUs the machine has online.
#[must_use]
pub fn online_cpus() -> Vec<usize> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(online) = fs::read_to_string("/sys/devices/system/cpu/online") {
            let cpus = parse_cpulist_lenient(online.trim());
            if !cpus.is_empty() {
                return cpus;
            }
        }
    }
    (0..num_cpus::get()).collect()
}

/// CPUs the enclosing cgroup (v2 first, then v1) allows, if restricted.
#[must_use]
pub fn cgroup_cpus() -> Option<Vec<usize>> {
    #[cfg(target_os = "linux")]
    {
        // cgroup v2 unified hierarchy.
        for path in [
            "/sys/fs/cgroup/cpuset.cpus.effective",
            "/sys/fs/cgroup/cpuset/cpuset.effective_cpus",
            "/sys/fs/cgroup/cpuset/cpuset.cpus",
        ] {
            if let Ok(s) = fs::read_to_string(path) {
                let cpus = parse_cpulist_lenient(s.trim());
                if !cpus.is_empty() {
                    return Some(cpus);
                }
            }
        }
        // cgroup v1: resolve our cpuset group from /proc/self/cgroup.
        if let Ok(groups) = fs::read_to_string("/proc/self/cgroup") {
            for line in groups.lines() {
                let mut fields = line.splitn(3, ':');
                let (_, controllers, path) =
                    (fields.next(), fields.next(), fields.next());
                if let (Some(controllers), Some(path)) = (controllers, path) {
                    if controllers.split(',').any(|c| c == "cpuset") {
                        let file =
                            format!("/sys/fs/cgroup/cpuset{path}/cpuset.cpus");
                        if let Ok(s) = fs::read_to_string(file) {
                            let cpus = parse_cpulist_lenient(s.trim());
                            if !cpus.is_empty() {
                                return Some(cpus);
                            }
                        }
                    }
                }
            }
        }
    }
    None
}

/// Intersection of the machine's CPUs, cgroup limits, and an explicit
/// restriction.
#[must_use]
pub fn usable_cpus(restriction: Option<&[usize]>) -> Vec<usize> {
    let mut cpus = online_cpus();
    if let Some(allowed) = cgroup_cpus() {
        cpus.retain(|c| allowed.contains(c));
    }
    if let Some(allowed) = restriction {
        cpus.retain(|c| allowed.contains(c));
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_and_ranges() {
        assert_eq!(parse_cpuset("0").unwrap(), vec![0]);
        assert_eq!(parse_cpuset("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpuset("0-3,7").unwrap(), vec![0, 1, 2, 3, 7]);
        assert_eq!(
            parse_cpuset("8-9, 1-2").unwrap(),
            vec![1, 2, 8, 9]
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_cpuset("").is_err());
        assert!(parse_cpuset("a-b").is_err());
        assert!(parse_cpuset("3-1").is_err());
        assert!(parse_cpuset("1,,x").is_err());
    }

    #[test]
    fn parse_dedups_overlaps() {
        assert_eq!(parse_cpuset("0-2,1-3").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn online_cpus_is_non_empty() {
        assert!(!online_cpus().is_empty());
    }

    #[test]
    fn usable_respects_explicit_restriction() {
        let online = online_cpus();
        let first = online[0];
        let usable = usable_cpus(Some(&[first]));
        assert_eq!(usable, vec![first]);
    }
}
