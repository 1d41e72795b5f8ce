//! CPU and NUMA topology, resolved once at startup from `/sys/devices/system/node/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const NODE_ROOT: &str = "/sys/devices/system/node";

#[derive(Debug, Clone, Default)]
pub struct CpuTopology {
    /// node -> ordered list of cores belonging to it.
    nodes: BTreeMap<u32, Vec<u32>>,
    /// core -> node, the inverse of `nodes`.
    core_to_node: BTreeMap<u32, u32>,
    /// distance[(a, b)] from `node<a>/distance`.
    distances: BTreeMap<(u32, u32), u32>,
}

impl CpuTopology {
    /// Discovers topology by reading the three sysfs files §4.1 names.
    /// A malformed or missing file degrades to an empty mapping rather than
    /// failing the whole discovery — callers see a possibly-incomplete but
    /// always-usable topology.
    pub fn discover() -> Self {
        Self::discover_at(Path::new(NODE_ROOT))
    }

    pub fn discover_at(root: &Path) -> Self {
        let online = fs::read_to_string(root.join("online")).unwrap_or_default();
        let node_ids = parse_sys_range(online.trim());

        let mut nodes = BTreeMap::new();
        let mut core_to_node = BTreeMap::new();
        for node in node_ids {
            let cpulist_path = root.join(format!("node{node}/cpulist"));
            let cpulist = fs::read_to_string(&cpulist_path).unwrap_or_default();
            let cores = parse_sys_range(cpulist.trim());
            for &core in &cores {
                core_to_node.insert(core, node);
            }
            nodes.insert(node, cores);
        }

        let mut distances = BTreeMap::new();
        for &node_a in nodes.keys() {
            let distance_path = root.join(format!("node{node_a}/distance"));
            let raw = fs::read_to_string(&distance_path).unwrap_or_default();
            let values: Vec<u32> = raw
                .split_whitespace()
                .filter_map(|tok| tok.parse::<u32>().ok())
                .collect();
            for (i, &node_b) in nodes.keys().enumerate() {
                if let Some(&d) = values.get(i) {
                    distances.insert((node_a, node_b), d);
                }
            }
        }

        Self {
            nodes,
            core_to_node,
            distances,
        }
    }

    pub fn core_count(&self) -> usize {
        self.core_to_node.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_of_core(&self, core: u32) -> Option<u32> {
        self.core_to_node.get(&core).copied()
    }

    pub fn cores_of_node(&self, node: u32) -> &[u32] {
        self.nodes.get(&node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn nodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.keys().copied()
    }

    pub fn all_cores(&self) -> impl Iterator<Item = u32> + '_ {
        self.core_to_node.keys().copied()
    }

    pub fn distance(&self, node_a: u32, node_b: u32) -> u32 {
        if node_a == node_b {
            return 0;
        }
        self.distances.get(&(node_a, node_b)).copied().unwrap_or(u32::MAX)
    }
}

/// Parses the sysfs range-list syntax `a-b,c,d-e`.
///
/// Each comma-separated token is either a bare integer or a `lo-hi` range
/// with `lo <= hi`. Any token that doesn't parse that way — including a
/// `lo > hi` range — is silently skipped so a malformed file still yields a
/// usable (possibly empty) mapping (§4.1, Testable Property 8).
pub fn parse_sys_range(text: &str) -> Vec<u32> {
    let mut out = Vec::new();
    if text.is_empty() {
        return out;
    }
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('-') {
            None => {
                if let Ok(v) = token.parse::<u32>() {
                    out.push(v);
                }
            }
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
                    if lo <= hi {
                        out.extend(lo..=hi);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn range_parser_basic() {
        assert_eq!(parse_sys_range("0-2,4,7-8"), vec![0, 1, 2, 4, 7, 8]);
    }

    #[test]
    fn range_parser_empty() {
        assert_eq!(parse_sys_range(""), Vec::<u32>::new());
    }

    #[test]
    fn range_parser_rejects_inverted_range() {
        assert_eq!(parse_sys_range("5-2"), Vec::<u32>::new());
    }

    #[test]
    fn range_parser_scenario_s6() {
        assert_eq!(parse_sys_range("0-3,6"), vec![0, 1, 2, 3, 6]);
    }

    #[test]
    fn range_parser_skips_malformed_tokens() {
        assert_eq!(parse_sys_range("0-1,garbage,3"), vec![0, 1, 3]);
    }

    #[test]
    fn discover_two_node_four_core_topology() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("online"), "0-1\n").unwrap();
        for (node, cpus) in [(0, "0-3"), (1, "4-7")] {
            let node_dir = dir.path().join(format!("node{node}"));
            fs::create_dir_all(&node_dir).unwrap();
            fs::write(node_dir.join("cpulist"), cpus).unwrap();
            fs::write(node_dir.join("distance"), "10 20\n").unwrap();
        }
        let topo = CpuTopology::discover_at(dir.path());
        assert_eq!(topo.core_count(), 8);
        assert_eq!(topo.node_count(), 2);
        assert_eq!(topo.node_of_core(5), Some(1));
        assert_eq!(topo.cores_of_node(0), &[0, 1, 2, 3]);
        assert_eq!(topo.distance(0, 0), 0);
        assert_eq!(topo.distance(0, 1), 20);
    }
}
