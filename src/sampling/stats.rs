//! Per-page, per-level, and per-frequency statistics (§3, §4.6).

use std::collections::HashMap;

use dashmap::DashMap;

pub const WEIGHT_BUCKETS_NR: usize = 19;
pub const WEIGHT_BUCKET_INTERVAL: u64 = 50;
pub const SAMPLE_WEIGHT_THRESHOLD: u64 = 800;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageEntry {
    pub per_node_count: Vec<u64>,
    pub last_accessing_node: Option<u32>,
    pub home_change_count: u64,
}

impl PageEntry {
    fn new(node_count: usize) -> Self {
        Self {
            per_node_count: vec![0; node_count],
            last_accessing_node: None,
            home_change_count: 0,
        }
    }
}

/// Mapping from page-aligned address to per-node access counts, keyed as
/// specified in §3. Inserted on first sample; home-change counted only when
/// the accessing node differs from the previous one.
#[derive(Debug, Default)]
pub struct PageAccessStats {
    node_count: usize,
    pages: DashMap<u64, PageEntry>,
}

impl PageAccessStats {
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            pages: DashMap::new(),
        }
    }

    /// Testable Property 2's update: increments `per_node_count[node]` and
    /// bumps `home_change_count` (monotonically) iff the accessing node
    /// changed since the last sample of this page.
    pub fn record_access(&self, page: u64, node: u32) {
        let mut entry = self
            .pages
            .entry(page)
            .or_insert_with(|| PageEntry::new(self.node_count));
        if node as usize >= entry.per_node_count.len() {
            entry.per_node_count.resize(node as usize + 1, 0);
        }
        entry.per_node_count[node as usize] += 1;
        if let Some(last) = entry.last_accessing_node {
            if last != node {
                entry.home_change_count += 1;
            }
        }
        entry.last_accessing_node = Some(node);
    }

    pub fn get(&self, page: u64) -> Option<PageEntry> {
        self.pages.get(&page).map(|e| e.clone())
    }

    pub fn pages(&self) -> Vec<u64> {
        self.pages.iter().map(|e| *e.key()).collect()
    }

    pub fn clear(&self) {
        self.pages.clear();
    }

    /// Testable Property 2: `sum(per_node_count) == samples observed` and
    /// `home_flips <= sum`.
    pub fn invariant_holds(&self, page: u64) -> bool {
        match self.get(page) {
            None => true,
            Some(entry) => {
                let sum: u64 = entry.per_node_count.iter().sum();
                entry.home_change_count <= sum
            }
        }
    }
}

/// Mapping from a memory-hierarchy level bitmask to a count, plus the
/// secondary weight histogram of `WEIGHT_BUCKETS_NR` fixed-interval buckets.
#[derive(Debug, Default)]
pub struct LevelHistogram {
    levels: HashMap<u32, u64>,
    weight_buckets: [u64; WEIGHT_BUCKETS_NR],
}

impl LevelHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, level_mask: u32, weight: u64) {
        *self.levels.entry(level_mask).or_insert(0) += 1;
        let bucket = ((weight / WEIGHT_BUCKET_INTERVAL) as usize).min(WEIGHT_BUCKETS_NR - 1);
        self.weight_buckets[bucket] += 1;
    }

    pub fn level_count(&self, level_mask: u32) -> u64 {
        self.levels.get(&level_mask).copied().unwrap_or(0)
    }

    pub fn weight_bucket(&self, idx: usize) -> u64 {
        self.weight_buckets[idx]
    }

    pub fn reset(&mut self) {
        self.levels.clear();
        self.weight_buckets = [0; WEIGHT_BUCKETS_NR];
    }
}

/// Mapping from an aggregate access count to how many pages have that count.
#[derive(Debug, Default)]
pub struct FrequencyHistogram {
    by_count: HashMap<u64, u64>,
}

impl FrequencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, access_count: u64) {
        *self.by_count.entry(access_count).or_insert(0) += 1;
    }

    pub fn pages_with_count(&self, access_count: u64) -> u64 {
        self.by_count.get(&access_count).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_2_sum_equals_samples_and_flips_never_exceed_sum() {
        let stats = PageAccessStats::new(2);
        stats.record_access(0x1000, 0);
        stats.record_access(0x1000, 0);
        stats.record_access(0x1000, 1);
        let entry = stats.get(0x1000).unwrap();
        let sum: u64 = entry.per_node_count.iter().sum();
        assert_eq!(sum, 3);
        assert_eq!(entry.home_change_count, 1);
        assert!(stats.invariant_holds(0x1000));
    }

    #[test]
    fn home_change_count_is_monotonically_non_decreasing() {
        let stats = PageAccessStats::new(2);
        let mut prior = 0;
        for node in [0, 1, 0, 1, 1] {
            stats.record_access(0x2000, node);
            let current = stats.get(0x2000).unwrap().home_change_count;
            assert!(current >= prior);
            prior = current;
        }
    }

    #[test]
    fn weight_bucket_clamps_at_the_last_bucket() {
        let mut hist = LevelHistogram::new();
        hist.record(0, SAMPLE_WEIGHT_THRESHOLD * 10);
        assert_eq!(hist.weight_bucket(WEIGHT_BUCKETS_NR - 1), 1);
    }

    #[test]
    fn frequency_histogram_counts_pages_per_bucket() {
        let mut hist = FrequencyHistogram::new();
        hist.record(3);
        hist.record(3);
        hist.record(5);
        assert_eq!(hist.pages_with_count(3), 2);
        assert_eq!(hist.pages_with_count(5), 1);
    }
}
