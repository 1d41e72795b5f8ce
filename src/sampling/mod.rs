//! `SamplingEngine` (§4.6): ring-buffer consumption, sample decoding, access
//! classification, and per-sample bookkeeping.

pub mod reader;
pub mod ringbuf;
pub mod stats;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::perf::ffi::{
    LOAD_LATENCY_SAMPLE_TYPE, PERF_SAMPLE_CPU, PERF_SAMPLE_IP, PERF_SAMPLE_PERIOD, PERF_SAMPLE_TID, PERF_SAMPLE_TIME,
};
pub use stats::{FrequencyHistogram, LevelHistogram, PageAccessStats, SAMPLE_WEIGHT_THRESHOLD};

pub(crate) const PERF_RECORD_SAMPLE: u32 = 9;

/// The grouped profiling counter set's sample mask (§4.6): lighter than the
/// PEBS group's since it carries no `ADDR`/`DATA_SRC` — it tracks sample
/// cadence and period, not memory locality.
pub(crate) const PROFILING_SAMPLE_TYPE: u64 =
    PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_CPU | PERF_SAMPLE_PERIOD;

const MEM_LVL_L1: u64 = 1 << 3;
const MEM_LVL_L2: u64 = 1 << 4;
const MEM_LVL_LFB: u64 = 1 << 5;
const MEM_LVL_L3: u64 = 1 << 6;
const MEM_HIT: u64 = 1 << 1;
const MEM_MISS: u64 = 1 << 2;
const MEM_REMOTE_BAND: u64 = 0b1111 << 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    FilteredLocal,
    Remote,
    UncountedOther,
}

/// Classifies `data_src` per §4.6: L1/L2/LFB or L3 hits are filtered local
/// accesses; an L3 miss or any remote-band bit is a remote access; anything
/// else is uncounted.
pub fn classify_access(data_src: u64) -> AccessClass {
    let local_hit = data_src & (MEM_LVL_L1 | MEM_LVL_L2 | MEM_LVL_LFB) != 0 && data_src & MEM_HIT != 0;
    if local_hit {
        return AccessClass::FilteredLocal;
    }
    if data_src & MEM_LVL_L3 != 0 {
        if data_src & MEM_HIT != 0 {
            return AccessClass::FilteredLocal;
        }
        if data_src & MEM_MISS != 0 {
            return AccessClass::Remote;
        }
    }
    if data_src & MEM_REMOTE_BAND != 0 {
        return AccessClass::Remote;
    }
    AccessClass::UncountedOther
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub pid: u32,
    pub tid: u32,
    pub timestamp: u64,
    pub addr: u64,
    pub cpu: u32,
    pub period: u64,
    pub weight: u64,
    pub data_src: u64,
}

/// Decodes a `PERF_RECORD_SAMPLE` payload field-by-field in the order the
/// `sample_type` mask declares. If the record runs out of bytes before every
/// requested field is read, the remainder is dropped and `None` is returned
/// (the caller logs a warning), per §4.6.
pub fn decode_sample(buf: &[u8], sample_type: u64) -> Option<Sample> {
    let mut offset = 0usize;
    let mut take = |len: usize| -> Option<&[u8]> {
        if offset + len > buf.len() {
            None
        } else {
            let slice = &buf[offset..offset + len];
            offset += len;
            Some(slice)
        }
    };

    let mut sample = Sample {
        pid: 0,
        tid: 0,
        timestamp: 0,
        addr: 0,
        cpu: 0,
        period: 0,
        weight: 0,
        data_src: 0,
    };

    if sample_type & crate::perf::ffi::PERF_SAMPLE_IP != 0 {
        take(8)?;
    }
    if sample_type & crate::perf::ffi::PERF_SAMPLE_TID != 0 {
        let b = take(8)?;
        sample.pid = u32::from_ne_bytes(b[0..4].try_into().unwrap());
        sample.tid = u32::from_ne_bytes(b[4..8].try_into().unwrap());
    }
    if sample_type & crate::perf::ffi::PERF_SAMPLE_TIME != 0 {
        let b = take(8)?;
        sample.timestamp = u64::from_ne_bytes(b.try_into().unwrap());
    }
    if sample_type & crate::perf::ffi::PERF_SAMPLE_ADDR != 0 {
        let b = take(8)?;
        sample.addr = u64::from_ne_bytes(b.try_into().unwrap());
    }
    if sample_type & crate::perf::ffi::PERF_SAMPLE_CPU != 0 {
        let b = take(8)?;
        sample.cpu = u32::from_ne_bytes(b[0..4].try_into().unwrap());
    }
    if sample_type & crate::perf::ffi::PERF_SAMPLE_PERIOD != 0 {
        let b = take(8)?;
        sample.period = u64::from_ne_bytes(b.try_into().unwrap());
    }
    if sample_type & crate::perf::ffi::PERF_SAMPLE_WEIGHT != 0 {
        let b = take(8)?;
        sample.weight = u64::from_ne_bytes(b.try_into().unwrap());
    }
    if sample_type & crate::perf::ffi::PERF_SAMPLE_DATA_SRC != 0 {
        let b = take(8)?;
        sample.data_src = u64::from_ne_bytes(b.try_into().unwrap());
    }

    Some(sample)
}

fn page_of(addr: u64, page_size: u64) -> u64 {
    addr & !(page_size - 1)
}

#[derive(Default)]
pub struct CoreCounters {
    pub process_samples: AtomicU64,
    pub remote_samples: AtomicU64,
}

/// The sampling engine itself. Ring buffers and the profiling snapshot are
/// owned exclusively by the sampling thread; `PageAccessStats` is read by
/// `MigrationController` only while `disable_ll` is set (§5).
pub struct SamplingEngine {
    observed_pid: u32,
    page_size: u64,
    pub page_access: PageAccessStats,
    pub levels: Mutex<LevelHistogram>,
    pub frequencies: Mutex<FrequencyHistogram>,
    pub core_counters: Vec<CoreCounters>,
    migration_candidates: Mutex<HashSet<u64>>,
    expensive_accesses: Mutex<Vec<u64>>,
}

impl SamplingEngine {
    pub fn new(observed_pid: u32, node_count: usize, core_count: usize, page_size: u64) -> Self {
        Self {
            observed_pid,
            page_size,
            page_access: PageAccessStats::new(node_count),
            levels: Mutex::new(LevelHistogram::new()),
            frequencies: Mutex::new(FrequencyHistogram::new()),
            core_counters: (0..core_count).map(|_| CoreCounters::default()).collect(),
            migration_candidates: Mutex::new(HashSet::new()),
            expensive_accesses: Mutex::new(Vec::new()),
        }
    }

    /// Demultiplexes one ring-buffer record; non-SAMPLE records are skipped.
    pub fn process_record(&self, header_type: u32, core: usize, node_of_core: impl Fn(u32) -> u32, buf: &[u8]) {
        if header_type != PERF_RECORD_SAMPLE {
            return;
        }
        let Some(sample) = decode_sample(buf, LOAD_LATENCY_SAMPLE_TYPE) else {
            log::warn!("Monitor/value: dropped a truncated sample record");
            return;
        };
        self.bookkeep(&sample, core, node_of_core);
    }

    /// Per-sample bookkeeping (§4.6), applied only when the sample belongs
    /// to the observed process. The accessing node is derived from
    /// `sample.cpu` (the core that took the sample), not from the page
    /// address — a remote access is defined by where the core sits, not
    /// where the backing memory happens to be addressed from.
    fn bookkeep(&self, sample: &Sample, core: usize, node_of_core: impl Fn(u32) -> u32) {
        if sample.pid != self.observed_pid {
            return;
        }
        if let Some(counters) = self.core_counters.get(core) {
            counters.process_samples.fetch_add(1, Ordering::Relaxed);
        }

        let page = page_of(sample.addr, self.page_size);
        let node = node_of_core(sample.cpu);
        self.page_access.record_access(page, node);
        self.levels.lock().unwrap().record(classify_level_mask(sample.data_src), sample.weight);

        if classify_access(sample.data_src) == AccessClass::Remote {
            if let Some(counters) = self.core_counters.get(core) {
                counters.remote_samples.fetch_add(1, Ordering::Relaxed);
            }
            self.migration_candidates.lock().unwrap().insert(page);
        }

        if sample.weight > SAMPLE_WEIGHT_THRESHOLD {
            self.expensive_accesses.lock().unwrap().push(sample.addr);
        }
    }

    /// Demultiplexes one profiling-group ring record. Unlike the PEBS group
    /// this only tracks sample cadence (`process_samples`) and the period
    /// histogram; it carries no address, so it never touches `page_access`.
    pub fn process_profiling_record(&self, header_type: u32, core: usize, buf: &[u8]) {
        if header_type != PERF_RECORD_SAMPLE {
            return;
        }
        let Some(sample) = decode_sample(buf, PROFILING_SAMPLE_TYPE) else {
            log::warn!("Monitor/value: dropped a truncated profiling sample record");
            return;
        };
        if sample.pid != self.observed_pid {
            return;
        }
        if let Some(counters) = self.core_counters.get(core) {
            counters.process_samples.fetch_add(1, Ordering::Relaxed);
        }
        self.frequencies.lock().unwrap().record(sample.period);
    }

    /// Testable Property 7: idempotent under repeated identical candidate
    /// additions — cardinality is unaffected by duplicates.
    pub fn add_page_to_move(&self, page: u64) {
        self.migration_candidates.lock().unwrap().insert(page);
    }

    pub fn migration_candidates(&self) -> Vec<u64> {
        self.migration_candidates.lock().unwrap().iter().copied().collect()
    }

    /// Open Question 2's fix: hash-set membership, O(n) instead of the
    /// older tree's nested O(n²) linked-list scan.
    pub fn is_expensive_access(&self, addr: u64) -> bool {
        let seen: HashSet<u64> = self.expensive_accesses.lock().unwrap().iter().copied().collect();
        seen.contains(&addr)
    }

    pub fn reset_for_remeasure(&self) {
        for c in &self.core_counters {
            c.process_samples.store(0, Ordering::Relaxed);
            c.remote_samples.store(0, Ordering::Relaxed);
        }
        self.migration_candidates.lock().unwrap().clear();
        self.levels.lock().unwrap().reset();
    }
}

fn classify_level_mask(data_src: u64) -> u32 {
    (data_src & (MEM_LVL_L1 | MEM_LVL_L2 | MEM_LVL_LFB | MEM_LVL_L3)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l1_hit_is_filtered_local() {
        assert_eq!(classify_access(MEM_LVL_L1 | MEM_HIT), AccessClass::FilteredLocal);
    }

    #[test]
    fn l3_miss_is_remote() {
        assert_eq!(classify_access(MEM_LVL_L3 | MEM_MISS), AccessClass::Remote);
    }

    #[test]
    fn remote_band_bit_is_remote_regardless_of_level() {
        assert_eq!(classify_access(1 << 9), AccessClass::Remote);
    }

    #[test]
    fn unclassified_bits_are_uncounted() {
        assert_eq!(classify_access(0), AccessClass::UncountedOther);
    }

    #[test]
    fn decode_sample_reads_fields_in_mask_order() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xAAAAu64.to_ne_bytes()); // IP (discarded)
        buf.extend_from_slice(&100u32.to_ne_bytes()); // pid
        buf.extend_from_slice(&200u32.to_ne_bytes()); // tid
        buf.extend_from_slice(&42u64.to_ne_bytes()); // time
        buf.extend_from_slice(&0x4000u64.to_ne_bytes()); // addr
        buf.extend_from_slice(&3u32.to_ne_bytes()); // cpu
        buf.extend_from_slice(&0u32.to_ne_bytes()); // res padding
        buf.extend_from_slice(&1000u64.to_ne_bytes()); // period
        buf.extend_from_slice(&900u64.to_ne_bytes()); // weight
        buf.extend_from_slice(&(MEM_LVL_L3 | MEM_MISS).to_ne_bytes()); // data_src

        let sample = decode_sample(&buf, LOAD_LATENCY_SAMPLE_TYPE).unwrap();
        assert_eq!(sample.pid, 100);
        assert_eq!(sample.tid, 200);
        assert_eq!(sample.addr, 0x4000);
        assert_eq!(sample.weight, 900);
    }

    #[test]
    fn truncated_record_decodes_to_none() {
        let buf = vec![0u8; 4];
        assert!(decode_sample(&buf, LOAD_LATENCY_SAMPLE_TYPE).is_none());
    }

    #[test]
    fn property_7_add_page_to_move_is_idempotent() {
        let engine = SamplingEngine::new(1, 2, 1, 4096);
        engine.add_page_to_move(0x1000);
        engine.add_page_to_move(0x1000);
        assert_eq!(engine.migration_candidates().len(), 1);
    }

    #[test]
    fn page_of_masks_to_page_boundary() {
        assert_eq!(page_of(0x1234, 0x1000), 0x1000);
        assert_eq!(page_of(0x1000, 0x1000), 0x1000);
    }
}
