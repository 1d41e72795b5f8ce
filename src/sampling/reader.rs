//! Opens the two per-core perf-event groups §4.6 mandates and drains them
//! on a dedicated thread (§5 thread 3): a PEBS load-latency sampler and a
//! grouped profiling counter set, each backed by its own mmap ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{errors, AutopinError};
use crate::perf::ffi::{self, PerfEventAttr, LOAD_LATENCY_SAMPLE_TYPE};
use crate::sampling::ringbuf::RingBuffer;
use crate::sampling::{SamplingEngine, PERF_RECORD_SAMPLE, PROFILING_SAMPLE_TYPE};
use crate::topology::CpuTopology;

/// `MEM_TRANS_RETIRED.LOAD_LATENCY`; `config1` carries the minimum latency
/// in cycles the PEBS facility requires before it records a sample.
const PEBS_LOAD_LATENCY_EVENT: u64 = 0x01cd;
const PEBS_MIN_LATENCY_CYCLES: u64 = 3;
const PEBS_SAMPLE_PERIOD: u64 = 1000;

/// Unhalted core cycles, instructions retired, LLC misses — the grouped
/// profiling set's raw events; only the leader (the first) samples.
const PROFILING_GROUP_EVENTS: [u64; 3] = [0x003c, 0x00c0, 0x412e];
const PROFILING_SAMPLE_PERIOD: u64 = 100_000;

const RING_PAGE_COUNT: usize = 8;
const IDLE_SLEEP: Duration = Duration::from_millis(20);

struct CoreRings {
    core: usize,
    pebs_ring: RingBuffer,
    profiling_ring: RingBuffer,
    profiling_member_fds: Vec<i32>,
}

impl Drop for CoreRings {
    fn drop(&mut self) {
        for &fd in &self.profiling_member_fds {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Owns the reader thread; dropping it without calling [`SamplingReader::join`]
/// just leaves the thread running detached until process exit, mirroring how
/// `TraceEngine` hands back a bare `JoinHandle` for the watchdog to own.
pub struct SamplingReader {
    exit_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SamplingReader {
    /// Opens both perf groups on every online core and spawns the reader
    /// thread. A core whose groups fail to open (no PMU, permission denied)
    /// is skipped with a warning rather than failing the whole engine.
    pub fn spawn(engine: Arc<SamplingEngine>, topology: Arc<CpuTopology>, page_size: u64) -> Result<Self, AutopinError> {
        let page_size = page_size as usize;
        let mut cores = Vec::new();
        for core in topology.all_cores() {
            match open_core_rings(core as usize, page_size) {
                Ok(rings) => cores.push(rings),
                Err(e) => log::warn!("Monitor/reset: cannot open perf groups on core {core}: {e}"),
            }
        }

        let exit_requested = Arc::new(AtomicBool::new(false));
        let thread_exit = exit_requested.clone();
        let handle = std::thread::Builder::new()
            .name("sampling-reader".into())
            .spawn(move || run_reader_loop(engine, topology, cores, thread_exit))
            .map_err(|e| errors::system("attach", e.to_string()))?;

        Ok(Self {
            exit_requested,
            handle: Some(handle),
        })
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    /// Signals the reader thread and blocks until it has closed every fd.
    pub fn join(mut self) {
        self.request_exit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn open_core_rings(core: usize, page_size: usize) -> Result<CoreRings, AutopinError> {
    let mut pebs_attr = PerfEventAttr::raw(PEBS_LOAD_LATENCY_EVENT, PEBS_MIN_LATENCY_CYCLES, 0);
    pebs_attr
        .set_sample_type(LOAD_LATENCY_SAMPLE_TYPE)
        .set_sample_period(PEBS_SAMPLE_PERIOD)
        .set_precise_ip(2)
        .sample_id_all();
    let pebs_fd = ffi::perf_event_open(&pebs_attr, -1, core as i32, -1, 0)
        .map_err(|e| errors::monitor("start", format!("PEBS open on core {core}: {e}")))?;
    let _ = ffi::ioctl(pebs_fd, ffi::PERF_EVENT_IOC_RESET, 0);
    let _ = ffi::ioctl(pebs_fd, ffi::PERF_EVENT_IOC_ENABLE, 0);
    let pebs_ring = RingBuffer::map(pebs_fd, RING_PAGE_COUNT, page_size)?;

    let mut profiling_attr = PerfEventAttr::raw(PROFILING_GROUP_EVENTS[0], 0, 0);
    profiling_attr
        .set_sample_type(PROFILING_SAMPLE_TYPE)
        .set_sample_period(PROFILING_SAMPLE_PERIOD)
        .sample_id_all();
    let profiling_fd = ffi::perf_event_open(&profiling_attr, -1, core as i32, -1, 0)
        .map_err(|e| errors::monitor("start", format!("profiling group open on core {core}: {e}")))?;

    let mut profiling_member_fds = Vec::new();
    for &event in &PROFILING_GROUP_EVENTS[1..] {
        let member_attr = PerfEventAttr::raw(event, 0, 0);
        match ffi::perf_event_open(&member_attr, -1, core as i32, profiling_fd, 0) {
            Ok(fd) => profiling_member_fds.push(fd),
            Err(e) => log::debug!("Monitor/reset: profiling group member {event:#x} on core {core} failed: {e}"),
        }
    }

    let _ = ffi::ioctl(profiling_fd, ffi::PERF_EVENT_IOC_RESET, 0);
    let _ = ffi::ioctl(profiling_fd, ffi::PERF_EVENT_IOC_ENABLE, 0);
    let profiling_ring = RingBuffer::map(profiling_fd, RING_PAGE_COUNT, page_size)?;

    Ok(CoreRings {
        core,
        pebs_ring,
        profiling_ring,
        profiling_member_fds,
    })
}

fn run_reader_loop(engine: Arc<SamplingEngine>, topology: Arc<CpuTopology>, cores: Vec<CoreRings>, exit_requested: Arc<AtomicBool>) {
    let node_of_core = |core: u32| topology.node_of_core(core).unwrap_or(0);
    loop {
        if exit_requested.load(Ordering::SeqCst) {
            break;
        }
        let mut drained_any = false;
        for rings in &cores {
            for (record_type, payload) in decode_ring(&rings.pebs_ring) {
                drained_any = true;
                engine.process_record(record_type, rings.core, &node_of_core, &payload);
            }
            for (record_type, payload) in decode_ring(&rings.profiling_ring) {
                drained_any = true;
                engine.process_profiling_record(record_type, rings.core, &payload);
            }
        }
        if !drained_any {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

/// Splits a drained ring chunk into `perf_event_header`-framed records:
/// `type: u32, misc: u16, size: u16` followed by `size - 8` bytes of payload.
/// A record whose declared size runs past what was drained is dropped,
/// mirroring [`crate::sampling::decode_sample`]'s truncation handling.
fn decode_ring(ring: &RingBuffer) -> Vec<(u32, Vec<u8>)> {
    let bytes = ring.drain();
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let record_type = u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());
        let size = u16::from_ne_bytes(bytes[offset + 6..offset + 8].try_into().unwrap()) as usize;
        if size < 8 || offset + size > bytes.len() {
            break;
        }
        out.push((record_type, bytes[offset + 8..offset + size].to_vec()));
        offset += size;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(record_type: u32, size: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&record_type.to_ne_bytes());
        out.extend_from_slice(&0u16.to_ne_bytes());
        out.extend_from_slice(&size.to_ne_bytes());
        out
    }

    #[test]
    fn decode_ring_framing_splits_type_and_payload() {
        let mut bytes = header(PERF_RECORD_SAMPLE, 12);
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        bytes.extend(header(PERF_RECORD_SAMPLE, 10));
        bytes.extend_from_slice(&[9, 9]);

        let mut offset = 0usize;
        let mut records = Vec::new();
        while offset + 8 <= bytes.len() {
            let record_type = u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let size = u16::from_ne_bytes(bytes[offset + 6..offset + 8].try_into().unwrap()) as usize;
            if size < 8 || offset + size > bytes.len() {
                break;
            }
            records.push((record_type, bytes[offset + 8..offset + size].to_vec()));
            offset += size;
        }

        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (PERF_RECORD_SAMPLE, vec![1, 2, 3, 4]));
        assert_eq!(records[1], (PERF_RECORD_SAMPLE, vec![9, 9]));
    }

    #[test]
    fn truncated_trailing_record_is_dropped() {
        let mut bytes = header(PERF_RECORD_SAMPLE, 8);
        bytes.extend_from_slice(&header(PERF_RECORD_SAMPLE, 40)[..4]);

        let mut offset = 0usize;
        let mut records = Vec::new();
        while offset + 8 <= bytes.len() {
            let record_type = u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let size = u16::from_ne_bytes(bytes[offset + 6..offset + 8].try_into().unwrap()) as usize;
            if size < 8 || offset + size > bytes.len() {
                break;
            }
            records.push((record_type, bytes[offset + 8..offset + size].to_vec()));
            offset += size;
        }
        assert_eq!(records.len(), 1);
    }
}
