//! `PerformanceMonitor` (§4.5) re-architected as a tagged variant per the
//! system's inheritance-hierarchy redesign note (§9): one enum, one shared
//! lifecycle contract, concrete per-variant state held by composition.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::config::MonitorConfig;
use crate::error::{errors, AutopinError};
use crate::pinning::OptimisationDirection;
use crate::perf::clustsafe::ClustSafeClient;
use crate::perf::ffi::{self, PerfEventAttr};

#[derive(Debug, Clone, Copy, Default)]
struct CounterState {
    started_at: Option<std::time::Instant>,
    baseline: f64,
    accumulated: f64,
    /// only meaningful for `EnergyMeterState`: this instance's registration
    /// in the shared meter's subscriber table.
    subscriber_id: u64,
}

/// One physical ClustSafe device behind potentially many logical
/// `EnergyMeter` monitor instances (§4.5): a single mutex serialises the
/// destructive read, and every registered subscriber's running total is
/// credited with each read's delta, not just the caller's.
pub struct EnergyMeterShared {
    client: Mutex<ClustSafeClient>,
    totals: DashMap<u64, f64>,
    next_id: AtomicU64,
}

impl EnergyMeterShared {
    pub fn new(client: ClustSafeClient) -> Arc<Self> {
        Arc::new(Self {
            client: Mutex::new(client),
            totals: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.totals.insert(id, 0.0);
        id
    }

    fn unregister(&self, id: u64) {
        self.totals.remove(&id);
    }

    /// Performs one destructive device read and fans its delta out to every
    /// currently registered subscriber, then returns `id`'s running total.
    fn poll_and_read(&self, id: u64) -> Result<f64, AutopinError> {
        let delta: f64 = {
            let mut client = self.client.lock().unwrap();
            client.read_and_reset_outlets()?.iter().map(|&v| v as f64).sum()
        };
        for mut entry in self.totals.iter_mut() {
            *entry.value_mut() += delta;
        }
        self.totals
            .get(&id)
            .map(|v| *v)
            .ok_or_else(|| errors::monitor("value", "subscriber not registered"))
    }
}

pub struct GenericPerfState {
    processors: Vec<u32>,
    attr: PerfEventAttr,
    fds: DashMap<i32, Vec<i32>>,
    counters: DashMap<i32, CounterState>,
}

pub struct LegacyPerfState {
    event_config: u64,
    fds: DashMap<i32, i32>,
    counters: DashMap<i32, CounterState>,
}

pub struct LoadLatencyState {
    /// Shared with the `SamplingEngine`: per-tid running sample count.
    sample_counts: Arc<DashMap<i32, u64>>,
    counters: DashMap<i32, CounterState>,
}

pub struct EnergyMeterState {
    shared: Arc<EnergyMeterShared>,
    /// one accumulator per logical monitor instance sharing the same meter
    counters: DashMap<i32, CounterState>,
}

pub struct RandomState {
    min: f64,
    max: f64,
    seed: Mutex<u64>,
    counters: DashMap<i32, f64>,
}

pub enum PerformanceMonitor {
    GenericPerf(GenericPerfState),
    LegacyPerf(LegacyPerfState),
    LoadLatencySampler(LoadLatencyState),
    EnergyMeter(EnergyMeterState),
    Random(RandomState),
}

impl PerformanceMonitor {
    pub fn unit(&self) -> &'static str {
        match self {
            PerformanceMonitor::GenericPerf(_) | PerformanceMonitor::LegacyPerf(_) => "count",
            PerformanceMonitor::LoadLatencySampler(_) => "samples",
            PerformanceMonitor::EnergyMeter(_) => "joule",
            PerformanceMonitor::Random(_) => "a.u.",
        }
    }

    pub fn optimisation_direction(&self, cfg: &MonitorConfig) -> OptimisationDirection {
        match cfg.options.get_str("valtype") {
            Some("MAX") => OptimisationDirection::Max,
            Some("MIN") => OptimisationDirection::Min,
            _ => OptimisationDirection::Unknown,
        }
    }

    pub fn random(min: f64, max: f64, seed: u64) -> Self {
        PerformanceMonitor::Random(RandomState {
            min,
            max,
            seed: Mutex::new(seed),
            counters: DashMap::new(),
        })
    }

    pub fn load_latency(sample_counts: Arc<DashMap<i32, u64>>) -> Self {
        PerformanceMonitor::LoadLatencySampler(LoadLatencyState {
            sample_counts,
            counters: DashMap::new(),
        })
    }

    pub fn energy_meter(shared: Arc<EnergyMeterShared>) -> Self {
        PerformanceMonitor::EnergyMeter(EnergyMeterState {
            shared,
            counters: DashMap::new(),
        })
    }

    pub fn legacy_perf(event_config: u64) -> Self {
        PerformanceMonitor::LegacyPerf(LegacyPerfState {
            event_config,
            fds: DashMap::new(),
            counters: DashMap::new(),
        })
    }

    /// `attr_type` is one of `PERF_TYPE_{RAW,HARDWARE,SOFTWARE,HW_CACHE}`, as
    /// resolved by [`crate::perf::sensor::resolve_sensor`].
    pub fn generic_perf(processors: Vec<u32>, attr_type: u32, config: u64, config1: u64, config2: u64) -> Self {
        PerformanceMonitor::GenericPerf(GenericPerfState {
            processors,
            attr: PerfEventAttr::typed(attr_type, config, config1, config2),
            fds: DashMap::new(),
            counters: DashMap::new(),
        })
    }

    pub fn start(&self, tid: i32) -> Result<(), AutopinError> {
        match self {
            PerformanceMonitor::GenericPerf(s) => {
                let mut fds = Vec::new();
                for &cpu in &s.processors {
                    let mut attr = s.attr;
                    attr.pinned();
                    match ffi::perf_event_open(&attr, tid, cpu as i32, -1, 0) {
                        Ok(fd) => {
                            let _ = ffi::ioctl(fd, ffi::PERF_EVENT_IOC_RESET, 0);
                            let _ = ffi::ioctl(fd, ffi::PERF_EVENT_IOC_ENABLE, 0);
                            fds.push(fd);
                        }
                        Err(e) => {
                            log::debug!("Monitor/start: thread-scoped open failed, falling back to system-wide: {e}");
                            if let Ok(fd) = ffi::perf_event_open(&attr, -1, cpu as i32, -1, 0) {
                                fds.push(fd);
                            }
                        }
                    }
                }
                s.fds.insert(tid, fds);
                s.counters.insert(
                    tid,
                    CounterState {
                        started_at: Some(std::time::Instant::now()),
                        baseline: 0.0,
                        accumulated: 0.0,
                        subscriber_id: 0,
                    },
                );
                Ok(())
            }
            PerformanceMonitor::LegacyPerf(s) => {
                let mut attr = PerfEventAttr::raw(s.event_config, 0, 0);
                let fd = ffi::perf_event_open(&attr, tid, -1, -1, 0)
                    .map_err(|e| errors::monitor("start", e.to_string()))?;
                let _ = ffi::ioctl(fd, ffi::PERF_EVENT_IOC_RESET, 0);
                let _ = ffi::ioctl(fd, ffi::PERF_EVENT_IOC_ENABLE, 0);
                let _ = &mut attr;
                s.fds.insert(tid, fd);
                s.counters.insert(tid, CounterState::default());
                Ok(())
            }
            PerformanceMonitor::LoadLatencySampler(s) => {
                let baseline = s.sample_counts.get(&tid).map(|v| *v).unwrap_or(0) as f64;
                s.counters.insert(
                    tid,
                    CounterState {
                        started_at: Some(std::time::Instant::now()),
                        baseline,
                        accumulated: 0.0,
                        subscriber_id: 0,
                    },
                );
                Ok(())
            }
            PerformanceMonitor::EnergyMeter(s) => {
                let subscriber_id = s.shared.register();
                s.counters.insert(
                    tid,
                    CounterState {
                        started_at: Some(std::time::Instant::now()),
                        baseline: 0.0,
                        accumulated: 0.0,
                        subscriber_id,
                    },
                );
                Ok(())
            }
            PerformanceMonitor::Random(s) => {
                s.counters.insert(tid, 0.0);
                Ok(())
            }
        }
    }

    pub fn value(&self, tid: i32) -> Result<f64, AutopinError> {
        match self {
            PerformanceMonitor::GenericPerf(s) => {
                let fds = s
                    .fds
                    .get(&tid)
                    .ok_or_else(|| errors::monitor("value", "not started"))?;
                let mut sum = 0i64;
                for &fd in fds.iter() {
                    let mut buf = [0u8; 8];
                    unsafe {
                        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                    }
                    sum += i64::from_ne_bytes(buf);
                }
                Ok(sum as f64)
            }
            PerformanceMonitor::LegacyPerf(s) => {
                let fd = *s
                    .fds
                    .get(&tid)
                    .ok_or_else(|| errors::monitor("value", "not started"))?;
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                Ok(i64::from_ne_bytes(buf) as f64)
            }
            PerformanceMonitor::LoadLatencySampler(s) => {
                let state = s
                    .counters
                    .get(&tid)
                    .ok_or_else(|| errors::monitor("value", "not started"))?;
                let current = s.sample_counts.get(&tid).map(|v| *v).unwrap_or(0) as f64;
                Ok(current - state.baseline)
            }
            PerformanceMonitor::EnergyMeter(s) => {
                let subscriber_id = s
                    .counters
                    .get(&tid)
                    .ok_or_else(|| errors::monitor("value", "not started"))?
                    .subscriber_id;
                // the subscriber's running total starts at 0.0 at `register()`,
                // so it already equals this instance's delta since start().
                s.shared.poll_and_read(subscriber_id)
            }
            PerformanceMonitor::Random(s) => {
                let mut seed = s.seed.lock().unwrap();
                *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let unit = ((*seed >> 33) as f64) / (u32::MAX as f64);
                Ok(s.min + unit * (s.max - s.min))
            }
        }
    }

    pub fn stop(&self, tid: i32) -> Result<f64, AutopinError> {
        let v = self.value(tid)?;
        self.clear(tid);
        Ok(v)
    }

    pub fn clear(&self, tid: i32) {
        match self {
            PerformanceMonitor::GenericPerf(s) => {
                if let Some((_, fds)) = s.fds.remove(&tid) {
                    for fd in fds {
                        unsafe {
                            libc::close(fd);
                        }
                    }
                }
                s.counters.remove(&tid);
            }
            PerformanceMonitor::LegacyPerf(s) => {
                if let Some((_, fd)) = s.fds.remove(&tid) {
                    unsafe {
                        libc::close(fd);
                    }
                }
                s.counters.remove(&tid);
            }
            PerformanceMonitor::LoadLatencySampler(s) => {
                s.counters.remove(&tid);
            }
            PerformanceMonitor::EnergyMeter(s) => {
                if let Some((_, state)) = s.counters.remove(&tid) {
                    s.shared.unregister(state.subscriber_id);
                }
            }
            PerformanceMonitor::Random(s) => {
                s.counters.remove(&tid);
            }
        }
    }

    pub fn monitored_tasks(&self) -> HashSet<i32> {
        match self {
            PerformanceMonitor::GenericPerf(s) => s.fds.iter().map(|e| *e.key()).collect(),
            PerformanceMonitor::LegacyPerf(s) => s.fds.iter().map(|e| *e.key()).collect(),
            PerformanceMonitor::LoadLatencySampler(s) => s.counters.iter().map(|e| *e.key()).collect(),
            PerformanceMonitor::EnergyMeter(s) => s.counters.iter().map(|e| *e.key()).collect(),
            PerformanceMonitor::Random(s) => s.counters.iter().map(|e| *e.key()).collect(),
        }
    }

    pub fn start_many(&self, tids: &[i32]) -> HashMap<i32, Result<(), AutopinError>> {
        tids.iter().map(|&t| (t, self.start(t))).collect()
    }

    pub fn value_many(&self, tids: &[i32]) -> HashMap<i32, Result<f64, AutopinError>> {
        tids.iter().map(|&t| (t, self.value(t))).collect()
    }

    pub fn stop_many(&self, tids: &[i32]) -> HashMap<i32, Result<f64, AutopinError>> {
        tids.iter().map(|&t| (t, self.stop(t))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_monitor_stays_within_configured_interval() {
        let m = PerformanceMonitor::random(1.0, 2.0, 42);
        m.start(1).unwrap();
        for _ in 0..50 {
            let v = m.value(1).unwrap();
            assert!((1.0..=2.0).contains(&v));
        }
    }

    #[test]
    fn load_latency_value_is_delta_since_start() {
        let counts = Arc::new(DashMap::new());
        counts.insert(1, 10u64);
        let m = PerformanceMonitor::load_latency(counts.clone());
        m.start(1).unwrap();
        counts.insert(1, 17u64);
        assert_eq!(m.value(1).unwrap(), 7.0);
    }

    #[test]
    fn stop_clears_monitored_task() {
        let m = PerformanceMonitor::random(0.0, 1.0, 1);
        m.start(5).unwrap();
        assert!(m.monitored_tasks().contains(&5));
        let _ = m.stop(5).unwrap();
        assert!(!m.monitored_tasks().contains(&5));
    }
}
