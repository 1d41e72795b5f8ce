//! `Watchdog` (§2/§3): owns every subsystem for one observed process and
//! drives its lifecycle from attach through teardown. A single-threaded
//! event loop, implemented here as a blocking `mpsc` receive loop over
//! trace/comm events plus a tick timeout.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Local;

use crate::config::{AttachOrExec, Config, MonitorConfig, StrategyType, TargetConfig};
use crate::error::{errors, AutopinError};
use crate::migration::MigrationController;
use crate::os::OsServices;
use crate::perf::clustsafe::ClustSafeClient;
use crate::perf::monitor::EnergyMeterShared;
use crate::perf::sensor::{resolve_sensor, ResolvedSensor};
use crate::perf::PerformanceMonitor;
use crate::pinning::{OptimisationDirection, Pinning, PinningHistory, Task};
use crate::process::{AttachTarget, ObservedProcess, ProcessSignal};
use crate::sampling::reader::SamplingReader;
use crate::sampling::SamplingEngine;
use crate::strategy::history_xml;
use crate::strategy::{Autopin1State, AutopinPhase, CompactState, ControlStrategy, HistoryState, NoopState, ScatterState};
use crate::topology::CpuTopology;
use crate::trace::TraceEvent;

const TICK: Duration = Duration::from_millis(500);
const SAMPLING_PAGE_SIZE: u64 = 4096;

pub struct Watchdog<'a> {
    os: &'a OsServices,
    topology: CpuTopology,
    target: TargetConfig,
    observed: ObservedProcess<'a>,
    trace_rx: Receiver<TraceEvent>,
    monitors: HashMap<String, PerformanceMonitor>,
    strategy: ControlStrategy,
    sampling: Option<Arc<SamplingEngine>>,
    sampling_reader: Option<SamplingReader>,
    history: PinningHistory,
    current_pinning: Pinning,
    sensing_period: Duration,
    last_migration_tick: Instant,
    autopin_warmup: Duration,
    autopin_measure: Duration,
    autopin_phase_started: Instant,
    exit_requested: Arc<AtomicBool>,
}

impl<'a> Watchdog<'a> {
    /// Constructs every subsystem in the order §4.4 fixes: target
    /// resolution/attach first (via `ObservedProcess::start`), then monitors,
    /// then the control strategy (loading history from disk for `History`).
    pub fn bootstrap(os: &'a OsServices, config: &Config) -> Result<Self, AutopinError> {
        let target = TargetConfig::from_config(config)?;
        let topology = CpuTopology::discover();

        let attach_target = match &target.target {
            Some(AttachOrExec::Attach(s)) => match s.parse::<i32>() {
                Ok(pid) => AttachTarget::Pid(pid),
                Err(_) => AttachTarget::Name(s.clone()),
            },
            Some(AttachOrExec::Exec(cmd)) => AttachTarget::Command(cmd.clone()),
            None => return Err(errors::bad_config("target", "neither Attach nor Exec is set")),
        };

        let comm_chan = target.comm_chan.as_ref().map(std::path::PathBuf::from);
        let (observed, trace_rx) = ObservedProcess::start(
            os,
            attach_target,
            comm_chan,
            target.comm_chan_timeout.max(0) as u64,
            target.trace,
        )?;

        let mut monitors = HashMap::new();
        let mut direction = OptimisationDirection::Unknown;
        let mut energy_meters: HashMap<String, Arc<EnergyMeterShared>> = HashMap::new();
        for name in &target.performance_monitors {
            let mc = MonitorConfig::from_config(name, config)?;
            let monitor = build_monitor(&mc, &mut energy_meters)?;
            direction = monitor.optimisation_direction(&mc);
            monitors.insert(name.clone(), monitor);
        }

        let core_count = topology.core_count().max(1);
        let known_tids = observed.process_tree().map(|t| t.all_tids()).unwrap_or_default();

        let mut autopin_warmup = Duration::from_secs(1);
        let mut autopin_measure = Duration::from_secs(1);

        let strategy = match target.strategy.strategy_type {
            StrategyType::Compact => ControlStrategy::Compact(CompactState::new(core_count)),
            StrategyType::Scatter => ControlStrategy::Scatter(ScatterState::new(core_count)),
            StrategyType::Noop => ControlStrategy::Noop(NoopState),
            StrategyType::Autopin1 => {
                let options = &target.strategy.options;
                let schedule = options.get_list("schedule");
                let skip: Vec<i32> = options.get_list("skip").iter().filter_map(|s| s.parse().ok()).collect();
                autopin_warmup = Duration::from_secs(options.get_int("warmup_time", 1).max(0) as u64);
                autopin_measure = Duration::from_secs(options.get_int("measure_time", 1).max(1) as u64);
                let eligible_tids: Vec<i32> = known_tids.iter().copied().filter(|tid| !skip.contains(tid)).collect();
                let candidates = build_autopin1_candidates(&schedule, core_count, &eligible_tids, observed.pid);
                ControlStrategy::Autopin1(Autopin1State::new(candidates, direction, skip))
            }
            StrategyType::History => {
                let path = target
                    .pinning_history_load
                    .as_ref()
                    .ok_or_else(|| errors::bad_config("pinning_history", "History strategy requires PinningHistory.load"))?;
                let xml = std::fs::read_to_string(path)
                    .map_err(|e| errors::file_not_found("pinning_history", format!("{path}: {e}")))?;
                let history = history_xml::load_history(&xml, core_count, direction)?;
                ControlStrategy::History(HistoryState { history })
            }
        };

        let (sampling, sampling_reader) = if target.sampling {
            let engine = Arc::new(SamplingEngine::new(
                observed.pid as u32,
                topology.node_count().max(1),
                core_count,
                SAMPLING_PAGE_SIZE,
            ));
            let reader = match SamplingReader::spawn(engine.clone(), Arc::new(topology.clone()), SAMPLING_PAGE_SIZE) {
                Ok(reader) => Some(reader),
                Err(e) => {
                    log::warn!("Monitor/start: sampling reader failed to start: {e}");
                    None
                }
            };
            (Some(engine), reader)
        } else {
            (None, None)
        };

        // The `History` strategy applies the best phase-0 pinning from the
        // loaded log once at startup rather than recomputing one (§4.8).
        let initial_pinning = match &strategy {
            ControlStrategy::History(hs) => hs.history.best(0).map(|r| r.pinning.clone()),
            _ => None,
        };

        let mut watchdog = Self {
            os,
            topology,
            target,
            observed,
            trace_rx,
            monitors,
            strategy,
            sampling,
            sampling_reader,
            history: PinningHistory::new(direction),
            current_pinning: Pinning::empty(core_count),
            sensing_period: Duration::from_secs(1),
            last_migration_tick: Instant::now(),
            autopin_warmup,
            autopin_measure,
            autopin_phase_started: Instant::now(),
            exit_requested: Arc::new(AtomicBool::new(false)),
        };
        watchdog.sensing_period = Duration::from_secs(watchdog.target.sensing_period_secs);
        if let Some(pinning) = initial_pinning {
            watchdog.apply_pinning(&pinning);
        }
        Ok(watchdog)
    }

    pub fn request_exit(&self) -> Arc<AtomicBool> {
        self.exit_requested.clone()
    }

    /// The main loop: react to trace/comm events as they arrive, otherwise
    /// wake on `TICK` to drive the migration engine and periodic monitor work.
    pub fn run(&mut self) -> Result<(), AutopinError> {
        loop {
            if self.exit_requested.load(Ordering::SeqCst) {
                break;
            }
            match self.trace_rx.recv_timeout(TICK) {
                Ok(TraceEvent::TaskCreated(tid)) => self.on_task_created(tid),
                Ok(TraceEvent::TaskTerminated(tid)) => self.on_task_terminated(tid),
                Err(RecvTimeoutError::Timeout) => self.on_tick(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.shutdown();
        Ok(())
    }

    fn on_task_created(&mut self, tid: i32) {
        let pid = self.observed.pid;
        let new_pinning = match &mut self.strategy {
            ControlStrategy::Compact(s) => {
                s.on_task_created(&self.topology, pid, tid);
                Some(s.pinning.clone())
            }
            ControlStrategy::Scatter(s) => {
                s.on_task_created(&self.topology, pid, tid);
                Some(s.pinning.clone())
            }
            ControlStrategy::Noop(_) | ControlStrategy::Autopin1(_) | ControlStrategy::History(_) => None,
        };

        for monitor in self.monitors.values() {
            if let Err(e) = monitor.start(tid) {
                log::warn!("Monitor/reset: failed to start monitoring {tid}: {e}");
            }
        }

        if let Some(pinning) = new_pinning {
            self.apply_pinning(&pinning);
        }
    }

    fn on_task_terminated(&mut self, tid: i32) {
        match &mut self.strategy {
            ControlStrategy::Compact(s) => s.on_task_terminated(tid),
            ControlStrategy::Scatter(s) => s.on_task_terminated(&self.topology, tid),
            _ => {}
        }
        for monitor in self.monitors.values() {
            let _ = monitor.stop(tid);
        }
    }

    fn on_tick(&mut self) {
        self.drive_autopin1();

        if let Some(sampling) = &self.sampling {
            if self.last_migration_tick.elapsed() >= self.sensing_period {
                let controller = MigrationController::new(
                    sampling,
                    self.observed.pid,
                    self.topology.node_count().max(1),
                    self.sensing_period,
                    self.target.significance_threshold,
                );
                match controller.decide_and_migrate() {
                    Ok(report) => log::debug!(
                        "migrated {}/{} candidates ({} confirmed)",
                        report.migrated,
                        report.candidates_considered,
                        report.pages_confirmed_on_target
                    ),
                    Err(e) => log::warn!("{e}"),
                }
                self.last_migration_tick = Instant::now();
            }
        }
    }

    /// Drives the Autopin1 state machine (§4.8, Scenario S4) one step per
    /// tick: `Init` applies the next candidate and starts its warmup wait,
    /// `Warmup` arms monitors once `warmup_time` elapses, `Measure` stops
    /// them and records the result once `measure_time` elapses. `Done`
    /// applies the best-measured candidate exactly once.
    fn drive_autopin1(&mut self) {
        let warmup_elapsed = self.autopin_phase_started.elapsed() >= self.autopin_warmup;
        let measure_elapsed = self.autopin_phase_started.elapsed() >= self.autopin_measure;

        let next_candidate = match &mut self.strategy {
            ControlStrategy::Autopin1(state) if state.phase == AutopinPhase::Init => {
                match state.candidates.get(state.current).cloned() {
                    Some(pinning) => {
                        state.phase = AutopinPhase::Warmup;
                        Some(pinning)
                    }
                    None => {
                        state.phase = AutopinPhase::Done;
                        None
                    }
                }
            }
            _ => None,
        };
        if let Some(pinning) = next_candidate {
            self.apply_pinning(&pinning);
            self.autopin_phase_started = Instant::now();
            return;
        }

        let should_start_measuring =
            matches!(&self.strategy, ControlStrategy::Autopin1(s) if s.phase == AutopinPhase::Warmup) && warmup_elapsed;
        if should_start_measuring {
            for tid in self.current_candidate_tids() {
                for monitor in self.monitors.values() {
                    if let Err(e) = monitor.start(tid) {
                        log::warn!("Monitor/reset: failed to start monitoring {tid}: {e}");
                    }
                }
            }
            if let ControlStrategy::Autopin1(state) = &mut self.strategy {
                state.begin_measuring();
            }
            self.autopin_phase_started = Instant::now();
            return;
        }

        let should_finish_measuring =
            matches!(&self.strategy, ControlStrategy::Autopin1(s) if s.phase == AutopinPhase::Measure) && measure_elapsed;
        if should_finish_measuring {
            let tids = self.current_candidate_tids();
            let mut total = 0.0;
            for tid in &tids {
                for monitor in self.monitors.values() {
                    if let Ok(v) = monitor.stop(*tid) {
                        total += v;
                    }
                }
            }
            let phase_num = self.observed.phase();
            if let ControlStrategy::Autopin1(state) = &mut self.strategy {
                state.finish_measuring(phase_num, total, &mut self.history);
            }
            self.autopin_phase_started = Instant::now();

            let best = match &self.strategy {
                ControlStrategy::Autopin1(state) if state.is_done() => state.best_pinning(phase_num, &self.history),
                _ => None,
            };
            if let Some(best) = best {
                self.apply_pinning(&best);
            }
        }
    }

    fn current_candidate_tids(&self) -> Vec<i32> {
        match &self.strategy {
            ControlStrategy::Autopin1(state) => match state.candidates.get(state.current) {
                Some(pinning) => (0..pinning.core_count()).filter_map(|c| pinning.slot(c)).map(|t| t.tid as i32).collect(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Applies only the slots that changed between the current and the new
    /// pinning, so quiescent threads are never re-pinned needlessly.
    fn apply_pinning(&mut self, new_pinning: &Pinning) {
        for (core, changed) in diff_pinning(&self.current_pinning, new_pinning) {
            if let Some(task) = changed {
                if let Err(e) = self.os.set_affinity(task.tid as i32, core) {
                    log::warn!("System/get_threads: set_affinity({}, {core}) failed: {e}", task.tid);
                }
            }
        }
        self.current_pinning = new_pinning.clone();
    }

    /// Routes a decoded comm-channel message through the observed process's
    /// phase bookkeeping, resetting the Autopin1 state machine on a phase
    /// change per §4.8.
    pub fn handle_comm_message(&mut self, event_id: u64, arg: u64, val: f64) {
        match self.observed.handle_comm_message(event_id, arg, val) {
            Some(ProcessSignal::PhaseChanged(_)) => {
                if let ControlStrategy::Autopin1(s) = &mut self.strategy {
                    s.on_phase_changed();
                }
            }
            Some(ProcessSignal::UserMessage(_, _)) | None => {}
        }
    }

    /// Tears everything down in the reverse of construction order: tracer,
    /// comm channel, then (if configured) persists the pinning history.
    fn shutdown(&mut self) {
        self.observed.stop_tracer();
        self.os.tear_down_comm_channel();
        if let Some(reader) = self.sampling_reader.take() {
            reader.join();
        }

        if let Some(path) = &self.target.pinning_history_save {
            let hostname = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string());
            let now = Local::now();
            let xml = history_xml::save_history(
                &self.history,
                &hostname,
                &now.format("%Y-%m-%d").to_string(),
                &now.format("%H:%M:%S").to_string(),
            );
            if let Err(e) = std::fs::write(path, xml) {
                log::warn!("History/save: cannot write {path}: {e}");
            }
        }
    }
}

/// `energy_meters` dedups `EnergyMeterShared` instances by device address,
/// so two `clustsafe` monitor configs pointed at the same outlet strip share
/// one physical connection and one destructive-read fan-out (§4.5).
fn build_monitor(
    mc: &MonitorConfig,
    energy_meters: &mut HashMap<String, Arc<EnergyMeterShared>>,
) -> Result<PerformanceMonitor, AutopinError> {
    match mc.monitor_type {
        crate::config::MonitorType::Random => {
            let min = mc.options.get_str("min").and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let max = mc.options.get_str("max").and_then(|s| s.parse().ok()).unwrap_or(1.0);
            let seed = mc.options.get_int("seed", 1) as u64;
            Ok(PerformanceMonitor::random(min, max, seed))
        }
        crate::config::MonitorType::ClustSafe => {
            let addr = mc
                .options
                .get_str("address")
                .ok_or_else(|| errors::bad_config("monitor", format!("{}.address missing", mc.name)))?;
            let password = mc.options.get_str("password").unwrap_or("");
            let shared = match energy_meters.get(addr) {
                Some(shared) => shared.clone(),
                None => {
                    let client = ClustSafeClient::connect(addr, password)?;
                    let shared = EnergyMeterShared::new(client);
                    energy_meters.insert(addr.to_string(), shared.clone());
                    shared
                }
            };
            Ok(PerformanceMonitor::energy_meter(shared))
        }
        crate::config::MonitorType::Perf => {
            let config = parse_hex_or_dec(mc.options.get_str("event_config").unwrap_or("0"));
            Ok(PerformanceMonitor::legacy_perf(config))
        }
        crate::config::MonitorType::GPerf => {
            let processors: Vec<u32> = mc
                .options
                .get_list("processors")
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            let resolved = match mc.options.get_str("sensor") {
                Some(descriptor) => resolve_sensor(descriptor)?,
                None => ResolvedSensor {
                    attr_type: crate::perf::ffi::PERF_TYPE_RAW,
                    config: parse_hex_or_dec(mc.options.get_str("config").unwrap_or("0")),
                    config1: parse_hex_or_dec(mc.options.get_str("config1").unwrap_or("0")),
                    config2: parse_hex_or_dec(mc.options.get_str("config2").unwrap_or("0")),
                },
            };
            Ok(PerformanceMonitor::generic_perf(
                processors,
                resolved.attr_type,
                resolved.config,
                resolved.config1,
                resolved.config2,
            ))
        }
    }
}

/// Builds each `schedule` line (§4.8: colon-separated core indices) into a
/// candidate `Pinning` by assigning the currently known tids, in order, to
/// the cores the line names. Tasks created after bootstrap are not added to
/// later candidates; Autopin1 is defined over the process's initial threads.
fn build_autopin1_candidates(schedule: &[String], core_count: usize, tids: &[i32], pid: i32) -> Vec<Pinning> {
    schedule
        .iter()
        .map(|line| {
            let mut pinning = Pinning::empty(core_count);
            for (&tid, core_str) in tids.iter().zip(line.split(':')) {
                if let Ok(core) = core_str.trim().parse::<usize>() {
                    if core < core_count {
                        pinning.assign(
                            core,
                            Task {
                                pid: pid as u32,
                                tid: tid as u32,
                            },
                        );
                    }
                }
            }
            pinning
        })
        .collect()
}

fn parse_hex_or_dec(s: &str) -> u64 {
    s.strip_prefix("0x")
        .and_then(|h| u64::from_str_radix(h, 16).ok())
        .or_else(|| s.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Returns `(core, new_occupant)` for every slot that differs between `old`
/// and `new`, so callers only re-pin what actually moved.
fn diff_pinning(old: &Pinning, new: &Pinning) -> Vec<(usize, Option<Task>)> {
    (0..new.core_count())
        .filter(|&core| old.slot(core) != new.slot(core))
        .map(|core| (core, new.slot(core)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_pinning_reports_only_changed_slots() {
        let mut old = Pinning::empty(4);
        old.assign(0, Task { pid: 1, tid: 10 });

        let mut new = old.clone();
        new.assign(1, Task { pid: 1, tid: 11 });

        let diff = diff_pinning(&old, &new);
        assert_eq!(diff, vec![(1, Some(Task { pid: 1, tid: 11 }))]);
    }

    #[test]
    fn diff_pinning_is_empty_for_identical_pinnings() {
        let p = Pinning::empty(2);
        assert!(diff_pinning(&p, &p).is_empty());
    }

    #[test]
    fn parse_hex_or_dec_accepts_both_forms() {
        assert_eq!(parse_hex_or_dec("0x2e"), 0x2e);
        assert_eq!(parse_hex_or_dec("46"), 46);
        assert_eq!(parse_hex_or_dec("not_a_number"), 0);
    }
}
