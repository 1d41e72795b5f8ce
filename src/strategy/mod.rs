//! `ControlStrategy` (§4.8), re-architected as a tagged variant per §9:
//! Autopin1, History, Compact, Scatter, Noop share one event-hook contract.

pub mod history_xml;

use std::collections::HashMap;

use crate::pinning::{OptimisationDirection, Pinning, PinningHistory, Task};
use crate::topology::CpuTopology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutopinPhase {
    Init,
    Warmup,
    Measure,
    Done,
}

pub struct Autopin1State {
    pub candidates: Vec<Pinning>,
    pub phase: AutopinPhase,
    pub current: usize,
    pub direction: OptimisationDirection,
    pub skip: Vec<i32>,
}

impl Autopin1State {
    pub fn new(candidates: Vec<Pinning>, direction: OptimisationDirection, skip: Vec<i32>) -> Self {
        Self {
            candidates,
            phase: AutopinPhase::Init,
            current: 0,
            direction,
            skip,
        }
    }

    /// A `PhaseChanged` signal resets the state machine to `Init` on the
    /// current candidate (§4.8), it does not restart from candidate 0.
    pub fn on_phase_changed(&mut self) {
        self.phase = AutopinPhase::Init;
    }

    /// Drives one candidate through `Init -> Warmup -> Measure`, recording
    /// its measured value, then advances. The caller supplies the measured
    /// value (obtained from the monitor after `warmup_time`/`measure_time`
    /// elapse) since those are wall-clock suspension points owned by the
    /// Watchdog's event loop, not this state machine.
    pub fn measure_candidate(
        &mut self,
        execution_phase: u32,
        measured_value: f64,
        history: &mut PinningHistory,
    ) {
        self.phase = AutopinPhase::Warmup;
        let pinning = self.candidates[self.current].clone();
        self.phase = AutopinPhase::Measure;
        history.record(execution_phase, pinning, measured_value);

        self.current += 1;
        if self.current >= self.candidates.len() {
            self.phase = AutopinPhase::Done;
        } else {
            self.phase = AutopinPhase::Init;
        }
    }

    /// Like [`Autopin1State::measure_candidate`] but split across the
    /// Watchdog's warmup/measure wall-clock waits: call once warmup elapses
    /// to arm monitors, then [`Autopin1State::finish_measuring`] once
    /// measure elapses.
    pub fn begin_measuring(&mut self) {
        self.phase = AutopinPhase::Measure;
    }

    pub fn finish_measuring(&mut self, execution_phase: u32, measured_value: f64, history: &mut PinningHistory) {
        let pinning = self.candidates[self.current].clone();
        history.record(execution_phase, pinning, measured_value);

        self.current += 1;
        self.phase = if self.current >= self.candidates.len() {
            AutopinPhase::Done
        } else {
            AutopinPhase::Init
        };
    }

    pub fn is_done(&self) -> bool {
        self.phase == AutopinPhase::Done
    }

    pub fn best_pinning(&self, execution_phase: u32, history: &PinningHistory) -> Option<Pinning> {
        history.best(execution_phase).map(|r| r.pinning.clone())
    }
}

pub struct CompactState {
    pub pinning: Pinning,
}

impl CompactState {
    pub fn new(core_count: usize) -> Self {
        Self {
            pinning: Pinning::empty(core_count),
        }
    }

    /// Pins `tid` to the free core minimising distance to any core already
    /// occupied by the observed pid; ties broken by lowest core index (S1).
    pub fn on_task_created(&mut self, topology: &CpuTopology, pid: i32, tid: i32) -> Option<usize> {
        let occupied: Vec<u32> = self.pinning.occupied_cores().map(|c| c as u32).collect();
        let target = if occupied.is_empty() {
            self.pinning.free_cores().min()?
        } else {
            self.pinning
                .free_cores()
                .min_by_key(|&core| {
                    let node = topology.node_of_core(core as u32).unwrap_or(0);
                    occupied
                        .iter()
                        .map(|&oc| {
                            let other_node = topology.node_of_core(oc).unwrap_or(0);
                            topology.distance(node, other_node)
                        })
                        .min()
                        .unwrap_or(u32::MAX)
                })?
        };
        self.pinning.assign(
            target,
            Task {
                pid: pid as u32,
                tid: tid as u32,
            },
        );
        Some(target)
    }

    pub fn on_task_terminated(&mut self, tid: i32) {
        self.pinning.clear_tid(tid as u32);
    }
}

pub struct ScatterState {
    pub pinning: Pinning,
    node_counts: HashMap<u32, u32>,
}

impl ScatterState {
    pub fn new(core_count: usize) -> Self {
        Self {
            pinning: Pinning::empty(core_count),
            node_counts: HashMap::new(),
        }
    }

    /// Pins `tid` to a free core on the node currently holding the fewest
    /// tids of the observed pid, ascending node index breaking ties (S2).
    pub fn on_task_created(&mut self, topology: &CpuTopology, pid: i32, tid: i32) -> Option<usize> {
        let mut nodes: Vec<u32> = topology.nodes().collect();
        nodes.sort_unstable();
        let target_node = nodes
            .into_iter()
            .filter(|n| topology.cores_of_node(*n).iter().any(|c| self.pinning.slot(*c as usize).is_none()))
            .min_by_key(|n| *self.node_counts.get(n).unwrap_or(&0))?;

        let core = topology
            .cores_of_node(target_node)
            .iter()
            .find(|&&c| self.pinning.slot(c as usize).is_none())
            .copied()?;

        self.pinning.assign(
            core as usize,
            Task {
                pid: pid as u32,
                tid: tid as u32,
            },
        );
        *self.node_counts.entry(target_node).or_insert(0) += 1;
        Some(core as usize)
    }

    pub fn on_task_terminated(&mut self, topology: &CpuTopology, tid: i32) {
        if let Some(core) = self.pinning.clear_tid(tid as u32) {
            if let Some(node) = topology.node_of_core(core as u32) {
                if let Some(count) = self.node_counts.get_mut(&node) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }
}

pub struct HistoryState {
    pub history: PinningHistory,
}

pub struct NoopState;

pub enum ControlStrategy {
    Autopin1(Autopin1State),
    History(HistoryState),
    Compact(CompactState),
    Scatter(ScatterState),
    Noop(NoopState),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_four_core_topology() -> CpuTopology {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("online"), "0-1\n").unwrap();
        for (node, cpus) in [(0, "0-3"), (1, "4-7")] {
            let node_dir = dir.path().join(format!("node{node}"));
            std::fs::create_dir_all(&node_dir).unwrap();
            std::fs::write(node_dir.join("cpulist"), cpus).unwrap();
            std::fs::write(node_dir.join("distance"), "10 20\n").unwrap();
        }
        CpuTopology::discover_at(dir.path())
    }

    #[test]
    fn scenario_s1_compact_pinning() {
        let topo = two_node_four_core_topology();
        let mut s = CompactState::new(topo.core_count());
        let first = s.on_task_created(&topo, 1, 100).unwrap();
        let second = s.on_task_created(&topo, 1, 101).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }

    #[test]
    fn scenario_s2_scatter_pinning() {
        let topo = two_node_four_core_topology();
        let mut s = ScatterState::new(topo.core_count());
        let first = s.on_task_created(&topo, 1, 100).unwrap();
        let second = s.on_task_created(&topo, 1, 101).unwrap();
        let third = s.on_task_created(&topo, 1, 102).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 4);
        assert_eq!(third, 1);
    }

    #[test]
    fn scenario_s4_autopin1_selects_the_better_candidate() {
        let mut history = PinningHistory::new(OptimisationDirection::Max);
        let mut a = Pinning::empty(4);
        a.assign(0, Task { pid: 1, tid: 10 });
        let mut b = Pinning::empty(4);
        b.assign(1, Task { pid: 1, tid: 10 });

        let mut state = Autopin1State::new(vec![a.clone(), b.clone()], OptimisationDirection::Max, vec![]);
        state.measure_candidate(0, 5.0, &mut history);
        state.measure_candidate(0, 7.0, &mut history);

        assert!(state.is_done());
        let best = state.best_pinning(0, &history).unwrap();
        assert_eq!(best, b);
        assert_eq!(history.best(0).unwrap().value, 7.0);
    }

    #[test]
    fn phase_changed_resets_to_init_on_current_candidate() {
        let mut history = PinningHistory::new(OptimisationDirection::Max);
        let mut a = Pinning::empty(2);
        a.assign(0, Task { pid: 1, tid: 1 });
        let mut state = Autopin1State::new(vec![a], OptimisationDirection::Max, vec![]);
        state.measure_candidate(0, 1.0, &mut history);
        assert!(state.is_done());
        state.on_phase_changed();
        assert_eq!(state.phase, AutopinPhase::Init);
        assert_eq!(state.current, 1, "resets phase, not the candidate index");
    }

    #[test]
    fn scatter_decrements_node_count_on_terminate() {
        let topo = two_node_four_core_topology();
        let mut s = ScatterState::new(topo.core_count());
        s.on_task_created(&topo, 1, 100);
        s.on_task_terminated(&topo, 100);
        let next = s.on_task_created(&topo, 1, 101).unwrap();
        assert_eq!(next, 0, "freed node 0 should be chosen again");
    }
}
