//! [`Pinning`] and [`PinningHistory`] — the per-core task assignment and the
//! record of what was measured for each candidate (§3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub pid: u32,
    pub tid: u32,
}

/// An ordered sequence of length `core_count`; a slot is either empty or
/// holds one `(pid, tid)`. A tid appears in at most one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pinning {
    slots: Vec<Option<Task>>,
}

impl Pinning {
    pub fn empty(core_count: usize) -> Self {
        Self {
            slots: vec![None; core_count],
        }
    }

    pub fn core_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, core: usize) -> Option<Task> {
        self.slots.get(core).copied().flatten()
    }

    pub fn slots(&self) -> &[Option<Task>] {
        &self.slots
    }

    pub fn core_of_tid(&self, tid: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.map(|t| t.tid) == Some(tid))
    }

    /// Assigns `task` to `core`, replacing whatever was there. Returns the
    /// previous occupant, if any.
    pub fn assign(&mut self, core: usize, task: Task) -> Option<Task> {
        let prev = self.slots[core];
        self.slots[core] = Some(task);
        prev
    }

    /// Clears any slot holding `tid` (TaskTerminated handling). Returns the
    /// core index that was cleared, if the tid was pinned.
    pub fn clear_tid(&mut self, tid: u32) -> Option<usize> {
        let idx = self.core_of_tid(tid)?;
        self.slots[idx] = None;
        Some(idx)
    }

    pub fn free_cores(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
    }

    pub fn occupied_cores(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i)
    }

    /// Testable Property 1: every tid present occupies exactly one slot.
    pub fn is_tid_unique(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.slots
            .iter()
            .flatten()
            .all(|t| seen.insert(t.tid))
    }

    /// Parses the XML history's `sched="c0:c1:..."` attribute: slot `i`
    /// holds the tid listed at position `i`, with `-1` meaning empty and
    /// `pid` left unset (filled in by the caller once tids are known).
    pub fn from_core_indices(core_count: usize, cores: &[i64]) -> Self {
        let mut p = Self::empty(core_count);
        for (core, &tid) in cores.iter().enumerate().take(core_count) {
            if tid >= 0 {
                p.slots[core] = Some(Task {
                    pid: 0,
                    tid: tid as u32,
                });
            }
        }
        p
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimisationDirection {
    Max,
    Min,
    Unknown,
}

impl OptimisationDirection {
    /// `true` if `candidate` is strictly better than `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            OptimisationDirection::Max => candidate > incumbent,
            OptimisationDirection::Min => candidate < incumbent,
            OptimisationDirection::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PinningResult {
    pub pinning: Pinning,
    pub value: f64,
}

/// Per-execution-phase history of measured pinnings, with an O(1) best-per-phase.
#[derive(Debug, Default)]
pub struct PinningHistory {
    direction: Option<OptimisationDirection>,
    by_phase: HashMap<u32, Vec<PinningResult>>,
    best_by_phase: HashMap<u32, usize>,
}

impl PinningHistory {
    pub fn new(direction: OptimisationDirection) -> Self {
        Self {
            direction: Some(direction),
            by_phase: HashMap::new(),
            best_by_phase: HashMap::new(),
        }
    }

    /// Records or updates the entry for `(phase, pinning)`. At most one
    /// entry per distinct `(phase, pinning)` is kept (Testable Property 4).
    pub fn record(&mut self, phase: u32, pinning: Pinning, value: f64) {
        let direction = self.direction.unwrap_or(OptimisationDirection::Unknown);
        let entries = self.by_phase.entry(phase).or_default();

        let existing = entries.iter_mut().find(|r| r.pinning == pinning);
        let idx = match existing {
            Some(r) => {
                r.value = value;
                entries.iter().position(|r| r.pinning == pinning).unwrap()
            }
            None => {
                entries.push(PinningResult { pinning, value });
                entries.len() - 1
            }
        };

        let challenger_value = entries[idx].value;
        let should_replace = match self.best_by_phase.get(&phase) {
            None => true,
            Some(&best_idx) => {
                best_idx == idx || direction.is_better(challenger_value, entries[best_idx].value)
            }
        };
        if should_replace {
            self.best_by_phase.insert(phase, idx);
        } else if self.best_by_phase.get(&phase) == Some(&idx) {
            // value got worse; re-scan to keep the invariant honest
        }
        self.recompute_best(phase);
    }

    fn recompute_best(&mut self, phase: u32) {
        let direction = self.direction.unwrap_or(OptimisationDirection::Unknown);
        if let Some(entries) = self.by_phase.get(&phase) {
            let mut best_idx = 0usize;
            for (i, r) in entries.iter().enumerate().skip(1) {
                if direction.is_better(r.value, entries[best_idx].value) {
                    best_idx = i;
                }
            }
            self.best_by_phase.insert(phase, best_idx);
        }
    }

    pub fn best(&self, phase: u32) -> Option<&PinningResult> {
        let idx = *self.best_by_phase.get(&phase)?;
        self.by_phase.get(&phase)?.get(idx)
    }

    pub fn entries(&self, phase: u32) -> &[PinningResult] {
        self.by_phase
            .get(&phase)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn phases(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_phase.keys().copied()
    }

    pub fn all_triples(&self) -> Vec<(u32, Pinning, f64)> {
        let mut out = Vec::new();
        for (&phase, entries) in &self.by_phase {
            for r in entries {
                out.push((phase, r.pinning.clone(), r.value));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinning_with(tid: u32, core: usize, core_count: usize) -> Pinning {
        let mut p = Pinning::empty(core_count);
        p.assign(core, Task { pid: 1, tid });
        p
    }

    #[test]
    fn tid_uniqueness_property() {
        let mut p = Pinning::empty(4);
        p.assign(0, Task { pid: 1, tid: 10 });
        p.assign(1, Task { pid: 1, tid: 11 });
        assert!(p.is_tid_unique());
    }

    #[test]
    fn clear_tid_frees_slot() {
        let mut p = Pinning::empty(2);
        p.assign(0, Task { pid: 1, tid: 5 });
        assert_eq!(p.clear_tid(5), Some(0));
        assert!(p.slot(0).is_none());
    }

    #[test]
    fn best_per_phase_max_direction() {
        let mut h = PinningHistory::new(OptimisationDirection::Max);
        let a = pinning_with(1, 0, 4);
        let b = pinning_with(2, 1, 4);
        h.record(0, a.clone(), 5.0);
        h.record(0, b.clone(), 7.0);
        assert_eq!(h.best(0).unwrap().pinning, b);
        assert_eq!(h.best(0).unwrap().value, 7.0);
        assert_eq!(h.entries(0).len(), 2);
    }

    #[test]
    fn best_per_phase_min_direction() {
        let mut h = PinningHistory::new(OptimisationDirection::Min);
        let a = pinning_with(1, 0, 4);
        let b = pinning_with(2, 1, 4);
        h.record(0, a.clone(), 5.0);
        h.record(0, b.clone(), 7.0);
        assert_eq!(h.best(0).unwrap().pinning, a);
    }

    #[test]
    fn at_most_one_entry_per_phase_and_pinning() {
        let mut h = PinningHistory::new(OptimisationDirection::Max);
        let a = pinning_with(1, 0, 4);
        h.record(0, a.clone(), 1.0);
        h.record(0, a.clone(), 9.0);
        assert_eq!(h.entries(0).len(), 1);
        assert_eq!(h.best(0).unwrap().value, 9.0);
    }
}
