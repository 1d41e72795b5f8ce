//! `ObservedProcess` and `ProcessTree` (§3 / §4.4).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::time::Duration;

use crate::error::{errors, AutopinError};
use crate::os::OsServices;
use crate::trace::{TraceEngine, TraceEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNode {
    pub pid: i32,
    pub tids: Vec<i32>,
    pub children: BTreeMap<i32, ProcessNode>,
}

/// An immutable BFS snapshot of the observed tree, rooted at the target pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTree {
    pub root: ProcessNode,
}

impl ProcessTree {
    /// Rebuilds the tree from `OsServices`, breadth-first from `root_pid`.
    pub fn snapshot(os: &OsServices, root_pid: i32) -> Result<Self, AutopinError> {
        let root = build_node(os, root_pid)?;
        Ok(Self { root })
    }

    pub fn all_tids(&self) -> Vec<i32> {
        let mut out = Vec::new();
        collect_tids(&self.root, &mut out);
        out
    }
}

fn build_node(os: &OsServices, pid: i32) -> Result<ProcessNode, AutopinError> {
    let mut tids: Vec<i32> = os.threads_of(pid)?.into_iter().collect();
    tids.sort_unstable();

    let mut children = BTreeMap::new();
    for child_pid in os.children_of(pid)? {
        // a child that died between enumeration and descent is a warning,
        // not a reason to fail the whole snapshot.
        match build_node(os, child_pid) {
            Ok(node) => {
                children.insert(child_pid, node);
            }
            Err(e) => log::warn!("System/get_threads: {e}"),
        }
    }

    Ok(ProcessNode {
        pid,
        tids,
        children,
    })
}

fn collect_tids(node: &ProcessNode, out: &mut Vec<i32>) {
    out.extend(node.tids.iter().copied());
    for child in node.children.values() {
        collect_tids(child, out);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessSignal {
    PhaseChanged(u32),
    UserMessage(u64, f64),
}

pub enum AttachTarget {
    Pid(i32),
    Name(String),
    Command(String),
}

/// Owns the target's lifecycle: attach-or-spawn, comm channel, tracer, and
/// the execution-phase counter driven by comm-channel messages.
pub struct ObservedProcess<'a> {
    os: &'a OsServices,
    pub pid: i32,
    phase: u32,
    tracer: Option<TraceEngine>,
}

impl<'a> ObservedProcess<'a> {
    /// Resolves `target`, starting the process or attaching to it, then
    /// performs the ordered startup sequence §4.4 specifies: comm channel,
    /// tracer, comm-channel connect wait, synthetic root `TaskCreated`.
    pub fn start(
        os: &'a OsServices,
        target: AttachTarget,
        comm_chan: Option<PathBuf>,
        comm_chan_timeout: u64,
        trace: bool,
    ) -> Result<(Self, std::sync::mpsc::Receiver<TraceEvent>), AutopinError> {
        let pid = match target {
            AttachTarget::Pid(pid) => pid,
            AttachTarget::Name(name) => {
                let pids = os.pid_of(&name)?;
                match pids.len() {
                    0 => return Err(errors::process("not_found", format!("no process named {name}"))),
                    1 => *pids.iter().next().unwrap(),
                    _ => return Err(errors::process("not_found", format!("ambiguous name {name}"))),
                }
            }
            AttachTarget::Command(cmd) => os.spawn_process(&cmd, trace)?.as_raw(),
        };

        if let Some(path) = &comm_chan {
            os.init_comm_channel(path)?;
        }

        let (tx, rx) = channel();
        let tracer = if trace {
            let initial_tasks = os.threads_of(pid)?;
            let (engine, _handle) = TraceEngine::attach(pid, &initial_tasks, tx.clone())?;
            Some(engine)
        } else {
            None
        };

        if comm_chan.is_some() {
            os.connect_comm_channel(comm_chan_timeout)?;
        }

        let _ = tx.send(TraceEvent::TaskCreated(pid));

        Ok((
            Self {
                os,
                pid,
                phase: 0,
                tracer,
            },
            rx,
        ))
    }

    pub fn process_tree(&self) -> Result<ProcessTree, AutopinError> {
        ProcessTree::snapshot(self.os, self.pid)
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Maps a raw comm-channel message to the signal strategies observe.
    pub fn handle_comm_message(
        &mut self,
        event_id: u64,
        arg: u64,
        val: f64,
    ) -> Option<ProcessSignal> {
        match event_id {
            crate::os::comm::APP_NEW_PHASE => {
                self.phase = arg as u32;
                Some(ProcessSignal::PhaseChanged(self.phase))
            }
            crate::os::comm::APP_USER => Some(ProcessSignal::UserMessage(arg, val)),
            _ => None,
        }
    }

    pub fn stop_tracer(&self) {
        if let Some(tracer) = &self.tracer {
            tracer.request_exit();
        }
        let _ = Duration::from_secs(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(pid: i32, tids: &[i32]) -> ProcessNode {
        ProcessNode {
            pid,
            tids: tids.to_vec(),
            children: BTreeMap::new(),
        }
    }

    #[test]
    fn all_tids_walks_the_whole_tree() {
        let mut children = BTreeMap::new();
        children.insert(2, leaf(2, &[20, 21]));
        let tree = ProcessTree {
            root: ProcessNode {
                pid: 1,
                tids: vec![10, 11],
                children,
            },
        };
        let mut tids = tree.all_tids();
        tids.sort_unstable();
        assert_eq!(tids, vec![10, 11, 20, 21]);
    }

    #[test]
    fn new_phase_message_updates_phase_and_emits_signal() {
        let os = OsServices::new();
        let mut p = ObservedProcess {
            os: &os,
            pid: 1,
            phase: 0,
            tracer: None,
        };
        let sig = p.handle_comm_message(crate::os::comm::APP_NEW_PHASE, 3, 0.0);
        assert_eq!(p.phase(), 3);
        assert_eq!(sig, Some(ProcessSignal::PhaseChanged(3)));
    }

    #[test]
    fn user_message_passes_through_unchanged() {
        let os = OsServices::new();
        let mut p = ObservedProcess {
            os: &os,
            pid: 1,
            phase: 0,
            tracer: None,
        };
        let sig = p.handle_comm_message(crate::os::comm::APP_USER, 9, 1.5);
        assert_eq!(sig, Some(ProcessSignal::UserMessage(9, 1.5)));
    }
}
