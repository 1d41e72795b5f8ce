//! `OsServices` — the single seam between the rest of the crate and the
//! kernel: process spawn, affinity, `/proc` enumeration, and the comm
//! channel. Built on `nix`/`procfs`.

pub mod comm;

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::{close, fork, pipe, read as nix_read, ForkResult, Pid};
use procfs::process::{all_processes, Process};

use crate::error::{errors, AutopinError};
use comm::CommMessage;

pub struct CommChannel {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    stream: Option<UnixStream>,
}

/// Wraps the kernel and `/proc` boundary. `proc_mutex` and `attach_mutex`
/// serialize the operations §5 calls out as needing one: `/proc` scans
/// and tracer attach, respectively.
pub struct OsServices {
    proc_mutex: Mutex<()>,
    attach_mutex: Mutex<()>,
    comm: Mutex<Option<CommChannel>>,
    pending_release: Mutex<HashMap<Pid, OwnedFd>>,
}

impl Default for OsServices {
    fn default() -> Self {
        Self::new()
    }
}

impl OsServices {
    pub fn new() -> Self {
        Self {
            proc_mutex: Mutex::new(()),
            attach_mutex: Mutex::new(()),
            comm: Mutex::new(None),
            pending_release: Mutex::new(HashMap::new()),
        }
    }

    /// Forks and execs `command`. When `wait_for_attach` is set, the child
    /// blocks on a pipe read before `execvp` so the controller can attach
    /// its tracer first; the parent releases it with a one-byte write.
    pub fn spawn_process(&self, command: &str, wait_for_attach: bool) -> Result<Pid, AutopinError> {
        let argv: Vec<CString> = command
            .split_whitespace()
            .map(|s| CString::new(s).unwrap())
            .collect();
        if argv.is_empty() {
            return Err(errors::process("spawn", "empty command line"));
        }

        let (read_fd, write_fd) = if wait_for_attach {
            let (r, w) = pipe().map_err(|e| errors::system("spawn", e.to_string()))?;
            (Some(r), Some(w))
        } else {
            (None, None)
        };

        match unsafe { fork() }.map_err(|e| errors::process("spawn", e.to_string()))? {
            ForkResult::Child => {
                if let Some(w) = write_fd {
                    let _ = close(w);
                }
                if let Some(r) = read_fd {
                    let mut byte = [0u8; 1];
                    let _ = nix_read(r.as_raw_fd(), &mut byte);
                }
                let _ = nix::unistd::execvp(&argv[0], &argv);
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                if let Some(r) = read_fd {
                    let _ = close(r.as_raw_fd());
                }
                if let Some(w) = write_fd {
                    // Released once the caller has finished attaching its
                    // tracer; the child blocks on `read_fd` until then.
                    self.pending_release.lock().unwrap().insert(child, w);
                }
                Ok(child)
            }
        }
    }

    /// Lets a child spawned with `wait_for_attach` proceed to `execvp`.
    pub fn release_wait_for_attach(&self, pid: Pid) {
        if let Some(w) = self.pending_release.lock().unwrap().remove(&pid) {
            let _ = nix::unistd::write(&w, &[0u8]);
        }
    }

    /// Pins `tid` to a single CPU. Non-fatal: the caller logs and continues
    /// on failure per §4.2.
    pub fn set_affinity(&self, tid: i32, cpu_index: usize) -> Result<(), AutopinError> {
        let mut set = CpuSet::new();
        set.set(cpu_index)
            .map_err(|e| errors::system("set_affinity", e.to_string()))?;
        sched_setaffinity(Pid::from_raw(tid), &set)
            .map_err(|e| errors::system("set_affinity", e.to_string()))
    }

    pub fn init_comm_channel(&self, path: &Path) -> Result<(), AutopinError> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| errors::comm("bind", format!("{}: {e}", path.display())))?;
        *self.comm.lock().unwrap() = Some(CommChannel {
            socket_path: path.to_path_buf(),
            listener: Some(listener),
            stream: None,
        });
        Ok(())
    }

    /// Blocks, up to `timeout_s`, for the observed application to connect.
    pub fn connect_comm_channel(&self, timeout_s: u64) -> Result<(), AutopinError> {
        let mut guard = self.comm.lock().unwrap();
        let channel = guard
            .as_mut()
            .ok_or_else(|| errors::comm("connect", "comm channel not initialized"))?;
        let listener = channel
            .listener
            .take()
            .ok_or_else(|| errors::comm("connect", "already connected"))?;
        listener
            .set_nonblocking(false)
            .map_err(|e| errors::comm("connect", e.to_string()))?;

        let deadline = Instant::now() + Duration::from_secs(timeout_s);
        listener
            .set_nonblocking(true)
            .map_err(|e| errors::comm("connect", e.to_string()))?;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    channel.stream = Some(stream);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(errors::comm("connect", "timed out waiting for app"));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(errors::comm("connect", e.to_string())),
            }
        }
    }

    pub fn send_msg(&self, event_id: u64, arg: u64, val: f64) -> Result<(), AutopinError> {
        use std::io::Write;
        let mut guard = self.comm.lock().unwrap();
        let channel = guard
            .as_mut()
            .ok_or_else(|| errors::comm("send", "comm channel not initialized"))?;
        let stream = channel
            .stream
            .as_mut()
            .ok_or_else(|| errors::comm("send", "app not connected"))?;
        let msg = CommMessage::new(event_id, arg, val);
        stream
            .write_all(&msg.encode())
            .map_err(|e| errors::comm("send", e.to_string()))
    }

    pub fn tear_down_comm_channel(&self) {
        if let Some(channel) = self.comm.lock().unwrap().take() {
            let _ = std::fs::remove_file(&channel.socket_path);
        }
    }

    pub fn pid_of(&self, name: &str) -> Result<HashSet<i32>, AutopinError> {
        let _guard = self.proc_mutex.lock().unwrap();
        let mut out = HashSet::new();
        for proc in all_processes().map_err(|e| errors::system("pid_of", e.to_string()))? {
            let Ok(proc) = proc else { continue };
            if let Ok(stat) = proc.stat() {
                if stat.comm == name {
                    out.insert(proc.pid());
                }
            }
        }
        Ok(out)
    }

    pub fn cmd_of(&self, pid: i32) -> Result<String, AutopinError> {
        let _guard = self.proc_mutex.lock().unwrap();
        let proc = Process::new(pid).map_err(|e| errors::process("not_found", e.to_string()))?;
        let cmdline = proc
            .cmdline()
            .map_err(|e| errors::system("cmd_of", e.to_string()))?;
        Ok(cmdline.join(" "))
    }

    pub fn threads_of(&self, pid: i32) -> Result<HashSet<i32>, AutopinError> {
        let _guard = self.proc_mutex.lock().unwrap();
        let proc = Process::new(pid).map_err(|e| errors::system("get_threads", e.to_string()))?;
        let mut out = HashSet::new();
        match proc.tasks() {
            Ok(tasks) => {
                for task in tasks {
                    if let Ok(task) = task {
                        out.insert(task.tid);
                    }
                }
            }
            Err(e) => return Err(errors::system("get_threads", e.to_string())),
        }
        Ok(out)
    }

    pub fn children_of(&self, pid: i32) -> Result<HashSet<i32>, AutopinError> {
        let _guard = self.proc_mutex.lock().unwrap();
        let mut out = HashSet::new();
        for proc in all_processes().map_err(|e| errors::system("children_of", e.to_string()))? {
            let Ok(proc) = proc else { continue };
            if let Ok(stat) = proc.stat() {
                if stat.ppid == pid {
                    out.insert(proc.pid());
                }
            }
        }
        Ok(out)
    }

    /// The task's creation timestamp, from `/proc/<tid>/stat` field 22
    /// (`starttime`), used only to impose a deterministic order on peers.
    pub fn task_sort_key(&self, tid: i32) -> Result<u64, AutopinError> {
        let _guard = self.proc_mutex.lock().unwrap();
        let proc = Process::new(tid).map_err(|e| errors::system("task_sort_key", e.to_string()))?;
        let stat = proc
            .stat()
            .map_err(|e| errors::system("task_sort_key", e.to_string()))?;
        Ok(stat.starttime)
    }

    pub fn attach_mutex(&self) -> &Mutex<()> {
        &self.attach_mutex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn comm_channel_round_trips_a_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comm.sock");
        let os = OsServices::new();
        os.init_comm_channel(&path).unwrap();

        let path_clone = path.clone();
        let client = std::thread::spawn(move || {
            // retry until the listener is accepting
            for _ in 0..100 {
                if let Ok(mut stream) = UnixStream::connect(&path_clone) {
                    let mut buf = [0u8; comm::WIRE_LEN];
                    stream.read_exact(&mut buf).unwrap();
                    return comm::CommMessage::decode(&buf);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            panic!("never connected");
        });

        os.connect_comm_channel(5).unwrap();
        os.send_msg(comm::APP_READY, 0, 0.0).unwrap();
        let received = client.join().unwrap();
        assert_eq!(received, comm::CommMessage::new(comm::APP_READY, 0, 0.0));
        os.tear_down_comm_channel();
    }
}
