//! Async-signal-safe SIGCHLD dispatch (§5): a `signalfd`-free self-pipe, the
//! handler only writes one byte, everything else happens on the reading
//! side. Grounded on `nix`'s `signal`/`fs` features already in the dependency
//! table rather than pulling in a separate signal-handling crate.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{self, close};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_sigchld(_: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [0u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Installs the SIGCHLD handler and returns the read end of the self-pipe.
/// A byte becomes readable on that fd each time a child changes state;
/// the reader should then do a non-blocking `waitpid(-1, WNOHANG)` reap loop.
pub struct SigchldPipe {
    read_fd: OwnedFd,
    write_fd: RawFd,
}

impl SigchldPipe {
    pub fn install() -> io::Result<Self> {
        let (read, write) = unistd::pipe().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let read_flags = fcntl(read.as_raw_fd(), FcntlArg::F_GETFL).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        fcntl(
            read.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(read_flags) | OFlag::O_NONBLOCK),
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let write_fd = write.as_raw_fd();
        WRITE_FD.store(write_fd, Ordering::Relaxed);
        std::mem::forget(write); // lives for the process; released on shutdown via close()

        let action = SigAction::new(SigHandler::Handler(handle_sigchld), SaFlags::SA_RESTART, SigSet::empty());
        unsafe {
            signal::sigaction(Signal::SIGCHLD, &action).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        }

        Ok(Self {
            read_fd: read,
            write_fd,
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Drains every pending wakeup byte without blocking.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.read_fd.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
            }
        }
    }
}

impl Drop for SigchldPipe {
    fn drop(&mut self) {
        WRITE_FD.store(-1, Ordering::Relaxed);
        let _ = close(self.write_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_drain_does_not_block_with_no_pending_signal() {
        let pipe = SigchldPipe::install().expect("sigaction should succeed under test");
        pipe.drain();
    }
}
