//! Self-pipe that turns asynchronous signal delivery into a readable
//! descriptor event (SPEC_FULL §4.1).
//!
//! The OS signal handler itself does nothing but `write(2)` one byte to the
//! pipe's write end — the only operation POSIX guarantees is
//! async-signal-safe. Everything else (deciding what a byte means, draining
//! the pipe, rebuilding it on error) happens on the supervisor thread.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::pollset::{PollSet, Ready, Token};
use crate::sys::fd::{set_cloexec_raw, set_nonblocking_raw};

/// Write end published for `libc::write` inside the signal handler. `-1`
/// means "no pipe installed yet" — the handler drops the signal rather than
/// writing to a closed descriptor.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// The wire format is just the raw POSIX signal number truncated to a byte;
/// `control::handle_event` dispatches on it directly rather than on an
/// internal tag set, since the handler only ever has a `libc::c_int` to hand
/// over.
extern "C" fn deliver(sig: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        unsafe {
            libc::write(fd, std::ptr::addr_of!(byte).cast::<libc::c_void>(), 1);
        }
    }
}

/// Signals the supervisor reacts to (SPEC_FULL §6). `SIGCHLD` feeds the
/// Child Reaper; the rest feed the Control Dispatcher.
const HANDLED_SIGNALS: &[libc::c_int] = &[
    libc::SIGCHLD,
    libc::SIGHUP,
    libc::SIGUSR1,
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGQUIT,
];

/// # Safety
/// Must be called at most once per pipe write-fd generation: installs a
/// process-wide handler, so calling it concurrently from two `SignalPipe`s
/// racing `WRITE_FD` would be unsound.
unsafe fn install_handlers() {
    for &sig in HANDLED_SIGNALS {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = deliver as *const () as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// A pair of connected descriptors: the read end lives in the Poll Set, the
/// write end is published to the signal handler and to `post` callers.
pub struct SignalPipe {
    read_fd: RawFd,
    write_fd: RawFd,
    token: Token,
}

impl SignalPipe {
    /// Creates the pipe, installs OS signal handlers, and registers the
    /// read end with `poll_set`.
    pub fn init(poll_set: &mut PollSet) -> std::io::Result<SignalPipe> {
        let (read_fd, write_fd) = make_pipe()?;
        WRITE_FD.store(write_fd, Ordering::Relaxed);
        unsafe { install_handlers() };
        let token = poll_set.add(read_fd, Ready::readable())?;
        Ok(SignalPipe {
            read_fd,
            write_fd,
            token,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Async-signal-safe: a single nonblocking `write(2)`. Failure (a full
    /// pipe, or `EAGAIN`) is silently ignored per SPEC_FULL §4.1 — losing a
    /// duplicate wakeup byte is harmless, the event has already been queued.
    pub fn post(event: u8) {
        let fd = WRITE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            unsafe {
                libc::write(fd, std::ptr::addr_of!(event).cast::<libc::c_void>(), 1);
            }
        }
    }

    /// Drains exactly one event byte. `Ok(None)` means `EAGAIN` — the pipe
    /// is empty, return to the loop. `Err` means the pipe needs rebuilding.
    pub fn read_one(&self) -> std::io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = syscall!(read(
            self.read_fd,
            byte.as_mut_ptr() as *mut libc::c_void,
            1
        ));
        match n {
            Ok(1) => Ok(Some(byte[0])),
            Ok(0) => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "signal pipe closed",
            )),
            Ok(_) => unreachable!("read(2) of a 1-byte buffer returns 0 or 1"),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Closes the old pipe and builds a fresh one in its place, per
    /// SPEC_FULL §4.1 ("the pipe must be rebuildable at runtime").
    pub fn rebuild(&mut self, poll_set: &mut PollSet) -> std::io::Result<()> {
        let _ = poll_set.remove(self.token);
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
        let (read_fd, write_fd) = make_pipe()?;
        WRITE_FD.store(write_fd, Ordering::Relaxed);
        self.read_fd = read_fd;
        self.write_fd = write_fd;
        self.token = poll_set.add(read_fd, Ready::readable())?;
        Ok(())
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        WRITE_FD.store(-1, Ordering::Relaxed);
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn make_pipe() -> std::io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    match syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK)) {
        Ok(_) => Ok((fds[0], fds[1])),
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => {
            syscall!(pipe(fds.as_mut_ptr()))?;
            set_cloexec_raw(fds[0])?;
            set_cloexec_raw(fds[1])?;
            set_nonblocking_raw(fds[0], true)?;
            set_nonblocking_raw(fds[1], true)?;
            Ok((fds[0], fds[1]))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_drain_round_trips_a_byte() {
        let mut ps = PollSet::init(4).unwrap();
        let pipe = SignalPipe::init(&mut ps).unwrap();
        let sighup = libc::SIGHUP as u8;
        unsafe {
            libc::write(
                pipe.write_fd,
                [sighup].as_ptr() as *const libc::c_void,
                1,
            );
        }
        assert_eq!(pipe.read_one().unwrap(), Some(sighup));
        assert_eq!(pipe.read_one().unwrap(), None);
    }

    #[test]
    fn rebuild_produces_a_working_pipe() {
        let mut ps = PollSet::init(4).unwrap();
        let mut pipe = SignalPipe::init(&mut ps).unwrap();
        pipe.rebuild(&mut ps).unwrap();
        let sigterm = libc::SIGTERM as u8;
        unsafe {
            libc::write(
                pipe.write_fd,
                [sigterm].as_ptr() as *const libc::c_void,
                1,
            );
        }
        assert_eq!(pipe.read_one().unwrap(), Some(sigterm));
    }
}
