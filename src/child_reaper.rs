//! Non-blocking reaping of exited children (SPEC_FULL §4.5).

use log::info;

/// Drains every exited child without blocking, logging one line per child.
/// `tag` distinguishes the caller's concurrency model in the log line
/// ("Process" for a forked client, "Child process" for an exec+connect
/// helper), matching the two call sites in the original accept loop.
pub fn reap_nohang(tag: &str) {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        log_status(tag, pid, status);
    }
}

/// Blocks for exactly one child exit. Exposed for a caller that already
/// knows one is pending (an exec+connect worker collecting its own helper
/// at shutdown) and wants to avoid a `WNOHANG` busy-poll.
pub fn reap_hang(tag: &str) {
    let mut status: libc::c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
    if pid > 0 {
        log_status(tag, pid, status);
    }
}

fn log_status(tag: &str, pid: libc::pid_t, status: libc::c_int) {
    if libc_wifsignaled(status) {
        let sig = libc_wtermsig(status);
        info!("{} {} terminated on {}", tag, pid, signal_name(sig));
    } else {
        info!("{} {} finished with code {}", tag, pid, libc_wexitstatus(status));
    }
}

fn libc_wifsignaled(status: libc::c_int) -> bool {
    (status & 0x7f) != 0 && (status & 0x7f) != 0x7f
}

fn libc_wtermsig(status: libc::c_int) -> libc::c_int {
    status & 0x7f
}

fn libc_wexitstatus(status: libc::c_int) -> libc::c_int {
    (status >> 8) & 0xff
}

/// Decodes a signal number into its textual name, falling back to
/// `"signal <n>"` for anything not in the compiled-in table (SPEC_FULL
/// §4.5 and the Control Dispatcher's default branch, §4.6).
pub fn signal_name(signum: libc::c_int) -> String {
    let name = match signum {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        _ => return format!("signal {}", signum),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_signal_renders_numeric() {
        assert_eq!(signal_name(12345), "signal 12345");
    }

    #[test]
    fn known_signal_renders_name() {
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
    }

    #[test]
    fn reap_nohang_is_a_no_op_with_no_children() {
        reap_nohang("Process");
    }

    #[test]
    fn reap_hang_collects_a_known_pending_child() {
        // Leave the child un-waited so its exit is still pending when
        // reap_hang's blocking waitpid runs; calling Child::wait first
        // would reap it itself and make reap_hang block forever.
        let child = std::process::Command::new("true").spawn().unwrap();
        std::mem::forget(child);
        reap_hang("Process");
    }
}
