//! Ambient logging: a [`log::Log`] implementation fanning out to a syslog
//! sink and a buffered file sink, with the buffer/close/reopen lifecycle
//! `main_configure`/`REOPEN_LOG`/`RELOAD_CONFIG` all depend on (SPEC_FULL
//! §1.1, §4.6, §4.9).
//!
//! Two sinks, opened syslog-then-file relative to privilege drop and
//! closed in the mirror order (§6): syslog can reach `/dev/log` before
//! `chroot`, the file sink must be opened after `drop_privileges` so log
//! rotation works under the daemon's own identity.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{Level, Log, Metadata, Record};

struct State {
    syslog_open: bool,
    file: Option<File>,
    file_path: Option<PathBuf>,
    /// While `true`, formatted lines accumulate here instead of reaching a
    /// sink — used across reload/reopen so no line is lost while sinks are
    /// momentarily closed.
    buffering: bool,
    buffer: Vec<(Level, String)>,
}

/// The process-wide logger installed via [`install`].
pub struct LogSink {
    state: Mutex<State>,
}

impl LogSink {
    pub fn new() -> LogSink {
        LogSink {
            state: Mutex::new(State {
                syslog_open: false,
                file: None,
                file_path: None,
                buffering: true,
                buffer: Vec::new(),
            }),
        }
    }

    pub fn open_syslog(&self, ident: &str) {
        let mut state = self.state.lock().unwrap();
        if state.syslog_open {
            return;
        }
        let c_ident = CString::new(ident).unwrap_or_else(|_| CString::new("relayd").unwrap());
        unsafe {
            // Leaked intentionally: openlog(3) retains the pointer for the
            // life of the process.
            let ident_ptr = Box::leak(c_ident.into_boxed_c_str()).as_ptr();
            libc::openlog(ident_ptr, libc::LOG_PID | libc::LOG_CONS, libc::LOG_DAEMON);
        }
        state.syslog_open = true;
    }

    pub fn close_syslog(&self) {
        let mut state = self.state.lock().unwrap();
        if state.syslog_open {
            unsafe { libc::closelog() };
            state.syslog_open = false;
        }
    }

    pub fn open_file(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut state = self.state.lock().unwrap();
        state.file = Some(file);
        state.file_path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn close_file(&self) {
        let mut state = self.state.lock().unwrap();
        state.file = None;
    }

    /// Reopens the file sink at its last-known path, used by `REOPEN_LOG`
    /// (SPEC_FULL §4.6) — idempotent if the path hasn't changed, since
    /// append-mode reopen of the same inode has no observable effect.
    pub fn reopen_file(&self) -> std::io::Result<()> {
        let path = self.state.lock().unwrap().file_path.clone();
        match path {
            Some(path) => self.open_file(&path),
            None => Ok(()),
        }
    }

    pub fn start_buffering(&self) {
        self.state.lock().unwrap().buffering = true;
    }

    /// Stops buffering and replays everything accumulated, in order, to
    /// whatever sinks are currently open.
    pub fn stop_buffering_and_flush(&self) {
        let lines = {
            let mut state = self.state.lock().unwrap();
            state.buffering = false;
            std::mem::take(&mut state.buffer)
        };
        for (level, line) in lines {
            self.emit(level, &line);
        }
    }

    fn emit(&self, level: Level, line: &str) {
        let state = self.state.lock().unwrap();
        if state.syslog_open {
            let priority = match level {
                Level::Error => libc::LOG_ERR,
                Level::Warn => libc::LOG_WARNING,
                Level::Info => libc::LOG_INFO,
                Level::Debug | Level::Trace => libc::LOG_DEBUG,
            };
            if let Ok(c_line) = CString::new(line) {
                let fmt = CString::new("%s").unwrap();
                unsafe { libc::syslog(priority, fmt.as_ptr(), c_line.as_ptr()) };
            }
        }
        if let Some(mut file) = state.file.as_ref() {
            let _ = writeln!(file, "{}", line);
        }
        if !state.syslog_open && state.file.is_none() {
            eprintln!("{}", line);
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink::new()
    }
}

impl Log for LogSink {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let line = format!("[{}] {}", record.level(), record.args());
        let mut state = self.state.lock().unwrap();
        if state.buffering {
            state.buffer.push((record.level(), line));
        } else {
            drop(state);
            self.emit(record.level(), &line);
        }
    }

    fn flush(&self) {}
}

/// Installs a [`LogSink`] as the global logger and returns a handle to it
/// for the lifecycle/control code to drive buffer/open/close/reopen.
pub fn install() -> &'static LogSink {
    let sink: &'static LogSink = Box::leak(Box::new(LogSink::new()));
    log::set_logger(sink).expect("logger already installed");
    log::set_max_level(log::LevelFilter::Debug);
    sink
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_lines_flush_in_order() {
        let sink = LogSink::new();
        sink.state.lock().unwrap().buffer.push((Level::Info, "a".into()));
        sink.state.lock().unwrap().buffer.push((Level::Info, "b".into()));
        sink.stop_buffering_and_flush();
        assert!(sink.state.lock().unwrap().buffer.is_empty());
    }

    #[test]
    fn reopen_without_a_prior_open_is_a_no_op() {
        let sink = LogSink::new();
        assert!(sink.reopen_file().is_ok());
    }
}
