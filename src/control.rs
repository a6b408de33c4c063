//! Decodes one octet from the Signal Pipe into a control action (C6,
//! SPEC_FULL §4.6). Runs entirely on the supervisor thread, between two
//! `wait` calls, so a reload is never observed half-applied.

use std::sync::Arc;

use log::{error, info, warn};

use crate::accept_loop;
use crate::child_reaper;
use crate::config;
use crate::endpoint_binder;
use crate::service::ServiceEntry;
use crate::supervisor::Supervisor;
use crate::tls::NullTlsContext;

/// What the caller (the Accept Loop) should do next.
pub enum ControlOutcome {
    Continue,
    Terminate,
}

/// Drains and handles exactly one event byte. Call only when the signal
/// pipe's token is readable.
pub fn dispatch_one(supervisor: &mut Supervisor) -> ControlOutcome {
    match supervisor.signal_pipe.read_one() {
        Ok(Some(byte)) => handle_event(supervisor, byte),
        Ok(None) => ControlOutcome::Continue,
        Err(e) => {
            error!("Signal pipe read error, rebuilding: {}", e);
            match supervisor.signal_pipe.rebuild(&mut supervisor.poll_set) {
                Ok(()) => ControlOutcome::Continue,
                Err(e) => {
                    error!("Failed to rebuild signal pipe, terminating: {}", e);
                    ControlOutcome::Terminate
                }
            }
        }
    }
}

fn handle_event(supervisor: &mut Supervisor, byte: u8) -> ControlOutcome {
    match byte as libc::c_int {
        libc::SIGCHLD => {
            child_reaper::reap_nohang("Process");
            ControlOutcome::Continue
        }
        libc::SIGHUP => reload(supervisor),
        libc::SIGUSR1 => reopen_log(supervisor),
        libc::SIGTERM => terminate("SIGTERM"),
        libc::SIGINT => terminate("SIGINT"),
        libc::SIGQUIT => terminate("SIGQUIT"),
        signum => terminate(&child_reaper::signal_name(signum)),
    }
}

fn terminate(what: &str) -> ControlOutcome {
    info!("Received {}, terminating", what);
    ControlOutcome::Terminate
}

fn reopen_log(supervisor: &Supervisor) -> ControlOutcome {
    info!("Reopening log file");
    supervisor.log_sink.start_buffering();
    supervisor.log_sink.close_file();
    if let Err(e) = supervisor.log_sink.reopen_file() {
        error!("Failed to reopen log file: {}", e);
    }
    supervisor.log_sink.stop_buffering_and_flush();
    ControlOutcome::Continue
}

fn reload(supervisor: &mut Supervisor) -> ControlOutcome {
    info!("Reloading configuration");

    let parsed = match load_config(supervisor) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("Configuration reload failed, keeping current configuration: {}", e);
            return ControlOutcome::Continue;
        }
    };

    let old_services = supervisor.registry.snapshot();
    endpoint_binder::unbind_ports(&old_services, &mut supervisor.poll_set);

    supervisor.log_sink.start_buffering();
    supervisor.log_sink.close_file();

    let new_services: Vec<Arc<ServiceEntry>> = parsed
        .services
        .into_iter()
        .map(|options| Arc::new(ServiceEntry::new(options, Some(Arc::new(NullTlsContext::new(256))))))
        .collect();
    supervisor.registry.swap(new_services);

    let output_file = parsed.global.output_file.clone();
    *supervisor.global.write().unwrap() = parsed.global;

    if let Some(path) = output_file {
        if let Err(e) = supervisor.log_sink.open_file(&path) {
            warn!("Failed to open log file {}: {}", path.display(), e);
        }
    }
    supervisor.log_sink.stop_buffering_and_flush();

    let services = supervisor.registry.snapshot();
    if let Err(e) = endpoint_binder::bind_ports(&services, supervisor.inherited, &mut supervisor.poll_set) {
        error!("Reload failed to bind new configuration, terminating: {}", e);
        return ControlOutcome::Terminate;
    }
    if let Err(e) = accept_loop::exec_connect_start(supervisor) {
        error!("Reload failed to start exec+connect services, terminating: {}", e);
        return ControlOutcome::Terminate;
    }

    info!("Configuration successfully reloaded");
    ControlOutcome::Continue
}

fn load_config(supervisor: &Supervisor) -> Result<config::ParsedConfig, crate::error::ConfigError> {
    use crate::supervisor::ConfigSource;
    match &supervisor.config_source {
        ConfigSource::File(path) => config::parse_file(path),
        ConfigSource::Fd(fd) => {
            use std::io::Read;
            use std::os::unix::io::FromRawFd;
            let mut file = unsafe { std::fs::File::from_raw_fd(*fd) };
            let mut text = String::new();
            file.read_to_string(&mut text)
                .map_err(|source| crate::error::ConfigError::Read {
                    path: std::path::PathBuf::from(format!("fd:{}", fd)),
                    source,
                })?;
            // We don't own this descriptor; don't let `File`'s Drop close it.
            std::mem::forget(file);
            config::parse_str(&text, &format!("fd:{}", fd))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::LogSink;
    use crate::pollset::PollSet;
    use crate::service::GlobalOptions;
    use crate::signal_pipe::SignalPipe;
    use crate::supervisor::ConfigSource;
    use crate::worker::ThreadWorker;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicI64;
    use std::sync::RwLock;

    fn test_supervisor() -> Supervisor {
        let mut poll_set = PollSet::init(8).unwrap();
        let signal_pipe = SignalPipe::init(&mut poll_set).unwrap();
        Supervisor {
            poll_set,
            signal_pipe,
            registry: crate::service::Registry::new(),
            log_sink: Box::leak(Box::new(LogSink::new())),
            worker: Arc::new(ThreadWorker::new()),
            num_clients: Arc::new(AtomicI64::new(0)),
            inherited: crate::endpoint_binder::Inherited::none(),
            global: RwLock::new(GlobalOptions::default()),
            config_source: ConfigSource::File(PathBuf::from("/nonexistent/relayd.conf")),
        }
    }

    #[test]
    fn reload_with_unreadable_config_keeps_running() {
        let mut supervisor = test_supervisor();
        match reload(&mut supervisor) {
            ControlOutcome::Continue => {}
            ControlOutcome::Terminate => panic!("a bad config path must not terminate the daemon"),
        }
    }

    #[test]
    fn terminate_byte_requests_loop_exit() {
        let mut supervisor = test_supervisor();
        match handle_event(&mut supervisor, libc::SIGTERM as u8) {
            ControlOutcome::Terminate => {}
            ControlOutcome::Continue => panic!("TERMINATE must stop the loop"),
        }
    }

    #[test]
    fn sigchld_reaps_without_terminating() {
        let mut supervisor = test_supervisor();
        match handle_event(&mut supervisor, libc::SIGCHLD as u8) {
            ControlOutcome::Continue => {}
            ControlOutcome::Terminate => panic!("SIGCHLD must not terminate the loop"),
        }
    }
}
