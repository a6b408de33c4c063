//! One-time init, configured init, cleanup (C9, SPEC_FULL §4.9).

use std::path::PathBuf;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, RwLock};

use log::{debug, info};

use crate::endpoint_binder::{self, Inherited};
use crate::error::{ConfigError, LifecycleError};
use crate::log_sink;
use crate::pollset::PollSet;
use crate::privilege;
use crate::service::{Registry, ServiceEntry};
use crate::signal_pipe::SignalPipe;
use crate::supervisor::{ConfigSource, Supervisor};
use crate::tls::NullTlsContext;
use crate::worker::ThreadWorker;

/// What command-line parsing decided to do (SPEC_FULL §6: `arg1`/`arg2`).
pub enum CliAction {
    Configure(ConfigSource),
    PrintHelp,
    PrintVersion,
    PrintSockets,
}

/// What `main_configure` accomplished.
pub enum ConfigureOutcome {
    Accepted,
    Printed,
}

/// Allocates the Poll Set and Signal Pipe, reads inherited descriptors,
/// and logs the build-info banner. Corresponds to the original's
/// `main_init`.
pub fn main_init() -> Result<Supervisor, LifecycleError> {
    let inherited = Inherited::from_environment();
    for fd in inherited.start..inherited.start + inherited.count as std::os::unix::io::RawFd {
        crate::sys::fd::set_nonblocking_raw(fd, true)
            .map_err(|source| LifecycleError::InheritedNonBlocking { fd, source })?;
    }
    let mut poll_set = PollSet::init(64).map_err(|e| {
        LifecycleError::Poll(crate::error::PollError::Create(e))
    })?;
    let signal_pipe = SignalPipe::init(&mut poll_set).map_err(LifecycleError::SignalPipe)?;
    let log_sink = log_sink::install();

    build_info(inherited.count);

    Ok(Supervisor {
        poll_set,
        signal_pipe,
        registry: Registry::new(),
        log_sink,
        worker: Arc::new(ThreadWorker::new()),
        num_clients: Arc::new(AtomicI64::new(-1)),
        inherited,
        global: RwLock::new(Default::default()),
        config_source: ConfigSource::File(PathBuf::from("relayd.conf")),
    })
}

fn build_info(inherited_count: usize) {
    info!(
        "{} {}: Threading=thread-per-client, Sockets=epoll",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    if inherited_count > 0 {
        info!("Inherited {} descriptor(s) from the service manager", inherited_count);
    }
    #[cfg(debug_assertions)]
    debug!("errno layout: c_int ({} bytes)", std::mem::size_of::<libc::c_int>());
}

/// Parses `arg1`/`arg2` per SPEC_FULL §6: a config path, `-help`/`-version`
/// (print and exit), `-sockets` (print inherited descriptor count and
/// exit), or `-fd <n>` (read configuration from an inherited descriptor).
pub fn parse_command_line(arg1: Option<&str>, arg2: Option<&str>) -> Result<CliAction, ConfigError> {
    match arg1 {
        None | Some("-help") => Ok(CliAction::PrintHelp),
        Some("-version") => Ok(CliAction::PrintVersion),
        Some("-sockets") => Ok(CliAction::PrintSockets),
        Some("-fd") => {
            let fd = arg2
                .and_then(|s| s.parse::<i32>().ok())
                .ok_or_else(|| ConfigError::Parse {
                    path: "<command line>".to_string(),
                    line: 0,
                    message: "-fd requires a numeric descriptor as the second argument".to_string(),
                })?;
            Ok(CliAction::Configure(ConfigSource::Fd(fd)))
        }
        Some(path) => Ok(CliAction::Configure(ConfigSource::File(PathBuf::from(path)))),
    }
}

/// Parses the command line, loads configuration, binds ports, drops
/// privileges, and opens the post-drop log sink. Corresponds to the
/// original's `main_configure`.
pub fn main_configure(
    supervisor: &mut Supervisor,
    arg1: Option<&str>,
    arg2: Option<&str>,
) -> Result<ConfigureOutcome, LifecycleError> {
    let action = parse_command_line(arg1, arg2)?;
    let source = match action {
        CliAction::Configure(source) => source,
        CliAction::PrintHelp => {
            println!("usage: relayd <config-file> | -help | -version | -sockets | -fd <n>");
            return Ok(ConfigureOutcome::Printed);
        }
        CliAction::PrintVersion => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            return Ok(ConfigureOutcome::Printed);
        }
        CliAction::PrintSockets => {
            println!("{} inherited socket(s)", supervisor.inherited.count);
            return Ok(ConfigureOutcome::Printed);
        }
    };

    let parsed = match &source {
        ConfigSource::File(path) => crate::config::parse_file(path)?,
        ConfigSource::Fd(fd) => {
            use std::io::Read;
            use std::os::unix::io::FromRawFd;
            let mut file = unsafe { std::fs::File::from_raw_fd(*fd) };
            let mut text = String::new();
            file.read_to_string(&mut text)
                .map_err(|err| ConfigError::Read {
                    path: PathBuf::from(format!("fd:{}", fd)),
                    source: err,
                })?;
            std::mem::forget(file);
            crate::config::parse_str(&text, &format!("fd:{}", fd))?
        }
    };
    supervisor.config_source = source;

    supervisor.log_sink.open_syslog("relayd");

    let services: Vec<Arc<ServiceEntry>> = parsed
        .services
        .into_iter()
        .map(|options| Arc::new(ServiceEntry::new(options, Some(Arc::new(NullTlsContext::new(256))))))
        .collect();

    endpoint_binder::bind_ports(&services, supervisor.inherited, &mut supervisor.poll_set)?;
    supervisor.registry.swap(services);

    privilege::change_root(parsed.global.chroot.as_deref())?;
    privilege::drop_privileges(parsed.global.setgid, parsed.global.setuid, true)?;

    if let Some(path) = &parsed.global.output_file {
        supervisor
            .log_sink
            .open_file(path)
            .map_err(|source| crate::error::ConfigError::Read {
                path: path.clone(),
                source,
            })?;
    }

    *supervisor.global.write().unwrap() = parsed.global;
    supervisor.mark_configured();
    supervisor.log_sink.stop_buffering_and_flush();

    info!("Configuration accepted, {} service(s) active", supervisor.registry.len());
    Ok(ConfigureOutcome::Accepted)
}

/// Unbinds every listening port, frees the Poll Set's slab, and flushes and
/// closes both log sinks. Corresponds to the original's `main_cleanup`.
pub fn main_cleanup(supervisor: &mut Supervisor) {
    let services = supervisor.registry.snapshot();
    endpoint_binder::unbind_ports(&services, &mut supervisor.poll_set);
    supervisor.poll_set.free();
    supervisor.log_sink.stop_buffering_and_flush();
    supervisor.log_sink.close_file();
    supervisor.log_sink.close_syslog();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_line_with_no_args_prints_help() {
        assert!(matches!(
            parse_command_line(None, None).unwrap(),
            CliAction::PrintHelp
        ));
    }

    #[test]
    fn parse_command_line_with_a_path_configures() {
        match parse_command_line(Some("/etc/relayd.conf"), None).unwrap() {
            CliAction::Configure(ConfigSource::File(path)) => {
                assert_eq!(path, PathBuf::from("/etc/relayd.conf"))
            }
            _ => panic!("expected Configure(File)"),
        }
    }

    #[test]
    fn parse_command_line_with_fd_requires_a_number() {
        assert!(parse_command_line(Some("-fd"), Some("not-a-number")).is_err());
    }

    #[test]
    fn parse_command_line_with_fd_and_a_number_configures() {
        match parse_command_line(Some("-fd"), Some("4")).unwrap() {
            CliAction::Configure(ConfigSource::Fd(fd)) => assert_eq!(fd, 4),
            _ => panic!("expected Configure(Fd)"),
        }
    }

    #[test]
    fn main_init_allocates_a_runnable_supervisor() {
        let supervisor = main_init().unwrap();
        assert_eq!(supervisor.registry.len(), 0);
        assert_eq!(supervisor.num_clients.load(std::sync::atomic::Ordering::SeqCst), -1);
    }
}
