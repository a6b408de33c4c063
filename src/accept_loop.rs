//! The blocking readiness loop: readiness → dispatch or accept →
//! admission → handoff (C7, SPEC_FULL §4.7).

use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{error, info, warn};

use crate::control::ControlOutcome;
use crate::service::{RemotePeer, Slot};
use crate::supervisor::Supervisor;
use crate::sys::socket;
use crate::worker::ClientSession;

/// What `accept_one` found, so the caller can decide whether to back off.
enum AcceptOutcome {
    Handled,
    ResourcePressure,
    Transient,
}

/// Runs forever until `TERMINATE` (or an unrecoverable signal-pipe
/// rebuild failure) is observed. Mirrors the original's `daemon_loop`:
/// start exec+connect services once, then loop on `wait`.
pub fn run(supervisor: &mut Supervisor) -> std::io::Result<()> {
    exec_connect_start(supervisor)?;

    loop {
        let mut backoff = false;

        match supervisor.poll_set.wait(None) {
            Ok(()) => {}
            Err(e) => {
                error!("poll set wait failed: {}", e);
                backoff = true;
            }
        }

        if !backoff {
            let signal_token = supervisor.signal_pipe.token();
            if supervisor.poll_set.can_read(signal_token) {
                match crate::control::dispatch_one(supervisor) {
                    ControlOutcome::Continue => {}
                    ControlOutcome::Terminate => return Ok(()),
                }
            } else {
                for service in supervisor.registry.snapshot() {
                    for (i, slot) in service.all_slots().into_iter().enumerate() {
                        if let Slot::Bound { fd, .. } = slot {
                            let token = match supervisor.token_for_fd(fd) {
                                Some(t) => t,
                                None => continue,
                            };
                            if supervisor.poll_set.can_read(token) {
                                match accept_one(supervisor, &service, i, fd) {
                                    AcceptOutcome::ResourcePressure => backoff = true,
                                    AcceptOutcome::Handled | AcceptOutcome::Transient => {}
                                }
                            }
                        }
                    }
                }
            }
        }

        if backoff {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

fn accept_one(
    supervisor: &Supervisor,
    service: &std::sync::Arc<crate::service::ServiceEntry>,
    index: usize,
    listen_fd: std::os::unix::io::RawFd,
) -> AcceptOutcome {
    let (client_fd, peer_addr) = match socket::accept(listen_fd) {
        Ok(pair) => pair,
        Err(e) => {
            return match e.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS)
                | Some(libc::ENOMEM) => AcceptOutcome::ResourcePressure,
                _ => AcceptOutcome::Transient,
            };
        }
    };

    info!(
        "Service [{}] accepted connection from {} (local endpoint {})",
        service.options.name, peer_addr, index
    );

    let max_clients = supervisor.max_clients();
    if max_clients > 0 && supervisor.num_clients.load(Ordering::SeqCst) >= max_clients {
        warn!(
            "Connection rejected: too many clients (>={})",
            max_clients
        );
        socket::close(client_fd);
        return AcceptOutcome::Handled;
    }

    supervisor.num_clients.fetch_add(1, Ordering::SeqCst);
    service.incr_refcount();

    let session = ClientSession {
        service: service.clone(),
        client_fd,
        peer_fd: client_fd,
        num_clients: supervisor.num_clients_handle(),
    };

    if let Err(e) = supervisor.worker.launch(session) {
        error!("Failed to launch worker for service [{}]: {}", service.options.name, e);
        socket::close(client_fd);
        service.decr_refcount();
        supervisor.num_clients.fetch_sub(1, Ordering::SeqCst);
    }

    AcceptOutcome::Handled
}

/// Starts every exec+connect service once, at loop entry. Any failure is
/// fatal to daemon startup (SPEC_FULL §4.7).
pub fn exec_connect_start(supervisor: &Supervisor) -> std::io::Result<()> {
    for service in supervisor.registry.snapshot() {
        if let RemotePeer::Exec { program, args } = &service.options.remote {
            info!("Starting exec+connect service [{}]", service.options.name);
            service.incr_refcount();
            let session = ClientSession {
                service: service.clone(),
                client_fd: -1,
                peer_fd: -1,
                num_clients: supervisor.num_clients_handle(),
            };
            if let Err(e) = supervisor.worker.launch(session) {
                error!(
                    "Failed to start exec+connect service [{}] ({} {:?}): {}",
                    service.options.name, program, args, e
                );
                service.decr_refcount();
                return Err(e);
            }
        }
    }
    Ok(())
}
