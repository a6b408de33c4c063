//! Opens, binds, listens on, and tears down per-service listening sockets
//! (C3, SPEC_FULL §4.3), including integration with service-manager
//! descriptor inheritance.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::{debug, error, info};

use crate::error::BindError;
use crate::pollset::{PollSet, Ready};
use crate::service::{Endpoint, RemotePeer, ServiceEntry, Slot};
use crate::sys::socket;

/// Number of descriptors handed to us by a service manager, and the base
/// fd they start at (conventionally 3, SPEC_FULL §6).
#[derive(Debug, Clone, Copy)]
pub struct Inherited {
    pub start: RawFd,
    pub count: usize,
}

impl Inherited {
    pub fn none() -> Inherited {
        Inherited { start: 3, count: 0 }
    }

    /// Reads the systemd-style socket-activation protocol: `LISTEN_PID`
    /// must match our pid and `LISTEN_FDS` gives the count (SPEC_FULL §6).
    pub fn from_environment() -> Inherited {
        let pid_matches = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .map(|pid| pid == std::process::id() as i32)
            .unwrap_or(false);
        if !pid_matches {
            return Inherited::none();
        }
        let count = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        Inherited { start: 3, count }
    }

    fn fd_for(&self, listening_section: usize) -> Option<RawFd> {
        if listening_section < self.count {
            Some(self.start + listening_section as RawFd)
        } else {
            None
        }
    }

    pub fn owns(&self, fd: RawFd) -> bool {
        fd >= self.start && fd < self.start + self.count as RawFd
    }
}

/// Binds every configured service's local endpoints, in declaration order.
/// Registers each bound descriptor with `poll_set`. Returns the number of
/// listening services claimed from `inherited` so the caller can detect
/// "too many inherited descriptors".
pub fn bind_ports(
    services: &[Arc<ServiceEntry>],
    inherited: Inherited,
    poll_set: &mut PollSet,
) -> Result<(), BindError> {
    for service in services {
        for i in 0..service.options.local.len() {
            service.set_slot(i, Slot::Unbound);
        }
    }

    let mut listening_section = 0usize;
    for service in services {
        if service.options.has_local_endpoints() {
            debug!("Binding service [{}]", service.options.name);
            for (i, endpoint) in service.options.local.iter().enumerate() {
                match bind_one(service, listening_section, i, endpoint, inherited, poll_set) {
                    Ok(()) => {}
                    Err(_) => continue,
                }
            }
            if service.bound_count() == 0 {
                error!("Binding service [{}] failed", service.options.name);
                return Err(BindError::NoEndpointsBound {
                    service: service.options.name.clone(),
                });
            }
            listening_section += 1;
        } else {
            match &service.options.remote {
                RemotePeer::Exec { .. } => {
                    debug!("Skipped exec+connect service [{}]", service.options.name)
                }
                RemotePeer::SniSlave => {
                    debug!("Skipped SNI slave service [{}]", service.options.name)
                }
                RemotePeer::Addrs(_) => {
                    error!("Invalid service [{}]", service.options.name);
                    return Err(BindError::NoEndpointsBound {
                        service: service.options.name.clone(),
                    });
                }
            }
        }
    }

    if listening_section < inherited.count {
        error!(
            "Too many listening file descriptors received from the service manager, got {}",
            inherited.count
        );
        return Err(BindError::TooManyInheritedDescriptors {
            count: inherited.count,
            listening_services: listening_section,
        });
    }

    Ok(())
}

fn bind_one(
    service: &Arc<ServiceEntry>,
    listening_section: usize,
    index: usize,
    endpoint: &Endpoint,
    inherited: Inherited,
    poll_set: &mut PollSet,
) -> Result<(), BindError> {
    let (fd, is_inherited) = match inherited.fd_for(listening_section) {
        Some(fd) => {
            debug!("Listening file descriptor received from the service manager (FD={})", fd);
            (fd, true)
        }
        None => {
            let fd = socket::new_stream_socket(endpoint).map_err(|source| BindError::Bind {
                service: service.options.name.clone(),
                index,
                addr: endpoint.to_string(),
                source,
            })?;
            (fd, false)
        }
    };

    if !is_inherited {
        let _ = socket::set_reuseaddr(fd);
        if let Err(source) = socket::bind(fd, endpoint) {
            info!(
                "Binding service [{}] to {}: {}",
                service.options.name, endpoint, source
            );
            socket::close(fd);
            return Err(BindError::Bind {
                service: service.options.name.clone(),
                index,
                addr: endpoint.to_string(),
                source,
            });
        }
        if let Err(source) = socket::listen(fd) {
            socket::close(fd);
            return Err(BindError::Bind {
                service: service.options.name.clone(),
                index,
                addr: endpoint.to_string(),
                source,
            });
        }
    }

    if let Endpoint::Unix(path) = endpoint {
        if let Some(ownership) = service.options.ownership {
            if socket::lchown_path(path, ownership.uid, ownership.gid).is_ok() {
                debug!(
                    "Socket chown succeeded: {}, UID={}, GID={}",
                    path.display(),
                    ownership.uid,
                    ownership.gid
                );
            } else {
                match socket::path_owned_by(path, ownership.uid, ownership.gid) {
                    Ok(true) => debug!(
                        "Socket chown unneeded: {}, UID={}, GID={}",
                        path.display(),
                        ownership.uid,
                        ownership.gid
                    ),
                    _ => error!(
                        "Socket chown failed: {}, UID={}, GID={}",
                        path.display(),
                        ownership.uid,
                        ownership.gid
                    ),
                }
            }
        }
    }

    let token = match poll_set.add(fd, Ready::readable()) {
        Ok(token) => token,
        Err(e) => {
            if !is_inherited {
                socket::close(fd);
            }
            return Err(BindError::Bind {
                service: service.options.name.clone(),
                index,
                addr: endpoint.to_string(),
                source: e,
            });
        }
    };

    service.set_slot(
        index,
        Slot::Bound {
            fd,
            inherited: is_inherited,
            token,
        },
    );
    info!(
        "Service [{}] (FD={}) bound to {}",
        service.options.name, fd, endpoint
    );
    Ok(())
}

/// Closes every non-inherited listening descriptor, unlinks stale
/// filesystem-path sockets, disables retry on exec+connect services (the
/// Open Question (b) workaround, SPEC_FULL §9), and flushes each service's
/// TLS session cache with an expiry just past its session timeout.
///
/// Deregisters every bound descriptor's token from `poll_set` first
/// (SPEC_FULL §4.3: "Re-initializes the Poll Set to contain only the
/// signal pipe"), so a reload never leaves a stale epoll registration
/// behind for a closed or reused descriptor.
pub fn unbind_ports(services: &[Arc<ServiceEntry>], poll_set: &mut PollSet) {
    for service in services {
        debug!("Unbinding service [{}]", service.options.name);
        for (i, endpoint) in service.options.local.iter().enumerate() {
            unbind_one(service, i, endpoint, poll_set);
        }
        if let RemotePeer::Exec { .. } = service.options.remote {
            service
                .retry
                .store(false, std::sync::atomic::Ordering::SeqCst);
        }
        if let Some(tls) = &service.tls {
            let ttl = service.options.session_timeout + std::time::Duration::from_secs(1);
            tls.flush_sessions(ttl);
        }
        debug!("Service [{}] closed", service.options.name);
    }
}

fn unbind_one(service: &Arc<ServiceEntry>, index: usize, endpoint: &Endpoint, poll_set: &mut PollSet) {
    let slot = service.slot(index);
    let (fd, inherited, token) = match slot {
        Slot::Bound { fd, inherited, token } => (fd, inherited, token),
        Slot::Unbound => return,
    };
    service.set_slot(index, Slot::Unbound);

    if let Err(e) = poll_set.remove(token) {
        error!("Service [{}] FD={} already missing from the Poll Set: {}", service.options.name, fd, e);
    }

    if !inherited {
        socket::close(fd);
    }
    debug!("Service [{}] closed (FD={})", service.options.name, fd);

    if let Endpoint::Unix(path) = endpoint {
        match socket::path_is_socket(path) {
            Ok(true) => match socket::unlink_path(path) {
                Ok(()) => debug!("Socket removed: {}", path.display()),
                Err(e) => error!("{}: {}", path.display(), e),
            },
            Ok(false) => error!("Not a socket: {}", path.display()),
            Err(e) => error!("{}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Ownership, ServiceOptions};
    use std::time::Duration;

    fn tcp_service(name: &str, port: u16) -> Arc<ServiceEntry> {
        Arc::new(ServiceEntry::new(
            ServiceOptions {
                name: name.to_string(),
                local: vec![Endpoint::Tcp(format!("127.0.0.1:{}", port).parse().unwrap())],
                remote: RemotePeer::Addrs(vec![]),
                session_timeout: Duration::from_secs(5),
                ownership: None,
            },
            None,
        ))
    }

    #[test]
    fn bind_then_unbind_round_trips_the_poll_set() {
        let mut ps = PollSet::init(8).unwrap();
        let services = vec![tcp_service("t", 0)];
        bind_ports(&services, Inherited::none(), &mut ps).unwrap();
        assert_eq!(services[0].bound_count(), 1);
        assert_eq!(ps.dump().len(), 1);

        unbind_ports(&services, &mut ps);
        assert!(matches!(services[0].slot(0), Slot::Unbound));
        assert!(ps.dump().is_empty());
    }

    #[test]
    fn exec_connect_service_skips_binding() {
        let mut ps = PollSet::init(8).unwrap();
        let service = Arc::new(ServiceEntry::new(
            ServiceOptions {
                name: "helper".to_string(),
                local: vec![],
                remote: RemotePeer::Exec {
                    program: "/bin/true".to_string(),
                    args: vec![],
                },
                session_timeout: Duration::from_secs(5),
                ownership: None,
            },
            None,
        ));
        bind_ports(std::slice::from_ref(&service), Inherited::none(), &mut ps).unwrap();
        unbind_ports(std::slice::from_ref(&service), &mut ps);
        assert!(!service.retry.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn unused_ownership_field_compiles() {
        let _ = Ownership { uid: 0, gid: 0 };
    }
}
