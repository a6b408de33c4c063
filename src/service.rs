//! Service Registry (C8, SPEC_FULL §3 / §4.8).
//!
//! The original keeps services in an intrusive singly-linked list rooted at
//! a sentinel. The only mutation pattern that matters here is whole-chain
//! replacement on reload, so this crate uses an owned `Vec<Arc<ServiceEntry>>`
//! behind an `RwLock` instead (SPEC_FULL §9, REDESIGN FLAGS).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::pollset::Token;
use crate::tls::TlsContext;

/// A local or remote address a service binds to or connects out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// What a service relays accepted connections to.
#[derive(Debug, Clone)]
pub enum RemotePeer {
    /// A conventional remote address list, tried in order.
    Addrs(Vec<Endpoint>),
    /// An exec+connect service: no local endpoint, a child process is
    /// spawned once at loop entry and the worker connects to it.
    Exec { program: String, args: Vec<String> },
    /// A TLS extension slave: matched by SNI on another service's accepted
    /// connection rather than by its own listening endpoint.
    SniSlave,
}

/// Filesystem-path endpoint ownership, applied with `lchown` after bind.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

/// Static configuration for one service, produced by the configuration
/// parser (external collaborator, §6) and installed into the registry.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub name: String,
    pub local: Vec<Endpoint>,
    pub remote: RemotePeer,
    pub session_timeout: Duration,
    pub ownership: Option<Ownership>,
}

impl ServiceOptions {
    pub fn has_local_endpoints(&self) -> bool {
        !self.local.is_empty()
    }
}

/// One descriptor slot in a service's local endpoint array: either bound,
/// or "unbound" (SPEC_FULL §3 invariant on `local_fd[i]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Unbound,
    Bound {
        fd: std::os::unix::io::RawFd,
        /// Descriptors in the inherited range must never be closed by us.
        inherited: bool,
        /// The Poll Set token this descriptor is registered under, so
        /// unbind can deregister it without a linear fd scan.
        token: Token,
    },
}

/// A live service: its static options, its current bind state, and the
/// bridge between accept-time reference capture and worker-time release.
pub struct ServiceEntry {
    pub options: ServiceOptions,
    pub tls: Option<Arc<dyn TlsContext>>,
    slots: RwLock<Vec<Slot>>,
    /// Reference count bridging accept-time capture to worker-time release;
    /// only meaningful for non-fork worker backends (SPEC_FULL §4.8).
    refcount: AtomicI64,
    /// Cleared on unbind for exec+connect services, per the Open Question
    /// (b) resolution (SPEC_FULL §9): a crude workaround rather than a
    /// bounded cancellation protocol.
    pub retry: AtomicBool,
}

impl ServiceEntry {
    pub fn new(options: ServiceOptions, tls: Option<Arc<dyn TlsContext>>) -> ServiceEntry {
        let n = options.local.len();
        ServiceEntry {
            options,
            tls,
            slots: RwLock::new(vec![Slot::Unbound; n]),
            refcount: AtomicI64::new(0),
            retry: AtomicBool::new(true),
        }
    }

    pub fn slot(&self, index: usize) -> Slot {
        self.slots.read().unwrap()[index]
    }

    pub fn set_slot(&self, index: usize, slot: Slot) {
        self.slots.write().unwrap()[index] = slot;
    }

    pub fn bound_count(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, Slot::Bound { .. }))
            .count()
    }

    pub fn all_slots(&self) -> Vec<Slot> {
        self.slots.read().unwrap().clone()
    }

    pub fn incr_refcount(&self) -> i64 {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decr_refcount(&self) -> i64 {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::SeqCst)
    }
}

/// Process-wide global options, the data the original kept on the chain's
/// sentinel head alongside the first service.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub chroot: Option<PathBuf>,
    pub setuid: Option<u32>,
    pub setgid: Option<u32>,
    pub max_clients: i64,
    pub syslog_facility: Option<String>,
    pub output_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
}

/// The active set of services, swapped whole on reload (SPEC_FULL §9).
pub struct Registry {
    services: RwLock<Vec<Arc<ServiceEntry>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            services: RwLock::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<ServiceEntry>> {
        self.services.read().unwrap().clone()
    }

    /// Replaces the whole chain. The Sections write lock in the original
    /// maps to this single `RwLock` write guard (SPEC_FULL §4.8).
    pub fn swap(&self, new_services: Vec<Arc<ServiceEntry>>) -> Vec<Arc<ServiceEntry>> {
        let mut guard = self.services.write().unwrap();
        std::mem::replace(&mut *guard, new_services)
    }

    pub fn len(&self) -> usize {
        self.services.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().unwrap().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(name: &str, n_local: usize) -> ServiceOptions {
        ServiceOptions {
            name: name.to_string(),
            local: (0..n_local)
                .map(|i| Endpoint::Tcp(format!("127.0.0.1:{}", 9000 + i).parse().unwrap()))
                .collect(),
            remote: RemotePeer::Addrs(vec![]),
            session_timeout: Duration::from_secs(300),
            ownership: None,
        }
    }

    #[test]
    fn refcount_tracks_accept_and_release() {
        let entry = ServiceEntry::new(opts("svc", 1), None);
        assert_eq!(entry.incr_refcount(), 1);
        assert_eq!(entry.incr_refcount(), 2);
        assert_eq!(entry.decr_refcount(), 1);
    }

    #[test]
    fn swap_replaces_the_whole_chain_atomically() {
        let registry = Registry::new();
        let a = Arc::new(ServiceEntry::new(opts("a", 1), None));
        registry.swap(vec![a.clone()]);
        assert_eq!(registry.len(), 1);

        let b = Arc::new(ServiceEntry::new(opts("b", 1), None));
        let old = registry.swap(vec![b]);
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].options.name, "a");
        assert_eq!(registry.snapshot()[0].options.name, "b");
    }

    #[test]
    fn newly_created_service_has_all_slots_unbound() {
        let entry = ServiceEntry::new(opts("svc", 2), None);
        assert_eq!(entry.all_slots(), vec![Slot::Unbound, Slot::Unbound]);
        assert_eq!(entry.bound_count(), 0);
    }
}
