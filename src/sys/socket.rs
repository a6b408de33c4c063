//! Raw socket syscalls backing the Endpoint Binder (SPEC_FULL §4.3).
//!
//! Kept close to the teacher's `sys::socket` in spirit (direct `libc` calls
//! wrapped by `syscall!`, manual `sockaddr` construction) but narrowed down
//! to exactly what binding, listening, accepting, and tearing down a
//! listening endpoint need.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::{c_int, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_un, socklen_t};

use crate::service::Endpoint;

use super::fd::{set_cloexec_raw, set_nonblocking_raw};

/// Address of an accepted peer, for logging (§4.7 "Log acceptance with peer address").
#[derive(Debug, Clone)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
    Unknown,
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Unix => write!(f, "(local)"),
            PeerAddr::Unknown => write!(f, "(unknown)"),
        }
    }
}

/// Creates a non-blocking, close-on-exec stream socket for `endpoint`'s
/// address family. Does not bind or listen.
pub fn new_stream_socket(endpoint: &Endpoint) -> io::Result<RawFd> {
    let family = match endpoint {
        Endpoint::Tcp(SocketAddr::V4(_)) => libc::AF_INET,
        Endpoint::Tcp(SocketAddr::V6(_)) => libc::AF_INET6,
        Endpoint::Unix(_) => libc::AF_UNIX,
    };
    let fd = match syscall!(socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            // Kernel predates SOCK_CLOEXEC in socket(2); fall back and set it by hand.
            let fd = syscall!(socket(family, libc::SOCK_STREAM, 0))?;
            set_cloexec_raw(fd)?;
            fd
        }
        Err(e) => return Err(e),
    };
    set_nonblocking_raw(fd, true)?;
    Ok(fd)
}

/// Sets `SO_REUSEADDR`, matching the original's `socket_options_set` applied
/// before `bind` (§4.3 step 2).
pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let on: c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &on as *const _ as *const libc::c_void,
        mem::size_of::<c_int>() as socklen_t,
    ))
    .map(|_| ())
}

pub fn bind(fd: RawFd, endpoint: &Endpoint) -> io::Result<()> {
    match endpoint {
        Endpoint::Tcp(addr) => bind_tcp(fd, addr),
        Endpoint::Unix(path) => bind_unix(fd, path),
    }
}

fn bind_tcp(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    match addr {
        SocketAddr::V4(a) => {
            let raw = sockaddr_in_from(a);
            syscall!(bind(
                fd,
                &raw as *const _ as *const sockaddr,
                mem::size_of::<sockaddr_in>() as socklen_t,
            ))
            .map(|_| ())
        }
        SocketAddr::V6(a) => {
            let raw = sockaddr_in6_from(a);
            syscall!(bind(
                fd,
                &raw as *const _ as *const sockaddr,
                mem::size_of::<sockaddr_in6>() as socklen_t,
            ))
            .map(|_| ())
        }
    }
}

fn bind_unix(fd: RawFd, path: &Path) -> io::Result<()> {
    let (raw, len) = sockaddr_un_from(path)?;
    syscall!(bind(fd, &raw as *const _ as *const sockaddr, len)).map(|_| ())
}

/// Listens with the platform maximum backlog (§4.3 step 2: "the platform maximum backlog").
pub fn listen(fd: RawFd) -> io::Result<()> {
    syscall!(listen(fd, libc::SOMAXCONN)).map(|_| ())
}

/// Accepts one connection, retrying on `EINTR` (handled by `syscall!`).
/// Returns `(fd, peer_address)` or propagates the raw error so the caller
/// can classify it per §4.7 ("resource pressure" vs "transient").
pub fn accept(listen_fd: RawFd) -> io::Result<(RawFd, PeerAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let fd = match syscall!(accept4(
        listen_fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len,
        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
    )) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => {
            let fd = syscall!(accept(
                listen_fd,
                &mut storage as *mut _ as *mut sockaddr,
                &mut len,
            ))?;
            set_cloexec_raw(fd)?;
            set_nonblocking_raw(fd, true)?;
            fd
        }
        Err(e) => return Err(e),
    };

    let peer = peer_addr_from_storage(&storage);
    Ok((fd, peer))
}

fn peer_addr_from_storage(storage: &libc::sockaddr_storage) -> PeerAddr {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let raw: &sockaddr_in = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
            let port = u16::from_be(raw.sin_port);
            PeerAddr::Tcp(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let raw: &sockaddr_in6 = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(raw.sin6_addr.s6_addr);
            let port = u16::from_be(raw.sin6_port);
            PeerAddr::Tcp(SocketAddr::new(ip.into(), port))
        }
        libc::AF_UNIX => PeerAddr::Unix,
        _ => PeerAddr::Unknown,
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn sockaddr_in_from(addr: &std::net::SocketAddrV4) -> sockaddr_in {
    let mut raw: sockaddr_in = unsafe { mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = addr.port().to_be();
    raw.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    raw
}

fn sockaddr_in6_from(addr: &std::net::SocketAddrV6) -> sockaddr_in6 {
    let mut raw: sockaddr_in6 = unsafe { mem::zeroed() };
    raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    raw.sin6_port = addr.port().to_be();
    raw.sin6_addr.s6_addr = addr.ip().octets();
    raw.sin6_scope_id = addr.scope_id();
    raw
}

fn sockaddr_un_from(path: &Path) -> io::Result<(sockaddr_un, socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= 108 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix socket path too long",
        ));
    }
    let mut raw: sockaddr_un = unsafe { mem::zeroed() };
    raw.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in raw.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as socklen_t;
    Ok((raw, len))
}

/// `lchown` on a filesystem-path endpoint (§4.3 "Filesystem-path endpoints").
/// Descriptor-based `fchown` does not work on socket inodes on any platform
/// this crate targets.
pub fn lchown_path(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    syscall!(lchown(c_path.as_ptr(), uid, gid)).map(|_| ())
}

/// Whether `path`'s inode identity already matches `(uid, gid)`, used to
/// downgrade a failed `lchown` to a debug log when it was unneeded (§4.3).
pub fn path_owned_by(path: &Path, uid: u32, gid: u32) -> io::Result<bool> {
    let stat = lstat(path)?;
    Ok(stat.st_uid == uid && stat.st_gid == gid)
}

/// Whether `path` is still a socket inode, checked before `unlink` on
/// unbind (§4.3 "unlink any filesystem-path endpoint whose inode is
/// confirmed to be a socket").
pub fn path_is_socket(path: &Path) -> io::Result<bool> {
    let stat = lstat(path)?;
    Ok((stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
}

fn lstat(path: &Path) -> io::Result<libc::stat> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    syscall!(lstat(c_path.as_ptr(), &mut stat))?;
    Ok(stat)
}

pub fn unlink_path(path: &Path) -> io::Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    syscall!(unlink(c_path.as_ptr())).map(|_| ())
}
