use std::io;
use std::os::unix::io::RawFd;

/// Sets `O_NONBLOCK` on a raw descriptor (listening sockets inherited from
/// a service manager, client sockets just accepted).
pub fn set_nonblocking_raw(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    syscall!(fcntl(fd, libc::F_SETFL, flags)).map(|_| ())
}

/// Sets `FD_CLOEXEC` on a raw descriptor.
pub fn set_cloexec_raw(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)).map(|_| ())
}
