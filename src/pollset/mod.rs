//! The supervisor's descriptor set (SPEC_FULL §4.2, "Poll Set").
//!
//! `PollSet` owns an [`epoll::Epoll`] instance plus a [`Slab`] mapping stable
//! integer tokens to the raw descriptor each one represents. Every other
//! component (signal pipe, listening sockets, control socket) registers
//! itself here instead of touching epoll directly.

pub mod epoll;

use std::fmt;
use std::ops;
use std::os::unix::io::RawFd;
use std::time::Duration;

use slab::Slab;

use epoll::{Epoll, Events as RawEvents};

/// Stable identifier handed back by [`PollSet::add`], re-used by
/// [`PollSet::remove`] and returned on every readiness event so the caller
/// can look up which descriptor fired.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}

/// A set of readiness conditions, combinable with `|`.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;

impl Ready {
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    pub fn error() -> Ready {
        Ready(ERROR)
    }

    pub fn hup() -> Ready {
        Ready(HUP)
    }

    pub fn is_empty(&self) -> bool {
        *self == Ready::empty()
    }

    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    pub fn is_error(&self) -> bool {
        self.contains(Ready(ERROR))
    }

    pub fn is_hup(&self) -> bool {
        self.contains(Ready(HUP))
    }

    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        write!(fmt, "Ready {{")?;
        for &(flag, msg) in &[
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready(ERROR), "Error"),
            (Ready(HUP), "Hup"),
        ] {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true
            }
        }
        write!(fmt, "}}")
    }
}

/// Registration mode. The supervisor only ever registers level-triggered
/// interest (SPEC_FULL §4.2), so this carries no edge/oneshot variants —
/// unlike `queen-io`'s general-purpose epoll wrapper, nothing here ever
/// needs them.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Debug)]
pub struct PollOpt(usize);

const LEVEL: usize = 0b0010;

impl PollOpt {
    pub fn level() -> PollOpt {
        PollOpt(LEVEL)
    }

    pub fn is_level(self) -> bool {
        self.0 & LEVEL != 0
    }
}

/// A readiness condition paired with the token that was registered for it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Event {
    kind: Ready,
    token: Token,
}

impl Event {
    pub fn new(kind: Ready, token: Token) -> Event {
        Event { kind, token }
    }

    pub fn readiness(&self) -> Ready {
        self.kind
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

/// The supervisor's registered descriptor set: epoll plus a slab of slots.
///
/// Slots are allocated on [`add`](PollSet::add) and freed on
/// [`remove`](PollSet::remove); the `Slab` index becomes the `Token`, so a
/// descriptor's token never changes while it stays registered (SPEC_FULL
/// §4.2, "tokens are stable for the life of the registration").
pub struct PollSet {
    epoll: Epoll,
    slots: Slab<RawFd>,
    events: RawEvents,
}

impl PollSet {
    pub fn init(capacity: usize) -> std::io::Result<PollSet> {
        Ok(PollSet {
            epoll: Epoll::new()?,
            slots: Slab::with_capacity(capacity),
            events: RawEvents::with_capacity(capacity),
        })
    }

    /// Registers `fd` for `interest` and returns the token to look it up by.
    pub fn add(&mut self, fd: RawFd, interest: Ready) -> std::io::Result<Token> {
        let slot = self.slots.insert(fd);
        let token = Token(slot);
        if let Err(e) = self
            .epoll
            .add(fd, token, interest, PollOpt::level())
        {
            self.slots.remove(slot);
            return Err(e);
        }
        Ok(token)
    }

    /// Deregisters the descriptor behind `token`. Does not close it — the
    /// caller may be deregistering an inherited descriptor it must keep
    /// open (SPEC_FULL §4.3, socket-activation descriptors).
    pub fn remove(&mut self, token: Token) -> std::io::Result<RawFd> {
        let fd = self
            .slots
            .try_remove(token.0)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unknown token"))?;
        self.epoll.delete(fd)?;
        Ok(fd)
    }

    pub fn fd_for(&self, token: Token) -> Option<RawFd> {
        self.slots.get(token.0).copied()
    }

    /// Blocks until at least one registered descriptor is ready, or
    /// `timeout` elapses. `None` waits forever.
    pub fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.epoll.wait(&mut self.events, timeout)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns whether `token` was among the descriptors that became
    /// readable in the most recent `wait` ("can_read", per SPEC_FULL §4.2).
    pub fn can_read(&self, token: Token) -> bool {
        for i in 0..self.events.len() {
            if let Some(ev) = self.events.get(i) {
                if ev.token() == token && ev.readiness().is_readable() {
                    return true;
                }
            }
        }
        false
    }

    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        (0..self.events.len()).filter_map(move |i| self.events.get(i))
    }

    /// Debug dump of currently-registered tokens, for the "dump" contract
    /// named in SPEC_FULL §4.2 (used by the control dispatcher's status
    /// introspection, and by tests).
    pub fn dump(&self) -> Vec<(Token, RawFd)> {
        self.slots.iter().map(|(k, &fd)| (Token(k), fd)).collect()
    }

    /// Drops every registration without touching the underlying
    /// descriptors, used during a clean shutdown after every descriptor has
    /// already been closed by its owner ("free", per SPEC_FULL §4.2).
    pub fn free(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assigns_stable_tokens() {
        let mut ps = PollSet::init(4).unwrap();
        let (r, w) = unix_pipe();
        let t1 = ps.add(r, Ready::readable()).unwrap();
        let t2 = ps.add(w, Ready::writable()).unwrap();
        assert_ne!(t1, t2);
        assert_eq!(ps.fd_for(t1), Some(r));
        ps.remove(t1).unwrap();
        assert_eq!(ps.fd_for(t1), None);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    fn unix_pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }
}
