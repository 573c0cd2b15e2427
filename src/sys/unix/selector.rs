use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLIN, EPOLLOUT, EPOLLRDHUP};

/// Thin wrapper around an epoll instance.
///
/// The scheduler toggles read/write interest while a socket has queued
/// output, so the selector runs level-triggered; `EPOLLET` would drop the
/// "still writable" wakeups the drain logic relies on.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis()
                    .min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `epoll_wait` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub fn register(&self, fd: RawFd, token: usize, read: bool, write: bool) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(read, write),
            u64: token as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, token: usize, read: bool, write: bool) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(read, write),
            u64: token as u64,
        };

        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())).map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interests_to_epoll(read: bool, write: bool) -> u32 {
    let mut kind = 0;

    if read {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if write {
        kind |= EPOLLOUT;
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::Event;

    pub fn token(event: &Event) -> usize {
        event.u64 as usize
    }

    pub fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLIN) != 0
            // Socket has received FIN or the peer closed; surface it as a
            // read event so the owner observes the zero-length recv.
            || (event.events as libc::c_int & libc::EPOLLRDHUP) != 0
            || (event.events as libc::c_int & libc::EPOLLHUP) != 0
            || (event.events as libc::c_int & libc::EPOLLERR) != 0
    }

    pub fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLOUT) != 0
            || (event.events as libc::c_int & libc::EPOLLERR) != 0
    }
}
