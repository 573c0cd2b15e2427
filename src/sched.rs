//! Readiness-based socket scheduler.
//!
//! The one thread of the daemon lives here: a loop that refreshes the clock,
//! runs the timer wheel when its next event is due, waits for readiness on
//! every registered file descriptor and invokes the per-socket callbacks with
//! the actual read/write bits. Callbacks are cooperative; they must return
//! quickly and chunk long work through timers.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::clock::{Clock, NEVER};
use crate::sys::selector::{self, Selector};
use crate::timer::TimerWheel;

/// Process-wide running latch. Cleared by signal handlers and the `quit`
/// surfaces; `handle(0)` returns on the next iteration once cleared.
static RUNNING: AtomicBool = AtomicBool::new(true);

/// Ask the main loop to terminate.
pub fn request_shutdown() {
    RUNNING.store(false, Ordering::Release);
}

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

/// Re-arm the running latch, used at process start and by tests.
pub fn clear_shutdown() {
    RUNNING.store(true, Ordering::Release);
}

/// Per-socket callback: file descriptor, read-ready, write-ready.
pub type IoCallback = Rc<dyn Fn(RawFd, bool, bool)>;

/// Handle to a socket registration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SocketEntry {
    idx: u32,
    gen: u32,
}

struct Reg {
    fd: RawFd,
    read: bool,
    write: bool,
    callback: Option<IoCallback>,
}

struct RegSlot {
    gen: u32,
    data: Option<Reg>,
}

struct Sched {
    selector: Selector,
    regs: Vec<RegSlot>,
    free: Vec<u32>,
    /// Removed during the current dispatch sweep; reaped at the next loop
    /// top so their slots cannot be recycled mid-sweep.
    dead: Vec<u32>,
}

/// Shared handle to the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<Sched>>,
    clock: Clock,
    timers: TimerWheel,
}

impl Scheduler {
    pub fn new(clock: Clock, timers: TimerWheel) -> io::Result<Scheduler> {
        Ok(Scheduler {
            inner: Rc::new(RefCell::new(Sched {
                selector: Selector::new()?,
                regs: Vec::new(),
                free: Vec::new(),
                dead: Vec::new(),
            })),
            clock,
            timers,
        })
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    /// Register a file descriptor with the scheduler. The fd stays owned by
    /// the caller; the scheduler only borrows it for readiness queries.
    pub fn add(
        &self,
        fd: RawFd,
        read: bool,
        write: bool,
        callback: IoCallback,
    ) -> io::Result<SocketEntry> {
        let mut s = self.inner.borrow_mut();
        let reg = Reg {
            fd,
            read,
            write,
            callback: Some(callback),
        };
        let idx = match s.free.pop() {
            Some(idx) => {
                s.regs[idx as usize].data = Some(reg);
                idx
            }
            None => {
                s.regs.push(RegSlot { gen: 0, data: Some(reg) });
                s.regs.len() as u32 - 1
            }
        };
        s.selector.register(fd, idx as usize, read, write)?;
        debug!("adding socket entry {} to scheduler", fd);
        Ok(SocketEntry {
            idx,
            gen: s.regs[idx as usize].gen,
        })
    }

    /// Mark a registration for removal. Idempotent; the callback is dropped
    /// immediately, the slot is reaped on the next loop iteration, and
    /// closing the fd remains the owner's responsibility.
    pub fn remove(&self, entry: SocketEntry) {
        let mut s = self.inner.borrow_mut();
        if !s.is_live(entry) {
            return;
        }
        let reg = s.regs[entry.idx as usize].data.as_mut().expect("live registration");
        debug!("removing socket entry {} from scheduler", reg.fd);
        reg.callback = None;
        reg.read = false;
        reg.write = false;
        let fd = reg.fd;
        let _ = s.selector.deregister(fd);
        s.dead.push(entry.idx);
    }

    pub fn set_read(&self, entry: SocketEntry, read: bool) {
        self.set_interest(entry, Some(read), None);
    }

    pub fn set_write(&self, entry: SocketEntry, write: bool) {
        self.set_interest(entry, None, Some(write));
    }

    fn set_interest(&self, entry: SocketEntry, read: Option<bool>, write: Option<bool>) {
        let mut s = self.inner.borrow_mut();
        if !s.is_live(entry) {
            return;
        }
        let reg = s.regs[entry.idx as usize].data.as_mut().expect("live registration");
        if reg.callback.is_none() {
            return;
        }
        let new_read = read.unwrap_or(reg.read);
        let new_write = write.unwrap_or(reg.write);
        if new_read == reg.read && new_write == reg.write {
            return;
        }
        reg.read = new_read;
        reg.write = new_write;
        let fd = reg.fd;
        if let Err(err) = s.selector.reregister(fd, entry.idx as usize, new_read, new_write) {
            warn!("cannot change interest of fd {}: {}", fd, err);
        }
    }

    /// Run the event loop until `until` (absolute ms) is reached or, with
    /// `until == 0`, until the running latch clears. Returns an error only
    /// for unrecoverable OS failures.
    pub fn handle(&self, until: u64) -> io::Result<()> {
        let mut events: selector::Events = Vec::with_capacity(256);

        loop {
            self.clock.update()?;
            self.reap();

            if self.timers.next_event() <= self.clock.now() {
                self.timers.walk();
            }

            if !is_running() {
                return Ok(());
            }
            let now = self.clock.now();
            if until != 0 && now >= until {
                return Ok(());
            }

            let mut wake = self.timers.next_event();
            if until != 0 && until < wake {
                wake = until;
            }
            let timeout = if wake == NEVER {
                None
            } else {
                Some(Duration::from_millis(wake.saturating_sub(now)))
            };

            let result = {
                let s = self.inner.borrow();
                s.selector.select(&mut events, timeout)
            };
            match result {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    // Retried transparently; a signal may have cleared the
                    // running latch, which the loop top picks up.
                    events.clear();
                    continue;
                }
                Err(err) => {
                    warn!("selector error: {}", err);
                    return Err(err);
                }
            }

            self.clock.update()?;

            for event in events.iter() {
                let token = selector::event::token(event);
                let read = selector::event::is_readable(event);
                let write = selector::event::is_writable(event);

                // The callback may have been cleared by an earlier callback
                // in this same sweep.
                let target = {
                    let s = self.inner.borrow();
                    s.regs.get(token).and_then(|slot| {
                        slot.data
                            .as_ref()
                            .and_then(|reg| reg.callback.clone().map(|cb| (reg.fd, cb)))
                    })
                };
                if let Some((fd, callback)) = target {
                    trace!("dispatch fd {} read={} write={}", fd, read, write);
                    callback(fd, read, write);
                }
            }
        }
    }

    fn reap(&self) {
        let mut s = self.inner.borrow_mut();
        while let Some(idx) = s.dead.pop() {
            let slot = &mut s.regs[idx as usize];
            slot.data = None;
            slot.gen = slot.gen.wrapping_add(1);
            s.free.push(idx);
        }
    }
}

impl Sched {
    fn is_live(&self, entry: SocketEntry) -> bool {
        self.regs
            .get(entry.idx as usize)
            .map_or(false, |slot| slot.gen == entry.gen && slot.data.is_some())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.inner.borrow();
        let live = s.regs.iter().filter(|r| r.data.is_some()).count();
        f.debug_struct("Scheduler").field("sockets", &live).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn handle_runs_timers_until_deadline() {
        let clock = Clock::new().unwrap();
        let timers = TimerWheel::new(clock.clone());
        let sched = Scheduler::new(clock.clone(), timers.clone()).unwrap();

        let fired = Rc::new(Cell::new(false));
        let class = {
            let fired = fired.clone();
            timers.add_class("test fire", false, Rc::new(move |_, _| fired.set(true)))
        };
        let timer = timers.create(class, 0, 0);
        timers.start(timer, 20);

        sched.handle(clock.absolute(120)).unwrap();
        assert!(fired.get());
        assert!(clock.now() >= clock.now().saturating_sub(120));
    }

    #[test]
    fn remove_is_idempotent() {
        let clock = Clock::new().unwrap();
        let timers = TimerWheel::new(clock.clone());
        let sched = Scheduler::new(clock.clone(), timers.clone()).unwrap();

        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        use std::os::fd::AsRawFd;
        let entry = sched
            .add(socket.as_raw_fd(), true, false, Rc::new(|_, _, _| {}))
            .unwrap();

        sched.remove(entry);
        sched.remove(entry);
        sched.set_read(entry, true);

        // Run one bounded iteration so the dead slot is reaped.
        sched.handle(clock.absolute(10)).unwrap();
    }
}
