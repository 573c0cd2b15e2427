//! UDP endpoints with an outgoing queue.
//!
//! A packet socket tries to send directly; when the kernel pushes back the
//! datagram is queued as an `(address, payload)` frame and flushed once the
//! scheduler reports the socket writable. Incoming datagrams are handed to
//! the receive callback as one slice per datagram.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{self, IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::acl::Acl;
use crate::sched::{Scheduler, SocketEntry};
use crate::sys::net as sysnet;

const INPUT_BUFFER_SIZE: usize = 65536;

/// Receive callback: socket, source address, payload.
pub type PacketReceive = Rc<dyn Fn(&PacketSocket, SocketAddr, &[u8])>;

struct PacketInner {
    socket: Option<net::UdpSocket>,
    local: SocketAddr,
    entry: Option<SocketEntry>,
    queue: VecDeque<(SocketAddr, Vec<u8>)>,
    receive: Option<PacketReceive>,
    input: Vec<u8>,
    sched: Scheduler,
}

/// Shared handle to a bound UDP endpoint.
#[derive(Clone)]
pub struct PacketSocket {
    inner: Rc<RefCell<PacketInner>>,
}

impl PacketSocket {
    /// Bind a packet socket and hook it into the scheduler.
    pub fn open(sched: &Scheduler, local: SocketAddr) -> io::Result<PacketSocket> {
        let socket = sysnet::bind_udp(local)?;
        let local = socket.local_addr()?;
        let fd = socket.as_raw_fd();

        let inner = Rc::new(RefCell::new(PacketInner {
            socket: Some(socket),
            local,
            entry: None,
            queue: VecDeque::new(),
            receive: None,
            input: vec![0; INPUT_BUFFER_SIZE],
            sched: sched.clone(),
        }));

        let weak: Weak<RefCell<PacketInner>> = Rc::downgrade(&inner);
        let entry = sched.add(
            fd,
            true,
            false,
            Rc::new(move |fd, read, write| {
                if let Some(inner) = weak.upgrade() {
                    PacketSocket { inner }.event(fd, read, write);
                }
            }),
        )?;
        inner.borrow_mut().entry = Some(entry);

        debug!("packet socket bound to {}", local);
        Ok(PacketSocket { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.borrow().local
    }

    pub fn set_receive(&self, callback: Option<PacketReceive>) {
        self.inner.borrow_mut().receive = callback;
    }

    /// Number of frames waiting in the outgoing queue.
    pub fn queued(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Send a datagram. Queues the frame on kernel pushback; hard errors are
    /// logged and returned.
    pub fn send(&self, remote: SocketAddr, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let fd = match &inner.socket {
            Some(socket) => socket.as_raw_fd(),
            None => return Err(io::ErrorKind::NotConnected.into()),
        };

        if inner.queue.is_empty() {
            match sysnet::send_to(fd, data, &remote) {
                Ok(_) => return Ok(()),
                Err(ref err) if sysnet::soft_error(err) => {}
                Err(err) => {
                    warn!("cannot send UDP packet to {}: {}", remote, err);
                    return Err(err);
                }
            }
        }

        inner.queue.push_back((remote, data.to_vec()));
        if let Some(entry) = inner.entry {
            inner.sched.set_write(entry, true);
        }
        Ok(())
    }

    /// Tear the socket down: deregister, close, drop queued output.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entry.take() {
            inner.sched.remove(entry);
        }
        inner.socket = None;
        inner.receive = None;
        inner.queue.clear();
    }

    fn event(&self, fd: RawFd, read: bool, write: bool) {
        if read {
            self.read_event(fd);
        }
        if write {
            self.write_event(fd);
        }

        let inner = self.inner.borrow();
        if inner.queue.is_empty() {
            if let Some(entry) = inner.entry {
                inner.sched.set_write(entry, false);
            }
        }
    }

    fn read_event(&self, fd: RawFd) {
        // Take the input buffer so the receive callback may re-enter the
        // socket (e.g. to answer the datagram).
        let (received, mut buf) = {
            let mut inner = self.inner.borrow_mut();
            let mut buf = std::mem::take(&mut inner.input);
            if buf.is_empty() {
                buf = vec![0; INPUT_BUFFER_SIZE];
            }
            let local = inner.local;
            match sysnet::recv_from(fd, &mut buf) {
                Ok((len, from)) => (Some((len, from)), buf),
                Err(ref err) if sysnet::soft_error(err) => (None, buf),
                Err(err) => {
                    warn!("cannot read packet from socket {}: {}", local, err);
                    (None, buf)
                }
            }
        };

        if let Some((len, from)) = received {
            let callback = self.inner.borrow().receive.clone();
            if let Some(callback) = callback {
                callback(self, from, &buf[..len]);
            }
        }

        buf.resize(INPUT_BUFFER_SIZE, 0);
        self.inner.borrow_mut().input = buf;
    }

    fn write_event(&self, fd: RawFd) {
        let mut inner = self.inner.borrow_mut();
        while let Some((remote, data)) = inner.queue.pop_front() {
            match sysnet::send_to(fd, &data, &remote) {
                Ok(_) => {}
                Err(ref err) if sysnet::soft_error(err) => {
                    // Try again later; stay write-interested.
                    inner.queue.push_front((remote, data));
                    return;
                }
                Err(err) => {
                    // Drop the frame, keep draining.
                    warn!("cannot send UDP packet to {}: {}", remote, err);
                }
            }
        }
    }
}

impl std::fmt::Debug for PacketSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("PacketSocket")
            .field("local", &inner.local)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

/// Configuration block of a managed v4+v6 packet socket pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketConfig {
    pub bind_v4: Option<IpAddr>,
    pub bind_v6: Option<IpAddr>,
    pub port: u16,
    pub ipv4: bool,
    pub ipv6: bool,
    pub acl: Acl,
}

impl Default for PacketConfig {
    fn default() -> PacketConfig {
        PacketConfig {
            bind_v4: Some(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            bind_v6: Some(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
            port: 0,
            ipv4: true,
            ipv6: true,
            acl: Acl::accept_all(),
        }
    }
}

/// Managed pair of packet sockets, rebuilt when the applied configuration
/// changes and filtered by a shared ACL.
pub struct ManagedPacketSocket {
    sched: Scheduler,
    v4: Option<PacketSocket>,
    v6: Option<PacketSocket>,
    bound_v4: Option<SocketAddr>,
    bound_v6: Option<SocketAddr>,
    acl: Rc<RefCell<Acl>>,
    receive: PacketReceive,
}

impl ManagedPacketSocket {
    pub fn new(sched: &Scheduler, receive: PacketReceive) -> ManagedPacketSocket {
        ManagedPacketSocket {
            sched: sched.clone(),
            v4: None,
            v6: None,
            bound_v4: None,
            bound_v6: None,
            acl: Rc::new(RefCell::new(Acl::accept_all())),
            receive,
        }
    }

    pub fn socket_v4(&self) -> Option<&PacketSocket> {
        self.v4.as_ref()
    }

    pub fn socket_v6(&self) -> Option<&PacketSocket> {
        self.v6.as_ref()
    }

    /// Apply a configuration: rebind each family iff its binding changed,
    /// tear down a family that was disabled.
    pub fn apply(&mut self, config: &PacketConfig) -> io::Result<()> {
        *self.acl.borrow_mut() = config.acl.clone();

        let want_v4 = config
            .ipv4
            .then_some(())
            .and(config.bind_v4)
            .map(|ip| SocketAddr::new(ip, config.port));
        let want_v6 = config
            .ipv6
            .then_some(())
            .and(config.bind_v6)
            .map(|ip| SocketAddr::new(ip, config.port));

        if self.bound_v4 != want_v4 {
            if let Some(socket) = self.v4.take() {
                socket.close();
            }
            self.v4 = want_v4.map(|addr| self.open_filtered(addr)).transpose()?;
            self.bound_v4 = want_v4;
        }
        if self.bound_v6 != want_v6 {
            if let Some(socket) = self.v6.take() {
                socket.close();
            }
            self.v6 = want_v6.map(|addr| self.open_filtered(addr)).transpose()?;
            self.bound_v6 = want_v6;
        }
        Ok(())
    }

    fn open_filtered(&self, addr: SocketAddr) -> io::Result<PacketSocket> {
        let socket = PacketSocket::open(&self.sched, addr)?;
        let acl = self.acl.clone();
        let receive = self.receive.clone();
        socket.set_receive(Some(Rc::new(move |socket, from, data| {
            if !acl.borrow().check(&from.ip()) {
                debug!("dropped packet from {} because of acl", from);
                return;
            }
            receive(socket, from, data);
        })));
        Ok(socket)
    }

    pub fn close(&mut self) {
        if let Some(socket) = self.v4.take() {
            socket.close();
        }
        if let Some(socket) = self.v6.take() {
            socket.close();
        }
        self.bound_v4 = None;
        self.bound_v6 = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::timer::TimerWheel;
    use std::cell::RefCell;

    fn scheduler() -> Scheduler {
        let clock = Clock::new().unwrap();
        let timers = TimerWheel::new(clock.clone());
        Scheduler::new(clock, timers).unwrap()
    }

    #[test]
    fn queue_conserves_frames() {
        let sched = scheduler();
        let socket = PacketSocket::open(&sched, "127.0.0.1:0".parse().unwrap()).unwrap();
        let peer = PacketSocket::open(&sched, "127.0.0.1:0".parse().unwrap()).unwrap();

        let sent: usize = [3usize, 5, 9].iter().sum();
        let received = Rc::new(RefCell::new(0usize));
        {
            let received = received.clone();
            peer.set_receive(Some(Rc::new(move |_, _, data| {
                *received.borrow_mut() += data.len();
            })));
        }

        for len in [3usize, 5, 9] {
            socket
                .send(peer.local_addr(), &vec![0x55u8; len])
                .unwrap();
        }

        let deadline = sched.clock().absolute(500);
        while *received.borrow() < sent && !sched.clock().is_past(deadline) {
            sched.handle(sched.clock().absolute(20)).unwrap();
        }
        assert_eq!(*received.borrow(), sent);
        assert_eq!(socket.queued(), 0);

        socket.close();
        peer.close();
    }

    #[test]
    fn managed_pair_rebinds_on_change() {
        let sched = scheduler();
        let mut managed = ManagedPacketSocket::new(&sched, Rc::new(|_, _, _| {}));

        let mut config = PacketConfig {
            bind_v4: Some("127.0.0.1".parse().unwrap()),
            bind_v6: None,
            port: 0,
            ipv4: true,
            ipv6: false,
            acl: Acl::accept_all(),
        };
        managed.apply(&config).unwrap();
        assert!(managed.socket_v4().is_some());
        assert!(managed.socket_v6().is_none());

        // Pin the kernel-chosen port and re-apply; the pair rebinds to it.
        let before = managed.socket_v4().unwrap().local_addr();
        config.port = before.port();
        managed.apply(&config).unwrap();
        assert_eq!(managed.socket_v4().unwrap().local_addr(), before);

        // Disable the family.
        config.ipv4 = false;
        managed.apply(&config).unwrap();
        assert!(managed.socket_v4().is_none());

        managed.close();
    }
}
