//! Accepted TCP sessions with bounded buffers and timeouts.
//!
//! A stream listener turns accepted connections into per-session state
//! machines. Sessions own their buffers and inactivity timer; the listener
//! owns the sessions and unlinks one before any teardown callback runs.
//! Callbacks receive `&mut Session` while the session is temporarily moved
//! out of the listener, so they may call back into the listener freely.

use std::any::Any;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{self, IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::acl::Acl;
use crate::sched::{Scheduler, SocketEntry};
use crate::sys::net as sysnet;
use crate::timer::{Timer, TimerClass, TimerWheel};

const LISTEN_BACKLOG: u32 = 32;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is active and reading input.
    Active,
    /// Flush the outbound buffer, then clean up.
    SendAndQuit,
    /// Tear the session down now.
    Cleanup,
}

/// Error kinds surfaced to the `create_error` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    Forbidden,
    RequestTooLarge,
    ServiceUnavailable,
}

/// Callbacks and limits shared by every session of a listener.
#[derive(Clone)]
pub struct StreamConfig {
    pub session_timeout_ms: u64,
    pub max_input: usize,
    pub max_sessions: usize,
    pub send_first: bool,
    pub init: Option<Rc<dyn Fn(&mut Session)>>,
    pub cleanup: Option<Rc<dyn Fn(&mut Session)>>,
    pub receive: Option<Rc<dyn Fn(&mut Session) -> SessionState>>,
    pub create_error: Option<Rc<dyn Fn(&mut Session, StreamError)>>,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            session_timeout_ms: 120_000,
            max_input: 65536,
            max_sessions: 10,
            send_first: false,
            init: None,
            cleanup: None,
            receive: None,
            create_error: None,
        }
    }
}

/// One accepted (or outbound) TCP connection.
pub struct Session {
    peer: SocketAddr,
    pub inbuf: Vec<u8>,
    pub out: Vec<u8>,
    pub state: SessionState,
    /// Upper-layer extension state, attached by the `init` callback.
    pub ext: Option<Box<dyn Any>>,
    stream: Option<net::TcpStream>,
    entry: SocketEntry,
    timeout: Timer,
    timeout_ms: u64,
    wait_for_connect: bool,
    send_first: bool,
    id: usize,
    listener: Weak<RefCell<ListenerInner>>,
    sched: Scheduler,
    timers: TimerWheel,
}

impl Session {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The listener this session belongs to, while it still exists.
    pub fn listener(&self) -> Option<StreamListener> {
        self.listener.upgrade().map(|inner| StreamListener { inner })
    }

    pub fn timers(&self) -> &TimerWheel {
        &self.timers
    }

    /// Append data to the outbound buffer. The scheduler is asked to flush
    /// at the end of the current event; use [`Session::flush`] from timer
    /// callbacks.
    pub fn write(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    /// Enable write interest so queued output leaves outside a socket event.
    pub fn flush(&self) {
        self.sched.set_write(self.entry, true);
    }

    /// Change the inactivity timeout and re-arm it.
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
        self.timers.set(self.timeout, timeout_ms);
    }

    fn reset_timeout(&mut self) {
        self.timers.set(self.timeout, self.timeout_ms);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("in", &self.inbuf.len())
            .field("out", &self.out.len())
            .finish()
    }
}

struct ListenerInner {
    listener: Option<net::TcpListener>,
    local: SocketAddr,
    entry: Option<SocketEntry>,
    config: StreamConfig,
    acl: Rc<RefCell<Acl>>,
    sessions: Vec<Option<Session>>,
    free: Vec<usize>,
    count: usize,
    timeout_class: TimerClass,
    sched: Scheduler,
    timers: TimerWheel,
}

/// Shared handle to a stream listener and its sessions.
#[derive(Clone)]
pub struct StreamListener {
    inner: Rc<RefCell<ListenerInner>>,
}

impl StreamListener {
    /// Bind a listening socket and hook it into the scheduler.
    pub fn open(
        sched: &Scheduler,
        local: SocketAddr,
        config: StreamConfig,
    ) -> io::Result<StreamListener> {
        Self::build(sched, Some(local), config)
    }

    /// Create a listener shell without a bound socket, used for outbound
    /// connections only.
    pub fn outbound(sched: &Scheduler, config: StreamConfig) -> io::Result<StreamListener> {
        Self::build(sched, None, config)
    }

    fn build(
        sched: &Scheduler,
        local: Option<SocketAddr>,
        config: StreamConfig,
    ) -> io::Result<StreamListener> {
        let timers = sched.timers().clone();

        let (socket, local_addr) = match local {
            Some(addr) => {
                let socket = sysnet::bind_listener(addr, LISTEN_BACKLOG)?;
                let bound = socket.local_addr()?;
                (Some(socket), bound)
            }
            None => (None, SocketAddr::new(IpAddr::V4(net::Ipv4Addr::UNSPECIFIED), 0)),
        };

        let inner = Rc::new(RefCell::new(ListenerInner {
            listener: socket,
            local: local_addr,
            entry: None,
            config,
            acl: Rc::new(RefCell::new(Acl::accept_all())),
            sessions: Vec::new(),
            free: Vec::new(),
            count: 0,
            // placeholder, replaced right below
            timeout_class: TimerClass::PLACEHOLDER,
            sched: sched.clone(),
            timers: timers.clone(),
        }));

        let timeout_class = {
            let weak = Rc::downgrade(&inner);
            timers.add_class(
                "stream session timeout",
                false,
                Rc::new(move |_, ctx| {
                    if let Some(inner) = weak.upgrade() {
                        StreamListener { inner }.timeout_fired(ctx);
                    }
                }),
            )
        };
        inner.borrow_mut().timeout_class = timeout_class;

        let listen_fd = inner.borrow().listener.as_ref().map(|s| s.as_raw_fd());
        if let Some(fd) = listen_fd {
            let weak = Rc::downgrade(&inner);
            let entry = sched.add(
                fd,
                true,
                false,
                Rc::new(move |_, read, _| {
                    if !read {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        StreamListener { inner }.accept_event();
                    }
                }),
            )?;
            inner.borrow_mut().entry = Some(entry);
            debug!("stream listener bound to {}", local_addr);
        }

        Ok(StreamListener { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.borrow().local
    }

    pub fn session_count(&self) -> usize {
        self.inner.borrow().count
    }

    /// Replace the ACL shared by all sessions of this listener.
    pub fn set_acl(&self, acl: Acl) {
        *self.inner.borrow().acl.borrow_mut() = acl;
    }

    /// Open an outbound connection as a session of this listener. Returns
    /// the session id.
    pub fn connect_to(&self, remote: SocketAddr) -> io::Result<usize> {
        let (stream, in_progress) = sysnet::connect_stream(remote)?;
        self.create_session(stream, remote, in_progress)
    }

    /// Run a closure against a live session, then process the resulting
    /// buffer and state changes. Used by timer-driven producers.
    pub fn with_session<R>(&self, id: usize, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut session = self.take_session(id)?;
        let result = f(&mut session);

        if session.state == SessionState::Cleanup {
            self.teardown(session);
        } else {
            if !session.out.is_empty() {
                session.flush();
            }
            self.put_back(id, session);
        }
        Some(result)
    }

    /// Close every session and the listening socket itself.
    pub fn close(&self) {
        let ids: Vec<usize> = {
            let inner = self.inner.borrow();
            (0..inner.sessions.len())
                .filter(|&i| inner.sessions[i].is_some())
                .collect()
        };
        for id in ids {
            if let Some(session) = self.take_session(id) {
                self.teardown(session);
            }
        }

        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entry.take() {
            inner.sched.remove(entry);
        }
        inner.listener = None;
        let class = inner.timeout_class;
        let timers = inner.timers.clone();
        drop(inner);
        timers.remove_class(class);
    }

    fn accept_event(&self) {
        loop {
            let accepted = {
                let inner = self.inner.borrow();
                match inner.listener.as_ref() {
                    Some(listener) => sysnet::accept(listener),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("got connection from {}", peer);
                    let _ = self.create_session(stream, peer, false);
                }
                Err(ref err) if sysnet::would_block(err) => return,
                Err(ref err) if sysnet::interrupted(err) => continue,
                Err(err) => {
                    warn!("accept() call returned error: {}", err);
                    return;
                }
            }
        }
    }

    fn create_session(
        &self,
        stream: net::TcpStream,
        peer: SocketAddr,
        wait_for_connect: bool,
    ) -> io::Result<usize> {
        let fd = stream.as_raw_fd();

        let (id, entry, timer, config, allowed, at_capacity) = {
            let mut inner = self.inner.borrow_mut();

            let id = match inner.free.pop() {
                Some(id) => id,
                None => {
                    inner.sessions.push(None);
                    inner.sessions.len() - 1
                }
            };

            let weak = Rc::downgrade(&self.inner);
            let entry = match inner.sched.add(
                fd,
                true,
                true,
                Rc::new(move |_, read, write| {
                    if let Some(inner) = weak.upgrade() {
                        StreamListener { inner }.session_event(id, read, write);
                    }
                }),
            ) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("cannot hook session into scheduler: {}", err);
                    inner.free.push(id);
                    return Err(err);
                }
            };

            let timer = inner.timers.create(inner.timeout_class, 0, id);
            let allowed = inner.acl.borrow().check(&peer.ip());
            let at_capacity = inner.count >= inner.config.max_sessions;
            (id, entry, timer, inner.config.clone(), allowed, at_capacity)
        };

        let mut session = Session {
            peer,
            inbuf: Vec::new(),
            out: Vec::new(),
            state: SessionState::Active,
            ext: None,
            stream: Some(stream),
            entry,
            timeout: timer,
            timeout_ms: config.session_timeout_ms,
            wait_for_connect,
            send_first: config.send_first,
            id,
            listener: Rc::downgrade(&self.inner),
            sched: self.inner.borrow().sched.clone(),
            timers: self.inner.borrow().timers.clone(),
        };

        if !allowed {
            debug!("session from {} rejected by acl", peer);
            if let Some(cb) = &config.create_error {
                cb(&mut session, StreamError::Forbidden);
            }
            session.state = SessionState::SendAndQuit;
        } else if at_capacity {
            if let Some(cb) = &config.create_error {
                cb(&mut session, StreamError::ServiceUnavailable);
            }
            session.state = SessionState::SendAndQuit;
        } else {
            if let Some(cb) = &config.init {
                cb(&mut session);
            }
        }

        if config.session_timeout_ms > 0 {
            session.reset_timeout();
        }

        let mut inner = self.inner.borrow_mut();
        inner.sessions[id] = Some(session);
        inner.count += 1;
        Ok(id)
    }

    fn take_session(&self, id: usize) -> Option<Session> {
        self.inner
            .borrow_mut()
            .sessions
            .get_mut(id)
            .and_then(Option::take)
    }

    fn put_back(&self, id: usize, session: Session) {
        self.inner.borrow_mut().sessions[id] = Some(session);
    }

    fn timeout_fired(&self, id: usize) {
        if let Some(mut session) = self.take_session(id) {
            debug!("session with {} timed out", session.peer);
            session.state = SessionState::Cleanup;
            self.teardown(session);
        }
    }

    fn session_event(&self, id: usize, read: bool, write: bool) {
        let Some(mut session) = self.take_session(id) else {
            return;
        };
        let config = self.inner.borrow().config.clone();

        if session.wait_for_connect && write {
            let fd = session.stream.as_ref().map(|s| s.as_raw_fd());
            match fd.map(sysnet::take_socket_error) {
                Some(Ok(None)) => session.wait_for_connect = false,
                Some(Ok(Some(err))) => {
                    warn!("connection to {} failed: {}", session.peer, err);
                    session.state = SessionState::Cleanup;
                }
                Some(Err(err)) => {
                    warn!("cannot read socket status: {}", err);
                    session.state = SessionState::Cleanup;
                }
                None => session.state = SessionState::Cleanup,
            }
        }

        if !session.wait_for_connect {
            if session.state == SessionState::Active && read {
                let mut chunk = [0u8; READ_CHUNK];
                let result = session
                    .stream
                    .as_mut()
                    .map(|stream| stream.read(&mut chunk));
                match result {
                    Some(Ok(0)) => {
                        // Peer closed; flush what we have and quit.
                        session.state = SessionState::SendAndQuit;
                    }
                    Some(Ok(n)) => {
                        session.inbuf.extend_from_slice(&chunk[..n]);
                        if session.inbuf.len() > config.max_input {
                            if let Some(cb) = &config.create_error {
                                cb(&mut session, StreamError::RequestTooLarge);
                            }
                            session.state = SessionState::SendAndQuit;
                        } else {
                            session.reset_timeout();
                        }
                    }
                    Some(Err(ref err)) if sysnet::soft_error(err) => {}
                    Some(Err(err)) => {
                        warn!("error while reading from {}: {}", session.peer, err);
                        session.state = SessionState::Cleanup;
                    }
                    None => session.state = SessionState::Cleanup,
                }
            }

            if session.state == SessionState::Active
                && config.receive.is_some()
                && (!session.inbuf.is_empty() || session.send_first)
            {
                let receive = config.receive.clone().expect("receive callback");
                session.state = receive(&mut session);
                session.send_first = false;
            }
        }

        if session.state != SessionState::Cleanup && !session.out.is_empty() {
            if write {
                let result = session
                    .stream
                    .as_mut()
                    .map(|stream| stream.write(&session.out));
                match result {
                    Some(Ok(n)) => {
                        session.out.drain(..n);
                        session.reset_timeout();
                    }
                    Some(Err(ref err)) if sysnet::soft_error(err) => {}
                    Some(Err(err)) => {
                        warn!("error while writing to {}: {}", session.peer, err);
                        session.state = SessionState::Cleanup;
                    }
                    None => session.state = SessionState::Cleanup,
                }
            } else {
                session.flush();
            }
        }

        if session.out.is_empty() {
            session.sched.set_write(session.entry, false);
            if session.state == SessionState::SendAndQuit {
                session.state = SessionState::Cleanup;
            }
        }

        if session.state == SessionState::Cleanup {
            self.teardown(session);
        } else {
            self.put_back(id, session);
        }
    }

    /// The session is already unlinked from the listener when this runs.
    fn teardown(&self, mut session: Session) {
        let config = self.inner.borrow().config.clone();

        session.timers.destroy(session.timeout);
        if let Some(cb) = &config.cleanup {
            cb(&mut session);
        }
        session.sched.remove(session.entry);
        session.stream = None;

        let mut inner = self.inner.borrow_mut();
        inner.free.push(session.id);
        inner.count -= 1;
        debug!("session with {} closed", session.peer);
    }
}

impl std::fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("StreamListener")
            .field("local", &inner.local)
            .field("sessions", &inner.count)
            .finish()
    }
}

/// Configuration block of a managed v4+v6 stream socket pair.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSocketConfig {
    pub bind_v4: Option<IpAddr>,
    pub bind_v6: Option<IpAddr>,
    pub port: u16,
    pub ipv4: bool,
    pub ipv6: bool,
    pub acl: Acl,
}

impl Default for StreamSocketConfig {
    fn default() -> StreamSocketConfig {
        StreamSocketConfig {
            bind_v4: Some("127.0.0.1".parse().expect("loopback")),
            bind_v6: Some(IpAddr::V6(net::Ipv6Addr::LOCALHOST)),
            port: 0,
            ipv4: true,
            ipv6: true,
            acl: Acl::accept_all(),
        }
    }
}

/// Managed pair of stream listeners sharing one session configuration.
pub struct ManagedStreamSocket {
    sched: Scheduler,
    base: StreamConfig,
    v4: Option<StreamListener>,
    v6: Option<StreamListener>,
    bound_v4: Option<SocketAddr>,
    bound_v6: Option<SocketAddr>,
}

impl ManagedStreamSocket {
    pub fn new(sched: &Scheduler, base: StreamConfig) -> ManagedStreamSocket {
        ManagedStreamSocket {
            sched: sched.clone(),
            base,
            v4: None,
            v6: None,
            bound_v4: None,
            bound_v6: None,
        }
    }

    pub fn listener_v4(&self) -> Option<&StreamListener> {
        self.v4.as_ref()
    }

    pub fn listener_v6(&self) -> Option<&StreamListener> {
        self.v6.as_ref()
    }

    /// Apply a configuration: rebind each family iff its binding changed,
    /// tear down a family that was disabled.
    pub fn apply(&mut self, config: &StreamSocketConfig) -> io::Result<()> {
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
            if let Some(listener) = self.v4.take() {
                listener.close();
            }
            self.v4 = want_v4
                .map(|addr| StreamListener::open(&self.sched, addr, self.base.clone()))
                .transpose()?;
            self.bound_v4 = want_v4;
        }
        if self.bound_v6 != want_v6 {
            if let Some(listener) = self.v6.take() {
                listener.close();
            }
            self.v6 = want_v6
                .map(|addr| StreamListener::open(&self.sched, addr, self.base.clone()))
                .transpose()?;
            self.bound_v6 = want_v6;
        }

        for listener in [self.v4.as_ref(), self.v6.as_ref()].into_iter().flatten() {
            listener.set_acl(config.acl.clone());
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(listener) = self.v4.take() {
            listener.close();
        }
        if let Some(listener) = self.v6.take() {
            listener.close();
        }
        self.bound_v4 = None;
        self.bound_v6 = None;
    }
}
