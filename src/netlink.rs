//! Asynchronous netlink transport.
//!
//! One handle per kernel family. Outgoing requests are queued, stamped with
//! a 31-bit sequence number and flushed in a single `sendmsg` once the
//! socket is writable; every flush arms a short reply timeout that is
//! disarmed when the in-flight count returns to zero via `NLMSG_DONE` or
//! `NLMSG_ERROR`. Incoming data is peeked first so the receive buffer can
//! grow to the kernel's message size in page steps.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use log::{debug, warn};

use crate::interface::Interfaces;
use crate::sched::{Scheduler, SocketEntry};
use crate::sys::ifinfo;
use crate::sys::netlink as sysnl;
use crate::timer::{Timer, TimerClass, TimerWheel};

/// Reply/done/error timeout after a send.
const NETLINK_TIMEOUT_MS: u64 = 100;

const NLMSG_HDRLEN: usize = 16;

const NL_NOOP: u16 = libc::NLMSG_NOOP as u16;
const NL_ERROR: u16 = libc::NLMSG_ERROR as u16;
const NL_DONE: u16 = libc::NLMSG_DONE as u16;

/// Borrowed view of one netlink message.
#[derive(Debug)]
pub struct NlMsg<'a> {
    pub ty: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub payload: &'a [u8],
}

/// Iterate the messages of one datagram; stops at the first malformed
/// length.
pub fn iter_messages(buf: &[u8]) -> impl Iterator<Item = NlMsg<'_>> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset + NLMSG_HDRLEN > buf.len() {
            return None;
        }
        let rest = &buf[offset..];
        let len = u32::from_ne_bytes(rest[0..4].try_into().unwrap()) as usize;
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return None;
        }
        let msg = NlMsg {
            ty: u16::from_ne_bytes(rest[4..6].try_into().unwrap()),
            flags: u16::from_ne_bytes(rest[6..8].try_into().unwrap()),
            seq: u32::from_ne_bytes(rest[8..12].try_into().unwrap()),
            pid: u32::from_ne_bytes(rest[12..16].try_into().unwrap()),
            payload: &rest[NLMSG_HDRLEN..len],
        };
        // Messages are 4-byte aligned within a datagram.
        offset += (len + 3) & !3;
        Some(msg)
    })
}

/// Build a netlink message: header with the given type and flags, payload
/// appended, length filled in. Sequence and pid are stamped by the handle.
pub fn build_message(ty: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + payload.len();
    let mut msg = Vec::with_capacity(len);
    msg.extend_from_slice(&(len as u32).to_ne_bytes());
    msg.extend_from_slice(&ty.to_ne_bytes());
    msg.extend_from_slice(&flags.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // pid
    msg.extend_from_slice(payload);
    msg
}

/// Per-handle callbacks.
#[derive(Default, Clone)]
pub struct NetlinkCallbacks {
    pub message: Option<Rc<dyn Fn(&NlMsg<'_>)>>,
    pub done: Option<Rc<dyn Fn(u32)>>,
    pub error: Option<Rc<dyn Fn(u32, i32)>>,
    pub timeout: Option<Rc<dyn Fn()>>,
}

struct NlInner {
    fd: Option<OwnedFd>,
    entry: Option<SocketEntry>,
    out: Vec<u8>,
    inbuf: Vec<u8>,
    seq_used: u32,
    seq_sent: u32,
    in_flight: u32,
    timer: Timer,
    timer_class: TimerClass,
    callbacks: NetlinkCallbacks,
    sched: Scheduler,
    timers: TimerWheel,
}

/// Shared handle to one netlink socket.
#[derive(Clone)]
pub struct NetlinkHandle {
    inner: Rc<RefCell<NlInner>>,
}

impl NetlinkHandle {
    /// Open a netlink socket for a kernel family and register it with the
    /// scheduler.
    pub fn open(
        sched: &Scheduler,
        protocol: i32,
        callbacks: NetlinkCallbacks,
    ) -> io::Result<NetlinkHandle> {
        let fd = sysnl::open(protocol)?;
        let raw = fd.as_raw_fd();
        let timers = sched.timers().clone();

        let inner = Rc::new(RefCell::new(NlInner {
            fd: Some(fd),
            entry: None,
            out: Vec::new(),
            inbuf: vec![0; sysnl::page_size()],
            seq_used: 0,
            seq_sent: 0,
            in_flight: 0,
            timer: Timer::PLACEHOLDER,
            timer_class: TimerClass::PLACEHOLDER,
            callbacks,
            sched: sched.clone(),
            timers: timers.clone(),
        }));

        let timer_class = {
            let weak = Rc::downgrade(&inner);
            timers.add_class(
                "netlink timeout",
                false,
                Rc::new(move |_, _| {
                    if let Some(inner) = weak.upgrade() {
                        NetlinkHandle { inner }.timeout_fired();
                    }
                }),
            )
        };
        let timer = timers.create(timer_class, 0, 0);
        {
            let mut i = inner.borrow_mut();
            i.timer_class = timer_class;
            i.timer = timer;
        }

        let entry = {
            let weak = Rc::downgrade(&inner);
            sched.add(
                raw,
                true,
                false,
                Rc::new(move |fd, read, write| {
                    if let Some(inner) = weak.upgrade() {
                        NetlinkHandle { inner }.event(fd, read, write);
                    }
                }),
            )?
        };
        inner.borrow_mut().entry = Some(entry);

        Ok(NetlinkHandle { inner })
    }

    /// Queue one message for the kernel, assigning the next sequence number
    /// and forcing `NLM_F_ACK | NLM_F_MULTI`. Returns the sequence number.
    pub fn send(&self, msg: &mut Vec<u8>) -> u32 {
        let mut inner = self.inner.borrow_mut();
        debug_assert!(msg.len() >= NLMSG_HDRLEN);
        debug_assert_eq!(
            u32::from_ne_bytes(msg[0..4].try_into().unwrap()) as usize,
            msg.len()
        );

        let seq = (inner.seq_used + 1) & i32::MAX as u32;
        inner.seq_used = seq;

        msg[8..12].copy_from_slice(&seq.to_ne_bytes());
        let flags = u16::from_ne_bytes(msg[6..8].try_into().unwrap())
            | (libc::NLM_F_ACK as u16)
            | (libc::NLM_F_MULTI as u16);
        msg[6..8].copy_from_slice(&flags.to_ne_bytes());

        inner.out.extend_from_slice(msg);
        inner.in_flight += 1;

        if let Some(entry) = inner.entry {
            inner.sched.set_write(entry, true);
        }
        seq
    }

    /// Join multicast groups.
    pub fn add_mc(&self, groups: &[u32]) -> io::Result<()> {
        let inner = self.inner.borrow();
        let fd = inner.raw_fd().ok_or(io::ErrorKind::NotConnected)?;
        for &group in groups {
            sysnl::add_membership(fd, group)?;
        }
        Ok(())
    }

    /// Leave multicast groups.
    pub fn drop_mc(&self, groups: &[u32]) -> io::Result<()> {
        let inner = self.inner.borrow();
        let fd = inner.raw_fd().ok_or(io::ErrorKind::NotConnected)?;
        for &group in groups {
            sysnl::drop_membership(fd, group)?;
        }
        Ok(())
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.borrow().in_flight
    }

    pub fn last_seq(&self) -> u32 {
        self.inner.borrow().seq_used
    }

    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entry.take() {
            inner.sched.remove(entry);
        }
        inner.fd = None;
        let timers = inner.timers.clone();
        let timer = inner.timer;
        let class = inner.timer_class;
        drop(inner);
        timers.destroy(timer);
        timers.remove_class(class);
    }

    fn event(&self, fd: RawFd, read: bool, write: bool) {
        if write {
            self.flush(fd);
        }
        if read {
            self.receive(fd);
        }
    }

    /// Send the whole outgoing buffer in one message and start the feedback
    /// timer.
    fn flush(&self, fd: RawFd) {
        let mut inner = self.inner.borrow_mut();
        if inner.out.is_empty() {
            if let Some(entry) = inner.entry {
                inner.sched.set_write(entry, false);
            }
            return;
        }

        inner.timers.set(inner.timer, NETLINK_TIMEOUT_MS);

        match sysnl::send(fd, &inner.out) {
            Ok(sent) => {
                debug!(
                    "sent {}/{} bytes for netlink seqno {}",
                    sent,
                    inner.out.len(),
                    inner.seq_used
                );
                inner.seq_sent = inner.seq_used;
                inner.out.clear();
                if let Some(entry) = inner.entry {
                    inner.sched.set_write(entry, false);
                }
            }
            Err(err) => {
                // Keep the buffer, the scheduler will offer the socket again.
                warn!("cannot send data to netlink socket: {}", err);
            }
        }
    }

    fn receive(&self, fd: RawFd) {
        loop {
            // Peek so a truncated message only costs a buffer resize.
            let peeked = {
                let mut inner = self.inner.borrow_mut();
                let NlInner { fd: _, inbuf, .. } = &mut *inner;
                sysnl::recv(fd, inbuf, true)
            };
            match peeked {
                Err(ref err) if crate::sys::net::soft_error(err) => return,
                Err(err) => {
                    warn!("netlink recvmsg error: {}", err);
                    return;
                }
                Ok((len, truncated)) => {
                    let mut inner = self.inner.borrow_mut();
                    if truncated || len > inner.inbuf.len() {
                        let page = sysnl::page_size();
                        let mut size = inner.inbuf.len();
                        while size < len {
                            size += page;
                        }
                        inner.inbuf.resize(size, 0);
                        continue;
                    }
                }
            }

            // The peek fit; now actually take the message off the queue.
            let data = {
                let mut inner = self.inner.borrow_mut();
                let NlInner { inbuf, .. } = &mut *inner;
                match sysnl::recv(fd, inbuf, false) {
                    Ok((len, _)) => inbuf[..len].to_vec(),
                    Err(ref err) if crate::sys::net::soft_error(err) => return,
                    Err(err) => {
                        warn!("netlink recvmsg error: {}", err);
                        return;
                    }
                }
            };
            debug!("got netlink message of {} bytes", data.len());
            self.process_incoming(&data);
        }
    }

    /// Dispatch the messages of one received datagram.
    pub(crate) fn process_incoming(&self, data: &[u8]) {
        let callbacks = self.inner.borrow().callbacks.clone();

        for msg in iter_messages(data) {
            match msg.ty {
                NL_NOOP => {}
                NL_DONE => {
                    debug!("netlink message done: {}", msg.seq);
                    if let Some(done) = &callbacks.done {
                        done(msg.seq);
                    }
                    self.job_finished();
                }
                NL_ERROR => {
                    // nlmsgerr: i32 error followed by the offending header.
                    let error = msg
                        .payload
                        .get(0..4)
                        .map(|b| i32::from_ne_bytes(b.try_into().unwrap()))
                        .unwrap_or(0);
                    let seq = msg
                        .payload
                        .get(12..16)
                        .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
                        .unwrap_or(msg.seq);
                    debug!("received netlink feedback: seq {} error {}", seq, error);
                    if let Some(cb) = &callbacks.error {
                        cb(seq, -error);
                    }
                    self.job_finished();
                }
                _ => {
                    if let Some(message) = &callbacks.message {
                        message(&msg);
                    }
                }
            }
        }
    }

    fn job_finished(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.in_flight > 0 {
            inner.in_flight -= 1;
        }
        if inner.in_flight == 0 {
            inner.timers.stop(inner.timer);
            inner.seq_used = 0;
        }
    }

    fn timeout_fired(&self) {
        let callback = {
            let inner = self.inner.borrow();
            inner.callbacks.timeout.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
        self.inner.borrow_mut().seq_used = 0;
    }

    #[cfg(test)]
    fn timeout_armed(&self) -> bool {
        let inner = self.inner.borrow();
        inner.timers.is_armed(inner.timer)
    }

    #[cfg(test)]
    fn arm_timeout(&self) {
        let inner = self.inner.borrow();
        inner.timers.set(inner.timer, NETLINK_TIMEOUT_MS);
    }
}

impl NlInner {
    fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

impl std::fmt::Debug for NetlinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("NetlinkHandle")
            .field("in_flight", &inner.in_flight)
            .field("seq_used", &inner.seq_used)
            .finish()
    }
}

/// Built-in rtnetlink receiver: joins the link and address multicast groups
/// and maps kernel notifications to interface change triggers.
pub struct RtnetlinkReceiver {
    handle: NetlinkHandle,
}

impl RtnetlinkReceiver {
    pub fn open(sched: &Scheduler, interfaces: &Interfaces) -> io::Result<RtnetlinkReceiver> {
        let interfaces = interfaces.clone();
        let callbacks = NetlinkCallbacks {
            message: Some(Rc::new(move |msg: &NlMsg<'_>| {
                handle_rtnetlink(&interfaces, msg);
            })),
            ..NetlinkCallbacks::default()
        };

        let handle = NetlinkHandle::open(sched, libc::NETLINK_ROUTE, callbacks)?;
        handle.add_mc(&[
            sysnl::RTNLGRP_LINK,
            sysnl::RTNLGRP_IPV4_IFADDR,
            sysnl::RTNLGRP_IPV6_IFADDR,
        ])?;
        Ok(RtnetlinkReceiver { handle })
    }

    pub fn handle(&self) -> &NetlinkHandle {
        &self.handle
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

fn handle_rtnetlink(interfaces: &Interfaces, msg: &NlMsg<'_>) {
    let link = msg.ty == libc::RTM_NEWLINK || msg.ty == libc::RTM_DELLINK;
    let addr = msg.ty == libc::RTM_NEWADDR || msg.ty == libc::RTM_DELADDR;
    if !link && !addr {
        return;
    }

    // Both ifinfomsg and ifaddrmsg carry the interface index at offset 4.
    let Some(index) = msg
        .payload
        .get(4..8)
        .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
    else {
        return;
    };
    if let Some(name) = ifinfo::name_for_index(index) {
        debug!("rtnetlink change on {}", name);
        interfaces.trigger_change(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::cell::RefCell;

    fn scheduler() -> Scheduler {
        let clock = Clock::new().unwrap();
        let timers = TimerWheel::new(clock.clone());
        Scheduler::new(clock, timers).unwrap()
    }

    fn error_frame(seq: u32, errno: i32) -> Vec<u8> {
        // nlmsgerr payload: error code plus the offending header.
        let mut payload = Vec::new();
        payload.extend_from_slice(&(-errno).to_ne_bytes());
        payload.extend_from_slice(&build_message(18, 0, &[]));
        // Stamp the embedded header's sequence number.
        let len = payload.len();
        payload[4 + 8..4 + 12].copy_from_slice(&seq.to_ne_bytes());
        assert_eq!(len, 4 + 16);
        let mut frame = build_message(NL_ERROR, 0, &payload);
        frame[8..12].copy_from_slice(&seq.to_ne_bytes());
        frame
    }

    fn done_frame(seq: u32) -> Vec<u8> {
        let mut frame = build_message(NL_DONE, 0, &0u32.to_ne_bytes());
        frame[8..12].copy_from_slice(&seq.to_ne_bytes());
        frame
    }

    #[test]
    fn message_iteration_with_alignment() {
        let mut buf = build_message(20, 0, &[1, 2, 3]);
        // pad to alignment as the kernel would
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf.extend_from_slice(&build_message(21, 0, &[4, 5, 6, 7]));

        let msgs: Vec<_> = iter_messages(&buf).collect();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].ty, 20);
        assert_eq!(msgs[0].payload, &[1, 2, 3]);
        assert_eq!(msgs[1].ty, 21);
        assert_eq!(msgs[1].payload, &[4, 5, 6, 7]);
    }

    #[test]
    fn truncated_buffer_stops_iteration() {
        let buf = build_message(20, 0, &[0; 32]);
        let msgs: Vec<_> = iter_messages(&buf[..20]).collect();
        assert!(msgs.is_empty());
    }

    #[test]
    fn rtnetlink_receiver_opens() {
        let sched = scheduler();
        let interfaces = Interfaces::new(sched.timers());
        // Environments without netlink just skip.
        if let Ok(receiver) = RtnetlinkReceiver::open(&sched, &interfaces) {
            receiver.close();
        }
        interfaces.close();
    }

    #[test]
    fn sequence_accounting() {
        let sched = scheduler();
        let errors: Rc<RefCell<Vec<(u32, i32)>>> = Rc::new(RefCell::new(Vec::new()));
        let dones: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        let callbacks = NetlinkCallbacks {
            done: {
                let dones = dones.clone();
                Some(Rc::new(move |seq| dones.borrow_mut().push(seq)))
            },
            error: {
                let errors = errors.clone();
                Some(Rc::new(move |seq, errno| {
                    errors.borrow_mut().push((seq, errno))
                }))
            },
            ..NetlinkCallbacks::default()
        };

        let Ok(handle) = NetlinkHandle::open(&sched, libc::NETLINK_ROUTE, callbacks) else {
            // No netlink in this environment.
            return;
        };

        let seq1 = handle.send(&mut build_message(18, 0, &[0; 16]));
        let seq2 = handle.send(&mut build_message(18, 0, &[0; 16]));
        assert_ne!(seq1, seq2);
        assert_eq!(handle.in_flight(), 2);
        assert_eq!(handle.last_seq(), seq2);

        handle.arm_timeout();

        handle.process_incoming(&done_frame(seq1));
        assert_eq!(handle.in_flight(), 1);
        assert!(handle.timeout_armed());
        assert_eq!(*dones.borrow(), vec![seq1]);

        handle.process_incoming(&error_frame(seq2, libc::EEXIST));
        assert_eq!(handle.in_flight(), 0);
        assert!(!handle.timeout_armed());
        assert_eq!(handle.last_seq(), 0);
        assert_eq!(*errors.borrow(), vec![(seq2, libc::EEXIST)]);

        handle.close();
    }
}
