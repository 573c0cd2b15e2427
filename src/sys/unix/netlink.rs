use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// rtnetlink multicast group numbers, used with `NETLINK_ADD_MEMBERSHIP`.
/// Kernel ABI values from `linux/rtnetlink.h`; libc only carries the
/// bind-time bitmask variants.
pub(crate) const RTNLGRP_LINK: u32 = 1;
pub(crate) const RTNLGRP_IPV4_IFADDR: u32 = 5;
pub(crate) const RTNLGRP_IPV6_IFADDR: u32 = 9;

/// Open a raw netlink socket for a kernel family and bind it; the kernel
/// assigns the port id.
pub(crate) fn open(protocol: libc::c_int) -> io::Result<OwnedFd> {
    let fd = syscall!(socket(
        libc::PF_NETLINK,
        libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        protocol,
    ))?;
    // SAFETY: the fd was just created and is not owned elsewhere.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: all-zero is a valid `sockaddr_nl`.
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    use std::os::fd::AsRawFd;
    syscall!(bind(
        fd.as_raw_fd(),
        &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
    ))?;
    Ok(fd)
}

fn membership(fd: RawFd, op: libc::c_int, group: u32) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        libc::SOL_NETLINK,
        op,
        &group as *const u32 as *const libc::c_void,
        mem::size_of::<u32>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub(crate) fn add_membership(fd: RawFd, group: u32) -> io::Result<()> {
    membership(fd, libc::NETLINK_ADD_MEMBERSHIP, group)
}

pub(crate) fn drop_membership(fd: RawFd, group: u32) -> io::Result<()> {
    membership(fd, libc::NETLINK_DROP_MEMBERSHIP, group)
}

/// Send a buffer to the kernel in one `sendmsg`.
pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: all-zero is a valid `sockaddr_nl`; pid 0 addresses the kernel.
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // SAFETY: all-zero is a valid `msghdr`.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr as *mut libc::sockaddr_nl as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    syscall!(sendmsg(fd, &msg, 0)).map(|n| n as usize)
}

/// Receive into `buf`. Returns the message length and whether the kernel
/// truncated it (the caller peeks first and grows its buffer on truncation).
pub(crate) fn recv(fd: RawFd, buf: &mut [u8], peek: bool) -> io::Result<(usize, bool)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // SAFETY: all-zero is a valid `msghdr`.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut flags = libc::MSG_DONTWAIT;
    if peek {
        flags |= libc::MSG_PEEK | libc::MSG_TRUNC;
    }

    let n = syscall!(recvmsg(fd, &mut msg, flags))?;
    let truncated = (msg.msg_flags & libc::MSG_TRUNC) != 0;
    Ok((n as usize, truncated))
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => 4096,
        n => n as usize,
    }
}
