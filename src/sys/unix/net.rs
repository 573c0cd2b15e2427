use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{self, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Create a non-blocking, close-on-exec socket.
pub(crate) fn new_socket(domain: libc::c_int, socket_type: libc::c_int) -> io::Result<RawFd> {
    let socket_type = socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    syscall!(socket(domain, socket_type, 0))
}

fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let val: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &val as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

fn domain_for(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

/// A `sockaddr_storage` plus its length, for passing into bind/connect/sendto.
pub(crate) struct RawAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl RawAddr {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }
}

pub(crate) fn socket_addr(addr: &SocketAddr) -> RawAddr {
    // SAFETY: all-zero is a valid bit pattern for `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(addr) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            // SAFETY: `sin` points at storage large enough for `sockaddr_in`.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = addr.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                };
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(addr) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            // SAFETY: `sin6` points at storage large enough for `sockaddr_in6`.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = addr.port().to_be();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                };
                (*sin6).sin6_flowinfo = addr.flowinfo();
                (*sin6).sin6_scope_id = addr.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    RawAddr {
        storage,
        len: len as libc::socklen_t,
    }
}

/// `storage` must have been filled in by the kernel.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Bind a non-blocking UDP socket.
pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<net::UdpSocket> {
    let fd = new_socket(domain_for(&addr), libc::SOCK_DGRAM)?;
    // SAFETY: the fd was just created and is not owned elsewhere.
    let socket = unsafe { net::UdpSocket::from_raw_fd(fd) };
    set_reuseaddr(fd)?;
    let raw = socket_addr(&addr);
    syscall!(bind(fd, raw.as_ptr(), raw.len()))?;
    Ok(socket)
}

/// Bind a non-blocking TCP listener with `SO_REUSEADDR`, so a restarted
/// daemon does not have to wait out TIME_WAIT.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<net::TcpListener> {
    let fd = new_socket(domain_for(&addr), libc::SOCK_STREAM)?;
    // SAFETY: the fd was just created and is not owned elsewhere.
    let listener = unsafe { net::TcpListener::from_raw_fd(fd) };
    set_reuseaddr(fd)?;
    let raw = socket_addr(&addr);
    syscall!(bind(fd, raw.as_ptr(), raw.len()))?;
    syscall!(listen(fd, backlog as libc::c_int))?;
    Ok(listener)
}

/// Accept a connection, returning the non-blocking stream and peer address.
pub(crate) fn accept(listener: &net::TcpListener) -> io::Result<(net::TcpStream, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let stream = syscall!(accept4(
        listener.as_raw_fd(),
        storage.as_mut_ptr() as *mut _,
        &mut length,
        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
    ))
    // SAFETY: `accept4` ensures the fd is valid.
    .map(|socket| unsafe { net::TcpStream::from_raw_fd(socket) })?;

    // SAFETY: `accept4` initialised the storage for us.
    let addr = unsafe { to_socket_addr(storage.as_ptr()) }?;
    Ok((stream, addr))
}

/// Start a non-blocking connect. Returns the stream and whether the connect
/// is still in progress (`EINPROGRESS`).
pub(crate) fn connect_stream(addr: SocketAddr) -> io::Result<(net::TcpStream, bool)> {
    let fd = new_socket(domain_for(&addr), libc::SOCK_STREAM)?;
    // SAFETY: the fd was just created and is not owned elsewhere.
    let stream = unsafe { net::TcpStream::from_raw_fd(fd) };

    let raw = socket_addr(&addr);
    match syscall!(connect(fd, raw.as_ptr(), raw.len())) {
        Ok(_) => Ok((stream, false)),
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok((stream, true)),
        Err(err) => Err(err),
    }
}

/// Query and clear the pending `SO_ERROR` of a socket.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut val: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut val as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))?;
    if val == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(val)))
    }
}

/// Receive one datagram, returning length and source address.
pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        storage.as_mut_ptr() as *mut _,
        &mut length,
    ))?;

    // SAFETY: `recvfrom` initialised the storage for us.
    let addr = unsafe { to_socket_addr(storage.as_ptr()) }?;
    Ok((n as usize, addr))
}

/// Send one datagram.
pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
    let raw = socket_addr(addr);
    syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        0,
        raw.as_ptr(),
        raw.len(),
    ))
    .map(|n| n as usize)
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// `EINTR`, `EAGAIN` and `EWOULDBLOCK` are retry-later conditions, never
/// session errors.
pub(crate) fn soft_error(err: &io::Error) -> bool {
    would_block(err) || interrupted(err)
}
