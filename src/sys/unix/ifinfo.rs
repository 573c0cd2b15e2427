use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ptr;

use log::{debug, warn};

use crate::interface::InterfaceData;

const PROC_IF_REDIRECT: &str = "/proc/sys/net/ipv4/conf/{}/send_redirects";
const PROC_IF_SPOOF: &str = "/proc/sys/net/ipv4/conf/{}/rp_filter";

/// Saved proc-file values of an interface before it was configured for mesh
/// use, so the original state can be restored.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MeshState {
    old_redirect: u8,
    old_spoof: u8,
}

/// Snapshot the OS view of one interface.
pub(crate) fn read_interface_data(name: &str) -> io::Result<InterfaceData> {
    let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    // SAFETY: `cname` is a valid nul-terminated string.
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }

    let mut data = InterfaceData {
        index,
        name: name.to_string(),
        ..InterfaceData::default()
    };

    let mut addrs: *mut libc::ifaddrs = ptr::null_mut();
    syscall!(getifaddrs(&mut addrs))?;

    let mut cur = addrs;
    while !cur.is_null() {
        // SAFETY: `cur` comes from the list getifaddrs returned.
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;

        // SAFETY: `ifa_name` is a nul-terminated string for every entry.
        let ifa_name = unsafe { CStr::from_ptr(ifa.ifa_name) };
        if ifa_name.to_bytes() != name.as_bytes() {
            continue;
        }

        data.up = (ifa.ifa_flags & libc::IFF_UP as libc::c_uint) != 0;

        if ifa.ifa_addr.is_null() {
            continue;
        }
        // SAFETY: `ifa_addr` is non-null and points at a sockaddr whose
        // family field selects the concrete type below.
        let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
        match family {
            libc::AF_INET => {
                let sin = ifa.ifa_addr as *const libc::sockaddr_in;
                // SAFETY: family checked above.
                let ip = Ipv4Addr::from(unsafe { (*sin).sin_addr.s_addr }.to_ne_bytes());
                data.ipv4 = Some(ip);
            }
            libc::AF_INET6 => {
                let sin6 = ifa.ifa_addr as *const libc::sockaddr_in6;
                // SAFETY: family checked above.
                let ip = Ipv6Addr::from(unsafe { (*sin6).sin6_addr.s6_addr });
                if is_link_local(&ip) {
                    data.ipv6_linklocal = Some(ip);
                } else {
                    data.ipv6 = Some(ip);
                }
            }
            libc::AF_PACKET => {
                let sll = ifa.ifa_addr as *const libc::sockaddr_ll;
                // SAFETY: family checked above.
                let sll = unsafe { &*sll };
                if sll.sll_halen as usize >= 6 {
                    data.mac.copy_from_slice(&sll.sll_addr[..6]);
                }
            }
            _ => {}
        }
    }

    // SAFETY: `addrs` came from getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(addrs) };

    Ok(data)
}

/// Resolve an interface name from its index.
pub(crate) fn name_for_index(index: u32) -> Option<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    // SAFETY: `buf` is at least IF_NAMESIZE bytes as required.
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char) };
    if ret.is_null() {
        return None;
    }
    // SAFETY: on success the buffer holds a nul-terminated name.
    let name = unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) };
    name.to_str().ok().map(str::to_string)
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Overwrite a one-character proc entry, remembering the previous value.
fn write_proc(path: &str, old: Option<&mut u8>, value: u8) -> io::Result<()> {
    let current = fs::read(path)?;
    let current = *current.first().unwrap_or(&b'0');

    if current != value {
        fs::write(path, [value])?;
        debug!(
            "writing '{}' (was {}) to {}",
            value as char, current as char, path
        );
    }

    if let Some(old) = old {
        if current != value {
            *old = current;
        }
    }
    Ok(())
}

fn proc_path(template: &str, interface: &str) -> String {
    template.replace("{}", interface)
}

/// Prepare an interface for mesh traffic: disable ICMP redirects and the
/// reverse-path filter, keeping the old values for restore.
pub(crate) fn init_mesh_if(name: &str) -> MeshState {
    let mut state = MeshState::default();

    if write_proc(
        &proc_path(PROC_IF_REDIRECT, name),
        Some(&mut state.old_redirect),
        b'0',
    )
    .is_err()
    {
        warn!(
            "could not disable ICMP redirects on {}; \
             make sure they are disabled manually",
            name
        );
    }

    if write_proc(
        &proc_path(PROC_IF_SPOOF, name),
        Some(&mut state.old_spoof),
        b'0',
    )
    .is_err()
    {
        warn!(
            "could not disable the rp_filter on {}; \
             make sure it is disabled manually",
            name
        );
    }

    state
}

/// Restore the proc entries changed by `init_mesh_if`.
pub(crate) fn cleanup_mesh_if(name: &str, state: MeshState) {
    if state.old_redirect != 0 {
        let path = proc_path(PROC_IF_REDIRECT, name);
        if write_proc(&path, None, state.old_redirect).is_err() {
            warn!("could not restore {} to {}", path, state.old_redirect as char);
        }
    }
    if state.old_spoof != 0 {
        let path = proc_path(PROC_IF_SPOOF, name);
        if write_proc(&path, None, state.old_spoof).is_err() {
            warn!("could not restore {} to {}", path, state.old_spoof as char);
        }
    }
}
