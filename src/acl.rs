//! Address access control lists.
//!
//! Evaluation is a pure function over a remote address and two prefix lists;
//! the socket, telnet and http layers consume the result and never interpret
//! the lists themselves.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl Prefix {
    pub fn host(addr: IpAddr) -> Prefix {
        let len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Prefix { addr, len }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let bits = 32u32.saturating_sub(self.len as u32);
                let mask = if bits >= 32 { 0 } else { u32::MAX << bits };
                (u32::from(net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let bits = 128u32.saturating_sub(self.len as u32);
                let mask = if bits >= 128 { 0 } else { u128::MAX << bits };
                (u128::from(net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Accept/reject prefix lists with configurable precedence and default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    pub accept: Vec<Prefix>,
    pub reject: Vec<Prefix>,
    pub reject_first: bool,
    pub default_accept: bool,
}

impl Acl {
    /// An ACL that accepts everything.
    pub fn accept_all() -> Acl {
        Acl {
            default_accept: true,
            ..Acl::default()
        }
    }

    /// Check a remote address against the list.
    pub fn check(&self, addr: &IpAddr) -> bool {
        let accepted = self.accept.iter().any(|p| p.matches(addr));
        let rejected = self.reject.iter().any(|p| p.matches(addr));

        if self.reject_first {
            if rejected {
                return false;
            }
            if accepted {
                return true;
            }
        } else {
            if accepted {
                return true;
            }
            if rejected {
                return false;
            }
        }
        self.default_accept
    }

    /// Parse one ACL element. Plain addresses and `addr/len` prefixes add to
    /// the accept list, a `-` prefix adds to the reject list, and the
    /// keywords `default_accept`, `default_reject`, `first_accept` and
    /// `first_reject` set the flags.
    pub fn parse_element(&mut self, element: &str) -> Result<(), String> {
        match element {
            "default_accept" => {
                self.default_accept = true;
                return Ok(());
            }
            "default_reject" => {
                self.default_accept = false;
                return Ok(());
            }
            "first_accept" => {
                self.reject_first = false;
                return Ok(());
            }
            "first_reject" => {
                self.reject_first = true;
                return Ok(());
            }
            _ => {}
        }

        let (list, spec) = match element.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, element.strip_prefix('+').unwrap_or(element)),
        };

        let prefix = match spec.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr
                    .parse()
                    .map_err(|_| format!("invalid acl address '{}'", spec))?;
                let len: u8 = len
                    .parse()
                    .map_err(|_| format!("invalid acl prefix length '{}'", spec))?;
                Prefix { addr, len }
            }
            None => {
                let addr: IpAddr = spec
                    .parse()
                    .map_err(|_| format!("invalid acl address '{}'", spec))?;
                Prefix::host(addr)
            }
        };

        if list {
            self.reject.push(prefix);
        } else {
            self.accept.push(prefix);
        }
        Ok(())
    }

    /// Parse a whitespace-separated ACL string.
    pub fn parse(text: &str) -> Result<Acl, String> {
        let mut acl = Acl::default();
        for element in text.split_whitespace() {
            acl.parse_element(element)?;
        }
        Ok(acl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_only() {
        let acl = Acl::parse("127.0.0.1").unwrap();
        assert!(acl.check(&"127.0.0.1".parse().unwrap()));
        assert!(!acl.check(&"10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn prefix_match() {
        let acl = Acl::parse("10.0.0.0/8").unwrap();
        assert!(acl.check(&"10.200.3.4".parse().unwrap()));
        assert!(!acl.check(&"11.0.0.1".parse().unwrap()));
        assert!(!acl.check(&"::1".parse().unwrap()));
    }

    #[test]
    fn reject_and_default() {
        let acl = Acl::parse("-192.168.1.7 192.168.0.0/16 default_reject").unwrap();
        // accept list wins with first_accept ordering
        assert!(acl.check(&"192.168.1.7".parse().unwrap()));

        let acl = Acl::parse("first_reject -192.168.1.7 192.168.0.0/16").unwrap();
        assert!(!acl.check(&"192.168.1.7".parse().unwrap()));
        assert!(acl.check(&"192.168.1.8".parse().unwrap()));
        assert!(!acl.check(&"172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn default_accept() {
        let acl = Acl::parse("default_accept").unwrap();
        assert!(acl.check(&"203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn ipv6_prefix() {
        let acl = Acl::parse("fe80::/10 ::1").unwrap();
        assert!(acl.check(&"::1".parse().unwrap()));
        assert!(acl.check(&"fe80::42".parse().unwrap()));
        assert!(!acl.check(&"2001:db8::1".parse().unwrap()));
    }
}
