//! Ordered CIDR allow-list, checked on every accepted connection and
//! re-checked against live clients whenever the list is replaced.

use crate::error::AclParseError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Byte-partial prefix masks: `TESTMASKS[n]` is the mask to AND with a
/// byte when exactly `n` of its 8 bits participate in the prefix match.
const TESTMASKS: [u8; 9] = [0, 128, 192, 224, 240, 248, 252, 254, 255];

#[derive(Debug, Clone, Copy)]
enum Addr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl Addr {
    fn octets(&self) -> Vec<u8> {
        match self {
            Addr::V4(a) => a.octets().to_vec(),
            Addr::V6(a) => a.octets().to_vec(),
        }
    }

    fn max_bits(&self) -> u8 {
        match self {
            Addr::V4(_) => 32,
            Addr::V6(_) => 128,
        }
    }
}

/// One `addr/prefix` entry.
#[derive(Debug, Clone, Copy)]
pub struct AclEntry {
    addr: Addr,
    prefix_bits: u8,
}

impl AclEntry {
    /// Parse `"1.2.3.0/24"`, `"::1/128"`, or a bare address (implying a
    /// full-width prefix).
    pub fn parse(s: &str) -> Result<Self, AclParseError> {
        let (addr_part, bits_part) = match s.split_once('/') {
            Some((a, b)) => (a, Some(b)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| AclParseError::Address(addr_part.to_string()))?;
        let addr = match addr {
            IpAddr::V4(a) => Addr::V4(a),
            IpAddr::V6(a) => Addr::V6(a),
        };
        let max = addr.max_bits();
        let prefix_bits = match bits_part {
            Some(b) => b.parse::<u8>().map_err(|_| AclParseError::Syntax(s.to_string()))?,
            None => max,
        };
        if prefix_bits > max {
            return Err(AclParseError::PrefixTooLong(prefix_bits));
        }
        Ok(AclEntry { addr, prefix_bits })
    }

    fn matches(&self, candidate: &IpAddr) -> bool {
        let candidate = match (self.addr, candidate) {
            (Addr::V4(_), IpAddr::V4(c)) => c.octets().to_vec(),
            (Addr::V6(_), IpAddr::V6(c)) => c.octets().to_vec(),
            _ => return false,
        };
        let entry_bytes = self.addr.octets();
        let mut remaining_bits = self.prefix_bits as i32;
        for (a, b) in entry_bytes.iter().zip(candidate.iter()) {
            if remaining_bits <= 0 {
                break;
            }
            if remaining_bits >= 8 {
                if a != b {
                    return false;
                }
            } else {
                let mask = TESTMASKS[remaining_bits as usize];
                if a & mask != b & mask {
                    return false;
                }
            }
            remaining_bits -= 8;
        }
        true
    }
}

/// An ordered allow-list with a default policy for the case where the
/// list is empty.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    entries: Vec<AclEntry>,
    /// When the list is empty: reject everyone if `true`, accept
    /// everyone if `false`.
    pub default_deny: bool,
}

impl Acl {
    /// An empty ACL with the given default policy.
    pub fn new(default_deny: bool) -> Self {
        Acl { entries: Vec::new(), default_deny }
    }

    /// Replace the entry list, parsing each CIDR string.
    pub fn set_entries(&mut self, cidrs: &[String]) -> Result<(), AclParseError> {
        let parsed = cidrs.iter().map(|s| AclEntry::parse(s)).collect::<Result<Vec<_>, _>>()?;
        self.entries = parsed;
        Ok(())
    }

    /// Is `addr` allowed to connect?
    pub fn includes(&self, addr: &IpAddr) -> bool {
        if self.entries.is_empty() {
            return !self.default_deny;
        }
        self.entries.iter().any(|e| e.matches(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_acl_honors_default_policy() {
        let open = Acl::new(false);
        assert!(open.includes(&"1.2.3.4".parse().unwrap()));
        let closed = Acl::new(true);
        assert!(!closed.includes(&"1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn ipv4_prefix_match() {
        let mut acl = Acl::new(true);
        acl.set_entries(&["192.168.0.0/16".to_string()]).unwrap();
        assert!(acl.includes(&"192.168.5.5".parse().unwrap()));
        assert!(!acl.includes(&"192.169.0.1".parse().unwrap()));
    }

    #[test]
    fn ipv4_partial_byte_prefix() {
        let mut acl = Acl::new(true);
        acl.set_entries(&["10.0.0.0/22".to_string()]).unwrap();
        assert!(acl.includes(&"10.0.3.255".parse().unwrap()));
        assert!(!acl.includes(&"10.0.4.0".parse().unwrap()));
    }

    #[test]
    fn ipv6_prefix_match() {
        let mut acl = Acl::new(true);
        acl.set_entries(&["fe80::/10".to_string()]).unwrap();
        assert!(acl.includes(&"fe80::1".parse().unwrap()));
        assert!(!acl.includes(&"fc00::1".parse().unwrap()));
    }

    #[test]
    fn bare_address_implies_full_width_prefix() {
        let mut acl = Acl::new(true);
        acl.set_entries(&["10.0.0.5".to_string()]).unwrap();
        assert!(acl.includes(&"10.0.0.5".parse().unwrap()));
        assert!(!acl.includes(&"10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn family_mismatch_never_matches() {
        let mut acl = Acl::new(true);
        acl.set_entries(&["10.0.0.0/8".to_string()]).unwrap();
        assert!(!acl.includes(&"::1".parse().unwrap()));
    }

    #[test]
    fn rejects_oversized_prefix() {
        assert!(matches!(AclEntry::parse("10.0.0.0/40"), Err(AclParseError::PrefixTooLong(40))));
    }
}
