//! Network compatibility check: both endpoints must sit on the same /24.
//!
//! Advisory. A missing address on either side never blocks the session.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Candidate string a stream host advertises for itself.
pub fn host_candidate(addr: SocketAddr) -> String {
    format!("candidate:1 1 tcp 2122260223 {} {} typ host", addr.ip(), addr.port())
}

/// Address and port of a candidate line, whatever its type.
pub fn candidate_addr(candidate: &str) -> Option<SocketAddr> {
    let parts: Vec<&str> = candidate.split_whitespace().collect();
    let ip: IpAddr = parts.get(4)?.parse().ok()?;
    let port: u16 = parts.get(5)?.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Private IPv4 address of a host-type candidate, if it has one.
pub fn extract_local_ip(candidate: &str) -> Option<Ipv4Addr> {
    let parts: Vec<&str> = candidate.split_whitespace().collect();
    if parts.get(7) != Some(&"host") {
        return None;
    }
    let ip: Ipv4Addr = parts.get(4)?.parse().ok()?;
    // 10/8, 172.16/12, 192.168/16
    ip.is_private().then_some(ip)
}

/// Same first three octets.
pub fn is_same_network(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    a.octets()[..3] == b.octets()[..3]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// One side's address is still unknown.
    Unknown,
    Compatible,
    Mismatch { local: Ipv4Addr, peer: Ipv4Addr },
}

/// Tracks the local and peer addresses as they become known.
#[derive(Debug, Clone, Default)]
pub struct NetworkCheck {
    local: Option<Ipv4Addr>,
    peer: Option<Ipv4Addr>,
}

impl NetworkCheck {
    /// Feed a locally gathered candidate. Returns the local address the first time one is found;
    /// that is the address to relay to the peer.
    pub fn observe_candidate(&mut self, candidate: &str) -> Option<Ipv4Addr> {
        if self.local.is_some() {
            return None;
        }
        let ip = extract_local_ip(candidate)?;
        self.local = Some(ip);
        Some(ip)
    }

    pub fn set_peer(&mut self, ip: Ipv4Addr) {
        self.peer = Some(ip);
    }

    pub fn local(&self) -> Option<Ipv4Addr> {
        self.local
    }

    pub fn verdict(&self) -> Verdict {
        match (self.local, self.peer) {
            (Some(local), Some(peer)) if is_same_network(local, peer) => Verdict::Compatible,
            (Some(local), Some(peer)) => Verdict::Mismatch { local, peer },
            _ => Verdict::Unknown,
        }
    }
}
