//! The endpoint set: the datagram sockets the node communicates through.
//!
//! The bootstrap hands in already-bound sockets. A `Send` endpoint can
//! reach the whole cluster (its multicast/broadcast target address rides
//! along); a `RecvOnly` endpoint is the unicast receive end of one
//! interface and contributes that interface's address to our node record.
//! Endpoint numbers order the round-robin rotation used when a send
//! interface goes bad.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::UdpSocket;

use crate::error::ClusterError;

// ---------------------------------------------------------------------------
// Binary socket addresses
// ---------------------------------------------------------------------------

/// Address family tag for IPv4 in the binary address encoding.
pub const AF_INET: u16 = 2;
/// Address family tag for IPv6 in the binary address encoding.
pub const AF_INET6: u16 = 10;

/// Encoded length of an IPv4 socket address.
pub const ADDR_LEN_V4: usize = 8;
/// Encoded length of an IPv6 socket address.
pub const ADDR_LEN_V6: usize = 20;

/// Encodes a socket address into the fixed binary form carried in protocol
/// messages: `u16 family (LE), u16 port (BE), ip octets`.
#[must_use]
pub fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(ADDR_LEN_V6);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.extend_from_slice(&AF_INET.to_le_bytes());
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.extend_from_slice(&AF_INET6.to_le_bytes());
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
    }
    out
}

/// Decodes the binary form back into a socket address.
#[must_use]
pub fn decode_sockaddr(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() < 4 {
        return None;
    }
    let family = u16::from_le_bytes([bytes[0], bytes[1]]);
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    match family {
        AF_INET if bytes.len() >= ADDR_LEN_V4 => {
            let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        AF_INET6 if bytes.len() >= ADDR_LEN_V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Compares two binary addresses, skipping the 2-byte family field so
/// participants that encode the family differently still match.
#[must_use]
pub fn addr_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.len() > 2 && a[2..] == b[2..]
}

/// The low 32 bits of a binary address: the tail of the IP, used for the
/// NEWCLUSTER tie-break.
#[must_use]
pub fn low32_of_addr(addr: &[u8]) -> u32 {
    if addr.len() < 4 {
        return 0;
    }
    let tail = &addr[addr.len() - 4..];
    u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]])
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Role of one endpoint in the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Can reach every node; used for multicasts and unicasts alike.
    Send,
    /// The unicast receive end of one interface; never transmitted on.
    RecvOnly,
}

/// One datagram endpoint.
#[derive(Debug)]
pub struct Endpoint {
    pub role: EndpointRole,
    /// Position in the failover rotation.
    pub number: u32,
    pub socket: Arc<UdpSocket>,
    /// The socket's bound local address.
    pub local_addr: SocketAddr,
    /// Destination for cluster-wide sends (`Send` endpoints only).
    pub mcast_target: Option<SocketAddr>,
}

#[derive(Default)]
struct Inner {
    endpoints: Vec<Arc<Endpoint>>,
    /// Index of the current send endpoint in `endpoints`.
    current: Option<usize>,
    address_length: Option<usize>,
}

/// The ordered collection of endpoints, with the current-interface pointer.
#[derive(Default)]
pub struct EndpointSet {
    inner: RwLock<Inner>,
}

impl EndpointSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bound socket to the set.
    ///
    /// The first endpoint added fixes the cluster-wide binary address
    /// length. The first `Send` endpoint becomes current.
    ///
    /// # Errors
    ///
    /// Fails if the socket's local address cannot be read.
    pub fn add_endpoint(
        &self,
        role: EndpointRole,
        number: u32,
        socket: Arc<UdpSocket>,
        mcast_target: Option<SocketAddr>,
    ) -> Result<Arc<Endpoint>, ClusterError> {
        let local_addr = socket.local_addr()?;
        let endpoint = Arc::new(Endpoint {
            role,
            number,
            socket,
            local_addr,
            mcast_target,
        });

        let mut inner = self.inner.write();
        if inner.address_length.is_none() {
            inner.address_length = Some(encode_sockaddr(&local_addr).len());
        }
        inner.endpoints.push(Arc::clone(&endpoint));
        inner.endpoints.sort_by_key(|e| e.number);
        if inner.current.is_none() && role == EndpointRole::Send {
            let idx = inner
                .endpoints
                .iter()
                .position(|e| Arc::ptr_eq(e, &endpoint));
            inner.current = idx;
        } else if let Some(cur) = inner.current {
            // Re-find the current endpoint after the sort shifted indexes.
            let cur_number = inner.endpoints.get(cur).map(|e| e.number);
            if cur_number.is_none() || inner.endpoints[cur].role != EndpointRole::Send {
                inner.current = inner
                    .endpoints
                    .iter()
                    .position(|e| e.role == EndpointRole::Send);
            }
        }
        Ok(endpoint)
    }

    /// The current send endpoint, if any `Send` endpoint was added.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Endpoint>> {
        let inner = self.inner.read();
        inner.current.map(|i| Arc::clone(&inner.endpoints[i]))
    }

    /// Rotates to the next send-capable endpoint in numerical order,
    /// wrapping at the end, and returns it. With a single send endpoint
    /// this is a no-op.
    #[must_use]
    pub fn next_interface(&self) -> Option<Arc<Endpoint>> {
        let mut inner = self.inner.write();
        let cur = inner.current?;
        let n = inner.endpoints.len();
        for step in 1..=n {
            let idx = (cur + step) % n;
            if inner.endpoints[idx].role == EndpointRole::Send {
                inner.current = Some(idx);
                return Some(Arc::clone(&inner.endpoints[idx]));
            }
        }
        None
    }

    /// All send-capable endpoints, in rotation order.
    #[must_use]
    pub fn send_capable(&self) -> Vec<Arc<Endpoint>> {
        self.inner
            .read()
            .endpoints
            .iter()
            .filter(|e| e.role == EndpointRole::Send)
            .cloned()
            .collect()
    }

    /// Every endpoint in the set.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        self.inner.read().endpoints.clone()
    }

    /// Binary addresses of the receive-only endpoints; these become the
    /// local node record's address list. Falls back to the send endpoints'
    /// addresses when no receive-only endpoint exists.
    #[must_use]
    pub fn local_addresses(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.read();
        let recv: Vec<Vec<u8>> = inner
            .endpoints
            .iter()
            .filter(|e| e.role == EndpointRole::RecvOnly)
            .map(|e| encode_sockaddr(&e.local_addr))
            .collect();
        if recv.is_empty() {
            inner
                .endpoints
                .iter()
                .map(|e| encode_sockaddr(&e.local_addr))
                .collect()
        } else {
            recv
        }
    }

    /// The cluster-wide binary address length, fixed by the first endpoint.
    #[must_use]
    pub fn address_length(&self) -> Option<usize> {
        self.inner.read().address_length
    }

    /// Number of send-capable interfaces.
    #[must_use]
    pub fn num_interfaces(&self) -> usize {
        self.inner
            .read()
            .endpoints
            .iter()
            .filter(|e| e.role == EndpointRole::Send)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_v4_sockaddr_round_trips(a in any::<u8>(), b in any::<u8>(),
                                       c in any::<u8>(), d in any::<u8>(),
                                       port in any::<u16>()) {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port);
            let bytes = encode_sockaddr(&addr);
            prop_assert_eq!(decode_sockaddr(&bytes), Some(addr));
        }

        #[test]
        fn any_v6_sockaddr_round_trips(octets in any::<[u8; 16]>(), port in any::<u16>()) {
            let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port);
            let bytes = encode_sockaddr(&addr);
            prop_assert_eq!(decode_sockaddr(&bytes), Some(addr));
        }
    }

    #[test]
    fn sockaddr_v4_round_trip() {
        let addr: SocketAddr = "192.168.1.10:6809".parse().unwrap();
        let bytes = encode_sockaddr(&addr);
        assert_eq!(bytes.len(), ADDR_LEN_V4);
        assert_eq!(decode_sockaddr(&bytes), Some(addr));
    }

    #[test]
    fn sockaddr_v6_round_trip() {
        let addr: SocketAddr = "[fe80::1]:6809".parse().unwrap();
        let bytes = encode_sockaddr(&addr);
        assert_eq!(bytes.len(), ADDR_LEN_V6);
        assert_eq!(decode_sockaddr(&bytes), Some(addr));
    }

    #[test]
    fn addr_compare_skips_family_bytes() {
        let a: SocketAddr = "10.0.0.1:6809".parse().unwrap();
        let mut x = encode_sockaddr(&a);
        let y = encode_sockaddr(&a);
        // A different family encoding must not break the match.
        x[0] = 0xFF;
        assert!(addr_equal(&x, &y));

        let b: SocketAddr = "10.0.0.2:6809".parse().unwrap();
        assert!(!addr_equal(&encode_sockaddr(&a), &encode_sockaddr(&b)));
    }

    #[test]
    fn low32_uses_address_tail() {
        let a: SocketAddr = "10.0.0.1:6809".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6809".parse().unwrap();
        assert_ne!(
            low32_of_addr(&encode_sockaddr(&a)),
            low32_of_addr(&encode_sockaddr(&b))
        );
    }

    async fn bound_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn first_send_endpoint_becomes_current() {
        let set = EndpointSet::new();
        set.add_endpoint(EndpointRole::RecvOnly, 0, bound_socket().await, None)
            .unwrap();
        assert!(set.current().is_none());

        set.add_endpoint(EndpointRole::Send, 1, bound_socket().await, None)
            .unwrap();
        let current = set.current().unwrap();
        assert_eq!(current.number, 1);
        assert_eq!(set.num_interfaces(), 1);
    }

    #[tokio::test]
    async fn next_interface_skips_recv_only_and_wraps() {
        let set = EndpointSet::new();
        set.add_endpoint(EndpointRole::Send, 0, bound_socket().await, None)
            .unwrap();
        set.add_endpoint(EndpointRole::RecvOnly, 1, bound_socket().await, None)
            .unwrap();
        set.add_endpoint(EndpointRole::Send, 2, bound_socket().await, None)
            .unwrap();

        assert_eq!(set.current().unwrap().number, 0);
        assert_eq!(set.next_interface().unwrap().number, 2);
        assert_eq!(set.next_interface().unwrap().number, 0);
    }

    #[tokio::test]
    async fn address_length_fixed_by_first_endpoint() {
        let set = EndpointSet::new();
        set.add_endpoint(EndpointRole::Send, 0, bound_socket().await, None)
            .unwrap();
        assert_eq!(set.address_length(), Some(ADDR_LEN_V4));
    }

    #[tokio::test]
    async fn local_addresses_prefer_recv_only() {
        let set = EndpointSet::new();
        let send = bound_socket().await;
        let recv = bound_socket().await;
        let recv_addr = recv.local_addr().unwrap();
        set.add_endpoint(EndpointRole::Send, 0, send, None).unwrap();
        set.add_endpoint(EndpointRole::RecvOnly, 1, recv, None)
            .unwrap();

        let addrs = set.local_addresses();
        assert_eq!(addrs.len(), 1);
        assert_eq!(decode_sockaddr(&addrs[0]), Some(recv_addr));
    }
}
