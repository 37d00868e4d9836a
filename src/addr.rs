//! Endpoint address handling.
//!
//! The original adaptation layer converts between `sockaddr_storage` and
//! its own endpoint type for both IPv4 and IPv6. `mio::net::UdpSocket`
//! already speaks `std::net::SocketAddr` directly, so there is no
//! conversion layer to write here beyond giving the round-trip property
//! in the spec a name and a home to be tested against.

use std::net::SocketAddr;

/// The address type every endpoint in this crate is expressed in.
pub type Endpoint = SocketAddr;

/// Identity conversion kept around so the round-trip property named by
/// the spec (`to_endpoint(to_sockaddr(e)) == e`) has a concrete pair of
/// functions to assert on, even though on top of `std::net` both
/// directions are the same type.
pub fn to_endpoint(addr: SocketAddr) -> Endpoint {
    addr
}

pub fn to_sockaddr(endpoint: Endpoint) -> SocketAddr {
    endpoint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ipv4_and_ipv6() {
        let addrs: &[&str] = &[
            "127.0.0.1:0",
            "127.0.0.1:12345",
            "0.0.0.0:80",
            "[::1]:0",
            "[::1]:12345",
            "[fe80::1]:443",
        ];
        for raw in addrs {
            let e: SocketAddr = raw.parse().unwrap();
            assert_eq!(to_endpoint(to_sockaddr(e)), e);
        }
    }
}
