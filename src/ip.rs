//! Client IP resolution: `X-Real-IP`, then the first hop of
//! `X-Forwarded-For`, then the TCP peer address with any port stripped and
//! IPv4-mapped IPv6 addresses normalised back to IPv4.
//!
//! Reverse-proxy headers are trusted ahead of the bare peer address, the
//! usual precedence for a service expected to sit behind a load balancer.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

pub fn resolve_client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = parse_and_normalise(real_ip.trim()) {
            return ip;
        }
    }

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            if let Some(ip) = parse_and_normalise(first.trim()) {
                return ip;
            }
        }
    }

    normalise(peer.ip())
}

fn parse_and_normalise(raw: &str) -> Option<String> {
    raw.parse::<IpAddr>().ok().map(normalise)
}

fn normalise(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn prefers_x_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.5".parse().unwrap());
        headers.insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        assert_eq!(resolve_client_ip(&headers, peer("127.0.0.1:8080")), "203.0.113.5");
    }

    #[test]
    fn falls_back_to_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1, 10.0.0.1".parse().unwrap());
        assert_eq!(resolve_client_ip(&headers, peer("127.0.0.1:8080")), "198.51.100.1");
    }

    #[test]
    fn falls_back_to_peer_address_with_port_stripped() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_client_ip(&headers, peer("192.0.2.9:54321")), "192.0.2.9");
    }
}
