use std::{
    borrow::Cow,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". `SocketAddr` parsing and Tokio bind APIs do not accept it, so it
/// becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Parses the interface public tunnel listeners bind on. Empty means all IPv4 interfaces.
pub fn parse_bind_ip(s: &str) -> Result<IpAddr, std::net::AddrParseError> {
    let s = s.trim().trim_start_matches('[').trim_end_matches(']');
    if s.is_empty() {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    s.parse()
}

/// Wildcard local address of the same family as `remote`, for sockets that are
/// about to connect to it.
pub fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(normalize_bind_addr("127.0.0.1:5522").as_ref(), "127.0.0.1:5522");
        assert_eq!(normalize_bind_addr("[::]:5522").as_ref(), "[::]:5522");
    }

    #[test]
    fn bind_ip_defaults_and_brackets() {
        assert_eq!(parse_bind_ip("").unwrap(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(parse_bind_ip("[::1]").unwrap(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(parse_bind_ip("not-an-ip").is_err());
    }

    #[test]
    fn unspecified_matches_family() {
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert!(unspecified_for(&v6).is_ipv6());
        let v4: SocketAddr = "192.0.2.1:53".parse().unwrap();
        assert_eq!(unspecified_for(&v4).to_string(), "0.0.0.0:0");
    }
}
