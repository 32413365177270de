use std::collections::HashMap;
use std::net::IpAddr;

/// Session event kinds the aggregator classifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// New transport connection; `prior_session` carries the session the
    /// client is trying to resume, if any.
    Connect { prior_session: Option<String> },
    Subscribe,
    Invoke,
}

/// Connection details of the socket the event arrived on.
#[derive(Debug, Clone, Default)]
pub struct SocketInfo {
    /// Lower-cased request headers.
    pub headers: HashMap<String, String>,
    /// Peer address as reported by the transport.
    pub remote_address: Option<String>,
}

/// One inbound session event.
#[derive(Debug, Clone)]
pub struct SessionActivity {
    pub kind: SessionEventKind,
    pub session_ref: String,
    pub socket: SocketInfo,
}

/// Whether the socket originates from the local machine or a private
/// network. The host header wins when present; otherwise the forwarded-for
/// chain or the raw peer address decides.
pub(crate) fn is_local_socket(socket: &SocketInfo) -> bool {
    if let Some(host) = socket.headers.get("host") {
        return is_local_host(host);
    }

    let address = socket
        .headers
        .get("x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .or(socket.remote_address.as_deref());

    address.map(is_private_address).unwrap_or(false)
}

/// Classifies a host header value: `localhost`, `*.local` (with or without
/// a port suffix) or a private IP literal.
pub(crate) fn is_local_host(host: &str) -> bool {
    let bare = strip_port(host.trim());

    if bare.eq_ignore_ascii_case("localhost") || bare.to_ascii_lowercase().ends_with(".local") {
        return true;
    }

    is_private_address(bare)
}

/// Classifies an IP literal as loopback or RFC1918 private.
pub(crate) fn is_private_address(address: &str) -> bool {
    let bare = strip_port(address.trim());

    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

/// Drops a trailing `:port` if the remainder still parses as a host. IPv6
/// literals without brackets are left untouched.
fn strip_port(value: &str) -> &str {
    match value.rsplit_once(':') {
        Some((head, port))
            if !head.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            head
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_with_remote(address: &str) -> SocketInfo {
        SocketInfo {
            headers: HashMap::new(),
            remote_address: Some(address.to_string()),
        }
    }

    fn socket_with_header(key: &str, value: &str) -> SocketInfo {
        SocketInfo {
            headers: HashMap::from([(key.to_string(), value.to_string())]),
            remote_address: None,
        }
    }

    #[test]
    fn test_loopback_and_private_ranges() {
        assert!(is_private_address("127.0.0.1"));
        assert!(is_private_address("127.1.2.3"));
        assert!(is_private_address("10.0.0.5"));
        assert!(is_private_address("192.168.1.20"));
        assert!(is_private_address("172.16.0.1"));
        assert!(is_private_address("172.31.255.255"));
        assert!(is_private_address("::1"));
    }

    #[test]
    fn test_public_addresses() {
        assert!(!is_private_address("8.8.8.8"));
        assert!(!is_private_address("172.32.0.1"));
        assert!(!is_private_address("11.0.0.1"));
        assert!(!is_private_address("not-an-ip"));
    }

    #[test]
    fn test_address_with_port() {
        assert!(is_private_address("127.0.0.1:8080"));
        assert!(!is_private_address("8.8.8.8:443"));
    }

    #[test]
    fn test_local_hosts() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("localhost:3000"));
        assert!(is_local_host("myapp.local"));
        assert!(is_local_host("myapp.local:8080"));
        assert!(is_local_host("192.168.0.10"));
        assert!(!is_local_host("example.com"));
        assert!(!is_local_host("example.com:443"));
    }

    #[test]
    fn test_socket_host_header_wins() {
        let socket = SocketInfo {
            headers: HashMap::from([
                ("host".to_string(), "localhost:3000".to_string()),
            ]),
            remote_address: Some("8.8.8.8".to_string()),
        };
        assert!(is_local_socket(&socket));
    }

    #[test]
    fn test_socket_forwarded_for_beats_remote_address() {
        let socket = SocketInfo {
            headers: HashMap::from([
                ("x-forwarded-for".to_string(), "8.8.8.8, 10.0.0.1".to_string()),
            ]),
            remote_address: Some("127.0.0.1".to_string()),
        };
        assert!(!is_local_socket(&socket));
    }

    #[test]
    fn test_socket_remote_address_fallback() {
        assert!(is_local_socket(&socket_with_remote("127.0.0.1")));
        assert!(!is_local_socket(&socket_with_remote("8.8.8.8")));
    }

    #[test]
    fn test_socket_without_any_address() {
        let socket = SocketInfo::default();
        assert!(!is_local_socket(&socket));
    }

    #[test]
    fn test_public_host_header() {
        assert!(!is_local_socket(&socket_with_header("host", "example.com")));
    }
}
