//! Client key derivation.
//!
//! The client key is the only dimension rate limit state is partitioned by:
//! two requests with the same key and strategy always hit the same counter.

use std::net::IpAddr;

/// The parts of an incoming request admission control looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    /// Address of the directly connected peer
    pub peer_addr: Option<IpAddr>,
    /// Raw `X-Forwarded-For` header value
    pub forwarded_for: Option<String>,
    /// Authenticated user id, if an upstream layer established one
    pub user_id: Option<String>,
}

/// Derives a stable client key from a request.
pub trait IdentifyClient: Send + Sync {
    fn identify(&self, request: &RequestInfo) -> String;
}

/// Default identification: authenticated user first, then network address.
///
/// Produces `user:{id}` when the request carries a user id, otherwise
/// `ip:{address}` using the left-most `X-Forwarded-For` entry or, failing
/// that, the peer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIdentifier;

impl ClientIdentifier {
    fn forwarded_client(forwarded_for: &str) -> Option<&str> {
        forwarded_for
            .split(',')
            .next()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    }
}

impl IdentifyClient for ClientIdentifier {
    fn identify(&self, request: &RequestInfo) -> String {
        if let Some(user_id) = request.user_id.as_deref().filter(|id| !id.is_empty()) {
            return format!("user:{}", user_id);
        }

        if let Some(ip) = request
            .forwarded_for
            .as_deref()
            .and_then(Self::forwarded_client)
        {
            return format!("ip:{}", ip);
        }

        match request.peer_addr {
            Some(addr) => format!("ip:{}", addr),
            None => "ip:unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestInfo {
        RequestInfo {
            method: "GET".to_string(),
            path: "/api/v1/courses".to_string(),
            peer_addr: Some("10.0.0.5".parse().unwrap()),
            ..RequestInfo::default()
        }
    }

    #[test]
    fn test_user_id_takes_precedence() {
        let req = RequestInfo {
            user_id: Some("42".to_string()),
            forwarded_for: Some("203.0.113.9".to_string()),
            ..request()
        };
        assert_eq!(ClientIdentifier.identify(&req), "user:42");
    }

    #[test]
    fn test_leftmost_forwarded_for() {
        let req = RequestInfo {
            forwarded_for: Some(" 203.0.113.9 , 70.41.3.18, 150.172.238.178".to_string()),
            ..request()
        };
        assert_eq!(ClientIdentifier.identify(&req), "ip:203.0.113.9");
    }

    #[test]
    fn test_peer_address_fallback() {
        assert_eq!(ClientIdentifier.identify(&request()), "ip:10.0.0.5");

        let req = RequestInfo {
            forwarded_for: Some("  ".to_string()),
            user_id: Some(String::new()),
            ..request()
        };
        assert_eq!(ClientIdentifier.identify(&req), "ip:10.0.0.5");
    }

    #[test]
    fn test_unknown_peer() {
        let req = RequestInfo {
            peer_addr: None,
            ..request()
        };
        assert_eq!(ClientIdentifier.identify(&req), "ip:unknown");
    }
}
