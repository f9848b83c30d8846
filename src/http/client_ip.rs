//! Client address extraction.
//!
//! The address always comes from the accepted connection as recorded by
//! axum's `ConnectInfo`. Forwarding headers such as `X-Forwarded-For` or
//! `X-Real-IP` are client-controlled and never consulted here; deployments
//! behind a proxy must normalize the peer address before it reaches the
//! service.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{Extensions, StatusCode};
use axum::response::Response;

use super::response::error_response;

/// The limiter key for a peer: its IP without the port. IPv4-mapped IPv6
/// addresses are reported as plain IPv4 so both forms share one key.
pub fn extract_ip(peer: &SocketAddr) -> String {
    peer.ip().to_canonical().to_string()
}

/// The peer address recorded for a request, if the server was started with
/// connect info.
pub fn peer_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Extractor for the client address of the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl ClientIp {
    /// The address as a limiter key.
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        peer_addr(&parts.extensions)
            .map(|addr| ClientIp(addr.ip().to_canonical()))
            .ok_or_else(|| {
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Client address unavailable",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    fn parts_with(peer: Option<SocketAddr>, forwarded_for: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = forwarded_for {
            builder = builder
                .header("x-forwarded-for", value)
                .header("x-real-ip", value);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            request.extensions_mut().insert(ConnectInfo(peer));
        }
        request.into_parts().0
    }

    #[test]
    fn test_extract_ip_strips_port() {
        let peer: SocketAddr = "203.0.113.9:54321".parse().unwrap();
        assert_eq!(extract_ip(&peer), "203.0.113.9");

        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(extract_ip(&v6), "2001:db8::1");
    }

    #[test]
    fn test_extract_ip_unmaps_ipv4() {
        let mapped: SocketAddr = "[::ffff:192.0.2.7]:8080".parse().unwrap();
        assert_eq!(extract_ip(&mapped), "192.0.2.7");
    }

    #[tokio::test]
    async fn test_extractor_uses_connection_address() {
        let peer: SocketAddr = "198.51.100.4:1000".parse().unwrap();
        let mut parts = parts_with(Some(peer), None);

        let ClientIp(ip) = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(ip.to_string(), "198.51.100.4");
    }

    #[tokio::test]
    async fn test_forwarding_headers_are_ignored() {
        let peer: SocketAddr = "198.51.100.4:1000".parse().unwrap();
        let mut parts = parts_with(Some(peer), Some("1.2.3.4"));

        let client = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(client.key(), "198.51.100.4");
    }

    #[tokio::test]
    async fn test_missing_connect_info_is_rejected() {
        let mut parts = parts_with(None, Some("1.2.3.4"));

        let rejection = ClientIp::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(rejection.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
