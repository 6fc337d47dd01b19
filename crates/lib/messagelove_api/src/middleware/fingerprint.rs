//! Client fingerprint extractor for login throttling.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::header::USER_AGENT;
use axum::http::request::Parts;

use crate::AppState;

/// Characters of the user agent folded into the fingerprint.
const USER_AGENT_FRAGMENT_LEN: usize = 64;

/// `ip|user-agent-fragment` for the calling client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFingerprint(pub String);

impl ClientFingerprint {
    pub fn from_parts(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> Self {
        let proxied_ip = trust_proxy
            .then(|| {
                // The rightmost hop is the one the trusted proxy appended;
                // everything left of it is client-supplied.
                header_str(headers, "x-forwarded-for")
                    .and_then(|v| v.rsplit(',').next())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .or_else(|| header_str(headers, "x-real-ip").map(str::trim))
            })
            .flatten();
        let ip = proxied_ip
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        let agent: String = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .chars()
            .take(USER_AGENT_FRAGMENT_LEN)
            .collect();
        Self(format!("{ip}|{agent}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl FromRequestParts<AppState> for ClientFingerprint {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_parts(
            &parts.headers,
            peer,
            state.config.trust_proxy_headers,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn peer_address_and_agent_fragment() {
        let peer: SocketAddr = "203.0.113.9:5555".parse().expect("addr");
        let fp = ClientFingerprint::from_parts(&headers(&[("user-agent", "Mozilla/5.0")]), Some(peer), false);
        assert_eq!(fp.as_str(), "203.0.113.9|Mozilla/5.0");
    }

    #[test]
    fn forwarded_for_is_ignored_unless_trusted() {
        let peer: SocketAddr = "10.0.0.1:80".parse().expect("addr");
        let map = headers(&[("x-forwarded-for", "198.51.100.4")]);
        assert_eq!(
            ClientFingerprint::from_parts(&map, Some(peer), false).as_str(),
            "10.0.0.1|"
        );
        assert_eq!(
            ClientFingerprint::from_parts(&map, Some(peer), true).as_str(),
            "198.51.100.4|"
        );
    }

    #[test]
    fn forged_forwarded_for_entries_do_not_change_the_fingerprint() {
        let peer: SocketAddr = "10.0.0.1:80".parse().expect("addr");
        let honest = headers(&[("x-forwarded-for", "198.51.100.4")]);
        let forged = headers(&[("x-forwarded-for", "203.0.113.66, 198.51.100.4")]);
        let other_forgery = headers(&[("x-forwarded-for", "192.0.2.1,198.51.100.4")]);
        let expected = ClientFingerprint::from_parts(&honest, Some(peer), true);
        assert_eq!(ClientFingerprint::from_parts(&forged, Some(peer), true), expected);
        assert_eq!(ClientFingerprint::from_parts(&other_forgery, Some(peer), true), expected);
    }

    #[test]
    fn real_ip_is_used_without_forwarded_for() {
        let map = headers(&[("x-real-ip", " 198.51.100.9 ")]);
        assert_eq!(
            ClientFingerprint::from_parts(&map, None, true).as_str(),
            "198.51.100.9|"
        );
    }

    #[test]
    fn long_agents_are_truncated() {
        let long = "x".repeat(500);
        let mut map = HeaderMap::new();
        map.insert(USER_AGENT, HeaderValue::from_str(&long).expect("header"));
        let fp = ClientFingerprint::from_parts(&map, None, false);
        assert_eq!(fp.as_str().len(), "unknown|".len() + USER_AGENT_FRAGMENT_LEN);
    }
}
