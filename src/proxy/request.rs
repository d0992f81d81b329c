//! Rewriting a client request for the next hop.

use crate::error::{Result, TrawlError};
use crate::types::RequestHead;
use crate::types::exchange::split_authority;

/// Headers meaningful only for a single transport hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// Host and port of the next hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    /// Parses `host:port` (port defaults to 80).
    pub fn parse(authority: &str) -> Result<Self> {
        let authority = authority
            .trim()
            .trim_start_matches("http://")
            .trim_end_matches('/');
        split_authority(authority, 80)
            .map(|(host, port)| Self { host, port })
            .ok_or_else(|| TrawlError::invalid_request(format!("bad authority {authority:?}")))
    }

    /// Where a request goes: the upstream proxy if configured, otherwise the
    /// request's own target.
    pub fn for_request(head: &RequestHead, upstream: Option<&Destination>) -> Result<Self> {
        if let Some(upstream) = upstream {
            return Ok(upstream.clone());
        }
        head.authority()
            .map(|(host, port)| Self { host, port })
            .ok_or_else(|| TrawlError::invalid_request(format!("no target host in {:?}", head.target)))
    }
}

/// Serialises the request head to send to the next hop.
///
/// An upstream proxy receives the absolute URI; an origin server receives
/// the path only. Hop-by-hop headers, including those named in
/// `Connection`, are removed and `Connection: close` is forced.
#[must_use]
pub fn forward_head(head: &RequestHead, via_upstream: bool) -> Vec<u8> {
    let target = if via_upstream { head.uri() } else { head.path() };
    let target = if target.is_empty() { "/".to_string() } else { target };

    let mut headers = head.headers.clone();
    if let Some(named) = head.headers.get("connection") {
        for name in named.split(',') {
            headers.remove(name.trim());
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if !headers.contains("host") {
        if let Some((host, port)) = head.authority() {
            let host = if port == 80 { host } else { format!("{host}:{port}") };
            headers.push("Host", host);
        }
    }

    let mut out = format!("{} {} {}\r\n", head.method, target, head.version);
    for (name, value) in headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn direct_forward_uses_path_and_strips_hop_headers() {
        let req = head(
            "GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nConnection: keep-alive, X-Private\r\nX-Private: 1\r\nAccept: text/html\r\n\r\n",
        );
        let out = String::from_utf8(forward_head(&req, false)).unwrap();
        assert_eq!(
            out,
            "GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nAccept: text/html\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn upstream_forward_keeps_absolute_uri() {
        let req = head("GET http://example.com/a HTTP/1.0\r\n\r\n");
        let out = String::from_utf8(forward_head(&req, true)).unwrap();
        assert!(out.starts_with("GET http://example.com/a HTTP/1.0\r\nHost: example.com\r\n"));
        assert!(out.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn destination_prefers_upstream() {
        let req = head("GET http://example.com:8080/ HTTP/1.1\r\n\r\n");
        let direct = Destination::for_request(&req, None).unwrap();
        assert_eq!(direct, Destination { host: "example.com".into(), port: 8080 });

        let upstream = Destination::parse("http://proxy.internal:3128/").unwrap();
        let routed = Destination::for_request(&req, Some(&upstream)).unwrap();
        assert_eq!(routed.host, "proxy.internal");
        assert_eq!(routed.port, 3128);
    }

    #[test]
    fn origin_form_without_host_has_no_destination() {
        let req = head("GET /nowhere HTTP/1.1\r\n\r\n");
        assert!(Destination::for_request(&req, None).is_err());
    }
}
