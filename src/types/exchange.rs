//! HTTP message heads and the metadata derived from one captured exchange.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, TrawlError};

/// Header fields in arrival order; names keep their original case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Lowercased names; repeated fields are joined with `", "`.
    #[must_use]
    pub fn to_lowercase_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &self.0 {
            map.entry(name.to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        map
    }
}

fn head_lines(bytes: &[u8]) -> impl Iterator<Item = String> + '_ {
    bytes
        .split(|b| *b == b'\n')
        .map(|line| String::from_utf8_lossy(line.strip_suffix(b"\r").unwrap_or(line)).into_owned())
        .take_while(|line| !line.is_empty())
}

fn parse_header_lines(lines: impl Iterator<Item = String>) -> Headers {
    let mut headers = Headers::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push(name.trim(), value.trim());
        }
    }
    headers
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Parses a request head; bytes after the blank line are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut lines = head_lines(bytes);
        let request_line = lines
            .next()
            .ok_or_else(|| TrawlError::invalid_request("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Err(TrawlError::invalid_request(format!(
                "bad request line {request_line:?}"
            )));
        };
        let version = parts.next().unwrap_or("HTTP/0.9").to_string();
        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers: parse_header_lines(lines),
        })
    }

    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Absolute request target, if the client sent one.
    #[must_use]
    pub fn absolute_url(&self) -> Option<Url> {
        if self.is_connect() {
            return None;
        }
        Url::parse(&self.target)
            .ok()
            .filter(|url| url.has_host())
    }

    /// Target host and port; CONNECT targets are `host:port`.
    #[must_use]
    pub fn authority(&self) -> Option<(String, u16)> {
        if self.is_connect() {
            return split_authority(&self.target, 443);
        }
        if let Some(url) = self.absolute_url() {
            let host = url.host_str()?.to_string();
            return Some((host, url.port_or_known_default().unwrap_or(80)));
        }
        self.headers
            .get("host")
            .and_then(|host| split_authority(host, 80))
    }

    #[must_use]
    pub fn host(&self) -> String {
        self.authority().map(|(host, _)| host).unwrap_or_default()
    }

    /// Path plus query, as sent to an origin server.
    #[must_use]
    pub fn path(&self) -> String {
        match self.absolute_url() {
            Some(url) => match url.query() {
                Some(query) => format!("{}?{query}", url.path()),
                None => url.path().to_string(),
            },
            None => self.target.clone(),
        }
    }

    /// Full request URI, reconstructed from the Host header when needed.
    #[must_use]
    pub fn uri(&self) -> String {
        if self.is_connect() || self.absolute_url().is_some() {
            return self.target.clone();
        }
        match self.headers.get("host") {
            Some(host) => format!("http://{host}{}", self.target),
            None => self.target.clone(),
        }
    }
}

pub(crate) fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    // bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

/// Parsed status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut lines = head_lines(bytes);
        let status_line = lines
            .next()
            .ok_or_else(|| TrawlError::invalid_request("empty response"))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default().to_string();
        if !version.starts_with("HTTP/") {
            return Err(TrawlError::invalid_request(format!(
                "bad status line {status_line:?}"
            )));
        }
        let status = parts
            .next()
            .and_then(|code| code.trim().parse::<u16>().ok())
            .ok_or_else(|| TrawlError::invalid_request(format!("bad status {status_line:?}")))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();
        Ok(Self {
            version,
            status,
            reason,
            headers: parse_header_lines(lines),
        })
    }
}

/// Short content type tag: `html`, `txt`, otherwise the media subtype.
#[must_use]
pub fn abbreviate_content_type(content_type: &str) -> String {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "" => String::new(),
        "text/html" => "html".to_string(),
        "text/plain" => "txt".to_string(),
        other => other
            .rsplit_once('/')
            .map_or(other, |(_, subtype)| subtype)
            .chars()
            .take(10)
            .collect(),
    }
}

/// Three-character summary of cache and capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagCode(pub [u8; 3]);

impl fmt::Display for FlagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Metadata derived from a captured request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMetadata {
    pub method: String,
    pub host: String,
    pub path: String,
    pub uri: String,
    pub status: u16,
    /// Response headers with lowercased names.
    pub headers: BTreeMap<String, String>,
    pub content_length: Option<u64>,
    pub bytes_received: u64,
    pub ctype: String,
    pub has_authorization: bool,
    pub truncated: bool,
    pub overflowed: bool,
    pub flags: FlagCode,
    pub discard: bool,
}

impl ExchangeMetadata {
    /// Derives metadata; `response` is `None` when no status line arrived.
    #[must_use]
    pub fn derive(
        request: &RequestHead,
        response: Option<&ResponseHead>,
        bytes_received: u64,
        overflowed: bool,
    ) -> Self {
        let headers = response
            .map(|head| head.headers.to_lowercase_map())
            .unwrap_or_default();
        let status = response.map_or(0, |head| head.status);
        let content_length = headers
            .get("content-length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        let truncated = content_length.is_some_and(|len| len != bytes_received);
        let ctype = headers
            .get("content-type")
            .map(|value| abbreviate_content_type(value))
            .unwrap_or_default();
        let cache_control = headers
            .get("cache-control")
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        let no_store = cache_control.contains("no-store");
        let no_cache = cache_control.contains("no-cache");
        let has_authorization = request.headers.contains("authorization");
        let host = request.host();

        let keep = request.method == "GET"
            && status == 200
            && (ctype == "html" || ctype == "txt")
            && !has_authorization
            && !no_store
            && !truncated
            && !overflowed
            && !host.eq_ignore_ascii_case("localhost");
        let discard = !keep;

        let last = if truncated {
            b'T'
        } else if has_authorization {
            b'A'
        } else if discard {
            b'X'
        } else {
            b'_'
        };
        let flags = FlagCode([
            if no_store { b'S' } else { b'_' },
            if no_cache { b'C' } else { b'_' },
            last,
        ]);

        Self {
            method: request.method.clone(),
            path: request.path(),
            uri: request.uri(),
            host,
            status,
            headers,
            content_length,
            bytes_received,
            ctype,
            has_authorization,
            truncated,
            overflowed,
            flags,
            discard,
        }
    }

    /// One-line summary used in capture logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} {:3} {:<5} {:>8} {} {}",
            self.flags, self.status, self.ctype, self.bytes_received, self.method, self.uri
        )
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
