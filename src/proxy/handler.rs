//! One client connection: read the request head, then either forward and
//! record a plain HTTP exchange or tunnel a CONNECT.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use memchr::memmem;

use crate::constants::{
    CLIENT_HEAD_TIMEOUT_SECS, CONNECT_TIMEOUT_SECS, MAX_REQUEST_HEAD, PUMP_MAX_IDLE_POLLS,
    PUMP_POLL_MS,
};
use crate::error::{Result, TrawlError};
use crate::proxy::pump::{Pump, RelayStats, Side};
use crate::proxy::request::{Destination, forward_head};
use crate::queue::SequenceCounter;
use crate::recorder::{CaptureSettings, Disposition, ExchangeRecorder};
use crate::types::RequestHead;

/// Everything a worker needs to serve connections.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub counter: Arc<SequenceCounter>,
    pub capture: CaptureSettings,
    /// Forward everything through this proxy instead of contacting origins.
    pub upstream: Option<Destination>,
    pub connect_timeout: Duration,
    pub head_timeout: Duration,
    pub poll: Duration,
    pub max_idle_polls: u32,
}

impl ProxyContext {
    #[must_use]
    pub fn new(counter: Arc<SequenceCounter>, capture: CaptureSettings) -> Self {
        Self {
            counter,
            capture,
            upstream: None,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            head_timeout: Duration::from_secs(CLIENT_HEAD_TIMEOUT_SECS),
            poll: Duration::from_millis(PUMP_POLL_MS),
            max_idle_polls: PUMP_MAX_IDLE_POLLS,
        }
    }

    #[must_use]
    pub fn with_upstream(mut self, upstream: Option<Destination>) -> Self {
        self.upstream = upstream;
        self
    }
}

/// What a connection turned into.
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// Plain request relayed; the recorder's verdict is attached.
    Forwarded(Disposition),
    Tunneled(RelayStats),
    /// Client hung up before sending a request head.
    Closed,
}

pub fn handle_connection(client: TcpStream, ctx: &ProxyContext) -> Result<ConnectionOutcome> {
    let Some((raw_head, leftover)) = read_request_head(&client, ctx.head_timeout)? else {
        return Ok(ConnectionOutcome::Closed);
    };
    let head = match RequestHead::parse(&raw_head) {
        Ok(head) => head,
        Err(err) => {
            respond_error(&client, 400, "Bad Request", &err.to_string());
            return Err(err);
        }
    };
    tracing::debug!(method = %head.method, uri = %head.target, "request received");

    if head.is_connect() {
        tunnel(&client, &head, &raw_head, &leftover, ctx).map(ConnectionOutcome::Tunneled)
    } else {
        forward(&client, head, &raw_head, &leftover, ctx).map(ConnectionOutcome::Forwarded)
    }
}

/// Reads up to and including the blank line ending the request head.
/// Returns the head and any bytes read past it, or `None` on a clean close.
fn read_request_head(client: &TcpStream, timeout: Duration) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    client.set_read_timeout(Some(timeout))?;
    let mut reader = client;
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(TrawlError::invalid_request("connection closed inside request head"));
        }
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(at) = memmem::find(&buf[search_from..], b"\r\n\r\n") {
            let leftover = buf.split_off(search_from + at + 4);
            return Ok(Some((buf, leftover)));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            respond_error(client, 431, "Request Header Fields Too Large", "request head too large");
            return Err(TrawlError::invalid_request("request head too large"));
        }
    }
}

fn forward(
    client: &TcpStream,
    head: RequestHead,
    raw_head: &[u8],
    leftover: &[u8],
    ctx: &ProxyContext,
) -> Result<Disposition> {
    if head.absolute_url().is_none() {
        respond_error(client, 400, "Bad Request", "absolute URI required");
        return Err(TrawlError::invalid_request(format!(
            "not an absolute URI: {}",
            head.target
        )));
    }
    let destination = Destination::for_request(&head, ctx.upstream.as_ref())?;
    let origin = match connect(&destination, ctx.connect_timeout) {
        Ok(origin) => origin,
        Err(err) => {
            tracing::warn!(host = %destination.host, port = destination.port, error = %err, "connect failed");
            respond_error(client, 502, "Bad Gateway", &err.to_string());
            return Err(err.into());
        }
    };

    let outgoing = forward_head(&head, ctx.upstream.is_some());
    let mut recorder = ExchangeRecorder::begin(ctx.counter.clone(), ctx.capture, head)?;
    recorder.record_request(raw_head);
    recorder.record_request(leftover);

    let relay = send_and_relay(client, &origin, &outgoing, leftover, ctx, &mut recorder);
    // the exchange is finalised whatever happened on the wire
    let disposition = recorder.finish()?;
    match relay {
        Ok(stats) if stats.abandoned => {
            tracing::warn!(uri = %disposition.metadata.uri, "relay abandoned after idle timeout");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::debug!(uri = %disposition.metadata.uri, error = %err, "relay ended with error");
        }
    }
    Ok(disposition)
}

fn send_and_relay(
    client: &TcpStream,
    origin: &TcpStream,
    outgoing: &[u8],
    leftover: &[u8],
    ctx: &ProxyContext,
    recorder: &mut ExchangeRecorder,
) -> io::Result<RelayStats> {
    let mut writer = origin;
    writer.write_all(outgoing)?;
    writer.write_all(leftover)?;
    Pump::new(client, origin, ctx.poll, ctx.max_idle_polls)?.run(|side, bytes| match side {
        Side::Client => recorder.record_request(bytes),
        Side::Origin => recorder.record_response(bytes),
    })
}

fn tunnel(
    client: &TcpStream,
    head: &RequestHead,
    raw_head: &[u8],
    leftover: &[u8],
    ctx: &ProxyContext,
) -> Result<RelayStats> {
    let destination = Destination::for_request(head, ctx.upstream.as_ref())?;
    let origin = match connect(&destination, ctx.connect_timeout) {
        Ok(origin) => origin,
        Err(err) => {
            tracing::warn!(authority = %head.target, error = %err, "tunnel connect failed");
            respond_error(client, 502, "Bad Gateway", &err.to_string());
            return Err(err.into());
        }
    };

    let mut writer = &origin;
    if ctx.upstream.is_some() {
        // the upstream proxy answers the CONNECT itself
        writer.write_all(raw_head)?;
    } else {
        let mut reply = client;
        reply.write_all(b"HTTP/1.0 200 Connection established\r\n\r\n")?;
    }
    writer.write_all(leftover)?;

    let stats = Pump::new(client, &origin, ctx.poll, ctx.max_idle_polls)?.run(|_, _| {})?;
    tracing::info!(
        authority = %head.target,
        client_bytes = stats.client_bytes,
        origin_bytes = stats.origin_bytes,
        abandoned = stats.abandoned,
        "tunnel closed"
    );
    Ok(stats)
}

fn connect(destination: &Destination, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (destination.host.as_str(), destination.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve", destination.host),
        )
    }))
}

fn respond_error(client: &TcpStream, status: u16, reason: &str, detail: &str) {
    let body = format!("{status} {reason}: {detail}\r\n");
    let response = format!(
        "HTTP/1.0 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let mut writer = client;
    if let Err(err) = writer.write_all(response.as_bytes()) {
        tracing::debug!(status, error = %err, "could not send error response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueDirectory, QueueKind};
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> ProxyContext {
        let queue = QueueDirectory::open(dir.path()).unwrap();
        let mut ctx = ProxyContext::new(
            Arc::new(SequenceCounter::new(queue)),
            CaptureSettings {
                max_request_bytes: 4096,
                max_body_bytes: 4096,
                debug_mlog: false,
            },
        );
        ctx.poll = Duration::from_millis(20);
        ctx.max_idle_polls = 250;
        ctx
    }

    /// Serves one connection with a canned response and returns the request
    /// head it saw.
    fn origin(response: impl AsRef<[u8]> + Send + 'static) -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            let mut chunk = [0u8; 1024];
            while memmem::find(&seen, b"\r\n\r\n").is_none() {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&chunk[..n]);
            }
            stream.write_all(response.as_ref()).unwrap();
            seen
        });
        (port, handle)
    }

    /// Accepts one connection, reads until `until` bytes arrived, then
    /// answers with `response`.
    fn peer_reading(until: usize, response: &'static [u8]) -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = vec![0u8; until];
            stream.read_exact(&mut seen).unwrap();
            stream.write_all(response).unwrap();
            seen
        });
        (port, handle)
    }

    /// Runs `handle_connection` against `request` and returns what the
    /// client received.
    fn exchange(ctx: &ProxyContext, request: String) -> (Result<ConnectionOutcome>, Vec<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(request.as_bytes()).unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });
        let (accepted, _) = listener.accept().unwrap();
        let outcome = handle_connection(accepted, ctx);
        (outcome, client.join().unwrap())
    }

    #[test]
    fn forwards_and_records_html_exchange() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (port, origin) =
            origin(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello");

        let (outcome, received) = exchange(
            &ctx,
            format!("GET http://127.0.0.1:{port}/page HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"),
        );
        let seen = String::from_utf8(origin.join().unwrap()).unwrap();

        assert!(seen.starts_with("GET /page HTTP/1.1\r\n"));
        assert!(!seen.to_ascii_lowercase().contains("proxy-connection"));
        assert!(seen.contains("Connection: close\r\n"));
        assert!(received.ends_with(b"hello"));

        let ConnectionOutcome::Forwarded(disposition) = outcome.unwrap() else {
            panic!("expected a forwarded exchange");
        };
        assert!(!disposition.metadata.discard);
        let id = disposition.id.unwrap();
        assert!(ctx.counter.queue().path_for(id, QueueKind::Captured).exists());
    }

    #[test]
    fn relative_target_gets_400() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (outcome, received) =
            exchange(&ctx, "GET /local HTTP/1.1\r\nHost: example.com\r\n\r\n".to_string());
        assert!(outcome.is_err());
        assert!(received.starts_with(b"HTTP/1.0 400 "));
    }

    #[test]
    fn unreachable_origin_gets_502() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        // bind then drop to get a port with no listener
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let (outcome, received) = exchange(
            &ctx,
            format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\n\r\n"),
        );
        assert!(outcome.is_err());
        assert!(received.starts_with(b"HTTP/1.0 502 "));
        assert!(ctx.counter.queue().list(QueueKind::Captured).unwrap().is_empty());
    }

    #[test]
    fn connect_is_tunneled_without_recording() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let origin = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut ping = [0u8; 4];
            stream.read_exact(&mut ping).unwrap();
            stream.write_all(b"pong").unwrap();
        });

        let (outcome, received) = exchange(
            &ctx,
            format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\nping"),
        );
        origin.join().unwrap();

        assert_eq!(received, b"HTTP/1.0 200 Connection established\r\n\r\npong");
        let ConnectionOutcome::Tunneled(stats) = outcome.unwrap() else {
            panic!("expected a tunnel");
        };
        assert_eq!(stats.origin_bytes, 4);
        assert!(ctx.counter.queue().list(QueueKind::Captured).unwrap().is_empty());
    }

    #[test]
    fn clean_close_before_head_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || drop(TcpStream::connect(addr).unwrap()));
        let (accepted, _) = listener.accept().unwrap();
        client.join().unwrap();
        assert!(matches!(
            handle_connection(accepted, &ctx).unwrap(),
            ConnectionOutcome::Closed
        ));
    }

    #[test]
    fn upstream_receives_absolute_uri() {
        let dir = TempDir::new().unwrap();
        let (port, upstream) =
            origin(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nok");
        let ctx = context(&dir).with_upstream(Some(Destination {
            host: "127.0.0.1".into(),
            port,
        }));

        let (outcome, received) = exchange(
            &ctx,
            "GET http://archive.invalid/page?x=1 HTTP/1.1\r\nHost: archive.invalid\r\n\r\n".to_string(),
        );
        let seen = String::from_utf8(upstream.join().unwrap()).unwrap();

        assert!(seen.starts_with("GET http://archive.invalid/page?x=1 HTTP/1.1\r\n"));
        assert!(seen.contains("Host: archive.invalid\r\n"));
        assert!(received.ends_with(b"ok"));
        let ConnectionOutcome::Forwarded(disposition) = outcome.unwrap() else {
            panic!("expected a forwarded exchange");
        };
        assert_eq!(disposition.metadata.uri, "http://archive.invalid/page?x=1");
        assert!(disposition.id.is_some());
    }

    #[test]
    fn connect_through_upstream_relays_its_reply() {
        let dir = TempDir::new().unwrap();
        let request = "CONNECT secure.invalid:443 HTTP/1.1\r\nHost: secure.invalid:443\r\n\r\n";
        let (port, upstream) = peer_reading(
            request.len() + 4,
            b"HTTP/1.1 200 Tunnel ready\r\n\r\npong",
        );
        let ctx = context(&dir).with_upstream(Some(Destination {
            host: "127.0.0.1".into(),
            port,
        }));

        let (outcome, received) = exchange(&ctx, format!("{request}ping"));
        let seen = upstream.join().unwrap();

        assert_eq!(seen, format!("{request}ping").into_bytes());
        // the proxy adds no reply of its own
        assert_eq!(received, b"HTTP/1.1 200 Tunnel ready\r\n\r\npong");
        let ConnectionOutcome::Tunneled(stats) = outcome.unwrap() else {
            panic!("expected a tunnel");
        };
        assert_eq!(stats.origin_bytes, 33);
        assert!(ctx.counter.queue().list(QueueKind::Captured).unwrap().is_empty());
    }

    #[test]
    fn oversized_request_is_relayed_but_discarded() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (port, origin) =
            origin(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 4\r\n\r\ndone");
        let cookie = "c".repeat(6000);

        let (outcome, received) = exchange(
            &ctx,
            format!("GET http://127.0.0.1:{port}/form HTTP/1.1\r\nCookie: {cookie}\r\n\r\n"),
        );
        let seen = String::from_utf8(origin.join().unwrap()).unwrap();

        assert!(seen.contains(&cookie));
        assert!(received.ends_with(b"done"));
        let ConnectionOutcome::Forwarded(disposition) = outcome.unwrap() else {
            panic!("expected a forwarded exchange");
        };
        assert!(disposition.metadata.overflowed);
        assert!(disposition.metadata.discard);
        assert_eq!(disposition.id, None);
        assert!(ctx.counter.queue().list(QueueKind::Captured).unwrap().is_empty());
    }

    #[test]
    fn oversized_response_head_is_relayed_but_discarded() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let padding = "p".repeat(MAX_REQUEST_HEAD + 1024);
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nX-Padding: {padding}\r\nContent-Length: 4\r\n\r\nbody"
        );
        let expected = response.clone().into_bytes();
        let (port, origin) = origin(response);

        let (outcome, received) =
            exchange(&ctx, format!("GET http://127.0.0.1:{port}/big HTTP/1.1\r\n\r\n"));
        origin.join().unwrap();

        assert_eq!(received, expected);
        let ConnectionOutcome::Forwarded(disposition) = outcome.unwrap() else {
            panic!("expected a forwarded exchange");
        };
        assert!(disposition.metadata.overflowed);
        assert!(disposition.metadata.discard);
        assert!(ctx.counter.queue().list(QueueKind::Captured).unwrap().is_empty());
    }
}
