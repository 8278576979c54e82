//! Per-connection request handling on the HTTP port.
//!
//! Routes each accepted connection by its first request:
//!   - `CONNECT host:80` — plaintext hijack (dial, pump request/response pairs)
//!   - `CONNECT host:<other>` — TLS interception with a minted certificate
//!   - absolute-form URI — plain proxy forward with header rewriting
//!   - origin-form URI — treated as `http://<Host header><uri>` (HTTP/1.0
//!     clients talking to the proxy as if it were the origin)

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::proxy::inject::AllowlistResolver;
use crate::proxy::{connect, tls, ProxyState};

// ── Timeouts and limits ─────────────────────────────────────────────

pub const CONN_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONN_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const MAX_REQUEST_BODY: u64 = 64 * 1024 * 1024; // 64 MB
pub const MAX_RESPONSE_BODY: u64 = 512 * 1024 * 1024; // 512 MB

// ── Hop-by-hop headers (RFC 2616 §13.5.1) ──────────────────────────

/// Headers that must not be forwarded by a proxy.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// ── HTTP/1.x wire parsing ───────────────────────────────────────────

/// A parsed HTTP request head.
pub struct RawRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// A parsed HTTP response head.
pub struct RawResponse {
    pub status_line: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Read an HTTP/1.x request head (request-line + headers). The reader ends
/// up just past the `\r\n\r\n` terminator.
pub async fn read_http_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<RawRequest> {
    let mut request_line = String::new();
    let n = reader.read_line(&mut request_line).await?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty request"));
    }

    let request_line = request_line.trim_end();
    let parts: Vec<&str> = request_line.splitn(3, ' ').collect();
    if parts.len() < 3 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed request line: {request_line}"),
        ));
    }

    Ok(RawRequest {
        method: parts[0].to_owned(),
        uri: parts[1].to_owned(),
        version: parts[2].to_owned(),
        headers: read_headers(reader).await?,
    })
}

/// Read an HTTP/1.x response head (status-line + headers).
pub async fn read_http_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<RawResponse> {
    let mut status_line = String::new();
    let n = reader.read_line(&mut status_line).await?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty response"));
    }

    let status_line = status_line.trim_end().to_owned();
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed status line: {status_line}"),
            )
        })?;

    Ok(RawResponse {
        status_line,
        status,
        headers: read_headers(reader).await?,
    })
}

async fn read_headers<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }
    Ok(headers)
}

/// Read a fixed-length body.
pub async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R, len: u64) -> io::Result<Vec<u8>> {
    let mut body = vec![0u8; len as usize];
    if len > 0 {
        reader.read_exact(&mut body).await?;
    }
    Ok(body)
}

// ── Header helpers ──────────────────────────────────────────────────

/// Find the value of a header by name (case-insensitive).
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Get the Content-Length value from headers, or 0.
pub fn content_length(headers: &[(String, String)]) -> u64 {
    find_header(headers, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

pub fn is_chunked(headers: &[(String, String)]) -> bool {
    find_header(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

pub fn wants_close(headers: &[(String, String)]) -> bool {
    find_header(headers, "connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

/// Strip hop-by-hop headers from the list.
pub fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| {
        !HOP_BY_HOP_HEADERS
            .iter()
            .any(|&h| name.eq_ignore_ascii_case(h))
    });
}

/// Set a header to exactly one value, dropping any client-supplied copies.
pub fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    headers.push((name.to_owned(), value.to_owned()));
}

/// Format headers as an HTTP/1.1 header block.
pub fn format_headers(headers: &[(String, String)]) -> String {
    let mut block = String::new();
    for (name, value) in headers {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    block
}

/// Strip a trailing `:port` from a host, leaving IPv6 brackets intact.
pub fn host_without_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        // [::1]:443 or [::1]
        return &host[..=end];
    }
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

/// Split a CONNECT target into host and port (default 443).
pub fn parse_connect_target(uri: &str) -> (String, u16) {
    let host = host_without_port(uri);
    let port = uri[host.len()..]
        .strip_prefix(':')
        .and_then(|p| p.parse().ok())
        .unwrap_or(443);
    (host.to_owned(), port)
}

/// Extract the authority (`host[:port]`) from an absolute URI.
pub fn authority_of_url(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))?;
    Some(rest.split('/').next().unwrap_or(rest))
}

/// Write a bare error response.
pub async fn write_error_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
) -> io::Result<()> {
    let response = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\n\r\n");
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

// ── Connection entry point ──────────────────────────────────────────

/// Handle one accepted connection on the HTTP port.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ProxyState>) {
    let mut reader = BufReader::new(stream);

    let req = match timeout(CONN_READ_TIMEOUT, read_http_request(&mut reader)).await {
        Ok(Ok(req)) => req,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "failed to read request");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "read timeout");
            return;
        }
    };

    if req.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = parse_connect_target(&req.uri);
        debug!(peer = %peer, host = %host, port, "CONNECT request");
        if port == 80 {
            connect::hijack_port80(reader, &host, port, &state).await;
        } else {
            tls::serve_mitm(reader, &host, port, true, state).await;
        }
    } else {
        serve_http(reader, req, &state).await;
    }
}

/// Plain-HTTP request loop: forward each request with header rewriting,
/// keeping the connection alive until either side asks to close.
async fn serve_http<S>(mut reader: BufReader<S>, first: RawRequest, state: &ProxyState)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to build upstream client");
            return;
        }
    };

    let mut req = first;
    loop {
        let url = if req.uri.starts_with("http://") || req.uri.starts_with("https://") {
            req.uri.clone()
        } else {
            // Origin-form fallback: the client is speaking to the proxy as
            // if it were the origin server.
            match find_header(&req.headers, "host") {
                Some(host) => format!("http://{}{}", host, req.uri),
                None => {
                    let _ = write_error_response(reader.get_mut(), 400, "Bad Request").await;
                    return;
                }
            }
        };

        let authority = match authority_of_url(&url) {
            Some(authority) => authority.to_owned(),
            None => {
                let _ = write_error_response(reader.get_mut(), 400, "Bad Request").await;
                return;
            }
        };
        let host = host_without_port(&authority).to_owned();

        match forward_upstream(&mut reader, &req, &url, &host, &client, state).await {
            Ok(false) => {}
            _ => return,
        }

        req = match timeout(CONN_IDLE_TIMEOUT, read_http_request(&mut reader)).await {
            Ok(Ok(next)) => next,
            _ => return,
        };
    }
}

// ── Upstream forwarding ─────────────────────────────────────────────

/// Read the request body, rewrite headers, forward upstream, and relay the
/// response. Returns `Ok(true)` when the connection should close afterwards.
pub async fn forward_upstream<RW>(
    reader: &mut BufReader<RW>,
    req: &RawRequest,
    url: &str,
    host: &str,
    client: &reqwest::Client,
    state: &ProxyState,
) -> io::Result<bool>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    let body_len = content_length(&req.headers).min(MAX_REQUEST_BODY);
    let body = read_body(reader, body_len).await?;

    let mut headers = req.headers.clone();
    let resolver = AllowlistResolver {
        secrets: &state.secrets,
        tenant: &state.team_id,
        host,
    };
    state.rewriter.rewrite(&mut headers, &resolver).await;
    set_header(&mut headers, "X-E2B-Sandbox", &state.sandbox_id);
    set_header(&mut headers, "X-E2B-Team", &state.team_id);
    strip_hop_by_hop(&mut headers);
    // Body framing is recomputed by the upstream client.
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case("content-length"));

    let method = match reqwest::Method::from_bytes(req.method.to_ascii_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            write_error_response(reader.get_mut(), 400, "Bad Request").await?;
            return Ok(true);
        }
    };

    let mut builder = client.request(method, url);
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    let resp = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(host, error = %e, "upstream error");
            write_error_response(reader.get_mut(), 502, "Bad Gateway").await?;
            return Ok(true);
        }
    };

    let request_close = wants_close(&req.headers);
    let response_close = resp
        .headers()
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false);

    let status = resp.status();
    let mut resp_headers: Vec<(String, String)> = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_owned()))
        .collect();
    strip_hop_by_hop(&mut resp_headers);

    let resp_body = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(host, error = %e, "failed to read upstream body");
            write_error_response(reader.get_mut(), 502, "Bad Gateway").await?;
            return Ok(true);
        }
    };
    let body_slice = if resp_body.len() as u64 > MAX_RESPONSE_BODY {
        &resp_body[..MAX_RESPONSE_BODY as usize]
    } else {
        &resp_body
    };

    let writer = reader.get_mut();
    let status_line = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    writer.write_all(status_line.as_bytes()).await?;

    let has_content_length = resp_headers
        .iter()
        .any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
    if !has_content_length {
        let cl = format!("Content-Length: {}\r\n", body_slice.len());
        writer.write_all(cl.as_bytes()).await?;
    }

    writer.write_all(format_headers(&resp_headers).as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.write_all(body_slice).await?;
    writer.flush().await?;

    Ok(request_close || response_close)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_http_request_parses_get() {
        let raw = b"GET /path HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let mut cursor = &raw[..];
        let mut reader = BufReader::new(&mut cursor);
        let req = read_http_request(&mut reader).await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/path");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.headers[0].0, "Host");
        assert_eq!(req.headers[0].1, "example.com");
    }

    #[tokio::test]
    async fn read_http_request_parses_connect() {
        let raw = b"CONNECT api.example.com:443 HTTP/1.1\r\nHost: api.example.com:443\r\n\r\n";
        let mut cursor = &raw[..];
        let mut reader = BufReader::new(&mut cursor);
        let req = read_http_request(&mut reader).await.unwrap();
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.uri, "api.example.com:443");
    }

    #[tokio::test]
    async fn read_http_response_parses_status() {
        let raw = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";
        let mut cursor = &raw[..];
        let mut reader = BufReader::new(&mut cursor);
        let resp = read_http_response(&mut reader).await.unwrap();
        assert_eq!(resp.status, 502);
        assert_eq!(resp.status_line, "HTTP/1.1 502 Bad Gateway");
        assert_eq!(content_length(&resp.headers), 0);
    }

    #[tokio::test]
    async fn malformed_request_line_is_an_error() {
        let raw = b"NONSENSE\r\n\r\n";
        let mut cursor = &raw[..];
        let mut reader = BufReader::new(&mut cursor);
        assert!(read_http_request(&mut reader).await.is_err());
    }

    #[test]
    fn parse_connect_target_variants() {
        assert_eq!(
            parse_connect_target("example.com:443"),
            ("example.com".to_owned(), 443)
        );
        assert_eq!(
            parse_connect_target("example.com:80"),
            ("example.com".to_owned(), 80)
        );
        assert_eq!(
            parse_connect_target("example.com"),
            ("example.com".to_owned(), 443)
        );
    }

    #[test]
    fn host_without_port_variants() {
        assert_eq!(host_without_port("example.com:8080"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("[::1]:443"), "[::1]");
        assert_eq!(host_without_port("[::1]"), "[::1]");
    }

    #[test]
    fn authority_of_url_variants() {
        assert_eq!(
            authority_of_url("http://example.com:8080/path"),
            Some("example.com:8080")
        );
        assert_eq!(authority_of_url("https://api.test/v1"), Some("api.test"));
        assert_eq!(authority_of_url("/just/a/path"), None);
    }

    #[test]
    fn strip_hop_by_hop_removes_headers() {
        let mut headers = vec![
            ("Connection".to_owned(), "keep-alive".to_owned()),
            ("Content-Type".to_owned(), "text/plain".to_owned()),
            ("Keep-Alive".to_owned(), "timeout=5".to_owned()),
            ("Authorization".to_owned(), "Bearer token".to_owned()),
            ("Transfer-Encoding".to_owned(), "chunked".to_owned()),
        ];
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "Content-Type");
        assert_eq!(headers[1].0, "Authorization");
    }

    #[test]
    fn set_header_drops_spoofed_copies() {
        let mut headers = vec![
            ("X-E2B-Team".to_owned(), "spoofed".to_owned()),
            ("x-e2b-team".to_owned(), "also-spoofed".to_owned()),
            ("Accept".to_owned(), "*/*".to_owned()),
        ];
        set_header(&mut headers, "X-E2B-Team", "real-team");
        let values: Vec<&str> = headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("x-e2b-team"))
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(values, vec!["real-team"]);
    }

    #[test]
    fn chunked_and_close_detection() {
        let headers = vec![
            ("Transfer-Encoding".to_owned(), "Chunked".to_owned()),
            ("Connection".to_owned(), "Close".to_owned()),
        ];
        assert!(is_chunked(&headers));
        assert!(wants_close(&headers));
        assert!(!is_chunked(&[]));
        assert!(!wants_close(&[]));
    }
}
