//! Plaintext CONNECT hijacking for port-80 targets.
//!
//! The tunnel stays HTTP-aware: each request read from the client has its
//! headers rewritten before forwarding, and each response is relayed back
//! with its original framing (Content-Length, chunked, or read-to-close).
//! A 502 goes to the client only while no response bytes have been sent for
//! the current exchange.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::proxy::handler::{
    content_length, find_header, format_headers, host_without_port, is_chunked, read_body,
    read_http_request, read_http_response, set_header, wants_close, RawResponse,
    CONN_IDLE_TIMEOUT, MAX_REQUEST_BODY,
};
use crate::proxy::inject::AllowlistResolver;
use crate::proxy::ProxyState;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Take over a CONNECT to a port-80 target: dial, acknowledge, then pump
/// request/response pairs until either side closes.
pub async fn hijack_port80<S>(mut client: BufReader<S>, host: &str, port: u16, state: &ProxyState)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = format!("{host}:{port}");

    let remote = match timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            warn!(target = %target, error = %e, "hijack dial error");
            let _ = client
                .get_mut()
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            return;
        }
        Err(_) => {
            warn!(target = %target, "hijack dial timeout");
            let _ = client
                .get_mut()
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            return;
        }
    };

    if client
        .get_mut()
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }
    let _ = client.get_mut().flush().await;

    pump(client, BufReader::new(remote), host, state).await;
}

/// One request/response exchange at a time, client to remote and back.
async fn pump<S>(
    mut client: BufReader<S>,
    mut remote: BufReader<TcpStream>,
    host: &str,
    state: &ProxyState,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bare_host = host_without_port(host).to_owned();

    loop {
        let req = match timeout(CONN_IDLE_TIMEOUT, read_http_request(&mut client)).await {
            Ok(Ok(req)) => req,
            _ => return,
        };
        let body = match read_body(
            &mut client,
            content_length(&req.headers).min(MAX_REQUEST_BODY),
        )
        .await
        {
            Ok(body) => body,
            Err(_) => return,
        };

        let mut headers = req.headers.clone();
        let resolver = AllowlistResolver {
            secrets: &state.secrets,
            tenant: &state.team_id,
            host: &bare_host,
        };
        state.rewriter.rewrite(&mut headers, &resolver).await;
        set_header(&mut headers, "X-E2B-Sandbox", &state.sandbox_id);
        set_header(&mut headers, "X-E2B-Team", &state.team_id);

        // Forward the request; a failure here predates any response bytes.
        let head = format!(
            "{} {} {}\r\n{}\r\n",
            req.method,
            req.uri,
            req.version,
            format_headers(&headers)
        );
        let forwarded = async {
            remote.get_mut().write_all(head.as_bytes()).await?;
            remote.get_mut().write_all(&body).await?;
            remote.get_mut().flush().await
        }
        .await;
        if let Err(e) = forwarded {
            debug!(error = %e, "error writing request to remote");
            let _ = client
                .get_mut()
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            return;
        }

        let resp = match read_http_response(&mut remote).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, "error reading response from remote");
                let _ = client
                    .get_mut()
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                    .await;
                return;
            }
        };

        let resp_head = format!("{}\r\n{}\r\n", resp.status_line, format_headers(&resp.headers));
        if client.get_mut().write_all(resp_head.as_bytes()).await.is_err() {
            return;
        }
        // Response bytes are on the wire; errors past this point just close.
        match relay_response_body(&mut remote, client.get_mut(), &req.method, &resp).await {
            Ok(true) => {}
            Ok(false) => {
                // Body ran to connection close; nothing more to pump.
                let _ = client.get_mut().flush().await;
                return;
            }
            Err(e) => {
                debug!(error = %e, "error relaying response body");
                return;
            }
        }
        if client.get_mut().flush().await.is_err() {
            return;
        }

        if wants_close(&req.headers) || wants_close(&resp.headers) {
            return;
        }
    }
}

/// Relay a response body with its original framing. Returns `Ok(true)` when
/// the exchange ended cleanly and the connection can carry another request,
/// `Ok(false)` when the body was delimited by connection close.
async fn relay_response_body<W>(
    remote: &mut BufReader<TcpStream>,
    client: &mut W,
    request_method: &str,
    resp: &RawResponse,
) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    if !response_has_body(request_method, resp.status) {
        return Ok(true);
    }

    if is_chunked(&resp.headers) {
        relay_chunked(remote, client).await?;
        return Ok(true);
    }

    if find_header(&resp.headers, "content-length").is_some() {
        let len = content_length(&resp.headers);
        let mut limited = tokio::io::AsyncReadExt::take(&mut *remote, len);
        tokio::io::copy(&mut limited, client).await?;
        return Ok(true);
    }

    // No framing: the body runs until the remote closes.
    tokio::io::copy(remote, client).await?;
    Ok(false)
}

fn response_has_body(request_method: &str, status: u16) -> bool {
    if request_method.eq_ignore_ascii_case("HEAD") {
        return false;
    }
    !(status < 200 || status == 204 || status == 304)
}

/// Forward a chunked body chunk-by-chunk, including trailers.
async fn relay_chunked<W>(remote: &mut BufReader<TcpStream>, client: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    loop {
        let mut size_line = String::new();
        let n = remote.read_line(&mut size_line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof inside chunked body",
            ));
        }
        client.write_all(size_line.as_bytes()).await?;

        let size_str = size_line.trim_end();
        let size_str = size_str.split(';').next().unwrap_or(size_str);
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;

        if size == 0 {
            // Trailer section, ending with an empty line.
            loop {
                let mut trailer = String::new();
                let n = remote.read_line(&mut trailer).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof inside chunk trailers",
                    ));
                }
                client.write_all(trailer.as_bytes()).await?;
                if trailer == "\r\n" || trailer == "\n" {
                    return Ok(());
                }
            }
        }

        // Chunk data plus its trailing CRLF.
        let mut limited = tokio::io::AsyncReadExt::take(&mut *remote, size + 2);
        tokio::io::copy(&mut limited, client).await?;
    }
}
