//! TLS interception.
//!
//! The HTTPS port peeks the ClientHello for its SNI host without consuming
//! bytes, so the original handshake can replay against our minted
//! certificate. Clients without SNI are closed; there is no fallback
//! certificate to offer them. Once terminated, the decrypted stream runs the
//! same rewrite-and-forward loop as plain proxy traffic, dialing upstream
//! fresh for each session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tls_parser::{
    parse_tls_extensions, parse_tls_plaintext, SNIType, TlsExtension, TlsMessage,
    TlsMessageHandshake,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::proxy::handler::{
    forward_upstream, host_without_port, read_http_request, CONN_IDLE_TIMEOUT,
};
use crate::proxy::ProxyState;

const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Cert resolver ───────────────────────────────────────────────────

/// Always hands out the leaf minted for this connection's host.
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

impl std::fmt::Debug for FixedCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedCertResolver").finish()
    }
}

// ── SNI peek ────────────────────────────────────────────────────────

enum SniParse {
    Found(String),
    Absent,
    Incomplete,
    Invalid,
}

/// Peek the TLS ClientHello for its SNI host name. The bytes stay queued on
/// the socket for the later handshake. Returns `None` for connections that
/// are not a ClientHello or carry no SNI.
pub async fn peek_sni(stream: &TcpStream) -> io::Result<Option<String>> {
    let mut buf = vec![0u8; 4096];
    let mut last_len = 0;

    for _ in 0..8 {
        let n = match timeout(CLIENT_HELLO_TIMEOUT, stream.peek(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out reading ClientHello",
                ))
            }
        };
        if n == 0 {
            return Ok(None);
        }

        match parse_sni(&buf[..n]) {
            SniParse::Found(host) => return Ok(Some(host)),
            SniParse::Absent | SniParse::Invalid => return Ok(None),
            SniParse::Incomplete => {
                if n == buf.len() {
                    buf.resize(buf.len() * 4, 0);
                } else if n == last_len {
                    // No new bytes since the last peek; give the client a moment.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                last_len = n;
            }
        }
    }

    Ok(None)
}

fn parse_sni(buf: &[u8]) -> SniParse {
    let record = match parse_tls_plaintext(buf) {
        Ok((_, record)) => record,
        Err(tls_parser::nom::Err::Incomplete(_)) => return SniParse::Incomplete,
        Err(_) => return SniParse::Invalid,
    };

    let Some(TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello))) = record.msg.first()
    else {
        return SniParse::Invalid;
    };

    let Some(ext_data) = hello.ext else {
        return SniParse::Absent;
    };
    let Ok((_, extensions)) = parse_tls_extensions(ext_data) else {
        return SniParse::Invalid;
    };

    for ext in &extensions {
        if let TlsExtension::SNI(sni_list) = ext {
            for sni in sni_list.iter() {
                let (SNIType::HostName, data) = sni else {
                    continue;
                };
                if let Ok(host) = std::str::from_utf8(data) {
                    return SniParse::Found(host.to_owned());
                }
            }
        }
    }
    SniParse::Absent
}

// ── MITM session ────────────────────────────────────────────────────

/// Terminate TLS toward the client with a leaf minted for `host`, then run
/// the rewrite-and-forward request loop over the decrypted stream.
///
/// `send_ack` distinguishes a real CONNECT (the client waits for our
/// `200 Connection established`) from a connection synthesized off an SNI
/// peek, where the client already believes the transport is up and any
/// acknowledgement bytes would corrupt the TLS stream.
pub async fn serve_mitm<S>(stream: S, host: &str, port: u16, send_ack: bool, state: Arc<ProxyState>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream;

    let certified = match state.leaf_signer.certified_key_for(host) {
        Ok(certified) => certified,
        Err(e) => {
            warn!(host, error = %e, "cannot mint leaf certificate");
            return;
        }
    };

    if send_ack {
        if stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .is_err()
        {
            return;
        }
        let _ = stream.flush().await;
    }

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver(certified)));
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));
    let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            warn!(host, error = %e, "TLS handshake error");
            return;
        }
        Err(_) => {
            warn!(host, "TLS handshake timeout");
            return;
        }
    };

    debug!(host, "TLS interception established");

    // Fresh upstream client per intercepted session; no cross-session reuse.
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

    let bare_host = host_without_port(host).to_owned();
    let mut reader = BufReader::new(tls_stream);
    loop {
        let req = match timeout(CONN_IDLE_TIMEOUT, read_http_request(&mut reader)).await {
            Ok(Ok(req)) => req,
            Ok(Err(e)) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(host, error = %e, "read error on intercepted stream");
                }
                return;
            }
            Err(_) => {
                debug!(host, "idle timeout on intercepted stream");
                return;
            }
        };

        let url = if req.uri.starts_with("http://") || req.uri.starts_with("https://") {
            req.uri.clone()
        } else {
            format!("https://{host}:{port}{}", req.uri)
        };

        match forward_upstream(&mut reader, &req, &url, &bare_host, &client, &state).await {
            Ok(false) => {}
            _ => return,
        }
    }
}
