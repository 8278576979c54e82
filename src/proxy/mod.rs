//! Secret egress proxy engine.
//!
//! Binds an HTTP port (explicit proxy requests and CONNECTs) and an HTTPS
//! port (transparent TLS, SNI-peeked). Every TLS destination is intercepted
//! with a certificate minted from the tenant CA; every intercepted request
//! has its headers run through the placeholder rewriter before forwarding.
//! One task per accepted connection; the two caches are the only shared
//! state on the request path.

pub mod bypass;
pub mod ca;
pub mod connect;
pub mod handler;
pub mod inject;
pub mod secrets;
pub mod tls;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ProxyError;
use crate::store::SecretStore;
use ca::{CertificateCache, LeafSigner};
use inject::HeaderRewriter;
use secrets::SecretsCache;

/// Shared state for the engine, read by every connection handler.
pub struct ProxyState {
    pub team_id: String,
    pub sandbox_id: String,
    pub secrets: SecretsCache,
    pub rewriter: HeaderRewriter,
    pub leaf_signer: LeafSigner,
}

pub struct SecretProxy {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    stop: watch::Sender<bool>,
    http_task: JoinHandle<()>,
    https_task: JoinHandle<()>,
}

impl SecretProxy {
    /// Fetch the tenant CA (generating it on first use), bind both ports,
    /// and start the listener loops.
    pub async fn start(cfg: &Config, store: Arc<dyn SecretStore>) -> Result<Self, ProxyError> {
        ensure_crypto_provider();

        let certs = CertificateCache::new(Arc::clone(&store));
        let tenant_ca = certs.get_certificate(&cfg.team_id).await?;
        let leaf_signer = LeafSigner::from_pem(&tenant_ca)?;

        let state = Arc::new(ProxyState {
            team_id: cfg.team_id.clone(),
            sandbox_id: cfg.sandbox_id.clone(),
            secrets: SecretsCache::new(store),
            rewriter: HeaderRewriter::new(),
            leaf_signer,
        });

        let http_listener = TcpListener::bind(("0.0.0.0", cfg.http_port)).await?;
        let https_listener = TcpListener::bind(("0.0.0.0", cfg.https_port)).await?;
        let http_addr = http_listener.local_addr()?;
        let https_addr = https_listener.local_addr()?;

        info!(
            http = %http_addr,
            https = %https_addr,
            team = %cfg.team_id,
            sandbox = %cfg.sandbox_id,
            "secret egress proxy listening"
        );

        let (stop, stop_rx) = watch::channel(false);
        let grace = Duration::from_secs(cfg.shutdown_grace_secs);

        let http_task = spawn_accept_loop(http_listener, stop_rx.clone(), grace, {
            let state = Arc::clone(&state);
            move |stream, peer| handler::handle_connection(stream, peer, Arc::clone(&state))
        });
        let https_task = spawn_accept_loop(https_listener, stop_rx, grace, {
            let state = Arc::clone(&state);
            move |stream, peer| handle_tls_connection(stream, peer, Arc::clone(&state))
        });

        Ok(Self {
            http_addr,
            https_addr,
            stop,
            http_task,
            https_task,
        })
    }

    /// Stop accepting, drain in-flight connections (each loop aborts its
    /// stragglers after the configured grace), and give up waiting at
    /// `deadline`.
    pub async fn close(self, deadline: Duration) {
        let SecretProxy {
            stop,
            http_task,
            https_task,
            ..
        } = self;
        let _ = stop.send(true);
        let drain = async move {
            let _ = http_task.await;
            let _ = https_task.await;
        };
        if timeout(deadline, drain).await.is_err() {
            warn!("timeout waiting for proxy listeners to stop");
        }
    }
}

/// One accepted connection on the HTTPS port: peek the SNI and run TLS
/// interception against that host. Clients without SNI are unsupported and
/// closed.
async fn handle_tls_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ProxyState>) {
    if let Err(e) = try_handle_tls(stream, peer, state).await {
        warn!(peer = %peer, error = %e, "dropping https connection");
    }
}

async fn try_handle_tls(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ProxyState>,
) -> Result<(), ProxyError> {
    let host = tls::peek_sni(&stream)
        .await?
        .ok_or_else(|| ProxyError::Protocol("cannot support non-SNI clients".into()))?;

    debug!(peer = %peer, host = %host, "intercepting TLS connection");
    tls::serve_mitm(stream, &host, 443, false, state).await;
    Ok(())
}

/// Accept loop shared by the interception and bypass engines: one spawned
/// task per connection, stop signal observed between accepts, graceful drain
/// with a forced abort once the grace elapses.
pub(crate) fn spawn_accept_loop<F, Fut>(
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut conns: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        conns.spawn(handler(stream, peer));
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                },
            }
        }
        drop(listener);

        let drained = timeout(grace, async {
            while conns.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace elapsed, aborting remaining connections");
            conns.abort_all();
            while conns.join_next().await.is_some() {}
        }
    })
}

/// rustls needs one process-wide crypto provider; pick aws-lc-rs before any
/// TLS config is built.
pub(crate) fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

#[cfg(test)]
impl ProxyState {
    /// Full engine state over an in-memory store, CA generated on the spot.
    pub(crate) async fn for_tests(
        team: &str,
        sandbox: &str,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        ensure_crypto_provider();
        let certs = CertificateCache::new(Arc::clone(&store));
        let tenant_ca = certs.get_certificate(team).await.unwrap();
        ProxyState {
            team_id: team.to_owned(),
            sandbox_id: sandbox.to_owned(),
            secrets: SecretsCache::new(store),
            rewriter: HeaderRewriter::new(),
            leaf_signer: LeafSigner::from_pem(&tenant_ca).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{hosts_metadata, MemoryStore, SecretStore};
    use rustls::pki_types::{CertificateDer, ServerName};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    const ID: &str = "11111111-1111-4111-8111-111111111111";

    fn test_config() -> Config {
        Config {
            http_port: 0,
            https_port: 0,
            team_id: "team".into(),
            sandbox_id: "sbx-1".into(),
            shutdown_grace_secs: 1,
            ..Config::default()
        }
    }

    /// One-shot upstream: captures the request head it receives and answers
    /// with a small fixed response.
    async fn spawn_upstream() -> (u16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut total = 0;
            while !String::from_utf8_lossy(&buf[..total]).contains("\r\n\r\n") {
                let n = conn.read(&mut buf[total..]).await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            let _ = tx.send(String::from_utf8_lossy(&buf[..total]).into_owned());
            conn.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });
        (port, rx)
    }

    async fn seeded_store(patterns: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .put(&format!("team/{ID}"), "SK-ABC", Some(hosts_metadata(patterns)))
            .await
            .unwrap();
        store
    }

    fn client_config_trusting(ca_pem: &str) -> rustls::ClientConfig {
        let (_, pem) = x509_parser::pem::parse_x509_pem(ca_pem.as_bytes()).unwrap();
        let mut roots = rustls::RootCertStore::empty();
        roots.add(CertificateDer::from(pem.contents)).unwrap();
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }

    #[tokio::test]
    async fn substitutes_secret_for_allowed_host() {
        let store = seeded_store(&["127.0.0.*"]).await;
        let proxy = SecretProxy::start(&test_config(), store).await.unwrap();
        let (upstream_port, seen) = spawn_upstream().await;

        let mut client = TcpStream::connect(("127.0.0.1", proxy.http_addr.port()))
            .await
            .unwrap();
        client
            .write_all(
                format!(
                    "GET http://127.0.0.1:{upstream_port}/x HTTP/1.1\r\n\
                     Host: 127.0.0.1:{upstream_port}\r\n\
                     Authorization: Bearer e2b_{ID}\r\n\
                     X-E2B-Team: spoofed\r\n\
                     Connection: close\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok"));

        let upstream_saw = seen.await.unwrap().to_ascii_lowercase();
        assert!(upstream_saw.contains("authorization: bearer sk-abc"));
        assert!(upstream_saw.contains("x-e2b-team: team"));
        assert!(upstream_saw.contains("x-e2b-sandbox: sbx-1"));
        assert!(!upstream_saw.contains("spoofed"));
        assert!(!upstream_saw.contains("e2b_1111"));

        proxy.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn disallowed_host_receives_placeholder_verbatim() {
        let store = seeded_store(&["*.example.com"]).await;
        let proxy = SecretProxy::start(&test_config(), store).await.unwrap();
        let (upstream_port, seen) = spawn_upstream().await;

        let mut client = TcpStream::connect(("127.0.0.1", proxy.http_addr.port()))
            .await
            .unwrap();
        client
            .write_all(
                format!(
                    "GET http://127.0.0.1:{upstream_port}/x HTTP/1.1\r\n\
                     Host: 127.0.0.1:{upstream_port}\r\n\
                     Authorization: Bearer e2b_{ID}\r\n\
                     Connection: close\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let upstream_saw = seen.await.unwrap().to_ascii_lowercase();
        assert!(
            upstream_saw.contains(&format!("authorization: bearer e2b_{ID}")),
            "placeholder must survive unchanged, got: {upstream_saw}"
        );

        proxy.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn origin_form_request_falls_back_to_host_header() {
        let store = seeded_store(&["*"]).await;
        let proxy = SecretProxy::start(&test_config(), store).await.unwrap();
        let (upstream_port, seen) = spawn_upstream().await;

        let mut client = TcpStream::connect(("127.0.0.1", proxy.http_addr.port()))
            .await
            .unwrap();
        client
            .write_all(
                format!(
                    "GET /direct HTTP/1.1\r\n\
                     Host: 127.0.0.1:{upstream_port}\r\n\
                     Connection: close\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK"));

        let upstream_saw = seen.await.unwrap();
        assert!(upstream_saw.starts_with("GET /direct HTTP/1.1"));

        proxy.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn https_port_mints_trusted_leaf_without_ack_bytes() {
        let store = seeded_store(&["*"]).await;
        let proxy = SecretProxy::start(&test_config(), Arc::clone(&store) as Arc<dyn SecretStore>)
            .await
            .unwrap();

        let ca_pem = store.get("team/cert").await.unwrap().value;
        let connector =
            tokio_rustls::TlsConnector::from(Arc::new(client_config_trusting(&ca_pem)));

        let stream = TcpStream::connect(("127.0.0.1", proxy.https_addr.port()))
            .await
            .unwrap();
        let server_name = ServerName::try_from("example.com").unwrap();

        // The handshake only succeeds if no CONNECT acknowledgement bytes
        // preceded the ServerHello and the minted chain verifies against
        // the tenant CA for this exact name.
        let tls = timeout(
            Duration::from_secs(5),
            connector.connect(server_name, stream),
        )
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
        drop(tls);

        proxy.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn connect_acknowledges_then_terminates_tls() {
        let store = seeded_store(&["*"]).await;
        let proxy = SecretProxy::start(&test_config(), Arc::clone(&store) as Arc<dyn SecretStore>)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", proxy.http_addr.port()))
            .await
            .unwrap();
        stream
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        // Read the CONNECT acknowledgement exactly up to its blank line.
        let mut ack = Vec::new();
        let mut byte = [0u8; 1];
        while !ack.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "connection closed before acknowledgement");
            ack.push(byte[0]);
        }
        assert!(String::from_utf8_lossy(&ack).starts_with("HTTP/1.1 200 Connection established"));

        // TLS handshake over the tunnel against the minted certificate.
        let ca_pem = store.get("team/cert").await.unwrap().value;
        let connector =
            tokio_rustls::TlsConnector::from(Arc::new(client_config_trusting(&ca_pem)));
        let server_name = ServerName::try_from("example.com").unwrap();
        let tls = timeout(
            Duration::from_secs(5),
            connector.connect(server_name, stream),
        )
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
        drop(tls);

        proxy.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn close_returns_within_deadline_with_live_connection() {
        let store = seeded_store(&["*"]).await;
        let proxy = SecretProxy::start(&test_config(), store).await.unwrap();
        let http_addr = proxy.http_addr;

        // An idle connection that never sends a request.
        let idle = TcpStream::connect(("127.0.0.1", http_addr.port()))
            .await
            .unwrap();

        let started = Instant::now();
        proxy.close(Duration::from_secs(3)).await;
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "close exceeded its deadline"
        );
        drop(idle);

        // Listeners are gone: new connections are refused.
        assert!(
            TcpStream::connect(("127.0.0.1", http_addr.port())).await.is_err(),
            "listener still accepting after close"
        );
    }
}
