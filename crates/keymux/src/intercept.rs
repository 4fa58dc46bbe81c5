//! TLS interception for CONNECT requests to the configured origin.
//!
//! The engine owns the hijacked client socket from the moment the frontend
//! dispatches it. Nothing is written until the leaf certificate is ready;
//! then the exact `200 Connection established` bytes go out, the client
//! socket is TLS-terminated as the origin, a TLS session is opened to the
//! real origin, and a keep-alive exchange loop carries rewritten requests
//! forward and streams responses back.
//!
//! Session lifecycle:
//!
//! ```text
//! accepted -> 200 sent -> client handshake -> origin dial -> origin
//! handshake -> exchange loop -> closed
//! ```
//!
//! Failure in any state tears down the single session; other connections
//! are unaffected.

use crate::audit;
use crate::ca::CertificateAuthority;
use crate::dial::TunnelDialer;
use crate::error::{ProxyError, Result};
use crate::http1::{
    self, plain_text_response, reason_phrase, BodyFraming, MAX_REQUEST_BODY,
};
use crate::rewrite::{RequestRewriter, Rewrite};
use rustls::pki_types::ServerName;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// TLS handshake timeout, both sides.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle limit while waiting for the next request on a keep-alive session.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Drives intercepted sessions for the one configured origin host.
pub struct InterceptEngine {
    ca: Arc<CertificateAuthority>,
    dialer: Arc<TunnelDialer>,
    rewriter: Arc<RequestRewriter>,
    connector: TlsConnector,
}

impl InterceptEngine {
    #[must_use]
    pub fn new(
        ca: Arc<CertificateAuthority>,
        dialer: Arc<TunnelDialer>,
        rewriter: Arc<RequestRewriter>,
        connector: TlsConnector,
    ) -> Self {
        Self {
            ca,
            dialer,
            rewriter,
            connector,
        }
    }

    /// Run one intercepted session over a hijacked client socket.
    pub async fn handle(
        &self,
        mut stream: TcpStream,
        client_ip: IpAddr,
        host: &str,
        port: u16,
    ) -> Result<()> {
        // Leaf first: the client must not see 200 until the proxy can
        // actually impersonate the origin.
        let server_config = self.ca.server_config_for(host)?;

        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        stream.flush().await?;

        let acceptor = TlsAcceptor::from(server_config);
        let client_tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
            .await
            .map_err(|_| ProxyError::Tls("client TLS handshake timed out".to_string()))?
            .map_err(|e| ProxyError::Tls(format!("client TLS handshake: {}", e)))?;
        debug!(host, "client TLS session established");

        let origin_tcp = self.dialer.dial(host, port).await?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Tls(format!("invalid origin server name: {}", host)))?;
        let origin_tls = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.connector.connect(server_name, origin_tcp),
        )
        .await
        .map_err(|_| ProxyError::Tls("origin TLS handshake timed out".to_string()))?
        .map_err(|e| ProxyError::Tls(format!("origin TLS handshake: {}", e)))?;
        debug!(host, "origin TLS session established");

        let result = self
            .exchange_loop(client_tls, origin_tls, client_ip, host)
            .await;
        debug!(host, "intercepted session closed");
        result
    }

    /// Keep-alive request/response loop over the two TLS sessions.
    async fn exchange_loop<C, O>(
        &self,
        client: C,
        origin: O,
        client_ip: IpAddr,
        host: &str,
    ) -> Result<()>
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
        O: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let mut client = BufReader::new(client);
        let mut origin = BufReader::new(origin);

        loop {
            let mut head = match tokio::time::timeout(
                IDLE_TIMEOUT,
                http1::read_request_head(&mut client),
            )
            .await
            {
                Err(_) => {
                    debug!(host, "idle session timed out");
                    return Ok(());
                }
                Ok(Ok(None)) => return Ok(()), // client finished
                Ok(Ok(Some(head))) => head,
                // Clients that drop the socket without a TLS close_notify
                // are treated the same as a clean goodbye.
                Ok(Err(ProxyError::Io(e)))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(())
                }
                Ok(Err(ProxyError::HeadersTooLarge)) => {
                    let response =
                        plain_text_response("HTTP/1.1", 431, reason_phrase(431), "", true);
                    client.write_all(response.as_bytes()).await?;
                    client.flush().await?;
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
            };

            let method = head.method.clone();
            let path = head.target.split('?').next().unwrap_or("/").to_string();
            let version = head.version.clone();
            let client_wants_close = head.headers.wants_close();

            // Consume the body before deciding anything so a rejected
            // request leaves the session parseable.
            let body = match http1::request_body_framing(&head) {
                Ok(framing) => {
                    match http1::read_body(&mut client, framing, MAX_REQUEST_BODY).await {
                        Ok(body) => body,
                        Err(ProxyError::BodyTooLarge) => {
                            let response =
                                plain_text_response(&version, 413, reason_phrase(413), "", true);
                            client.write_all(response.as_bytes()).await?;
                            client.flush().await?;
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    warn!(host, error = %e, "unparseable request body framing");
                    let response =
                        plain_text_response(&version, 400, reason_phrase(400), "", true);
                    client.write_all(response.as_bytes()).await?;
                    client.flush().await?;
                    return Ok(());
                }
            };

            match self.rewriter.rewrite(&mut head, host).await {
                Rewrite::Reject { status, message } => {
                    // Synthesized locally; the origin never sees the request.
                    let response = plain_text_response(
                        &version,
                        status,
                        reason_phrase(status),
                        &message,
                        false,
                    );
                    client.write_all(response.as_bytes()).await?;
                    client.flush().await?;
                    audit::log_exchange(client_ip, host, &method, &path, status);
                    if client_wants_close {
                        return Ok(());
                    }
                    continue;
                }
                Rewrite::Forward => {}
            }

            // Forward to the origin over the pre-built TLS session.
            let forwarded = async {
                origin.write_all(head.encode().as_bytes()).await?;
                if !body.is_empty() {
                    origin.write_all(&body).await?;
                }
                origin.flush().await?;
                http1::read_response_head(&mut origin).await
            }
            .await;

            let response_head = match forwarded {
                Ok(head) => head,
                Err(e) => {
                    // Nothing of the response reached the client yet, so a
                    // clean 502 is still possible.
                    warn!(host, error = %e, "origin exchange failed");
                    let response =
                        plain_text_response(&version, 502, reason_phrase(502), "Bad Gateway", true);
                    client.write_all(response.as_bytes()).await?;
                    client.flush().await?;
                    return Err(e);
                }
            };

            let framing = http1::response_body_framing(&method, &response_head);
            let origin_wants_close = response_head.headers.wants_close();

            client
                .write_all(response_head.encode().as_bytes())
                .await?;
            client.flush().await?;
            // Headers are out; from here a failure can only drop the
            // connection, never a synthesized status.
            http1::stream_body(&mut origin, &mut client, framing).await?;

            audit::log_exchange(client_ip, host, &method, &path, response_head.status);

            if client_wants_close || origin_wants_close || framing == BodyFraming::ToEof {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::authz::ClientAuthenticator;
    use crate::config::{AuthConfig, KeySource};
    use crate::keys::KeyPool;
    use crate::tls::build_client_connector;
    use crate::token::TokenCodec;
    use rustls::RootCertStore;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// TLS origin stub: answers each parsed request with the next canned
    /// response and records the request heads it saw.
    async fn origin_stub(
        responses: Vec<String>,
    ) -> (u16, Arc<Mutex<Vec<String>>>, tokio::task::JoinHandle<()>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            rustls::pki_types::PrivatePkcs8KeyDer::from(key.serialized_der().to_vec()).into(),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_writer = Arc::clone(&seen);

        let handle = tokio::spawn(async move {
            let acceptor = TlsAcceptor::from(Arc::new(server_config));
            let (tcp, _) = listener.accept().await.unwrap();
            let tls = acceptor.accept(tcp).await.unwrap();
            let mut stream = BufReader::new(tls);
            for response in responses {
                let head = match http1::read_request_head(&mut stream).await {
                    Ok(Some(head)) => head,
                    _ => return,
                };
                let framing = http1::request_body_framing(&head).unwrap();
                let _ = http1::read_body(&mut stream, framing, MAX_REQUEST_BODY)
                    .await
                    .unwrap();
                seen_writer.lock().unwrap().push(head.encode());
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.flush().await.unwrap();
            }
        });

        (port, seen, handle)
    }

    fn engine(
        keys: &[&str],
        authenticator: ClientAuthenticator,
    ) -> (InterceptEngine, Arc<CertificateAuthority>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let ca = Arc::new(CertificateAuthority::open(dir.path()).unwrap());
        let pool = Arc::new(KeyPool::new(keys.iter().map(|k| k.to_string()).collect()).unwrap());
        let rewriter = Arc::new(RequestRewriter::new(pool, authenticator, KeySource::Header));
        let dialer = Arc::new(TunnelDialer::new(None).unwrap());
        // The stub origin is self-signed, so the test connector skips
        // verification; production wires the verified connector in.
        let connector = build_client_connector(true).unwrap();
        (
            InterceptEngine::new(Arc::clone(&ca), dialer, rewriter, connector),
            ca,
            dir,
        )
    }

    /// Open the client side: read the 200, then TLS-handshake as a client
    /// that trusts the engine's root CA.
    async fn client_session(
        proxy_port: u16,
        ca: &CertificateAuthority,
    ) -> BufReader<tokio_rustls::client::TlsStream<TcpStream>> {
        let mut tcp = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();

        let mut established = Vec::new();
        let mut one = [0u8; 1];
        while !established.ends_with(b"\r\n\r\n") {
            tcp.read_exact(&mut one).await.unwrap();
            established.push(one[0]);
        }
        assert!(established.starts_with(b"HTTP/1.1 200 Connection established"));

        let mut roots = RootCertStore::empty();
        for der in rustls_pemfile::certs(&mut ca.root_certificate_pem().as_bytes()) {
            roots.add(der.unwrap()).unwrap();
        }
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let tls = connector
            .connect(ServerName::try_from("127.0.0.1").unwrap(), tcp)
            .await
            .unwrap();
        BufReader::new(tls)
    }

    fn test_ip() -> IpAddr {
        "9.9.9.9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_intercept_rewrites_and_rotates_keys() {
        let (origin_port, seen, origin) = origin_stub(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfirst".to_string(),
            "HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecond".to_string(),
        ])
        .await;

        let (engine, ca, _ca_dir) = engine(&["K1", "K2"], ClientAuthenticator::AllowAll);
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = proxy.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (accepted, _) = proxy.accept().await.unwrap();
            engine
                .handle(accepted, test_ip(), "127.0.0.1", origin_port)
                .await
        });

        let mut session = client_session(proxy_port, &ca).await;

        // Two keep-alive requests on one TLS session.
        for (body, expected) in [("first", 5), ("second", 6)] {
            session
                .write_all(
                    b"GET /v1/models HTTP/1.1\r\nHost: intercepted\r\nx-goog-api-key: CLIENT_RAW\r\n\r\n",
                )
                .await
                .unwrap();
            session.flush().await.unwrap();

            let head = http1::read_response_head(&mut session).await.unwrap();
            assert_eq!(head.status, 200);
            let mut payload = vec![0u8; expected];
            session.read_exact(&mut payload).await.unwrap();
            assert_eq!(payload, body.as_bytes());
        }
        session.shutdown().await.unwrap();
        drop(session);

        server.await.unwrap().unwrap();
        origin.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("x-goog-api-key: K1\r\n"));
        assert!(seen[1].contains("x-goog-api-key: K2\r\n"));
        // The client's own value never reached the origin.
        assert!(!seen[0].contains("CLIENT_RAW"));
    }

    #[tokio::test]
    async fn test_intercept_streams_chunked_responses() {
        let chunked =
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\ndata:\r\n2\r\nok\r\n0\r\n\r\n";
        let (origin_port, _seen, origin) = origin_stub(vec![chunked.to_string()]).await;

        let (engine, ca, _ca_dir) = engine(&["K1"], ClientAuthenticator::AllowAll);
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = proxy.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (accepted, _) = proxy.accept().await.unwrap();
            engine
                .handle(accepted, test_ip(), "127.0.0.1", origin_port)
                .await
        });

        let mut session = client_session(proxy_port, &ca).await;
        session
            .write_all(b"GET /stream HTTP/1.1\r\nHost: intercepted\r\n\r\n")
            .await
            .unwrap();
        session.flush().await.unwrap();

        let head = http1::read_response_head(&mut session).await.unwrap();
        assert_eq!(head.status, 200);
        let body = http1::read_body(&mut session, BodyFraming::Chunked, 1024)
            .await
            .unwrap();
        // Byte-for-byte copy of what the origin framed.
        assert_eq!(body, b"5\r\ndata:\r\n2\r\nok\r\n0\r\n\r\n");

        session.shutdown().await.unwrap();
        drop(session);
        server.await.unwrap().unwrap();
        origin.await.unwrap();
    }

    #[tokio::test]
    async fn test_intercept_rejection_never_reaches_origin() {
        // Authorizer stub refusing with 404 and a JSON message.
        let authorizer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let auth_url = format!("http://{}/validate", authorizer.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let (conn, _) = match authorizer.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let mut stream = BufReader::new(conn);
                let head = match http1::read_request_head(&mut stream).await {
                    Ok(Some(head)) => head,
                    _ => continue,
                };
                let framing = http1::request_body_framing(&head).unwrap();
                let _ = http1::read_body(&mut stream, framing, MAX_REQUEST_BODY).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 404 Not Found\r\nContent-Length: 23\r\n\r\n{\"message\":\"not found\"}",
                    )
                    .await;
                let _ = stream.flush().await;
                let _ = stream.shutdown().await;
            }
        });

        let auth_config = AuthConfig {
            api_url: Some(auth_url),
            shared_secret: Some("shared".to_string()),
            ..Default::default()
        };
        let authenticator =
            ClientAuthenticator::from_config(&auth_config, TokenCodec::new("s")).unwrap();

        let (origin_port, seen, _origin) =
            origin_stub(vec!["HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_string()]).await;
        let (engine, ca, _ca_dir) = engine(&["K1"], authenticator);

        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = proxy.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (accepted, _) = proxy.accept().await.unwrap();
            engine
                .handle(accepted, test_ip(), "127.0.0.1", origin_port)
                .await
        });

        let mut session = client_session(proxy_port, &ca).await;
        session
            .write_all(b"GET /v1/models HTTP/1.1\r\nHost: i\r\nx-goog-api-key: BAD\r\n\r\n")
            .await
            .unwrap();
        session.flush().await.unwrap();

        let head = http1::read_response_head(&mut session).await.unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(
            head.headers.get("content-type"),
            Some("text/plain; charset=utf-8")
        );
        let mut body = vec![0u8; 9];
        session.read_exact(&mut body).await.unwrap();
        assert_eq!(body, b"not found");

        session.shutdown().await.unwrap();
        drop(session);
        server.await.unwrap().unwrap();
        // The origin saw the TLS connection but never a request.
        assert!(seen.lock().unwrap().is_empty());
    }
}
