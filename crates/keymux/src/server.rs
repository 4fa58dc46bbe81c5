//! The frontend: TCP listener, connection screening, and dispatch.
//!
//! Every accepted connection is read up to its first request head, screened
//! by the defense system, and routed:
//!
//! CONNECT to the intercept host -> [`InterceptEngine`]
//! CONNECT elsewhere             -> opaque bidirectional tunnel
//! anything else                 -> plain HTTP forward with the same
//!                                  credential substitution discipline

use crate::audit::{self, ProxyMode};
use crate::authz::ClientAuthenticator;
use crate::ca::CertificateAuthority;
use crate::config::ProxyConfig;
use crate::defense::DefenseSystem;
use crate::dial::TunnelDialer;
use crate::error::{ProxyError, Result};
use crate::http1::{
    self, plain_text_response, reason_phrase, Headers, RequestHead, MAX_REQUEST_BODY,
};
use crate::intercept::InterceptEngine;
use crate::keys::KeyPool;
use crate::rewrite::RequestRewriter;
use crate::tls::build_client_connector;
use crate::token::TokenCodec;
use rustls::pki_types::ServerName;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Limit on waiting for a client's first request head.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Overall budget for one plain-HTTP forward.
const PLAIN_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Handle returned when the proxy starts.
///
/// Dropping the handle does not stop the server; call
/// [`ProxyHandle::shutdown`] to close the accept loop and the sweeper.
pub struct ProxyHandle {
    /// The bound listen address (useful with port 0).
    pub local_addr: SocketAddr,
    defense: Arc<DefenseSystem>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    /// Signal the accept loop and sweeper to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Runtime access to the defense system (domain block/unblock).
    #[must_use]
    pub fn defense(&self) -> &Arc<DefenseSystem> {
        &self.defense
    }
}

/// Shared state for the proxy server.
struct ProxyState {
    intercept_host: String,
    intercept: InterceptEngine,
    dialer: Arc<TunnelDialer>,
    rewriter: Arc<RequestRewriter>,
    defense: Arc<DefenseSystem>,
    /// Verified connector for plain-HTTP requests to https URLs.
    origin_connector: TlsConnector,
}

/// Start the proxy server.
///
/// Fails fast on the fatal misconfigurations: empty key pool, unusable CA
/// material, bad upstream proxy URL, or an unbindable listen address.
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle> {
    let pool = Arc::new(KeyPool::new(config.api_keys.clone())?);
    info!(keys = pool.len(), "loaded API key pool");

    // RSA generation on first run takes a moment; keep it off the reactor.
    let ca_dir = config.ca_dir.clone();
    let ca = tokio::task::spawn_blocking(move || CertificateAuthority::open(&ca_dir))
        .await
        .map_err(|e| ProxyError::Ca(format!("CA init task failed: {}", e)))??;
    let ca = Arc::new(ca);

    let codec = TokenCodec::new(&config.token_secret);
    let authenticator = ClientAuthenticator::from_config(&config.auth, codec)?;
    let rewriter = Arc::new(RequestRewriter::new(
        Arc::clone(&pool),
        authenticator,
        config.auth.key_source,
    ));

    let dialer = Arc::new(TunnelDialer::new(config.upstream_proxy.as_deref())?);
    if dialer.has_upstream() {
        info!(proxy = config.upstream_proxy.as_deref().unwrap_or(""), "egress via upstream proxy");
    }

    let origin_connector = build_client_connector(false)?;
    let intercept = InterceptEngine::new(
        Arc::clone(&ca),
        Arc::clone(&dialer),
        Arc::clone(&rewriter),
        origin_connector.clone(),
    );

    let defense = Arc::new(DefenseSystem::new(config.defense.clone()));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: config.listen_addr.to_string(),
            source: e,
        })?;
    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: config.listen_addr.to_string(),
        source: e,
    })?;
    info!(addr = %local_addr, intercept_host = %config.intercept_host, "proxy listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(ProxyState {
        intercept_host: config.intercept_host.to_ascii_lowercase(),
        intercept,
        dialer,
        rewriter,
        defense: Arc::clone(&defense),
        origin_connector,
    });

    tokio::spawn(Arc::clone(&defense).run_sweeper(shutdown_rx.clone()));
    tokio::spawn(accept_loop(listener, state, shutdown_rx));

    Ok(ProxyHandle {
        local_addr,
        defense,
        shutdown_tx,
    })
}

/// Accept connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, &state).await {
                                debug!(%peer, error = %e, "connection handler finished with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("proxy server shutting down");
                    return;
                }
            }
        }
    }
}

/// Read the first request head and dispatch by method.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &ProxyState,
) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let head = match tokio::time::timeout(READ_TIMEOUT, http1::read_request_head(&mut reader)).await
    {
        Err(_) => return Ok(()), // never sent a request
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(head))) => head,
        Ok(Err(ProxyError::HeadersTooLarge)) => {
            let response = plain_text_response("HTTP/1.1", 431, reason_phrase(431), "", true);
            reader.write_all(response.as_bytes()).await?;
            reader.flush().await?;
            return Ok(());
        }
        Ok(Err(e)) => {
            let response = plain_text_response("HTTP/1.1", 400, reason_phrase(400), "", true);
            reader.write_all(response.as_bytes()).await?;
            reader.flush().await?;
            return Err(e);
        }
    };

    let ip = client_ip(&head.headers, peer);

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(reader, head, ip, state).await
    } else {
        handle_plain(reader, head, ip, state).await
    }
}

/// CONNECT dispatch: intercept the configured host, tunnel everything else.
async fn handle_connect(
    mut reader: BufReader<TcpStream>,
    head: RequestHead,
    ip: IpAddr,
    state: &ProxyState,
) -> Result<()> {
    let (host, port) = parse_connect_target(&head.target)?;

    if let Err(denial) = state.defense.check_request(ip, &host) {
        if state.defense.should_log(ip, true) {
            audit::log_denied(ProxyMode::Tunnel, ip, &host, &denial.message());
        }
        let response = plain_text_response(
            "HTTP/1.1",
            denial.status(),
            reason_phrase(denial.status()),
            &denial.message(),
            true,
        );
        reader.write_all(response.as_bytes()).await?;
        reader.flush().await?;
        return Ok(());
    }

    // The client sends nothing after CONNECT until it sees our reply, so
    // nothing is buffered and the raw socket can be taken back.
    let stream = reader.into_inner();

    if host == state.intercept_host {
        audit::log_allowed(ProxyMode::Intercept, ip, &host, port);
        return state.intercept.handle(stream, ip, &host, port).await;
    }

    opaque_tunnel(stream, ip, &host, port, state).await
}

/// Dial the target and splice bytes both ways; no TLS termination and no
/// leaf certificate involved.
async fn opaque_tunnel(
    mut stream: TcpStream,
    ip: IpAddr,
    host: &str,
    port: u16,
    state: &ProxyState,
) -> Result<()> {
    let mut upstream = match state.dialer.dial(host, port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let status = upstream_status(&e);
            if state.defense.should_log(ip, true) {
                audit::log_denied(ProxyMode::Tunnel, ip, host, &e.to_string());
            }
            let response = plain_text_response(
                "HTTP/1.1",
                status,
                reason_phrase(status),
                &e.to_string(),
                true,
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
            return Err(e);
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;
    audit::log_allowed(ProxyMode::Tunnel, ip, host, port);

    let result = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    debug!(host, ?result, "tunnel closed");
    Ok(())
}

/// Forward a plain (absolute-form) HTTP request.
async fn handle_plain(
    mut reader: BufReader<TcpStream>,
    mut head: RequestHead,
    ip: IpAddr,
    state: &ProxyState,
) -> Result<()> {
    let target = match url::Url::parse(&head.target) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
        _ => {
            let response = plain_text_response(
                &head.version,
                400,
                reason_phrase(400),
                "proxy requests must use an absolute URL",
                true,
            );
            reader.write_all(response.as_bytes()).await?;
            reader.flush().await?;
            return Ok(());
        }
    };
    let host = target
        .host_str()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let port = target
        .port_or_known_default()
        .unwrap_or(80);

    if let Err(denial) = state.defense.check_request(ip, &host) {
        if state.defense.should_log(ip, true) {
            audit::log_denied(ProxyMode::Forward, ip, &host, &denial.message());
        }
        let response = plain_text_response(
            &head.version,
            denial.status(),
            reason_phrase(denial.status()),
            &denial.message(),
            true,
        );
        reader.write_all(response.as_bytes()).await?;
        reader.flush().await?;
        return Ok(());
    }

    // Same hop-by-hop hygiene as the intercept path.
    head.headers.remove("Proxy-Connection");
    head.headers.remove("Proxy-Authorization");
    head.headers.remove("Connection");
    head.headers.remove("Keep-Alive");

    if host == state.intercept_host {
        state.rewriter.substitute_credential(&mut head);
    }

    let framing = match http1::request_body_framing(&head) {
        Ok(framing) => framing,
        Err(_) => {
            let response =
                plain_text_response(&head.version, 400, reason_phrase(400), "", true);
            reader.write_all(response.as_bytes()).await?;
            reader.flush().await?;
            return Ok(());
        }
    };
    let body = match http1::read_body(&mut reader, framing, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(ProxyError::BodyTooLarge) => {
            let response =
                plain_text_response(&head.version, 413, reason_phrase(413), "", true);
            reader.write_all(response.as_bytes()).await?;
            reader.flush().await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    audit::log_allowed(ProxyMode::Forward, ip, &host, port);

    let forwarded = tokio::time::timeout(
        PLAIN_HTTP_TIMEOUT,
        forward_plain(&mut reader, head, &target, &host, port, body, state),
    )
    .await;

    match forwarded {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            let status = upstream_status(&e);
            if state.defense.should_log(ip, true) {
                audit::log_denied(ProxyMode::Forward, ip, &host, &e.to_string());
            }
            let response = plain_text_response(
                "HTTP/1.1",
                status,
                reason_phrase(status),
                &e.to_string(),
                true,
            );
            let _ = reader.write_all(response.as_bytes()).await;
            let _ = reader.flush().await;
            Err(e)
        }
        Err(_) => {
            // The exchange may have been mid-response; closing the
            // connection is the only safe signal left.
            warn!(host, "plain forward exceeded time budget");
            Ok(())
        }
    }
}

/// Send the rewritten request upstream and relay the response. The client
/// connection closes after one exchange on this path.
async fn forward_plain(
    client: &mut BufReader<TcpStream>,
    mut head: RequestHead,
    target: &url::Url,
    host: &str,
    port: u16,
    body: Vec<u8>,
    state: &ProxyState,
) -> Result<()> {
    let origin_form = match target.query() {
        Some(query) => format!("{}?{}", target.path(), query),
        None => target.path().to_string(),
    };

    head.headers.set("Host", host);
    head.headers.set("Connection", "close");
    if !body.is_empty()
        && head.headers.get("content-length").is_none()
        && head.headers.get("transfer-encoding").is_none()
    {
        head.headers.set("Content-Length", &body.len().to_string());
    }

    let method = head.method.clone();
    let response_head = if target.scheme() == "https" {
        // TLS to the origin ourselves; the upstream proxy, if any, only
        // sees the CONNECT tunnel.
        let tcp = state.dialer.dial(host, port).await?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Tls(format!("invalid server name: {}", host)))?;
        let tls = state
            .origin_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("origin TLS handshake: {}", e)))?;
        head.target = origin_form;
        exchange_plain(client, BufReader::new(tls), &head, &body, &method).await?
    } else {
        let (tcp, via_proxy) = state.dialer.dial_plain(host, port).await?;
        if via_proxy {
            // Absolute-form through the chained proxy.
            if let Some(auth) = state.dialer.proxy_auth() {
                head.headers.set("Proxy-Authorization", auth);
            }
        } else {
            head.target = origin_form;
        }
        exchange_plain(client, BufReader::new(tcp), &head, &body, &method).await?
    };

    debug!(host, status = response_head.status, "plain forward complete");
    Ok(())
}

/// Write request, stream the response back to the client, return its head.
async fn exchange_plain<S>(
    client: &mut BufReader<TcpStream>,
    mut upstream: BufReader<S>,
    head: &RequestHead,
    body: &[u8],
    method: &str,
) -> Result<http1::ResponseHead>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    upstream.write_all(head.encode().as_bytes()).await?;
    if !body.is_empty() {
        upstream.write_all(body).await?;
    }
    upstream.flush().await?;

    let mut response_head = http1::read_response_head(&mut upstream).await?;
    let framing = http1::response_body_framing(method, &response_head);
    response_head.headers.set("Connection", "close");

    // Response bytes are flowing from here on; a failure mid-relay tears
    // the connection down rather than synthesizing a status the client
    // would misread as body data.
    let relay = async {
        client.write_all(response_head.encode().as_bytes()).await?;
        client.flush().await?;
        http1::stream_body(&mut upstream, client, framing).await
    };
    if let Err(e) = relay.await {
        debug!(error = %e, "response relay aborted");
    }
    Ok(response_head)
}

/// Map an upstream failure to the status the client sees.
fn upstream_status(err: &ProxyError) -> u16 {
    match err {
        ProxyError::UpstreamConnect { reason, .. } => {
            if reason.contains("timed out") {
                504
            } else if reason.contains("refused") {
                502
            } else {
                503
            }
        }
        ProxyError::UpstreamProxy(_) => 502,
        _ => 503,
    }
}

/// `host:port` from a CONNECT target; port defaults to 443.
fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port_text)) if !host.is_empty() => {
            let port = port_text.parse::<u16>().map_err(|_| {
                ProxyError::HttpParse(format!("invalid CONNECT port: {}", target))
            })?;
            (host, port)
        }
        _ => (target, 443u16),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::HttpParse(format!(
            "empty CONNECT host: {}",
            target
        )));
    }
    Ok((host.to_ascii_lowercase(), port))
}

/// Real client address: trust X-Real-IP, then the first X-Forwarded-For
/// entry, then the socket peer.
fn client_ip(headers: &Headers, peer: SocketAddr) -> IpAddr {
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.trim().parse().ok())
    {
        return ip;
    }
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
    {
        return ip;
    }
    peer.ip()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::DefenseConfig;
    use tokio::io::{AsyncReadExt, BufReader as TokioBufReader};

    fn test_config(ca_dir: &std::path::Path) -> ProxyConfig {
        ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            api_keys: vec!["K1".to_string(), "K2".to_string()],
            ca_dir: ca_dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_connect_target() {
        assert_eq!(
            parse_connect_target("origin.example:443").unwrap(),
            ("origin.example".to_string(), 443)
        );
        assert_eq!(
            parse_connect_target("internal:8443").unwrap(),
            ("internal".to_string(), 8443)
        );
        assert_eq!(
            parse_connect_target("origin.example").unwrap(),
            ("origin.example".to_string(), 443)
        );
        assert_eq!(
            parse_connect_target("UPPER.example:443").unwrap().0,
            "upper.example"
        );
        assert!(parse_connect_target(":443").is_err());
    }

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        let mut headers = Headers::new();
        assert_eq!(client_ip(&headers, peer), "10.0.0.1".parse::<IpAddr>().unwrap());

        headers.set("X-Forwarded-For", "1.2.3.4, 5.6.7.8");
        assert_eq!(client_ip(&headers, peer), "1.2.3.4".parse::<IpAddr>().unwrap());

        headers.set("X-Real-IP", "9.9.9.9");
        assert_eq!(client_ip(&headers, peer), "9.9.9.9".parse::<IpAddr>().unwrap());

        // Garbage headers fall back to the socket address.
        let mut headers = Headers::new();
        headers.set("X-Real-IP", "not-an-ip");
        assert_eq!(client_ip(&headers, peer), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_upstream_status_mapping() {
        let refused = ProxyError::UpstreamConnect {
            host: "h".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(upstream_status(&refused), 502);
        let timeout = ProxyError::UpstreamConnect {
            host: "h".into(),
            reason: "connection timed out".into(),
        };
        assert_eq!(upstream_status(&timeout), 504);
        let other = ProxyError::UpstreamConnect {
            host: "h".into(),
            reason: "no route to host".into(),
        };
        assert_eq!(upstream_status(&other), 503);
        assert_eq!(upstream_status(&ProxyError::UpstreamProxy("x".into())), 502);
    }

    #[tokio::test]
    async fn test_start_requires_key_pool() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ca_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(matches!(
            start(config).await,
            Err(ProxyError::EmptyKeyPool)
        ));
    }

    #[tokio::test]
    async fn test_starts_binds_and_shuts_down() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = start(test_config(dir.path())).await.unwrap();
        assert!(handle.local_addr.port() > 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_headers_get_431() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = start(test_config(dir.path())).await.unwrap();

        let mut conn = TcpStream::connect(handle.local_addr).await.unwrap();
        conn.write_all(b"GET http://example.com/ HTTP/1.1\r\n").await.unwrap();
        conn.write_all(format!("X-Big: {}\r\n\r\n", "a".repeat(http1::MAX_HEADER_SIZE)).as_bytes())
            .await
            .unwrap();

        let mut response = String::new();
        let mut reader = TokioBufReader::new(conn);
        tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut response)
            .await
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 431"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_blocked_domain_connect_denied_403() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = start(test_config(dir.path())).await.unwrap();

        let mut conn = TcpStream::connect(handle.local_addr).await.unwrap();
        conn.write_all(b"CONNECT hksjz.net:443 HTTP/1.1\r\nHost: hksjz.net:443\r\n\r\n")
            .await
            .unwrap();

        let mut reader = TokioBufReader::new(conn);
        let head = http1::read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 403);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_rate_limit_denies_with_429() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.defense = DefenseConfig {
            max_requests_per_window: 1,
            rate_limit_window: 600,
            ..Default::default()
        };
        let handle = start(config).await.unwrap();

        // Target for the allowed CONNECT.
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = target.accept().await;
        });

        let mut first = TcpStream::connect(handle.local_addr).await.unwrap();
        first
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", target_port).as_bytes())
            .await
            .unwrap();
        let mut reader = TokioBufReader::new(first);
        let head = http1::read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 200);
        drop(reader);

        let mut second = TcpStream::connect(handle.local_addr).await.unwrap();
        second
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", target_port).as_bytes())
            .await
            .unwrap();
        let mut reader = TokioBufReader::new(second);
        let head = http1::read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 429);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_opaque_tunnel_relays_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = start(test_config(dir.path())).await.unwrap();

        // Echo server standing in for a non-intercepted origin.
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = TcpStream::connect(handle.local_addr).await.unwrap();
        conn.write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo_port).as_bytes())
            .await
            .unwrap();
        let mut reader = TokioBufReader::new(conn);
        let head = http1::read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 200);

        // Opaque bytes through the established tunnel.
        reader.write_all(b"hello").await.unwrap();
        reader.flush().await.unwrap();
        let mut echoed = [0u8; 5];
        reader.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_plain_forward_substitutes_key_for_intercept_host() {
        // Stub origin speaking plain HTTP.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        let origin_task = tokio::spawn(async move {
            let (conn, _) = origin.accept().await.unwrap();
            let mut reader = TokioBufReader::new(conn);
            let head = http1::read_request_head(&mut reader).await.unwrap().unwrap();
            reader
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            reader.flush().await.unwrap();
            head
        });

        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.intercept_host = "127.0.0.1".to_string();
        let handle = start(config).await.unwrap();

        let mut conn = TcpStream::connect(handle.local_addr).await.unwrap();
        conn.write_all(
            format!(
                "GET http://127.0.0.1:{}/v1/models HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nx-goog-api-key: CLIENT_RAW\r\n\r\n",
                origin_port, origin_port
            )
            .as_bytes(),
        )
        .await
        .unwrap();

        let mut reader = TokioBufReader::new(conn);
        let head = http1::read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, 200);
        let mut body = [0u8; 2];
        reader.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"ok");

        let seen = origin_task.await.unwrap();
        assert_eq!(seen.target, "/v1/models");
        assert_eq!(seen.headers.get("x-goog-api-key"), Some("K1"));
        assert_eq!(seen.headers.get("Connection"), Some("close"));
        handle.shutdown();
    }
}
