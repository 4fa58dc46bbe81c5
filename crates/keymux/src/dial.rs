//! Origin dialing, direct or through an upstream HTTP CONNECT proxy.
//!
//! The dialer only produces raw TCP sockets; TLS is the caller's business.

use crate::error::{ProxyError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP connect timeout, also covering the upstream CONNECT exchange.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct UpstreamProxy {
    /// `host:port` of the proxy itself
    address: String,
    /// `Proxy-Authorization` value when the proxy URL carries userinfo
    basic_auth: Option<String>,
}

/// Dials targets directly or chains through a configured upstream proxy.
pub struct TunnelDialer {
    upstream: Option<UpstreamProxy>,
}

impl TunnelDialer {
    /// Parse the optional upstream proxy URL once at startup.
    pub fn new(upstream_url: Option<&str>) -> Result<Self> {
        let upstream = match upstream_url {
            None => None,
            Some(raw) => {
                let parsed = url::Url::parse(raw).map_err(|e| {
                    ProxyError::Config(format!("invalid upstream proxy URL '{}': {}", raw, e))
                })?;
                let host = parsed
                    .host_str()
                    .ok_or_else(|| {
                        ProxyError::Config(format!("upstream proxy URL has no host: {}", raw))
                    })?
                    .to_string();
                let port = parsed.port_or_known_default().unwrap_or(80);
                let basic_auth = match (parsed.username(), parsed.password()) {
                    ("", _) => None,
                    (user, pass) => Some(format!(
                        "Basic {}",
                        STANDARD.encode(format!("{}:{}", user, pass.unwrap_or("")))
                    )),
                };
                Some(UpstreamProxy {
                    address: format!("{}:{}", host, port),
                    basic_auth,
                })
            }
        };
        Ok(Self { upstream })
    }

    #[must_use]
    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    /// `Proxy-Authorization` value for plain requests sent to the upstream
    /// proxy, when its URL carried credentials.
    #[must_use]
    pub fn proxy_auth(&self) -> Option<&str> {
        self.upstream
            .as_ref()
            .and_then(|p| p.basic_auth.as_deref())
    }

    /// Socket for a plain (non-tunneled) HTTP request. With an upstream
    /// proxy configured this connects to the proxy itself and the caller
    /// sends an absolute-form request; returns whether that is the case.
    pub async fn dial_plain(&self, host: &str, port: u16) -> Result<(TcpStream, bool)> {
        match &self.upstream {
            None => Ok((connect_direct(host, port).await?, false)),
            Some(proxy) => {
                let (proxy_host, proxy_port) = proxy
                    .address
                    .rsplit_once(':')
                    .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(80)))
                    .unwrap_or_else(|| (proxy.address.clone(), 80));
                Ok((connect_direct(&proxy_host, proxy_port).await?, true))
            }
        }
    }

    /// Open a raw TCP connection to `host:port`.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        match &self.upstream {
            None => connect_direct(host, port).await,
            Some(proxy) => {
                tokio::time::timeout(CONNECT_TIMEOUT, connect_via_proxy(proxy, host, port))
                    .await
                    .map_err(|_| ProxyError::UpstreamConnect {
                        host: host.to_string(),
                        reason: "upstream proxy handshake timed out".to_string(),
                    })?
            }
        }
    }
}

async fn connect_direct(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: "connection timed out".to_string(),
        }),
    }
}

/// CONNECT through the upstream proxy and hand back the tunneled socket.
async fn connect_via_proxy(proxy: &UpstreamProxy, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(&proxy.address).await.map_err(|e| {
        ProxyError::UpstreamProxy(format!("cannot connect to {}: {}", proxy.address, e))
    })?;

    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(auth) = &proxy.basic_auth {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = parse_status_code(&status_line)?;

    // Drain the proxy's response headers, remembering the body length for
    // error reporting on refusal.
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if let Some(value) = line
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
            .and_then(|v| v.parse().ok())
        {
            content_length = value;
        }
    }

    if status != 200 {
        let mut body = vec![0u8; content_length.min(4096)];
        if !body.is_empty() {
            use tokio::io::AsyncReadExt;
            let _ = reader.read_exact(&mut body).await;
        }
        let text = String::from_utf8_lossy(&body).trim().to_string();
        debug!(status, %text, "upstream proxy refused CONNECT");
        return Err(ProxyError::UpstreamProxy(format!(
            "upstream proxy refused CONNECT to {}:{} with status {}: {}",
            host, port, status, text
        )));
    }

    // The proxy will not speak until we do, so nothing is buffered yet.
    Ok(reader.into_inner())
}

fn parse_status_code(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => {
            code.parse().map_err(|_| {
                ProxyError::HttpParse(format!("invalid status in proxy response: {}", line))
            })
        }
        _ => Err(ProxyError::HttpParse(format!(
            "malformed proxy response: {}",
            line.trim()
        ))),
    }
}
