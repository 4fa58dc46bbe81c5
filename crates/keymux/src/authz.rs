//! Client credential validation against the external authorization service.
//!
//! The client presents either a raw credential or a sealed envelope
//! ([`crate::token::TokenCodec`]); after unsealing, the raw value is POSTed
//! to the authorizer as `{"auth_key": ...}` with signed request headers.
//! The authorizer's verdict (including its HTTP status on richer failures)
//! is carried back so the client sees the real reason.
//!
//! TLS verification of the authorizer endpoint can be disabled with an
//! explicit, off-by-default toggle for private-PKI deployments. The
//! insecure connector exists only inside this module and is never used for
//! origin traffic.

use crate::config::AuthConfig;
use crate::error::{ProxyError, Result};
use crate::http1;
use crate::keys::mask_key;
use crate::tls::build_client_connector;
use crate::token::TokenCodec;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Signed request header names shared with the authorizer.
pub const HEADER_SIGNATURE: &str = "X-Api-Signature";
pub const HEADER_TIMESTAMP: &str = "X-Api-Timestamp";
pub const HEADER_NONCE: &str = "X-Api-Nonce";

/// Authorizer call timeout.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on buffered authorizer response bodies.
const MAX_AUTH_RESPONSE: usize = 64 * 1024;

/// Verdict for one presented credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Allowed,
    Blocked { status: u16, message: String },
}

impl AuthOutcome {
    fn blocked(status: u16, message: impl Into<String>) -> Self {
        AuthOutcome::Blocked {
            status,
            message: message.into(),
        }
    }
}

/// The validation capability. `AllowAll` is the nil implementation used
/// when no authorizer is wanted (and as the test double).
pub enum ClientAuthenticator {
    Remote(Box<RemoteAuthenticator>),
    AllowAll,
}

impl ClientAuthenticator {
    /// Build from configuration: remote when an authorizer URL is set,
    /// allow-all otherwise.
    pub fn from_config(auth: &AuthConfig, codec: TokenCodec) -> Result<Self> {
        if auth.api_url.is_some() {
            Ok(ClientAuthenticator::Remote(Box::new(
                RemoteAuthenticator::new(auth, codec)?,
            )))
        } else {
            warn!("no authorizer configured, all client credentials will be accepted");
            Ok(ClientAuthenticator::AllowAll)
        }
    }

    /// Validate a presented credential (or its absence).
    pub async fn validate(&self, credential: Option<&str>) -> AuthOutcome {
        match self {
            ClientAuthenticator::AllowAll => AuthOutcome::Allowed,
            ClientAuthenticator::Remote(remote) => remote.validate(credential).await,
        }
    }
}

/// Validates credentials against the remote authorization service.
pub struct RemoteAuthenticator {
    api_url: url::Url,
    shared_secret: Zeroizing<String>,
    codec: TokenCodec,
    connector: TlsConnector,
}

#[derive(Deserialize)]
struct AuthReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

impl RemoteAuthenticator {
    pub fn new(auth: &AuthConfig, codec: TokenCodec) -> Result<Self> {
        let raw_url = auth
            .api_url
            .as_deref()
            .ok_or_else(|| ProxyError::Config("authorizer URL missing".to_string()))?;
        let api_url = url::Url::parse(raw_url)
            .map_err(|e| ProxyError::Config(format!("invalid authorizer URL '{}': {}", raw_url, e)))?;
        if api_url.scheme() != "http" && api_url.scheme() != "https" {
            return Err(ProxyError::Config(format!(
                "authorizer URL must be http(s): {}",
                raw_url
            )));
        }
        let shared_secret = Zeroizing::new(
            auth.shared_secret
                .clone()
                .ok_or_else(|| ProxyError::Config("PROXY_MAIN_SERVER_SECRET missing".to_string()))?,
        );
        if auth.insecure_skip_verify {
            warn!("authorizer TLS certificate verification is DISABLED");
        }
        Ok(Self {
            api_url,
            shared_secret,
            codec,
            connector: build_client_connector(auth.insecure_skip_verify)?,
        })
    }

    pub async fn validate(&self, credential: Option<&str>) -> AuthOutcome {
        let presented = match credential {
            Some(value) if !value.is_empty() => value,
            _ => return AuthOutcome::blocked(401, "missing client credential"),
        };

        // A sealed envelope yields the raw credential; anything the codec
        // cannot open is treated as a raw credential as-is.
        let raw = match self.codec.open(presented) {
            Ok(opened) => opened,
            Err(_) => Zeroizing::new(presented.to_string()),
        };
        debug!(credential = %mask_key(&raw), "validating client credential");

        match tokio::time::timeout(AUTH_TIMEOUT, self.call_authorizer(&raw)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(error = %e, "authorizer call failed");
                AuthOutcome::blocked(500, format!("authorization check failed: {}", e))
            }
            Err(_) => {
                warn!("authorizer call timed out");
                AuthOutcome::blocked(500, "authorization check timed out")
            }
        }
    }

    async fn call_authorizer(&self, raw_credential: &str) -> Result<AuthOutcome> {
        let host = self
            .api_url
            .host_str()
            .ok_or_else(|| ProxyError::Config("authorizer URL has no host".to_string()))?;
        let port = self
            .api_url
            .port_or_known_default()
            .unwrap_or(443);
        let path = match self.api_url.query() {
            Some(query) => format!("{}?{}", self.api_url.path(), query),
            None => self.api_url.path().to_string(),
        };

        let body = serde_json::json!({ "auth_key": raw_credential }).to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let nonce = generate_nonce()?;
        let signature = sign_request(
            &[("auth_key", raw_credential)],
            &timestamp,
            &nonce,
            &self.shared_secret,
        );

        let request = Zeroizing::new(format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\n{}: {}\r\n{}: {}\r\n{}: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            path,
            host,
            HEADER_SIGNATURE,
            signature,
            HEADER_TIMESTAMP,
            timestamp,
            HEADER_NONCE,
            nonce,
            body.len(),
            body
        ));

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let (status, body) = if self.api_url.scheme() == "https" {
            let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
                ProxyError::Tls(format!("invalid authorizer server name: {}", host))
            })?;
            let tls = self
                .connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProxyError::Tls(format!("authorizer TLS handshake: {}", e)))?;
            exchange(tls, &request).await?
        } else {
            exchange(tcp, &request).await?
        };

        Ok(interpret_reply(status, &body))
    }
}

/// Write the request, read one response, return status and decoded body.
async fn exchange<S>(stream: S, request: &str) -> Result<(u16, Vec<u8>)>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = http1::read_response_head(&mut stream).await?;
    let framing = http1::response_body_framing("POST", &head);
    let body = http1::read_decoded_body(&mut stream, framing, MAX_AUTH_RESPONSE).await?;
    Ok((head.status, body))
}

fn interpret_reply(status: u16, body: &[u8]) -> AuthOutcome {
    if status == 200 {
        match serde_json::from_slice::<AuthReply>(body) {
            Ok(reply) if reply.success => AuthOutcome::Allowed,
            Ok(reply) => AuthOutcome::blocked(
                401,
                reply
                    .message
                    .unwrap_or_else(|| "invalid client credential".to_string()),
            ),
            Err(_) => AuthOutcome::blocked(500, "unparseable authorizer response"),
        }
    } else {
        // Prefer the JSON `message` field, fall back to the raw body.
        let message = serde_json::from_slice::<AuthReply>(body)
            .ok()
            .and_then(|r| r.message)
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
        AuthOutcome::blocked(status, message)
    }
}

/// Signature over the sorted request parameters:
/// `hex(SHA-256("k1=v1&…&timestamp=T&nonce=N&key=SECRET"))`.
fn sign_request(params: &[(&str, &str)], timestamp: &str, nonce: &str, secret: &str) -> String {
    let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);

    let mut input = String::new();
    for (key, value) in sorted {
        input.push_str(key);
        input.push('=');
        input.push_str(value);
        input.push('&');
    }
    input.push_str("timestamp=");
    input.push_str(timestamp);
    input.push_str("&nonce=");
    input.push_str(nonce);
    input.push_str("&key=");
    input.push_str(secret);

    hex_encode(&Sha256::digest(input.as_bytes()))
}

/// 16 characters of `[A-Za-z0-9]` from the CSPRNG.
fn generate_nonce() -> Result<String> {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes)
        .map_err(|e| ProxyError::Config(format!("RNG failure: {}", e)))?;
    Ok(bytes
        .iter()
        .map(|b| CHARSET[(*b as usize) % CHARSET.len()] as char)
        .collect())
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
