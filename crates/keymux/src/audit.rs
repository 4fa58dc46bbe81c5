//! Audit logging for proxy traffic.
//!
//! Structured allow/deny/exchange records via `tracing`. Credentials never
//! appear here; callers redact with [`crate::keys::mask_key`] before
//! logging anything credential-shaped. Deny records for an IP are expected
//! to be gated by the defense system's log throttle at the call site.

use std::net::IpAddr;
use tracing::info;

/// Which dispatch branch handled the connection.
#[derive(Debug, Clone, Copy)]
pub enum ProxyMode {
    /// TLS-intercepted session against the configured origin
    Intercept,
    /// Opaque CONNECT tunnel
    Tunnel,
    /// Plain HTTP forward
    Forward,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Intercept => write!(f, "intercept"),
            ProxyMode::Tunnel => write!(f, "tunnel"),
            ProxyMode::Forward => write!(f, "forward"),
        }
    }
}

/// Log an allowed request.
pub fn log_allowed(mode: ProxyMode, ip: IpAddr, host: &str, port: u16) {
    info!(
        target: "keymux::audit",
        mode = %mode,
        client = %ip,
        host = host,
        port = port,
        decision = "allow",
        "request allowed"
    );
}

/// Log a denied request.
pub fn log_denied(mode: ProxyMode, ip: IpAddr, host: &str, reason: &str) {
    info!(
        target: "keymux::audit",
        mode = %mode,
        client = %ip,
        host = host,
        decision = "deny",
        reason = reason,
        "request denied"
    );
}

/// Log one completed request/response exchange on an intercepted session.
pub fn log_exchange(ip: IpAddr, host: &str, method: &str, path: &str, status: u16) {
    info!(
        target: "keymux::audit",
        mode = "intercept",
        client = %ip,
        host = host,
        method = method,
        path = path,
        status = status,
        "exchange complete"
    );
}
