//! HTTPS-intercepting forward proxy for a single upstream API origin.
//!
//! keymux sits between client applications and one configured origin
//! (by default Google's generative-language endpoint) and:
//!
//! 1. **Intercepts** CONNECT requests for that origin: the client socket is
//!    TLS-terminated with a per-host leaf minted by a private root CA, each
//!    in-flight request is validated against an external authorization
//!    service, and the client's credential is swapped for the next key in a
//!    shared upstream pool.
//!
//! 2. **Tunnels** CONNECT requests for every other host opaquely, without
//!    TLS termination.
//!
//! 3. **Forwards** plain HTTP requests with the same credential
//!    substitution discipline.
//!
//! A defense layer screens every connection first: per-IP rate limiting
//! with temporary bans, a domain blocklist, and a repeated-error log
//! throttle. Egress can optionally chain through an upstream HTTP CONNECT
//! proxy.

pub mod audit;
pub mod authz;
pub mod ca;
pub mod config;
pub mod defense;
pub mod dial;
pub mod error;
pub mod http1;
pub mod intercept;
pub mod keys;
pub mod rewrite;
pub mod server;
pub mod tls;
pub mod token;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use server::{start, ProxyHandle};
