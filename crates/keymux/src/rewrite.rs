//! Per-request rewriting on intercepted sessions.
//!
//! Strips hop-by-hop headers, validates the client credential, and swaps in
//! the next upstream key from the pool. An authorization failure is not an
//! early exit: it is carried as [`Rewrite::Reject`] to the session loop,
//! the only place that can write a synthesized response, and nothing is
//! sent to the origin for that request.

use crate::authz::{AuthOutcome, ClientAuthenticator};
use crate::config::KeySource;
use crate::http1::RequestHead;
use crate::keys::{mask_key, KeyPool};
use std::sync::Arc;
use tracing::debug;

/// The upstream credential header Google clients send.
pub const API_KEY_HEADER: &str = "x-goog-api-key";
/// Query parameter carrying the upstream credential.
pub const API_KEY_PARAM: &str = "key";
/// Query parameter clients may use to present their own credential.
pub const AUTH_KEY_PARAM: &str = "auth_key";

/// Outcome of rewriting one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Request is ready to forward to the origin.
    Forward,
    /// Authorization refused this request; synthesize a response instead.
    Reject { status: u16, message: String },
}

/// Rewrites in-flight requests: auth check plus credential substitution.
pub struct RequestRewriter {
    pool: Arc<KeyPool>,
    authenticator: ClientAuthenticator,
    key_source: KeySource,
}

impl RequestRewriter {
    #[must_use]
    pub fn new(
        pool: Arc<KeyPool>,
        authenticator: ClientAuthenticator,
        key_source: KeySource,
    ) -> Self {
        Self {
            pool,
            authenticator,
            key_source,
        }
    }

    /// Rewrite `head` in place for forwarding to `origin_host`.
    pub async fn rewrite(&self, head: &mut RequestHead, origin_host: &str) -> Rewrite {
        let credential = extract_credential(head, self.key_source);
        let outcome = self.authenticator.validate(credential.as_deref()).await;
        self.finish(head, origin_host, outcome)
    }

    /// Apply an already-computed auth outcome. Split out so the reject and
    /// substitution paths are testable without a live authorizer.
    fn finish(&self, head: &mut RequestHead, origin_host: &str, outcome: AuthOutcome) -> Rewrite {
        strip_hop_headers(head);

        if let AuthOutcome::Blocked { status, message } = outcome {
            debug!(status, "request rejected by authorization");
            return Rewrite::Reject { status, message };
        }

        // The client's own credential never travels upstream.
        if self.key_source == KeySource::Query {
            head.target = remove_query_param(&head.target, AUTH_KEY_PARAM);
        }

        self.substitute_credential(head);
        head.headers.set("Host", origin_host);
        Rewrite::Forward
    }

    /// Swap the upstream credential in: header if present, else the `key`
    /// query parameter if present, else a fresh header.
    pub fn substitute_credential(&self, head: &mut RequestHead) {
        let next = self.pool.next_key();
        if head.headers.get(API_KEY_HEADER).is_some() {
            head.headers.set(API_KEY_HEADER, &next);
            debug!(key = %mask_key(&next), "replaced api key header");
        } else if query_param(&head.target, API_KEY_PARAM).is_some() {
            head.target = set_query_param(&head.target, API_KEY_PARAM, &next);
            debug!(key = %mask_key(&next), "replaced api key query parameter");
        } else {
            head.headers.set(API_KEY_HEADER, &next);
            debug!(key = %mask_key(&next), "added api key header");
        }
    }
}

/// Pull the client credential from the configured location.
#[must_use]
pub fn extract_credential(head: &RequestHead, source: KeySource) -> Option<String> {
    match source {
        KeySource::Header => head.headers.get(API_KEY_HEADER).map(str::to_string),
        KeySource::Query => query_param(&head.target, AUTH_KEY_PARAM),
    }
}

fn strip_hop_headers(head: &mut RequestHead) {
    head.headers.remove("Proxy-Connection");
    head.headers.remove("Proxy-Authorization");
}

/// Decoded value of a query parameter in a request target.
#[must_use]
pub fn query_param(target: &str, name: &str) -> Option<String> {
    let (_, query) = target.split_once('?')?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            return Some(
                urlencoding::decode(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string()),
            );
        }
    }
    None
}

/// Replace or append a query parameter, URL-encoding the value.
#[must_use]
pub fn set_query_param(target: &str, name: &str, value: &str) -> String {
    let encoded = urlencoding::encode(value);
    match target.split_once('?') {
        Some((path, query)) => {
            let mut found = false;
            let rewritten: Vec<String> = query
                .split('&')
                .map(|pair| {
                    let key = pair.split_once('=').map_or(pair, |(k, _)| k);
                    if key == name {
                        found = true;
                        format!("{}={}", name, encoded)
                    } else {
                        pair.to_string()
                    }
                })
                .collect();
            if found {
                format!("{}?{}", path, rewritten.join("&"))
            } else {
                format!("{}?{}&{}={}", path, query, name, encoded)
            }
        }
        None => format!("{}?{}={}", target, name, encoded),
    }
}

/// Drop a query parameter, removing the `?` when nothing remains.
#[must_use]
pub fn remove_query_param(target: &str, name: &str) -> String {
    match target.split_once('?') {
        None => target.to_string(),
        Some((path, query)) => {
            let kept: Vec<&str> = query
                .split('&')
                .filter(|pair| pair.split_once('=').map_or(*pair, |(k, _)| k) != name)
                .collect();
            if kept.is_empty() {
                path.to_string()
            } else {
                format!("{}?{}", path, kept.join("&"))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::http1::Headers;

    fn head(target: &str, headers: &[(&str, &str)]) -> RequestHead {
        let mut h = Headers::new();
        for (name, value) in headers {
            h.push(name, value);
        }
        RequestHead {
            method: "GET".to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: h,
        }
    }

    fn rewriter(keys: &[&str]) -> RequestRewriter {
        let pool = Arc::new(KeyPool::new(keys.iter().map(|k| k.to_string()).collect()).unwrap());
        RequestRewriter::new(pool, ClientAuthenticator::AllowAll, KeySource::Header)
    }

    #[tokio::test]
    async fn test_header_credential_replaced_in_rotation() {
        let rewriter = rewriter(&["K1", "K2", "K3"]);
        for expected in ["K1", "K2", "K3", "K1"] {
            let mut request = head("/v1/models", &[("x-goog-api-key", "CLIENT_RAW")]);
            let result = rewriter.rewrite(&mut request, "origin.example").await;
            assert_eq!(result, Rewrite::Forward);
            assert_eq!(request.headers.get(API_KEY_HEADER), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_outbound_key_never_echoes_client_value() {
        let rewriter = rewriter(&["K1"]);
        let mut request = head("/v1/models", &[("x-goog-api-key", "CLIENT_RAW")]);
        rewriter.rewrite(&mut request, "origin.example").await;
        assert_ne!(request.headers.get(API_KEY_HEADER), Some("CLIENT_RAW"));
    }

    #[tokio::test]
    async fn test_query_key_replaced_when_no_header() {
        let rewriter = rewriter(&["K1"]);
        let mut request = head("/v1/models?key=old&alt=sse", &[]);
        rewriter.rewrite(&mut request, "origin.example").await;
        assert_eq!(request.target, "/v1/models?key=K1&alt=sse");
        // The header path was not taken.
        assert!(request.headers.get(API_KEY_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_header_added_when_nothing_present() {
        let rewriter = rewriter(&["K1"]);
        let mut request = head("/v1/models", &[]);
        rewriter.rewrite(&mut request, "origin.example").await;
        assert_eq!(request.headers.get(API_KEY_HEADER), Some("K1"));
    }

    #[tokio::test]
    async fn test_hop_headers_stripped_and_host_forced() {
        let rewriter = rewriter(&["K1"]);
        let mut request = head(
            "/v1/models",
            &[
                ("Proxy-Connection", "keep-alive"),
                ("Proxy-Authorization", "Basic abc"),
                ("Host", "proxy.local:8091"),
            ],
        );
        rewriter.rewrite(&mut request, "origin.example").await;
        assert!(request.headers.get("Proxy-Connection").is_none());
        assert!(request.headers.get("Proxy-Authorization").is_none());
        assert_eq!(request.headers.get("Host"), Some("origin.example"));
    }

    #[test]
    fn test_reject_carries_status_and_message() {
        let rewriter = rewriter(&["K1"]);
        let mut request = head("/v1/models", &[("x-goog-api-key", "BAD")]);
        let result = rewriter.finish(
            &mut request,
            "origin.example",
            AuthOutcome::Blocked {
                status: 404,
                message: "not found".to_string(),
            },
        );
        assert_eq!(
            result,
            Rewrite::Reject {
                status: 404,
                message: "not found".to_string()
            }
        );
        // No credential substitution happened.
        assert_eq!(request.headers.get(API_KEY_HEADER), Some("BAD"));
    }

    #[test]
    fn test_query_source_strips_auth_key() {
        let pool = Arc::new(KeyPool::new(vec!["K1".to_string()]).unwrap());
        let rewriter =
            RequestRewriter::new(pool, ClientAuthenticator::AllowAll, KeySource::Query);
        let mut request = head("/v1/models?auth_key=tok&key=old", &[]);
        let result = rewriter.finish(&mut request, "origin.example", AuthOutcome::Allowed);
        assert_eq!(result, Rewrite::Forward);
        assert_eq!(request.target, "/v1/models?key=K1");
    }

    #[test]
    fn test_extract_credential_sources() {
        let request = head("/x?auth_key=qtoken", &[("x-goog-api-key", "htoken")]);
        assert_eq!(
            extract_credential(&request, KeySource::Header),
            Some("htoken".to_string())
        );
        assert_eq!(
            extract_credential(&request, KeySource::Query),
            Some("qtoken".to_string())
        );
        let bare = head("/x", &[]);
        assert_eq!(extract_credential(&bare, KeySource::Header), None);
        assert_eq!(extract_credential(&bare, KeySource::Query), None);
    }

    #[test]
    fn test_query_helpers() {
        assert_eq!(query_param("/p?a=1&b=2", "b"), Some("2".to_string()));
        assert_eq!(query_param("/p?a=%20x", "a"), Some(" x".to_string()));
        assert_eq!(query_param("/p", "a"), None);

        assert_eq!(set_query_param("/p", "k", "v"), "/p?k=v");
        assert_eq!(set_query_param("/p?k=old", "k", "new"), "/p?k=new");
        assert_eq!(set_query_param("/p?a=1", "k", "v w"), "/p?a=1&k=v%20w");

        assert_eq!(remove_query_param("/p?k=v", "k"), "/p");
        assert_eq!(remove_query_param("/p?k=v&a=1", "k"), "/p?a=1");
        assert_eq!(remove_query_param("/p", "k"), "/p");
    }
}
