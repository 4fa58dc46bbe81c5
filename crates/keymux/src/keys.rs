//! Upstream API key pool and round-robin rotation.
//!
//! The pool is fixed at construction. `next()` advances a cursor under a
//! mutex, so two concurrent callers always observe distinct positions and
//! the order of keys handed to the origin is auditable from the logs.

use crate::error::{ProxyError, Result};
use std::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

/// Ordered pool of upstream credentials with a rotation cursor.
pub struct KeyPool {
    keys: Vec<Zeroizing<String>>,
    cursor: Mutex<usize>,
}

impl KeyPool {
    /// Build a pool from the configured credential list.
    ///
    /// An empty pool is a startup error: the proxy cannot substitute
    /// credentials without at least one.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(ProxyError::EmptyKeyPool);
        }
        Ok(Self {
            keys: keys.into_iter().map(Zeroizing::new).collect(),
            cursor: Mutex::new(0),
        })
    }

    /// Number of keys in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Return the next key, strict round-robin.
    pub fn next_key(&self) -> Zeroizing<String> {
        let index = {
            let mut cursor = match self.cursor.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let index = *cursor;
            *cursor = (index + 1) % self.keys.len();
            index
        };
        let key = self.keys[index].clone();
        debug!(index, key = %mask_key(&key), "rotated to pool key");
        key
    }
}

/// Redact a credential for logging: first and last 4 characters, fully
/// starred when it is too short for that to hide anything.
#[must_use]
pub fn mask_key(key: &str) -> String {
    if key.chars().count() <= 8 {
        return "*".repeat(key.chars().count());
    }
    let chars: Vec<char> = key.chars().collect();
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
