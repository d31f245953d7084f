//! Bounded replay-nonce pool
//!
//! Every ACME response carries a `Replay-Nonce` header; the pool keeps the
//! most recent ones (LIFO) so the next signed request can usually skip the
//! extra `newNonce` round trip. The mutex is take-or-return only and is
//! never held across an await.

use std::collections::VecDeque;
use std::sync::Mutex;

const POOL_MAX: usize = 16;

#[derive(Debug, Default)]
pub(crate) struct NoncePool {
    nonces: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take the most recently stored nonce, if any
    pub(crate) fn take(&self) -> Option<String> {
        match self.nonces.lock() {
            Ok(mut pool) => pool.pop_front(),
            Err(_) => None,
        }
    }

    /// Store a nonce, evicting the oldest when the pool is full
    pub(crate) fn store(&self, nonce: String) {
        if nonce.is_empty() {
            return;
        }
        if let Ok(mut pool) = self.nonces.lock() {
            pool.push_front(nonce);
            pool.truncate(POOL_MAX);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nonces.lock().map(|pool| pool.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_empty() {
        let pool = NoncePool::new();
        assert!(pool.take().is_none());
    }

    #[test]
    fn test_lifo_order() {
        let pool = NoncePool::new();
        pool.store("first".to_string());
        pool.store("second".to_string());
        assert_eq!(pool.take().as_deref(), Some("second"));
        assert_eq!(pool.take().as_deref(), Some("first"));
        assert!(pool.take().is_none());
    }

    #[test]
    fn test_consumed_at_most_once() {
        let pool = NoncePool::new();
        pool.store("only".to_string());
        assert_eq!(pool.take().as_deref(), Some("only"));
        assert!(pool.take().is_none());
    }

    #[test]
    fn test_bounded() {
        let pool = NoncePool::new();
        for i in 0..40 {
            pool.store(format!("nonce-{i}"));
        }
        assert_eq!(pool.len(), POOL_MAX);
        // newest survives eviction
        assert_eq!(pool.take().as_deref(), Some("nonce-39"));
    }

    #[test]
    fn test_ignores_blank() {
        let pool = NoncePool::new();
        pool.store(String::new());
        assert!(pool.take().is_none());
    }
}
