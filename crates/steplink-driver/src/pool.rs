use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;

/// Lowest correlation sequence handed out; 0 is reserved for broadcasts.
pub const FIRST_SEQUENCE: u16 = 1;
/// Highest correlation sequence handed out.
pub const LAST_SEQUENCE: u16 = 255;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError<K: fmt::Debug + fmt::Display> {
    /// Every token is bound to a pending waiter.
    #[error("sequence pool exhausted")]
    Exhausted,

    /// The token is not bound (stale or duplicate response).
    #[error("sequence [{0}] not found")]
    NotFound(K),
}

/// Correlation tokens and the waiters bound to them.
///
/// A token is either available or bound to exactly one waiter. Release is
/// guarded by the waiter, so a timed-out request and a late response can
/// never both hand the same token back.
#[derive(Debug)]
pub struct SequencePool<K, W> {
    available: BTreeSet<K>,
    pending: HashMap<K, W>,
}

impl<K, W> SequencePool<K, W>
where
    K: Copy + Ord + Hash + fmt::Debug + fmt::Display,
    W: PartialEq,
{
    pub fn new(tokens: impl IntoIterator<Item = K>) -> Self {
        Self {
            available: tokens.into_iter().collect(),
            pending: HashMap::new(),
        }
    }

    /// Bind `waiter` to the lowest free token.
    pub fn assign(&mut self, waiter: W) -> Result<K, PoolError<K>> {
        let token = self.available.pop_first().ok_or(PoolError::Exhausted)?;
        self.pending.insert(token, waiter);
        Ok(token)
    }

    pub fn resolve(&self, token: K) -> Result<&W, PoolError<K>> {
        self.pending.get(&token).ok_or(PoolError::NotFound(token))
    }

    /// Return `token` to the pool iff it is still bound to `expected`.
    pub fn release(&mut self, token: K, expected: &W) -> bool {
        match self.pending.get(&token) {
            Some(bound) if bound == expected => {
                self.pending.remove(&token);
                self.available.insert(token);
                true
            }
            _ => false,
        }
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<W: PartialEq> SequencePool<u16, W> {
    /// Pool over the full device sequence range.
    pub fn for_driver() -> Self {
        Self::new(FIRST_SEQUENCE..=LAST_SEQUENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_release_reassign() {
        let mut pool: SequencePool<u16, &str> = SequencePool::new([1, 2]);
        assert_eq!(pool.assign("a").unwrap(), 1);
        assert_eq!(pool.assign("b").unwrap(), 2);
        assert_eq!(pool.assign("c"), Err(PoolError::Exhausted));

        assert!(pool.release(1, &"a"));
        assert_eq!(pool.assign("c").unwrap(), 1);
        assert_eq!(*pool.resolve(1).unwrap(), "c");
    }

    #[test]
    fn test_release_with_wrong_waiter_is_noop() {
        let mut pool: SequencePool<u16, u32> = SequencePool::new([7]);
        let token = pool.assign(100).unwrap();
        assert!(!pool.release(token, &200));
        assert_eq!(*pool.resolve(token).unwrap(), 100);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.pending(), 1);
    }

    #[test]
    fn test_double_release() {
        let mut pool: SequencePool<u16, u32> = SequencePool::new([1]);
        let token = pool.assign(1).unwrap();
        assert!(pool.release(token, &1));
        assert!(!pool.release(token, &1));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_stale_release_after_reuse() {
        // Timeout released the token, a new request took it, then the
        // original owner tries to release again.
        let mut pool: SequencePool<u16, u32> = SequencePool::new([5]);
        let token = pool.assign(1).unwrap();
        assert!(pool.release(token, &1));
        let reused = pool.assign(2).unwrap();
        assert_eq!(reused, token);
        assert!(!pool.release(token, &1));
        assert_eq!(*pool.resolve(token).unwrap(), 2);
    }

    #[test]
    fn test_resolve_unknown() {
        let pool: SequencePool<u16, u32> = SequencePool::new([1]);
        assert_eq!(pool.resolve(9), Err(PoolError::NotFound(9)));
        assert_eq!(PoolError::NotFound(9u16).to_string(), "sequence [9] not found");
    }

    #[test]
    fn test_driver_pool_never_hands_out_zero() {
        let mut pool: SequencePool<u16, usize> = SequencePool::for_driver();
        assert_eq!(pool.available(), 255);
        let mut seen = BTreeSet::new();
        for i in 0..255 {
            let token = pool.assign(i).unwrap();
            assert_ne!(token, 0);
            assert!(seen.insert(token), "token {token} handed out twice");
        }
        assert_eq!(pool.assign(255), Err(PoolError::Exhausted));
    }
}
