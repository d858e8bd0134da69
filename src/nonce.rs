use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Replay protection cache.
///
/// A nonce stays in the cache for between `retention` and `2 * retention` after it was added.
/// Expired entries are swept lazily, at most once per `retention`.
///
/// Not synchronized, the owner must be the only user.
pub struct NonceCache<K> {
    pool: HashMap<K, Instant>,
    retention: Duration,
    last_clean: Instant,
}

impl<K: Eq + Hash> NonceCache<K> {
    pub fn new(retention: Duration) -> Self {
        Self {
            pool: HashMap::new(),
            retention,
            last_clean: Instant::now(),
        }
    }

    /// returns true if nonce has not been seen within the retention window.
    pub fn check(&mut self, nonce: &K) -> bool {
        self.check_at(nonce, Instant::now())
    }

    pub fn add(&mut self, nonce: K) {
        self.add_at(nonce, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub(crate) fn check_at(&mut self, nonce: &K, now: Instant) -> bool {
        self.clean(now);
        !self.pool.contains_key(nonce)
    }

    pub(crate) fn add_at(&mut self, nonce: K, now: Instant) {
        self.pool.insert(nonce, now);
    }

    fn clean(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_clean) <= self.retention {
            return;
        }

        let retention = self.retention;
        let before = self.pool.len();
        self.pool
            .retain(|_, added| now.saturating_duration_since(*added) <= retention);
        self.last_clean = now;

        log::trace!("nonce cache swept {} of {}", before - self.pool.len(), before);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(60);

    #[test]
    fn test_check_add() {
        let mut c = NonceCache::new(RETENTION);
        let n = [1u8; 24];

        assert!(c.check(&n));
        c.add(n);
        assert!(!c.check(&n));
        assert!(c.check(&[2u8; 24]));

        c.add(n);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_lazy_sweep() {
        let mut c = NonceCache::new(RETENTION);
        let t0 = Instant::now();
        let n = [7u8; 24];
        c.add_at(n, t0);

        // no sweep yet, still present
        assert!(!c.check_at(&n, t0 + RETENTION / 2));
        assert_eq!(c.len(), 1);

        // checking any other nonce after retention sweeps n away
        let other = [8u8; 24];
        assert!(c.check_at(&other, t0 + RETENTION + Duration::from_millis(1)));
        assert!(c.is_empty());
        assert!(c.check_at(&n, t0 + RETENTION + Duration::from_millis(2)));
    }

    #[test]
    fn test_sweep_keeps_recent() {
        let mut c = NonceCache::new(RETENTION);
        let t0 = Instant::now();
        c.add_at([1u8; 24], t0);
        c.add_at([2u8; 24], t0 + RETENTION / 2);

        let t1 = t0 + RETENTION + Duration::from_secs(1);
        assert!(c.check_at(&[1u8; 24], t1));
        assert!(!c.check_at(&[2u8; 24], t1));
        assert_eq!(c.len(), 1);
    }
}
