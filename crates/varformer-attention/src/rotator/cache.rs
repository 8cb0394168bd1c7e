use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::Rotator;

type Key = (u64, u64, u64);

/// Entries kept by [`CachedRotator::new`].
pub const DEFAULT_CACHE_CAPACITY: usize = 1 << 16;

#[derive(Default)]
struct Memo {
    entries: HashMap<Key, [f64; 2]>,
    order: VecDeque<Key>,
}

impl Memo {
    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Insert, evicting the oldest entries beyond `capacity`.
    fn insert(&mut self, key: Key, value: [f64; 2], capacity: usize) {
        if self.entries.insert(key, value).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

/// Memoizes `rotate_reduced` results of the wrapped rotator.
///
/// Keys are the bit patterns of the reduced angle and vector. At most `capacity`
/// results are held; the oldest insertion is evicted first. The cache belongs to
/// this instance and is cleared whenever the inner rotator is borrowed mutably.
pub struct CachedRotator<R> {
    inner: R,
    capacity: usize,
    memo: Mutex<Memo>,
}

impl<R: Rotator> CachedRotator<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAPACITY)
    }

    /// A capacity of zero disables memoization.
    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            memo: Mutex::new(Memo::default()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Mutable access for reconfiguration; drops every cached result.
    pub fn inner_mut(&mut self) -> &mut R {
        self.memo.get_mut().clear();
        &mut self.inner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.memo.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.memo.lock().clear();
    }
}

impl<R: Rotator> Rotator for CachedRotator<R> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
        let key = (v[0].to_bits(), v[1].to_bits(), theta.to_bits());
        if let Some(hit) = self.memo.lock().entries.get(&key) {
            return *hit;
        }
        let out = self.inner.rotate_reduced(theta, v);
        self.memo.lock().insert(key, out, self.capacity);
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::rotator::CordicRotator;

    #[test]
    fn test_cache_hits_and_reconfigure_clears() {
        let mut cached = CachedRotator::new(CordicRotator::new(3));
        let first = cached.rotate(0.2, [1.0, 2.0]);
        assert_eq!(cached.len(), 1);
        assert_eq!(cached.rotate(0.2, [1.0, 2.0]), first);
        assert_eq!(cached.len(), 1);
        cached.rotate(0.3, [1.0, 2.0]);
        assert_eq!(cached.len(), 2);

        cached.inner_mut().set_stages(12);
        assert!(cached.is_empty());
        let refined = cached.rotate(0.2, [1.0, 2.0]);
        assert_ne!(refined, first);
        assert_eq!(refined, CordicRotator::new(12).rotate(0.2, [1.0, 2.0]));
    }

    struct Counting(AtomicUsize);

    impl Rotator for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn rotate_reduced(&self, theta: f64, v: [f64; 2]) -> [f64; 2] {
            self.0.fetch_add(1, Ordering::Relaxed);
            [v[0] + theta, v[1]]
        }
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let cached = CachedRotator::with_capacity(Counting(AtomicUsize::new(0)), 3);
        let calls = || cached.inner().0.load(Ordering::Relaxed);
        let angles = [0.1, 0.2, 0.3, 0.4];
        for theta in angles {
            cached.rotate_reduced(theta, [1.0, 0.0]);
        }
        assert_eq!((cached.len(), calls()), (3, 4));

        // 0.2..0.4 survive, 0.1 was evicted
        for theta in &angles[1..] {
            cached.rotate_reduced(*theta, [1.0, 0.0]);
        }
        assert_eq!(calls(), 4);
        cached.rotate_reduced(0.1, [1.0, 0.0]);
        assert_eq!((cached.len(), calls()), (3, 5));

        let off = CachedRotator::with_capacity(CordicRotator::new(6), 0);
        off.rotate(0.3, [2.0, 1.0]);
        assert!(off.is_empty());
    }
}
