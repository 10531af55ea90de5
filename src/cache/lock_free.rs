//! Mode-keyed cache of one derived value
//!
//! Every cached value carries the generation it was computed in.
//! Invalidation only bumps the generation counter, so it never waits for
//! readers and never makes a reader wait. A value computed before an
//! invalidation can still be returned to the caller that computed it, but
//! it is never published for later readers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

type ComputeFn<T, M> = Box<dyn Fn(&M) -> T + Send + Sync>;

/// Caches one value per mode, recomputing lazily after invalidation
///
/// Readers take a shared lock only long enough to clone the value. The
/// recompute path runs with no lock held; the exclusive lock is taken
/// only to prune stale entries and insert the new one. Two threads missing
/// at once may both compute; the second publish wins.
pub struct LockFreeCache<T, M = bool> {
    compute: ComputeFn<T, M>,
    generation: AtomicU64,
    values: RwLock<HashMap<M, (u64, T)>>,
}

impl<T, M> LockFreeCache<T, M>
where
    T: Clone,
    M: Eq + Hash + Clone,
{
    /// Create an empty cache around `compute`
    ///
    /// `compute` receives the mode it must compute for.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(&M) -> T + Send + Sync + 'static,
    {
        Self {
            compute: Box::new(compute),
            generation: AtomicU64::new(0),
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Cached value for `mode`, computing it on a miss
    pub fn get_value(&self, mode: &M) -> T {
        if let Some(value) = self.try_get_value(mode) {
            return value;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let value = (self.compute)(mode);

        let mut values = self.values.write();
        if self.generation.load(Ordering::Acquire) == generation {
            values.retain(|_, (g, _)| *g == generation);
            values.insert(mode.clone(), (generation, value.clone()));
        }
        value
    }

    /// Cached value for `mode`, never computing
    pub fn try_get_value(&self, mode: &M) -> Option<T> {
        let generation = self.generation.load(Ordering::Acquire);
        let values = self.values.read();
        values
            .get(mode)
            .filter(|(g, _)| *g == generation)
            .map(|(_, value)| value.clone())
    }

    /// Mark every mode stale
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of invalidations so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl<T, M> std::fmt::Debug for LockFreeCache<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeCache")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    fn counting_cache() -> (Arc<AtomicUsize>, LockFreeCache<i32, bool>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = LockFreeCache::new(move |wrap: &bool| {
            counter.fetch_add(1, Ordering::SeqCst);
            if *wrap {
                1
            } else {
                2
            }
        });
        (calls, cache)
    }

    #[test]
    fn test_computes_once_per_mode() {
        let (calls, cache) = counting_cache();

        assert_eq!(cache.get_value(&true), 1);
        assert_eq!(cache.get_value(&true), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get_value(&false), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_modes_never_mix() {
        let (_, cache) = counting_cache();

        assert_eq!(cache.get_value(&true), 1);
        assert_eq!(cache.get_value(&false), 2);
        assert_eq!(cache.get_value(&true), 1);
        assert_eq!(cache.try_get_value(&false), Some(2));
    }

    #[test]
    fn test_try_get_never_computes() {
        let (calls, cache) = counting_cache();

        assert_eq!(cache.try_get_value(&true), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache.get_value(&true);
        assert_eq!(cache.try_get_value(&true), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_forces_recompute() {
        let (calls, cache) = counting_cache();

        cache.get_value(&true);
        cache.get_value(&false);
        cache.invalidate();

        assert_eq!(cache.try_get_value(&true), None);
        assert_eq!(cache.try_get_value(&false), None);
        assert_eq!(cache.get_value(&true), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.generation(), 1);
    }

    #[test]
    fn test_stale_computation_is_not_published() {
        let gate = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let (g, r) = (gate.clone(), release.clone());
        let first = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let cache = Arc::new(LockFreeCache::new(move |_: &bool| {
            if first.swap(false, Ordering::SeqCst) {
                g.wait();
                r.wait();
                "stale"
            } else {
                "fresh"
            }
        }));

        let worker = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.get_value(&false))
        };

        gate.wait();
        cache.invalidate();
        release.wait();

        assert_eq!(worker.join().unwrap(), "stale");
        assert_eq!(cache.try_get_value(&false), None);
        assert_eq!(cache.get_value(&false), "fresh");
    }

    #[test]
    fn test_concurrent_readers_after_invalidate() {
        let (calls, cache) = counting_cache();
        let cache = Arc::new(cache);
        cache.get_value(&true);
        cache.invalidate();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get_value(&true))
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), 1);
        }

        // At least one recompute happened, duplicates are allowed
        let total = calls.load(Ordering::SeqCst);
        assert!((2..=9).contains(&total));
        assert_eq!(cache.get_value(&true), 1);
    }

    #[test]
    fn test_publish_survives_busy_readers() {
        let (calls, cache) = counting_cache();
        let cache = Arc::new(cache);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        if let Some(value) = cache.try_get_value(&false) {
                            assert_eq!(value, 2);
                        }
                    }
                })
            })
            .collect();

        for _ in 0..2000 {
            cache.invalidate();
            assert_eq!(cache.get_value(&false), 2);
            assert_eq!(cache.try_get_value(&false), Some(2));
        }

        done.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2000);
    }
}
