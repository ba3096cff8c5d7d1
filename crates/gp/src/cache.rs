//! Generation keyed caching of factorizations.
//!
//! Models carry a [`Generation`] counter bumped on every parameter mutation.
//! A [`FactorCache`] remembers the generation its value was computed for and
//! recomputes it as soon as the generation differs.
use crate::errors::Result;
use log::debug;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Monotonically increasing parameter version
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    /// Current value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Move to the next generation, invalidating every cache keyed on the current one
    pub fn bump(&mut self) {
        self.0 += 1;
    }
}

struct Slot<T> {
    generation: Generation,
    value: Arc<T>,
}

/// A single slot cache valid for one parameter generation
pub struct FactorCache<T> {
    name: &'static str,
    slot: Mutex<Option<Slot<T>>>,
}

impl<T> FactorCache<T> {
    /// Empty cache, `name` is only used for logging
    pub fn new(name: &'static str) -> Self {
        FactorCache {
            name,
            slot: Mutex::new(None),
        }
    }

    /// Returns the value stored for `generation` or computes, stores and returns it.
    ///
    /// A value stored for another generation is dropped.
    pub fn get_or_try_insert(
        &self,
        generation: Generation,
        compute: impl FnOnce() -> Result<T>,
    ) -> Result<Arc<T>> {
        // a poisoned lock only means another computation panicked, the slot is rebuilt anyway
        let mut guard = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = guard.as_ref() {
            if slot.generation == generation {
                return Ok(Arc::clone(&slot.value));
            }
        }
        debug!("{} cache rebuilt for generation {}", self.name, generation.0);
        let value = Arc::new(compute()?);
        *guard = Some(Slot {
            generation,
            value: Arc::clone(&value),
        });
        Ok(value)
    }

    /// Same as [FactorCache::get_or_try_insert] when a generation is given,
    /// otherwise computes the value without storing it
    pub fn fetch(
        &self,
        generation: Option<Generation>,
        compute: impl FnOnce() -> Result<T>,
    ) -> Result<Arc<T>> {
        match generation {
            Some(generation) => self.get_or_try_insert(generation, compute),
            None => compute().map(Arc::new),
        }
    }

    /// Generation of the stored value if any
    pub fn cached_generation(&self) -> Option<Generation> {
        let guard = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(|s| s.generation)
    }

    /// Drops the stored value
    pub fn invalidate(&self) {
        let mut guard = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }
}

impl<T> Clone for FactorCache<T> {
    /// Clones start empty: cached factors are never shared between models
    fn clone(&self) -> Self {
        FactorCache::new(self.name)
    }
}

impl<T> fmt::Debug for FactorCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "FactorCache({}, {:?})",
            self.name,
            self.cached_generation()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_cache_hits_within_generation() {
        let cache = FactorCache::new("test");
        let calls = Cell::new(0);
        let gen = Generation::default();
        for _ in 0..3 {
            let v = cache
                .get_or_try_insert(gen, || {
                    calls.set(calls.get() + 1);
                    Ok(42)
                })
                .unwrap();
            assert_eq!(*v, 42);
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cache_invalidated_on_bump() {
        let cache = FactorCache::new("test");
        let mut gen = Generation::default();
        let v = cache.get_or_try_insert(gen, || Ok(1)).unwrap();
        assert_eq!(*v, 1);
        gen.bump();
        let v = cache.get_or_try_insert(gen, || Ok(2)).unwrap();
        assert_eq!(*v, 2);
        assert_eq!(cache.cached_generation(), Some(gen));
        assert!(cache.clone().cached_generation().is_none());
        cache.invalidate();
        assert!(cache.cached_generation().is_none());
    }

    #[test]
    fn test_cache_error_not_stored() {
        let cache: FactorCache<usize> = FactorCache::new("test");
        let gen = Generation::default();
        let res = cache.get_or_try_insert(gen, || {
            Err(crate::GpError::NumericalInstability("boom".to_string()))
        });
        assert!(res.is_err());
        assert!(cache.cached_generation().is_none());
    }

    #[test]
    fn test_fetch_without_generation_is_not_stored() {
        let cache = FactorCache::new("test");
        let v = cache.fetch(None, || Ok(3)).unwrap();
        assert_eq!(*v, 3);
        assert_eq!(cache.cached_generation(), None);
        let v = cache.fetch(Some(Generation::default()), || Ok(4)).unwrap();
        assert_eq!(*v, 4);
        assert_eq!(cache.cached_generation(), Some(Generation::default()));
    }
}
