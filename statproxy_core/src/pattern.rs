//! Bounded least-recently-written cache of pattern cells.
//!
//! Recency tracks writes, not reads: [`PatternCache::peek`] never touches the
//! recency order, [`PatternCache::put`] always does. Once the cache holds
//! `capacity` patterns a put of a new pattern evicts the one written longest
//! ago.

use std::collections::{BTreeMap, TryReserveError};

use rustc_hash::FxHashMap;

use crate::metric::{Cell, Shape};

/// Errors produced by [`PatternCache`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Error {
    /// A cache that can hold nothing is useless.
    #[error("pattern cache capacity must be non-zero")]
    ZeroCapacity,
    /// Storage for the cache could not be reserved.
    #[error("failed to reserve pattern cache storage: {0}")]
    Reserve(#[from] TryReserveError),
    /// The cell does not fit the shape the cache was created with.
    #[error("cannot store a {found:?} cell in a {expected:?} pattern cache")]
    Shape {
        /// The cache's shape
        expected: Shape,
        /// The offending cell's shape
        found: Shape,
    },
}

#[derive(Debug)]
struct Slot {
    cell: Cell,
    stamp: u64,
}

#[derive(Debug)]
pub(crate) struct PatternCache {
    shape: Shape,
    capacity: usize,
    entries: FxHashMap<String, Slot>,
    // write stamp -> pattern, oldest first
    recency: BTreeMap<u64, String>,
    clock: u64,
}

impl PatternCache {
    pub(crate) fn new(shape: Shape, capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        let mut entries = FxHashMap::default();
        entries.try_reserve(capacity)?;
        Ok(Self {
            shape,
            capacity,
            entries,
            recency: BTreeMap::new(),
            clock: 0,
        })
    }

    pub(crate) fn shape(&self) -> Shape {
        self.shape
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Read a cell without refreshing its recency.
    pub(crate) fn peek(&self, pattern: &str) -> Option<Cell> {
        self.entries.get(pattern).map(|slot| slot.cell)
    }

    /// Write a cell, marking it most recently written. Returns the pattern
    /// evicted to make room, if any.
    pub(crate) fn put(&mut self, pattern: &str, cell: Cell) -> Result<Option<String>, Error> {
        if cell.shape() != self.shape {
            return Err(Error::Shape {
                expected: self.shape,
                found: cell.shape(),
            });
        }

        self.clock += 1;
        let stamp = self.clock;

        if let Some(slot) = self.entries.get_mut(pattern) {
            self.recency.remove(&slot.stamp);
            slot.stamp = stamp;
            slot.cell = cell;
            self.recency.insert(stamp, pattern.to_owned());
            return Ok(None);
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.recency.pop_first() {
                self.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.entries.insert(pattern.to_owned(), Slot { cell, stamp });
        self.recency.insert(stamp, pattern.to_owned());
        Ok(evicted)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, Cell)> {
        self.entries
            .iter()
            .map(|(pattern, slot)| (pattern.as_str(), slot.cell))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_cache(capacity: usize) -> PatternCache {
        PatternCache::new(Shape::Scalar, capacity).expect("cache creation failed")
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            PatternCache::new(Shape::Scalar, 0).err(),
            Some(Error::ZeroCapacity)
        );
    }

    #[test]
    fn evicts_least_recently_written() {
        let mut cache = scalar_cache(100);
        for i in 0..100 {
            let evicted = cache.put(&format!("p{i}"), Cell::Scalar(i)).unwrap();
            assert!(evicted.is_none());
        }
        let evicted = cache.put("p100", Cell::Scalar(100)).unwrap();
        assert_eq!(evicted.as_deref(), Some("p0"));
        assert_eq!(cache.len(), 100);
        assert!(cache.peek("p0").is_none());
        assert_eq!(cache.peek("p1"), Some(Cell::Scalar(1)));
    }

    #[test]
    fn peek_does_not_refresh_recency() {
        let mut cache = scalar_cache(2);
        cache.put("a", Cell::Scalar(1)).unwrap();
        cache.put("b", Cell::Scalar(2)).unwrap();
        assert_eq!(cache.peek("a"), Some(Cell::Scalar(1)));
        let evicted = cache.put("c", Cell::Scalar(3)).unwrap();
        assert_eq!(evicted.as_deref(), Some("a"));
    }

    #[test]
    fn put_refreshes_recency() {
        let mut cache = scalar_cache(2);
        cache.put("a", Cell::Scalar(1)).unwrap();
        cache.put("b", Cell::Scalar(2)).unwrap();
        cache.put("a", Cell::Scalar(10)).unwrap();
        let evicted = cache.put("c", Cell::Scalar(3)).unwrap();
        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(cache.peek("a"), Some(Cell::Scalar(10)));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut cache = scalar_cache(4);
        let err = cache
            .put("a", Cell::Mean { sum: 1, count: 1 })
            .expect_err("mean cell accepted by scalar cache");
        assert_eq!(
            err,
            Error::Shape {
                expected: Shape::Scalar,
                found: Shape::Mean
            }
        );
        assert_eq!(cache.len(), 0);
    }
}
