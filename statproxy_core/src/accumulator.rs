//! Per-source aggregate state.
//!
//! An [`Accumulator`] owns everything one reporting source has written since
//! the last drain: plain numeric metrics, pattern-keyed caches and two sets of
//! cardinality sketches. Every entry point holds the accumulator's mutex for
//! its full duration, so a write racing a drain either lands wholly in the
//! drained snapshot or wholly in the next cycle.
//!
//! ## Overload
//!
//! When any of the four maps holds more than [`Limits::max_keys`] distinct
//! names the accumulator becomes overloaded and drops every further write
//! without error. A drain clears the flag and then re-evaluates it against the
//! maps the drain did not touch.
//!
//! ## Retirement
//!
//! Once the registry lets go of an accumulator it is retired: its final state
//! is taken in the same critical section and every later write is refused with
//! [`Retired`], telling the caller to look the source up again.

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{
    metric::{self, Cell, Kind, Shape, SketchSet},
    pattern::PatternCache,
    protocol::Op,
    sketch::Sketch,
};

/// `metric → value`, the result of a numeric or daily drain.
pub type Numbers = FxHashMap<String, i64>;
/// `metric → pattern → value`, the result of a pattern drain.
pub type Patterns = FxHashMap<String, FxHashMap<String, i64>>;
/// `metric → marshalled sketch`, the persisted form of the daily sketches.
pub type SketchBlobs = FxHashMap<String, Vec<u8>>;

/// Bounds applied to every accumulator.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Limits {
    /// Distinct names any one map may hold before the accumulator overloads.
    pub max_keys: usize,
    /// Patterns held per pattern-keyed metric before eviction.
    pub pattern_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_keys: 70,
            pattern_capacity: 100,
        }
    }
}

/// The write was refused because the accumulator no longer belongs to the
/// registry.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("accumulator is retired")]
pub struct Retired;

/// Everything a retired accumulator held.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Remains {
    /// Numeric metrics and rolling estimates
    pub numeric: Numbers,
    /// Pattern metrics
    pub patterns: Patterns,
    /// Marshalled daily sketches
    pub daily_state: SketchBlobs,
}

#[derive(Debug, Default)]
struct Inner {
    numeric: Numbers,
    patterns: FxHashMap<String, PatternCache>,
    rolling: FxHashMap<String, Sketch>,
    daily: FxHashMap<String, Sketch>,
    overloaded: bool,
    retired: bool,
}

impl Inner {
    fn widest(&self) -> usize {
        self.numeric
            .len()
            .max(self.patterns.len())
            .max(self.rolling.len())
            .max(self.daily.len())
    }

    fn is_idle(&self) -> bool {
        self.numeric.is_empty()
            && self.patterns.is_empty()
            && self.rolling.is_empty()
            && self.daily.is_empty()
    }

    fn check_overload(&mut self, source: &str, max_keys: usize) {
        if self.overloaded {
            return;
        }
        let keys = self.widest();
        if keys > max_keys {
            warn!(
                source,
                keys, max_keys, "accumulator overloaded, dropping writes until next drain"
            );
            self.overloaded = true;
        }
    }

    /// Clear the flag after a drain and evaluate what the drain left behind.
    fn settle(&mut self, source: &str, max_keys: usize) {
        self.overloaded = false;
        self.check_overload(source, max_keys);
    }

    fn dropped(&self, source: &str, metric: &str) -> bool {
        if self.overloaded {
            trace!(source, metric, "write dropped, accumulator overloaded");
        }
        self.overloaded
    }

    fn take_numeric(&mut self) -> Numbers {
        let mut out: Numbers = self.numeric.drain().collect();
        for (name, sketch) in self.rolling.drain() {
            out.insert(name, estimate(&sketch));
        }
        out
    }

    fn take_daily(&mut self) -> Numbers {
        self.daily
            .drain()
            .map(|(name, sketch)| (name, estimate(&sketch)))
            .collect()
    }

    fn take_patterns(&mut self, source: &str) -> Patterns {
        let mut out = Patterns::default();
        for (metric, cache) in self.patterns.drain() {
            let mut values = FxHashMap::default();
            for (pattern, cell) in cache.iter() {
                match cell.value() {
                    Some(value) => {
                        values.insert(pattern.to_owned(), value);
                    }
                    None => {
                        warn!(source, %metric, pattern, ?cell, "malformed pattern cell skipped");
                    }
                }
            }
            if !values.is_empty() {
                out.insert(metric, values);
            }
        }
        out
    }

    fn export_daily_state(&self) -> SketchBlobs {
        self.daily
            .iter()
            .map(|(name, sketch)| (name.clone(), sketch.marshal()))
            .collect()
    }
}

/// Aggregate state for one reporting source.
#[derive(Debug)]
pub struct Accumulator {
    name: String,
    limits: Limits,
    inner: Mutex<Inner>,
}

impl Accumulator {
    /// Create an empty accumulator for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, limits: Limits) -> Self {
        Self {
            name: name.into(),
            limits,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The source key this accumulator belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn live(&self) -> Result<MutexGuard<'_, Inner>, Retired> {
        let inner = self.inner.lock();
        if inner.retired {
            trace!(source = %self.name, "write refused, accumulator retired");
            return Err(Retired);
        }
        Ok(inner)
    }

    /// Apply a scalar write to `metric`.
    ///
    /// # Errors
    ///
    /// Function will return [`Retired`] if the accumulator was retired.
    pub fn record(&self, metric: &str, kind: Kind, value: i64) -> Result<(), Retired> {
        let mut inner = self.live()?;
        self.record_in(&mut inner, metric, kind, value);
        Ok(())
    }

    fn record_in(&self, inner: &mut Inner, metric: &str, kind: Kind, value: i64) {
        if inner.dropped(&self.name, metric) {
            return;
        }
        metric::apply(&mut inner.numeric, metric, kind, value);
        inner.check_overload(&self.name, self.limits.max_keys);
    }

    /// Apply a write to one pattern of a pattern-keyed metric.
    ///
    /// # Errors
    ///
    /// Function will return [`Retired`] if the accumulator was retired.
    pub fn record_pattern(
        &self,
        metric: &str,
        pattern: &str,
        kind: Kind,
        value: i64,
    ) -> Result<(), Retired> {
        let mut inner = self.live()?;
        self.record_pattern_in(&mut inner, metric, pattern, kind, value);
        Ok(())
    }

    fn record_pattern_in(&self, inner: &mut Inner, metric: &str, pattern: &str, kind: Kind, value: i64) {
        if inner.dropped(&self.name, metric) {
            return;
        }

        if !inner.patterns.contains_key(metric) {
            match PatternCache::new(Shape::for_kind(kind), self.limits.pattern_capacity) {
                Ok(cache) => {
                    inner.patterns.insert(metric.to_owned(), cache);
                }
                Err(err) => {
                    warn!(source = %self.name, metric, %err, "unable to create pattern cache, write dropped");
                    return;
                }
            }
        }
        let Some(cache) = inner.patterns.get_mut(metric) else {
            return;
        };

        if cache.shape() != Shape::for_kind(kind) {
            warn!(
                source = %self.name,
                metric,
                pattern,
                ?kind,
                shape = ?cache.shape(),
                "write kind does not fit pattern cache, write dropped"
            );
            return;
        }
        if let Some(cell) = Cell::next(cache.peek(pattern), kind, value) {
            match cache.put(pattern, cell) {
                Ok(Some(evicted)) => {
                    trace!(source = %self.name, metric, %evicted, "pattern evicted");
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(source = %self.name, metric, pattern, %err, "pattern write dropped");
                }
            }
        }
        inner.check_overload(&self.name, self.limits.max_keys);
    }

    /// Count `pattern` as one occurrence in the `set` sketch named `metric`.
    ///
    /// # Errors
    ///
    /// Function will return [`Retired`] if the accumulator was retired.
    pub fn insert_cardinality(
        &self,
        set: SketchSet,
        metric: &str,
        pattern: &str,
    ) -> Result<(), Retired> {
        let mut inner = self.live()?;
        self.insert_cardinality_in(&mut inner, set, metric, pattern);
        Ok(())
    }

    fn insert_cardinality_in(&self, inner: &mut Inner, set: SketchSet, metric: &str, pattern: &str) {
        if inner.dropped(&self.name, metric) {
            return;
        }
        let sketches = match set {
            SketchSet::Rolling => &mut inner.rolling,
            SketchSet::Daily => &mut inner.daily,
        };
        if let Some(sketch) = sketches.get_mut(metric) {
            sketch.insert(pattern.as_bytes());
        } else {
            let mut sketch = Sketch::new();
            sketch.insert(pattern.as_bytes());
            sketches.insert(metric.to_owned(), sketch);
        }
        inner.check_overload(&self.name, self.limits.max_keys);
    }

    /// Apply a decoded write to `metric`.
    ///
    /// # Errors
    ///
    /// Function will return [`Retired`] if the accumulator was retired.
    pub fn apply(&self, metric: &str, op: &Op<'_>) -> Result<(), Retired> {
        let mut inner = self.live()?;
        match *op {
            Op::Scalar { kind, value } => self.record_in(&mut inner, metric, kind, value),
            Op::Pattern {
                kind,
                value,
                pattern,
            } => self.record_pattern_in(&mut inner, metric, pattern, kind, value),
            Op::Cardinality { set, pattern, .. } => {
                self.insert_cardinality_in(&mut inner, set, metric, pattern);
            }
        }
        Ok(())
    }

    /// Take every numeric metric and the estimate of every rolling sketch,
    /// leaving both maps empty.
    ///
    /// A rolling sketch's estimate replaces a numeric metric of the same name.
    pub fn take_numeric(&self) -> Numbers {
        let mut inner = self.inner.lock();
        let out = inner.take_numeric();
        inner.settle(&self.name, self.limits.max_keys);
        out
    }

    /// Take the estimate of every daily sketch, leaving the daily set empty.
    pub fn take_daily(&self) -> Numbers {
        let mut inner = self.inner.lock();
        let out = inner.take_daily();
        inner.settle(&self.name, self.limits.max_keys);
        out
    }

    /// Take every pattern cache flattened to `metric → pattern → value`,
    /// leaving no pattern caches behind.
    pub fn take_patterns(&self) -> Patterns {
        let mut inner = self.inner.lock();
        let out = inner.take_patterns(&self.name);
        inner.settle(&self.name, self.limits.max_keys);
        out
    }

    /// Marshal every daily sketch without clearing them.
    #[must_use]
    pub fn export_daily_state(&self) -> SketchBlobs {
        self.inner.lock().export_daily_state()
    }

    /// Restore daily sketches from their marshalled form.
    ///
    /// A blob that does not unmarshal is logged and skipped. A blob for a
    /// metric that already has a daily sketch is merged into it.
    ///
    /// # Errors
    ///
    /// Function will return [`Retired`] if the accumulator was retired.
    pub fn import_daily_state(&self, state: &SketchBlobs) -> Result<(), Retired> {
        let mut inner = self.live()?;
        for (metric, blob) in state {
            let restored = match Sketch::unmarshal(blob) {
                Ok(sketch) => sketch,
                Err(err) => {
                    warn!(source = %self.name, metric, %err, "unable to restore daily sketch");
                    continue;
                }
            };
            if let Some(sketch) = inner.daily.get_mut(metric) {
                sketch.merge(&restored);
            } else {
                inner.daily.insert(metric.clone(), restored);
            }
        }
        inner.check_overload(&self.name, self.limits.max_keys);
        Ok(())
    }

    /// Retire the accumulator and take all of its state in one step.
    ///
    /// Daily sketches are returned marshalled for the state file.
    pub fn retire(&self) -> Remains {
        let mut inner = self.inner.lock();
        inner.retired = true;
        let remains = Remains {
            numeric: inner.take_numeric(),
            patterns: inner.take_patterns(&self.name),
            daily_state: inner.export_daily_state(),
        };
        inner.daily.clear();
        inner.overloaded = false;
        remains
    }

    /// Retire the accumulator if it holds nothing. True if it was retired.
    pub fn retire_if_idle(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_idle() {
            inner.retired = true;
        }
        inner.retired
    }

    /// The current value of a numeric metric.
    #[must_use]
    pub fn value(&self, metric: &str) -> Option<i64> {
        self.inner.lock().numeric.get(metric).copied()
    }

    /// The current value of one pattern. Does not refresh its recency.
    #[must_use]
    pub fn pattern_value(&self, metric: &str, pattern: &str) -> Option<i64> {
        self.inner
            .lock()
            .patterns
            .get(metric)
            .and_then(|cache| cache.peek(pattern))
            .and_then(Cell::value)
    }

    /// Whether writes are currently being dropped.
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.inner.lock().overloaded
    }

    /// Whether the accumulator refuses writes.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.inner.lock().retired
    }
}

fn estimate(sketch: &Sketch) -> i64 {
    i64::try_from(sketch.estimate()).unwrap_or(i64::MAX)
}
