//! The source name to accumulator map.
//!
//! The registry lock guards only the map. Once a source's [`Accumulator`] is
//! created every write for it takes only that accumulator's own mutex, so
//! writers to different sources never contend.
//!
//! An accumulator leaves the map either when the whole registry is drained or
//! when a flush finds it idle. Either way it is retired under its own lock on
//! the way out, and a write that reaches it afterwards is redirected to the
//! source's new accumulator.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{
    accumulator::{Accumulator, Limits, Numbers, Patterns, Retired, SketchBlobs},
    protocol::Event,
};

/// `source → T`, one drain result per non-empty source.
pub type Snapshot<T> = FxHashMap<String, T>;

/// Everything removed by [`Registry::drain_all`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    /// Numeric metrics and rolling estimates
    pub numeric: Snapshot<Numbers>,
    /// Pattern metrics
    pub patterns: Snapshot<Patterns>,
    /// Marshalled daily sketches, for the state file
    pub daily_state: Snapshot<SketchBlobs>,
}

/// All live accumulators, keyed by source.
#[derive(Debug, Default)]
pub struct Registry {
    limits: Limits,
    sources: RwLock<FxHashMap<String, Arc<Accumulator>>>,
}

impl Registry {
    /// Create an empty registry whose accumulators obey `limits`.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            sources: RwLock::new(FxHashMap::default()),
        }
    }

    /// Return the accumulator for `source`, creating it on first use.
    ///
    /// Concurrent first calls for the same source all receive the same
    /// instance.
    pub fn get_or_create(&self, source: &str) -> Arc<Accumulator> {
        if let Some(acc) = self.sources.read().get(source) {
            return Arc::clone(acc);
        }

        let candidate = Arc::new(Accumulator::new(source, self.limits));
        let mut sources = self.sources.write();
        if let Some(acc) = sources.get(source) {
            return Arc::clone(acc);
        }
        debug!(source, "new source");
        sources.insert(source.to_owned(), Arc::clone(&candidate));
        candidate
    }

    fn with_live<F>(&self, source: &str, write: F)
    where
        F: Fn(&Accumulator) -> Result<(), Retired>,
    {
        // A retired accumulator is out of the map before it refuses writes,
        // so the next lookup finds or creates its successor.
        loop {
            if write(&self.get_or_create(source)).is_ok() {
                return;
            }
        }
    }

    /// Apply a decoded event to its source's accumulator.
    pub fn dispatch(&self, event: &Event<'_>) {
        self.with_live(event.source, |acc| acc.apply(event.metric, &event.op));
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    /// True if no source is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    fn each(&self) -> Vec<Arc<Accumulator>> {
        self.sources.read().values().cloned().collect()
    }

    fn take_each<T, F>(&self, take: F) -> Snapshot<FxHashMap<String, T>>
    where
        F: Fn(&Accumulator) -> FxHashMap<String, T>,
    {
        self.each()
            .into_iter()
            .filter_map(|acc| {
                let taken = take(&acc);
                (!taken.is_empty()).then(|| (acc.name().to_owned(), taken))
            })
            .collect()
    }

    /// Take numeric metrics and rolling estimates from every source.
    /// Sources stay registered.
    pub fn take_numeric(&self) -> Snapshot<Numbers> {
        self.take_each(Accumulator::take_numeric)
    }

    /// Take pattern metrics from every source. Sources stay registered.
    pub fn take_patterns(&self) -> Snapshot<Patterns> {
        self.take_each(Accumulator::take_patterns)
    }

    /// Take daily estimates from every source. Sources stay registered.
    pub fn take_daily(&self) -> Snapshot<Numbers> {
        self.take_each(Accumulator::take_daily)
    }

    /// Marshal every source's daily sketches without clearing them.
    #[must_use]
    pub fn export_daily_state(&self) -> Snapshot<SketchBlobs> {
        self.take_each(Accumulator::export_daily_state)
    }

    /// Restore daily sketches, creating sources as needed.
    pub fn import_daily_state(&self, state: &Snapshot<SketchBlobs>) {
        for (source, blobs) in state {
            self.with_live(source, |acc| acc.import_daily_state(blobs));
        }
    }

    /// Retire and remove every source that holds nothing.
    ///
    /// Returns the number of sources removed.
    pub fn prune_idle(&self) -> usize {
        let mut sources = self.sources.write();
        let before = sources.len();
        sources.retain(|_, acc| !acc.retire_if_idle());
        before - sources.len()
    }

    /// Detach every accumulator and take all of their state.
    ///
    /// The map is swapped for an empty one under the write lock. The detached
    /// accumulators are retired after it is released, so a source that writes
    /// meanwhile starts a fresh accumulator.
    pub fn drain_all(&self) -> Drained {
        let detached = std::mem::take(&mut *self.sources.write());

        let mut drained = Drained::default();
        for (source, acc) in detached {
            let remains = acc.retire();
            if !remains.numeric.is_empty() {
                drained.numeric.insert(source.clone(), remains.numeric);
            }
            if !remains.patterns.is_empty() {
                drained.patterns.insert(source.clone(), remains.patterns);
            }
            if !remains.daily_state.is_empty() {
                drained.daily_state.insert(source, remains.daily_state);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Barrier,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;
    use crate::{metric::Kind, protocol, SketchSet};

    #[test]
    fn concurrent_first_calls_share_one_instance() {
        const THREADS: usize = 16;
        let registry = Registry::default();
        let barrier = Barrier::new(THREADS);

        let accs: Vec<Arc<Accumulator>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.get_or_create("web/1")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(registry.len(), 1);
        for acc in &accs[1..] {
            assert!(Arc::ptr_eq(&accs[0], acc));
        }
    }

    #[test]
    fn concurrent_writes_are_not_lost() {
        let registry = Registry::default();
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        let event = protocol::decode(b"RL:app1:reqs:P:1").unwrap();
                        registry.dispatch(&event);
                    }
                });
            }
        });
        assert_eq!(registry.take_numeric()["app1"]["reqs"], 8000);
    }

    #[test]
    fn dispatch_routes_by_source() {
        let registry = Registry::default();
        for wire in [
            "RL:app1:reqs:P:5",
            "RL:app2:reqs:P:7",
            "RL:app1:hits:T:2:/home",
        ] {
            registry.dispatch(&protocol::decode(wire.as_bytes()).unwrap());
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_or_create("app1").value("reqs"), Some(5));
        assert_eq!(registry.get_or_create("app2").value("reqs"), Some(7));
        assert_eq!(
            registry.get_or_create("app1").pattern_value("hits", "/home"),
            Some(2)
        );
    }

    #[test]
    fn takes_are_destructive_and_keep_sources() {
        let registry = Registry::default();
        let acc = registry.get_or_create("app1");
        acc.record("reqs", Kind::Sum, 5).unwrap();
        acc.record_pattern("hits", "/home", Kind::Sum, 1).unwrap();
        acc.insert_cardinality(SketchSet::Daily, "users", "u1").unwrap();
        registry.get_or_create("idle");

        let numeric = registry.take_numeric();
        assert_eq!(numeric.len(), 1);
        assert_eq!(numeric["app1"]["reqs"], 5);
        assert!(registry.take_numeric().is_empty());

        // The other categories survived the numeric drain.
        assert_eq!(registry.take_patterns()["app1"]["hits"]["/home"], 1);
        assert_eq!(registry.take_daily()["app1"]["users"], 1);
        assert!(registry.take_patterns().is_empty());
        assert!(registry.take_daily().is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn drain_all_detaches_sources() {
        let registry = Registry::default();
        let old = registry.get_or_create("app1");
        old.record("reqs", Kind::Sum, 5).unwrap();
        old.record_pattern("hits", "/home", Kind::Set, 9).unwrap();
        old.insert_cardinality(SketchSet::Daily, "users", "u1").unwrap();

        let drained = registry.drain_all();
        assert!(registry.is_empty());
        assert_eq!(drained.numeric["app1"]["reqs"], 5);
        assert_eq!(drained.patterns["app1"]["hits"]["/home"], 9);
        assert!(drained.daily_state["app1"].contains_key("users"));

        let fresh = registry.get_or_create("app1");
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.value("reqs"), None);
    }

    #[test]
    fn daily_state_round_trips_through_registry() {
        let registry = Registry::default();
        for i in 0..100 {
            registry
                .get_or_create("app1")
                .insert_cardinality(SketchSet::Daily, "users", &format!("u{i}"))
                .unwrap();
        }
        let state = registry.export_daily_state();

        let restored = Registry::default();
        restored.import_daily_state(&state);
        assert_eq!(restored.take_daily(), registry.take_daily());
    }

    #[test]
    fn idle_sources_are_pruned_after_a_flush() {
        let registry = Registry::default();
        for i in 0..1000 {
            let wire = format!("RL:app{i}:reqs:P:1");
            registry.dispatch(&protocol::decode(wire.as_bytes()).unwrap());
        }
        registry
            .get_or_create("keeper")
            .insert_cardinality(SketchSet::Daily, "users", "u1")
            .unwrap();
        assert_eq!(registry.len(), 1001);

        let numeric = registry.take_numeric();
        assert_eq!(numeric.len(), 1000);
        assert_eq!(registry.prune_idle(), 1000);
        // Daily sketches keep their source alive until the daily drain.
        assert_eq!(registry.len(), 1);

        let _ = registry.take_daily();
        assert_eq!(registry.prune_idle(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn writes_to_a_pruned_source_follow_it() {
        let registry = Registry::default();
        let stale = registry.get_or_create("app1");
        assert_eq!(registry.prune_idle(), 1);
        assert!(stale.is_retired());
        assert_eq!(stale.record("reqs", Kind::Sum, 5), Err(Retired));

        registry.dispatch(&protocol::decode(b"RL:app1:reqs:P:5").unwrap());
        assert_eq!(registry.take_numeric()["app1"]["reqs"], 5);
    }

    #[test]
    fn write_after_drain_all_lands_in_the_next_drain() {
        let registry = Registry::default();
        let stale = registry.get_or_create("app1");
        assert_eq!(registry.drain_all(), Drained::default());
        assert_eq!(stale.record("reqs", Kind::Sum, 5), Err(Retired));

        registry.dispatch(&protocol::decode(b"RL:app1:reqs:P:5").unwrap());
        assert_eq!(registry.drain_all().numeric["app1"]["reqs"], 5);
    }

    #[test]
    fn no_write_is_lost_across_concurrent_drains() {
        const WRITERS: usize = 4;
        const WRITES: i64 = 5000;
        let registry = Registry::default();
        let done = AtomicUsize::new(0);

        let mut total = thread::scope(|scope| {
            for _ in 0..WRITERS {
                scope.spawn(|| {
                    let event = protocol::decode(b"RL:app1:reqs:P:1").unwrap();
                    for _ in 0..WRITES {
                        registry.dispatch(&event);
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
            let mut total = 0;
            let mut round = 0u64;
            while done.load(Ordering::SeqCst) < WRITERS {
                round += 1;
                let drained = if round % 2 == 0 {
                    registry.drain_all().numeric
                } else {
                    let taken = registry.take_numeric();
                    registry.prune_idle();
                    taken
                };
                total += drained.get("app1").map_or(0, |m| m["reqs"]);
            }
            total
        });
        total += registry
            .drain_all()
            .numeric
            .get("app1")
            .map_or(0, |m| m["reqs"]);
        assert_eq!(total, i64::try_from(WRITERS).unwrap() * WRITES);
    }
}
