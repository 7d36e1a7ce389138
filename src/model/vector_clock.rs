//! Vector clocks
//!
//! Per-replica logical time used to order events across replicas.
//! Absence of a replica in the map means its clock reads 0.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: BTreeMap<String, u64>,
}

/// The relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica: &str) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Advance this replica's own coordinate by one. Called on every
    /// local append (spec §4.6).
    pub fn increment(&mut self, replica: &str) {
        *self.clocks.entry(replica.to_string()).or_insert(0) += 1;
    }

    /// Pointwise max merge; the result is `>=` each input on every
    /// coordinate.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clocks.clone();
        for (replica, &value) in &other.clocks {
            let entry = merged.entry(replica.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
        VectorClock { clocks: merged }
    }

    fn replicas<'a>(&'a self, other: &'a VectorClock) -> impl Iterator<Item = &'a String> {
        self.clocks.keys().chain(other.clocks.keys())
    }

    /// `a.happens_before(b)` iff `a[r] <= b[r]` for every replica `r`
    /// and `a[r] < b[r]` for at least one.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::Before)
    }

    pub fn concurrent(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::Concurrent)
    }

    /// True if `self` is ahead of `other` on at least one coordinate,
    /// regardless of the relationship on the rest — the sync
    /// protocol's "has anything new for me" test, weaker than
    /// `happens_before`/`concurrent` since it doesn't care whether
    /// `other` is also ahead somewhere else.
    pub fn exceeds_on_any_coordinate(&self, other: &VectorClock) -> bool {
        self.replicas(other).any(|r| self.get(r) > other.get(r))
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        for replica in self.replicas(other) {
            match self.get(replica).cmp(&other.get(replica)) {
                Ordering::Greater => self_greater = true,
                Ordering::Less => other_greater = true,
                Ordering::Equal => {}
            }
        }

        match (self_greater, other_greater) {
            (false, false) => ClockOrdering::Equal,
            (false, true) => ClockOrdering::Before,
            (true, false) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, u64> {
        &self.clocks
    }

    pub fn from_map(clocks: BTreeMap<String, u64>) -> Self {
        Self { clocks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happens_before_is_strict() {
        let mut a = VectorClock::new();
        a.increment("r1");
        let mut b = a.clone();
        b.increment("r1");

        assert!(a.happens_before(&b));
        assert!(!b.happens_before(&a));
        assert!(!a.happens_before(&a));
    }

    #[test]
    fn concurrent_is_symmetric() {
        let mut a = VectorClock::new();
        a.increment("r1");
        let mut b = VectorClock::new();
        b.increment("r2");

        assert!(a.concurrent(&b));
        assert!(b.concurrent(&a));
    }

    #[test]
    fn merge_dominates_both_inputs() {
        let mut a = VectorClock::new();
        a.increment("r1");
        let mut b = VectorClock::new();
        b.increment("r2");
        b.increment("r2");

        let merged = a.merge(&b);
        assert!(a.happens_before(&merged) || a == merged);
        assert!(b.happens_before(&merged) || b == merged);
        assert_eq!(merged.get("r1"), 1);
        assert_eq!(merged.get("r2"), 2);
    }

    #[test]
    fn absence_means_zero() {
        let clock = VectorClock::new();
        assert_eq!(clock.get("anything"), 0);
    }

    #[test]
    fn partial_order_is_transitive_on_a_chain() {
        let mut a = VectorClock::new();
        a.increment("r1");
        let mut b = a.clone();
        b.increment("r1");
        let mut c = b.clone();
        c.increment("r1");

        assert!(a.happens_before(&b));
        assert!(b.happens_before(&c));
        assert!(a.happens_before(&c));
    }

    #[test]
    fn exceeds_on_any_coordinate_ignores_the_rest() {
        let mut a = VectorClock::new();
        a.increment("r1");
        a.increment("r2");
        a.increment("r2");

        let mut b = VectorClock::new();
        b.increment("r1");
        b.increment("r1");
        b.increment("r1");

        // a is behind b on r1 but ahead on r2: concurrent, and each
        // exceeds the other on its own coordinate.
        assert!(a.concurrent(&b));
        assert!(a.exceeds_on_any_coordinate(&b));
        assert!(b.exceeds_on_any_coordinate(&a));
    }

    const REPLICAS: &[&str] = &["r1", "r2", "r3"];

    fn arb_clock() -> impl proptest::strategy::Strategy<Value = VectorClock> {
        proptest::collection::vec(0u64..5, REPLICAS.len()).prop_map(|counts| {
            let mut clock = VectorClock::new();
            for (name, count) in REPLICAS.iter().zip(counts) {
                for _ in 0..count {
                    clock.increment(name);
                }
            }
            clock
        })
    }

    proptest::proptest! {
        /// `concurrent` is defined as "neither happens-before the
        /// other", which is symmetric in both its inputs by
        /// construction — spec §8's vector-clock law.
        #[test]
        fn concurrent_is_symmetric_prop(a in arb_clock(), b in arb_clock()) {
            proptest::prop_assert_eq!(a.concurrent(&b), b.concurrent(&a));
        }

        #[test]
        fn merge_is_pointwise_at_least_both_inputs(a in arb_clock(), b in arb_clock()) {
            let merged = a.merge(&b);
            for r in REPLICAS {
                proptest::prop_assert!(merged.get(r) >= a.get(r));
                proptest::prop_assert!(merged.get(r) >= b.get(r));
            }
        }

        #[test]
        fn happens_before_is_irreflexive(a in arb_clock()) {
            proptest::prop_assert!(!a.happens_before(&a));
        }

        #[test]
        fn happens_before_is_antisymmetric(a in arb_clock(), b in arb_clock()) {
            if a.happens_before(&b) {
                proptest::prop_assert!(!b.happens_before(&a));
            }
        }

        /// Any two clocks are related by exactly one of equal,
        /// before, after, concurrent.
        #[test]
        fn ordering_is_a_total_partition(a in arb_clock(), b in arb_clock()) {
            let relations = [
                a == b,
                a.happens_before(&b),
                b.happens_before(&a),
                a.concurrent(&b),
            ];
            proptest::prop_assert_eq!(relations.iter().filter(|r| **r).count(), 1);
        }
    }
}
