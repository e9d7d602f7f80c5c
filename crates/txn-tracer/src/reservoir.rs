// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity reservoir sampling shared by every event kind.
//!
//! The reservoir keeps a uniform sample of everything it has seen: once full,
//! the n-th arrival replaces a random slot with probability `capacity / n`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, MutexGuard};

/// The contents of a reservoir at harvest time.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservoirSnapshot<T> {
    pub reservoir_size: usize,
    pub events_seen: u64,
    pub items: Vec<T>,
}

#[derive(Debug)]
pub struct Reservoir<T> {
    capacity: usize,
    events_seen: u64,
    items: Vec<T>,
    rng: StdRng,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_rng(capacity, StdRng::from_entropy())
    }

    /// Deterministic reservoir for tests and replays.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self::with_rng(capacity, StdRng::seed_from_u64(seed))
    }

    fn with_rng(capacity: usize, rng: StdRng) -> Self {
        Self {
            capacity,
            events_seen: 0,
            // Capacities run into the tens of thousands; grow on demand.
            items: Vec::new(),
            rng,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A zero-capacity reservoir records nothing and is omitted from harvests.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Offers an item to the reservoir. Returns whether it was kept.
    pub fn add(&mut self, item: T) -> bool {
        if self.capacity == 0 {
            return false;
        }

        self.events_seen += 1;

        if self.items.len() < self.capacity {
            self.items.push(item);
            return true;
        }

        let slot = self.rng.gen_range(0..self.events_seen);
        if let Ok(slot) = usize::try_from(slot) {
            if slot < self.capacity {
                self.items[slot] = item;
                return true;
            }
        }
        false
    }

    /// Returns the current contents and starts a new window.
    pub fn drain(&mut self) -> ReservoirSnapshot<T> {
        let snapshot = ReservoirSnapshot {
            reservoir_size: self.capacity,
            events_seen: self.events_seen,
            items: std::mem::take(&mut self.items),
        };
        self.events_seen = 0;
        snapshot
    }
}

/// A reservoir that several transactions feed concurrently.
#[derive(Debug)]
pub struct SharedReservoir<T> {
    inner: Mutex<Reservoir<T>>,
}

impl<T> SharedReservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Self::from_reservoir(Reservoir::new(capacity))
    }

    pub fn from_reservoir(reservoir: Reservoir<T>) -> Self {
        Self {
            inner: Mutex::new(reservoir),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Reservoir<T>> {
        // The reservoir is consistent between calls, so a panic elsewhere
        // while holding the lock does not invalidate it.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn add(&self, item: T) -> bool {
        self.lock().add(item)
    }

    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) {
        let mut reservoir = self.lock();
        for item in items {
            reservoir.add(item);
        }
    }

    /// Drains the reservoir, or returns `None` when it is disabled so the
    /// payload section can be omitted entirely.
    pub fn drain(&self) -> Option<ReservoirSnapshot<T>> {
        let mut reservoir = self.lock();
        if !reservoir.is_enabled() {
            return None;
        }
        Some(reservoir.drain())
    }

    pub fn events_seen(&self) -> u64 {
        self.lock().events_seen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fills_before_sampling() {
        let mut reservoir = Reservoir::with_seed(3, 7);
        for i in 0..3 {
            assert!(reservoir.add(i));
        }
        assert_eq!(reservoir.items(), &[0, 1, 2]);
        assert_eq!(reservoir.events_seen(), 3);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut reservoir = Reservoir::with_seed(0, 7);
        for i in 0..10 {
            assert!(!reservoir.add(i));
        }
        assert_eq!(reservoir.events_seen(), 0);
        assert!(reservoir.is_empty());

        let shared = SharedReservoir::from_reservoir(reservoir);
        assert!(shared.drain().is_none());
    }

    #[test]
    fn test_drain_resets_window() {
        let mut reservoir = Reservoir::with_seed(2, 1);
        for i in 0..5 {
            reservoir.add(i);
        }
        let snapshot = reservoir.drain();
        assert_eq!(snapshot.reservoir_size, 2);
        assert_eq!(snapshot.events_seen, 5);
        assert_eq!(snapshot.items.len(), 2);

        assert_eq!(reservoir.events_seen(), 0);
        assert!(reservoir.is_empty());
        reservoir.add(9);
        assert_eq!(reservoir.drain().items, vec![9]);
    }

    #[test]
    fn test_fast_harvest_allotment() {
        let shared = SharedReservoir::from_reservoir(Reservoir::with_seed(8333, 42));
        shared.extend(0..20_000);
        let snapshot = shared.drain().expect("reservoir is enabled");
        assert_eq!(snapshot.events_seen, 20_000);
        assert_eq!(snapshot.items.len(), 8333);
    }

    #[test]
    fn test_sampling_is_roughly_uniform() {
        // Each of 10 arrivals should survive in a capacity-5 reservoir about
        // half of the time.
        let mut hits = [0u32; 10];
        for seed in 0..2000 {
            let mut reservoir = Reservoir::with_seed(5, seed);
            for i in 0..10 {
                reservoir.add(i);
            }
            for &kept in reservoir.items() {
                hits[kept] += 1;
            }
        }
        for count in hits {
            assert!((800..1200).contains(&count), "skewed sample: {hits:?}");
        }
    }

    proptest! {
        #[test]
        fn prop_counts_are_exact(capacity in 0usize..64, arrivals in 0u64..512, seed: u64) {
            let mut reservoir = Reservoir::with_seed(capacity, seed);
            for i in 0..arrivals {
                reservoir.add(i);
            }
            let snapshot = reservoir.drain();
            if capacity == 0 {
                prop_assert_eq!(snapshot.events_seen, 0);
            } else {
                prop_assert_eq!(snapshot.events_seen, arrivals);
            }
            let expected_len = usize::try_from(arrivals).unwrap().min(capacity);
            prop_assert_eq!(snapshot.items.len(), expected_len);
        }
    }
}
