//! Per-characteristic subscriber tracking

use crate::gatt::{CentralId, CharRef};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Subscribed initiators per characteristic, each with the largest payload it
/// can take in one notification
#[derive(Debug, Clone, Default)]
pub struct SubscriberSets {
    sets: HashMap<CharRef, BTreeMap<CentralId, usize>>,
    generation: u64,
}

impl SubscriberSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `central` was already subscribed with the same bound
    pub fn subscribe(&mut self, at: CharRef, central: CentralId, max_update_len: usize) -> bool {
        let previous = self.sets.entry(at).or_default().insert(central, max_update_len);
        let changed = previous != Some(max_update_len);
        if changed {
            self.generation += 1;
        }
        changed
    }

    pub fn unsubscribe(&mut self, at: CharRef, central: CentralId) -> bool {
        let Some(set) = self.sets.get_mut(&at) else {
            return false;
        };
        let removed = set.remove(&central).is_some();
        if set.is_empty() {
            self.sets.remove(&at);
        }
        if removed {
            self.generation += 1;
        }
        removed
    }

    pub fn subscribers(&self, at: CharRef) -> Vec<CentralId> {
        self.sets
            .get(&at)
            .map(|set| set.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, at: CharRef) -> usize {
        self.sets.get(&at).map_or(0, |set| set.len())
    }

    pub fn counts(&self) -> HashMap<CharRef, usize> {
        self.sets.iter().map(|(at, set)| (*at, set.len())).collect()
    }

    /// Smallest update bound among `targets`, or among every subscriber when
    /// `targets` is empty. `None` when no bound is known.
    pub fn max_update_len(&self, at: CharRef, targets: &[CentralId]) -> Option<usize> {
        let set = self.sets.get(&at)?;
        if targets.is_empty() {
            set.values().copied().min()
        } else {
            targets.iter().filter_map(|c| set.get(c).copied()).min()
        }
    }

    /// Drop every set belonging to `service`
    pub fn clear_service(&mut self, service: Uuid) {
        let before = self.sets.len();
        self.sets.retain(|at, _| at.service != service);
        if self.sets.len() != before {
            self.generation += 1;
        }
    }

    pub fn clear(&mut self) {
        if !self.sets.is_empty() {
            self.sets.clear();
            self.generation += 1;
        }
    }

    /// Change counter bumped on every subscription change
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{TARGET_CHARACTERISTIC_UUID, TARGET_SERVICE_UUID};

    fn target() -> CharRef {
        CharRef::new(TARGET_SERVICE_UUID, TARGET_CHARACTERISTIC_UUID)
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let mut sets = SubscriberSets::new();
        let central = CentralId::random();

        assert!(sets.subscribe(target(), central, 20));
        assert!(!sets.subscribe(target(), central, 20));
        assert_eq!(sets.count(target()), 1);
        assert_eq!(sets.generation(), 1);

        assert!(sets.unsubscribe(target(), central));
        assert!(!sets.unsubscribe(target(), central));
        assert_eq!(sets.count(target()), 0);
        assert_eq!(sets.generation(), 2);
        assert!(sets.counts().is_empty());
    }

    #[test]
    fn test_min_update_len() {
        let mut sets = SubscriberSets::new();
        let (a, b) = (CentralId::random(), CentralId::random());
        sets.subscribe(target(), a, 20);
        sets.subscribe(target(), b, 185);

        assert_eq!(sets.max_update_len(target(), &[]), Some(20));
        assert_eq!(sets.max_update_len(target(), &[b]), Some(185));
        assert_eq!(sets.max_update_len(target(), &[CentralId::random()]), None);
        assert_eq!(
            sets.max_update_len(CharRef::new(TARGET_SERVICE_UUID, Uuid::new_v4()), &[]),
            None
        );
    }

    #[test]
    fn test_clear_moves_generation_only_when_sets_change() {
        let mut sets = SubscriberSets::new();
        sets.clear();
        assert_eq!(sets.generation(), 0);

        sets.subscribe(target(), CentralId::random(), 20);
        sets.clear();
        assert_eq!(sets.count(target()), 0);
        assert_eq!(sets.generation(), 2);
    }

    #[test]
    fn test_clear_service() {
        let mut sets = SubscriberSets::new();
        sets.subscribe(target(), CentralId::random(), 20);
        let generation = sets.generation();

        sets.clear_service(TARGET_SERVICE_UUID);
        assert_eq!(sets.count(target()), 0);
        assert_eq!(sets.generation(), generation + 1);
    }
}
