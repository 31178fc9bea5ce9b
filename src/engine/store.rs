//! Trajectories currently known to the engine.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::filter::TrajectoryFilter;
use super::trajectory::Trajectory;
use crate::constants::TRAJECTORY_TTL;

#[derive(Debug, Clone)]
struct Entry {
    trajectory: Trajectory,
    updated_at: Instant,
}

/// Trajectories keyed by vehicle id.
///
/// Every stored trajectory passes the current filter. Entries not updated
/// within the TTL are dropped by [`Self::purge_stale`].
#[derive(Debug)]
pub struct TrajectoryStore {
    entries: HashMap<String, Entry>,
    filter: TrajectoryFilter,
    ttl: Duration,
}

impl Default for TrajectoryStore {
    fn default() -> Self {
        Self::new(TRAJECTORY_TTL)
    }
}

impl TrajectoryStore {
    /// Empty store with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            filter: TrajectoryFilter::default(),
            ttl,
        }
    }

    /// Insert or replace a trajectory. A trajectory the filter rejects is
    /// not stored and evicts any previous version. Returns whether it was
    /// stored.
    pub fn upsert(&mut self, trajectory: Trajectory, now: Instant) -> bool {
        if !self.filter.matches(&trajectory) {
            if self.entries.remove(&trajectory.id).is_some() {
                log::trace!("[Engine] Evicted {} (filtered out)", trajectory.id);
            }
            return false;
        }
        self.entries.insert(
            trajectory.id.clone(),
            Entry {
                trajectory,
                updated_at: now,
            },
        );
        true
    }

    /// Remove a trajectory by id.
    pub fn remove(&mut self, id: &str) -> Option<Trajectory> {
        self.entries.remove(id).map(|e| e.trajectory)
    }

    /// Drop entries older than the TTL. Returns how many were dropped.
    pub fn purge_stale(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.updated_at) <= ttl);
        let purged = before - self.entries.len();
        if purged > 0 {
            log::debug!("[Engine] Purged {} stale trajectories", purged);
        }
        purged
    }

    /// Replace the filter and evict everything it rejects.
    pub fn set_filter(&mut self, filter: TrajectoryFilter) {
        self.entries.retain(|_, e| filter.matches(&e.trajectory));
        self.filter = filter;
    }

    /// Trajectory by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Trajectory> {
        self.entries.get(id).map(|e| &e.trajectory)
    }

    /// Copies of every stored trajectory, for handing to the renderer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Trajectory> {
        self.entries.values().map(|e| e.trajectory.clone()).collect()
    }

    /// Number of stored trajectories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::trajectory::fixtures;

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut store = TrajectoryStore::default();
        let now = Instant::now();
        assert!(store.upsert(fixtures::trajectory("a", "bus"), now));
        assert!(store.upsert(fixtures::trajectory("a", "tram"), now));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().properties.mot.as_deref(), Some("tram"));
    }

    #[test]
    fn test_filtered_update_evicts_previous_version() {
        let mut store = TrajectoryStore::default();
        store.set_filter(TrajectoryFilter::default().with_mots(["bus"]));
        let now = Instant::now();

        assert!(store.upsert(fixtures::trajectory("a", "bus"), now));
        assert!(!store.upsert(fixtures::trajectory("a", "rail"), now));
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_filter_evicts_non_matching() {
        let mut store = TrajectoryStore::default();
        let now = Instant::now();
        store.upsert(fixtures::trajectory("a", "bus"), now);
        store.upsert(fixtures::trajectory("b", "rail"), now);

        store.set_filter(TrajectoryFilter::default().with_mots(["rail"]));
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
    }

    #[test]
    fn test_purge_stale() {
        let mut store = TrajectoryStore::new(Duration::from_secs(60));
        let start = Instant::now();
        store.upsert(fixtures::trajectory("old", "bus"), start);
        store.upsert(
            fixtures::trajectory("fresh", "bus"),
            start + Duration::from_secs(30),
        );

        assert_eq!(store.purge_stale(start + Duration::from_secs(60)), 0);
        assert_eq!(store.purge_stale(start + Duration::from_secs(61)), 1);
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_remove() {
        let mut store = TrajectoryStore::default();
        store.upsert(fixtures::trajectory("a", "bus"), Instant::now());
        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
    }
}
