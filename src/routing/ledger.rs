//! Per-agent committed load.
//!
//! Reads take a copy-on-write snapshot so selection sees one consistent
//! version; commits are serialized behind the write lock. The ledger is
//! shared across batches.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Default)]
pub struct LoadLedger {
    current: RwLock<Arc<HashMap<String, f64>>>,
}

impl LoadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ledger with the given base loads.
    pub fn seed<I>(&self, loads: I)
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        *self.current.write() = Arc::new(loads.into_iter().collect());
    }

    /// Consistent point-in-time view; never blocks behind a commit in
    /// progress for longer than the map swap.
    pub fn snapshot(&self) -> Arc<HashMap<String, f64>> {
        Arc::clone(&self.current.read())
    }

    /// Apply a load delta and return the agent's new committed load.
    pub fn commit(&self, agent_id: &str, delta: f64) -> f64 {
        let mut guard = self.current.write();
        let mut next: HashMap<String, f64> = (**guard).clone();
        let load = next.entry(agent_id.to_string()).or_insert(0.0);
        *load += delta;
        let new_load = *load;
        *guard = Arc::new(next);
        new_load
    }

    pub fn load_of(&self, agent_id: &str) -> f64 {
        self.snapshot().get(agent_id).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.snapshot().values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_accumulates() {
        let ledger = LoadLedger::new();
        assert_eq!(ledger.commit("a-1", 1.0), 1.0);
        assert_eq!(ledger.commit("a-1", 1.5), 2.5);
        assert_eq!(ledger.load_of("a-1"), 2.5);
    }

    #[test]
    fn test_snapshot_is_stable_across_commits() {
        let ledger = LoadLedger::new();
        ledger.commit("a-1", 1.0);
        let snapshot = ledger.snapshot();
        ledger.commit("a-1", 5.0);
        assert_eq!(snapshot.get("a-1"), Some(&1.0));
        assert_eq!(ledger.load_of("a-1"), 6.0);
    }

    #[test]
    fn test_seed_replaces_state() {
        let ledger = LoadLedger::new();
        ledger.commit("a-1", 3.0);
        ledger.seed([("a-2".to_string(), 2.0)]);
        assert_eq!(ledger.load_of("a-1"), 0.0);
        assert_eq!(ledger.load_of("a-2"), 2.0);
        assert_eq!(ledger.total(), 2.0);
    }

    #[test]
    fn test_concurrent_commits_are_serialized() {
        let ledger = Arc::new(LoadLedger::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    ledger.commit("a-1", 1.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.load_of("a-1"), 800.0);
    }
}
