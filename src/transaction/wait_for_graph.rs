use std::collections::{HashMap, HashSet};

use crate::types::TrxId;

/// The transaction waiting graph: an edge `A -> B` means `A` is an
/// unacquired waiter whose wait set includes `B`.
pub(crate) struct WaitForGraph {
    graph: HashMap<TrxId, HashSet<TrxId>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self {
            graph: HashMap::new(),
        }
    }

    pub(crate) fn add_edge(&mut self, from: TrxId, to: TrxId) {
        self.graph.entry(from).or_insert_with(HashSet::new).insert(to);
    }

    /// Drop one edge; reports whether `from` now waits on nobody.
    pub(crate) fn remove_edge(&mut self, from: TrxId, to: TrxId) -> bool {
        match self.graph.get_mut(&from) {
            Some(waiting_on) => {
                waiting_on.remove(&to);
                if waiting_on.is_empty() {
                    self.graph.remove(&from);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    pub(crate) fn remove_waiter(&mut self, from: TrxId) {
        self.graph.remove(&from);
    }

    pub(crate) fn is_waiting(&self, trx_id: TrxId) -> bool {
        self.graph.contains_key(&trx_id)
    }

    /// Whether any path from one of `root`'s wait targets leads back to
    /// `root`. Called on every acquire, before the requester starts
    /// waiting, so a cycle is never actually instated.
    pub(crate) fn has_cycle_through(&self, root: TrxId) -> bool {
        let mut visited = HashSet::new();
        match self.graph.get(&root) {
            Some(waiting_on) => waiting_on
                .iter()
                .any(|&next| self.reaches(next, root, &mut visited)),
            None => false,
        }
    }

    fn reaches(&self, current: TrxId, root: TrxId, visited: &mut HashSet<TrxId>) -> bool {
        if current == root {
            return true;
        }
        if !visited.insert(current) {
            return false;
        }

        match self.graph.get(&current) {
            Some(waiting_on) => waiting_on
                .iter()
                .any(|&next| self.reaches(next, root, visited)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle_on_chain() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);

        assert!(!graph.has_cycle_through(1));
        assert!(!graph.has_cycle_through(2));
        assert!(graph.is_waiting(1));
        assert!(!graph.is_waiting(3));
    }

    #[test]
    fn test_two_party_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);

        assert!(graph.has_cycle_through(1));
        assert!(graph.has_cycle_through(2));
    }

    #[test]
    fn test_long_cycle_detected_from_every_member() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 4);
        graph.add_edge(4, 1);
        // a dead-end branch must not confuse the walk
        graph.add_edge(2, 9);

        for trx in 1..=4 {
            assert!(graph.has_cycle_through(trx));
        }
        assert!(!graph.has_cycle_through(9));
    }

    #[test]
    fn test_remove_edge_empties_wait_set() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(1, 3);

        assert!(!graph.remove_edge(1, 2));
        assert!(graph.remove_edge(1, 3));
        assert!(!graph.is_waiting(1));
    }
}
