//! Client-to-node network distances used as placement costs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Distance reported when no measurement exists for a (client, node) pair.
/// Large enough to push the solver away from unknown links without making
/// them infeasible.
pub const UNKNOWN_DISTANCE: f64 = 10_000.0;

/// Live view of the network as reported by the user-equipment feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkTopology {
    distances: BTreeMap<String, BTreeMap<String, f64>>,
}

impl NetworkTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_distance(&mut self, client: &str, node: &str, distance: f64) {
        self.distances
            .entry(client.to_string())
            .or_default()
            .insert(node.to_string(), distance);
    }

    pub fn distance(&self, client: &str, node: &str) -> f64 {
        self.distances
            .get(client)
            .and_then(|d| d.get(node))
            .copied()
            .unwrap_or(UNKNOWN_DISTANCE)
    }

    pub fn forget_client(&mut self, client: &str) {
        self.distances.remove(client);
    }

    /// Immutable matrix for the given clients and nodes, handed to the
    /// placement search so it never touches the live topology.
    pub fn snapshot<'a>(
        &self,
        clients: impl IntoIterator<Item = &'a str>,
        nodes: impl IntoIterator<Item = &'a str>,
    ) -> NetworkDistances {
        let nodes: Vec<&str> = nodes.into_iter().collect();
        let mut matrix = BTreeMap::new();
        for client in clients {
            for node in &nodes {
                matrix.insert((client.to_string(), node.to_string()), self.distance(client, node));
            }
        }
        NetworkDistances { matrix }
    }
}

/// Frozen distance matrix queried during one placement search.
#[derive(Debug, Clone, Default)]
pub struct NetworkDistances {
    matrix: BTreeMap<(String, String), f64>,
}

impl NetworkDistances {
    pub fn distance(&self, client: &str, node: &str) -> f64 {
        self.matrix
            .get(&(client.to_string(), node.to_string()))
            .copied()
            .unwrap_or(UNKNOWN_DISTANCE)
    }
}
