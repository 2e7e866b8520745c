use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::infra::{Dijkstra, Position, ShortestPathTree};

/// Connectivity of one scan as stored in the dataset file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSpec {
    pub viewpoints: BTreeMap<String, Position>,
    pub edges: Vec<(String, String)>,
}

/// Navigation graph of one scan with all-pairs shortest paths.
#[derive(Debug, Clone)]
pub struct NavGraph {
    scan: String,
    positions: HashMap<String, Position>,
    adjacency: HashMap<String, Vec<(String, f32)>>,
    trees: HashMap<String, ShortestPathTree>,
}

impl NavGraph {
    pub fn new(scan: &str, spec: &ScanSpec) -> Result<Self> {
        let positions: HashMap<String, Position> = spec
            .viewpoints
            .iter()
            .map(|(id, pos)| (id.clone(), *pos))
            .collect();

        let mut adjacency: HashMap<String, Vec<(String, f32)>> = positions
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();

        for (a, b) in &spec.edges {
            let pa = Self::lookup(scan, &positions, a)?;
            let pb = Self::lookup(scan, &positions, b)?;
            let weight = pa.distance(&pb);
            if let Some(list) = adjacency.get_mut(a) {
                list.push((b.clone(), weight));
            }
            if let Some(list) = adjacency.get_mut(b) {
                list.push((a.clone(), weight));
            }
        }

        for list in adjacency.values_mut() {
            list.sort_by(|x, y| x.0.cmp(&y.0));
            list.dedup_by(|x, y| x.0 == y.0);
        }

        let trees = positions
            .keys()
            .map(|id| (id.clone(), Dijkstra::from_source(&adjacency, id)))
            .collect();

        Ok(Self {
            scan: scan.to_string(),
            positions,
            adjacency,
            trees,
        })
    }

    fn lookup(scan: &str, positions: &HashMap<String, Position>, id: &str) -> Result<Position> {
        positions
            .get(id)
            .copied()
            .ok_or_else(|| AgentError::UnknownViewpoint {
                scan: scan.to_string(),
                viewpoint: id.to_string(),
            })
    }

    pub fn scan(&self) -> &str {
        &self.scan
    }

    pub fn contains(&self, viewpoint: &str) -> bool {
        self.positions.contains_key(viewpoint)
    }

    pub fn position(&self, viewpoint: &str) -> Result<Position> {
        Self::lookup(&self.scan, &self.positions, viewpoint)
    }

    /// Neighbors sorted by viewpoint id.
    pub fn neighbors(&self, viewpoint: &str) -> &[(String, f32)] {
        self.adjacency
            .get(viewpoint)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    /// Geodesic distance; infinite when unreachable or unknown.
    pub fn distance(&self, from: &str, to: &str) -> f32 {
        self.trees
            .get(from)
            .and_then(|tree| tree.distance(to))
            .unwrap_or(f32::INFINITY)
    }

    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        self.trees.get(from).and_then(|tree| tree.path_to(to))
    }

    /// First step on the shortest path from `from` to `goal`, or `from` itself when already there.
    pub fn next_hop(&self, from: &str, goal: &str) -> String {
        match self.shortest_path(from, goal) {
            Some(path) if path.len() > 1 => path[1].clone(),
            _ => from.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Three viewpoints on a line two meters apart, plus a branch off the middle.
    pub(crate) fn corridor() -> ScanSpec {
        let mut viewpoints = BTreeMap::new();
        viewpoints.insert("a".to_string(), Position::new(0.0, 0.0, 0.0));
        viewpoints.insert("b".to_string(), Position::new(0.0, 2.0, 0.0));
        viewpoints.insert("c".to_string(), Position::new(0.0, 4.0, 0.0));
        viewpoints.insert("d".to_string(), Position::new(3.0, 2.0, 0.0));
        ScanSpec {
            viewpoints,
            edges: vec![
                ("a".to_string(), "b".to_string()),
                ("b".to_string(), "c".to_string()),
                ("b".to_string(), "d".to_string()),
            ],
        }
    }

    #[test]
    fn test_distances_and_next_hop() {
        let graph = NavGraph::new("scan", &corridor()).unwrap();
        assert!((graph.distance("a", "c") - 4.0).abs() < 1e-6);
        assert!((graph.distance("a", "d") - 5.0).abs() < 1e-6);
        assert_eq!(graph.next_hop("a", "c"), "b");
        assert_eq!(graph.next_hop("c", "c"), "c");
        assert_eq!(
            graph.neighbors("b").iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c", "d"]
        );
    }

    #[test]
    fn test_unknown_edge_endpoint_is_rejected() {
        let mut spec = corridor();
        spec.edges.push(("a".to_string(), "missing".to_string()));
        assert!(matches!(
            NavGraph::new("scan", &spec),
            Err(AgentError::UnknownViewpoint { .. })
        ));
    }
}
