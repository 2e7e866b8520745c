use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Clone, PartialEq)]
struct Node {
    id: String,
    cost: f32,
}

impl Eq for Node {}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.total_cmp(&self.cost)
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Single-source shortest paths over a weighted viewpoint graph.
#[derive(Debug, Clone, Default)]
pub struct ShortestPathTree {
    distances: HashMap<String, f32>,
    came_from: HashMap<String, String>,
}

impl ShortestPathTree {
    pub fn distance(&self, to: &str) -> Option<f32> {
        self.distances.get(to).copied()
    }

    /// Path from the source to `to`, both ends included.
    pub fn path_to(&self, to: &str) -> Option<Vec<String>> {
        if !self.distances.contains_key(to) {
            return None;
        }
        Some(reconstruct_path(&self.came_from, to))
    }
}

pub struct Dijkstra;

impl Dijkstra {
    pub fn from_source(adjacency: &HashMap<String, Vec<(String, f32)>>, source: &str) -> ShortestPathTree {
        let mut open_set = BinaryHeap::new();
        let mut distances: HashMap<String, f32> = HashMap::new();
        let mut came_from: HashMap<String, String> = HashMap::new();

        distances.insert(source.to_string(), 0.0);
        open_set.push(Node {
            id: source.to_string(),
            cost: 0.0,
        });

        while let Some(Node { id: current, cost }) = open_set.pop() {
            // Stale heap entry
            if cost > *distances.get(&current).unwrap_or(&f32::INFINITY) {
                continue;
            }

            let Some(neighbors) = adjacency.get(&current) else {
                continue;
            };
            for (neighbor, weight) in neighbors {
                let tentative = cost + weight;
                if tentative < *distances.get(neighbor).unwrap_or(&f32::INFINITY) {
                    came_from.insert(neighbor.clone(), current.clone());
                    distances.insert(neighbor.clone(), tentative);
                    open_set.push(Node {
                        id: neighbor.clone(),
                        cost: tentative,
                    });
                }
            }
        }

        ShortestPathTree {
            distances,
            came_from,
        }
    }
}

fn reconstruct_path(came_from: &HashMap<String, String>, to: &str) -> Vec<String> {
    let mut current = to.to_string();
    let mut path = vec![current.clone()];
    while let Some(prev) = came_from.get(&current) {
        path.push(prev.clone());
        current = prev.clone();
    }
    path.reverse();
    path
}
