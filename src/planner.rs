use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::discovery::TrustedNodeRecord;
use crate::error::{KmeError, Result};

/// A directed, weighted overlay graph built from one discovery result.
///
/// Edge `(u, v)` exists iff `v` is in `u.neighbor_tn_ids`; its weight is
/// `u.distance` as the discovering node reported it. This conflates hop
/// count with link cost (see design notes), but is preserved faithfully
/// for interoperability with the rest of the overlay.
struct Graph {
    edges: HashMap<String, Vec<(String, u32)>>,
}

impl Graph {
    fn from_records(records: &[TrustedNodeRecord]) -> Self {
        let mut edges: HashMap<String, Vec<(String, u32)>> = HashMap::new();

        for record in records {
            edges.entry(record.tn_id.clone()).or_default();

            for neighbor in &record.neighbor_tn_ids {
                edges
                    .entry(record.tn_id.clone())
                    .or_default()
                    .push((neighbor.clone(), record.distance));
            }
        }

        Self { edges }
    }

    fn neighbors(&self, node: &str) -> &[(String, u32)] {
        self.edges.get(node).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Dijkstra shortest path over the directed graph built from a discovery
/// result. Ties on total weight are broken by lower `tn_id`
/// lexicographically, so the result is reproducible given the same input.
/// Returns the node sequence including both `src` and `dst`.
pub fn find_path(records: &[TrustedNodeRecord], src: &str, dst: &str) -> Result<Vec<String>> {
    if src == dst {
        return Ok(vec![src.to_string()]);
    }

    let graph = Graph::from_records(records);

    let mut dist: HashMap<String, u32> = HashMap::new();
    let mut prev: HashMap<String, String> = HashMap::new();
    let mut heap: BinaryHeap<Reverse<(u32, String)>> = BinaryHeap::new();

    dist.insert(src.to_string(), 0);
    heap.push(Reverse((0, src.to_string())));

    while let Some(Reverse((d, node))) = heap.pop() {
        if let Some(&best) = dist.get(&node) {
            if d > best {
                continue;
            }
        }

        if node == dst {
            break;
        }

        let mut neighbors: Vec<&(String, u32)> = graph.neighbors(&node).iter().collect();
        neighbors.sort_by(|a, b| a.0.cmp(&b.0));

        for (neighbor, weight) in neighbors {
            let candidate = d + weight;
            let improves = dist
                .get(neighbor)
                .map(|&existing| candidate < existing)
                .unwrap_or(true);

            if improves {
                dist.insert(neighbor.clone(), candidate);
                prev.insert(neighbor.clone(), node.clone());
                heap.push(Reverse((candidate, neighbor.clone())));
            }
        }
    }

    if !dist.contains_key(dst) {
        return Err(KmeError::Routing(format!(
            "no path from {} to {}",
            src, dst
        )));
    }

    let mut path = vec![dst.to_string()];
    let mut current = dst.to_string();

    while current != src {
        let previous = prev.get(&current).ok_or_else(|| {
            KmeError::Routing(format!("no path from {} to {}", src, dst))
        })?;
        path.push(previous.clone());
        current = previous.clone();
    }

    path.reverse();

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, neighbors: &[&str], distance: u32) -> TrustedNodeRecord {
        TrustedNodeRecord {
            tn_id: id.to_string(),
            kme_ids: vec![],
            sae_ids: vec![],
            neighbor_tn_ids: neighbors.iter().map(|s| s.to_string()).collect(),
            distance,
        }
    }

    #[test]
    fn single_hop_path() {
        let records = vec![record("a", &["b"], 0), record("b", &["a"], 0)];
        let path = find_path(&records, "a", "b").unwrap();
        assert_eq!(path, vec!["a", "b"]);
    }

    #[test]
    fn three_node_chain() {
        let records = vec![
            record("a", &["b"], 0),
            record("b", &["a", "c"], 1),
            record("c", &["b"], 1),
        ];
        let path = find_path(&records, "a", "c").unwrap();
        assert_eq!(path, vec!["a", "b", "c"]);
    }

    #[test]
    fn ties_break_on_lower_tn_id() {
        // a connects to both b and x with equal weight; b < x lexicographically.
        let records = vec![
            record("a", &["b", "x"], 1),
            record("b", &["c"], 1),
            record("x", &["c"], 1),
            record("c", &[], 0),
        ];
        let path = find_path(&records, "a", "c").unwrap();
        assert_eq!(path, vec!["a", "b", "c"]);
    }

    #[test]
    fn unreachable_destination_is_a_routing_error() {
        let records = vec![record("a", &[], 0), record("b", &[], 0)];
        let result = find_path(&records, "a", "b");
        assert!(matches!(result, Err(KmeError::Routing(_))));
    }

    #[test]
    fn same_source_and_destination_is_trivial() {
        let records = vec![record("a", &[], 0)];
        let path = find_path(&records, "a", "a").unwrap();
        assert_eq!(path, vec!["a"]);
    }
}
