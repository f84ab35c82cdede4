//! Hierarchical navigable small world (HNSW) graph.
//!
//! An in-process approximate nearest-neighbour index over unit vectors,
//! keyed by record id. Each node lives on layers `0..=level`, where the
//! level is drawn from a geometric distribution so upper layers thin out
//! exponentially. Search descends greedily from the top layer and widens
//! to a beam of `ef` candidates on layer 0.
//!
//! Removal leaves a tombstone: the node keeps routing traffic but is never
//! returned. Once tombstones outnumber live nodes the graph is rebuilt
//! from the live set.

use crate::vector::{dot, normalize};
use planctx_config::HnswConfig;
use planctx_core::error::StoreError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

/// Levels above this are never assigned.
const MAX_LEVEL: usize = 16;

/// Graphs smaller than this are never compacted.
const MIN_COMPACTION_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::from(&HnswConfig::default())
    }
}

impl From<&HnswConfig> for HnswParams {
    fn from(config: &HnswConfig) -> Self {
        Self {
            m: config.m.max(2),
            ef_construction: config.ef_construction.max(1),
            ef_search: config.ef_search.max(1),
            seed: config.seed,
        }
    }
}

/// A node id with its similarity to the current query.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    similarity: f32,
    node: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Greater = more similar; lower node index wins ties.
    fn cmp(&self, other: &Self) -> Ordering {
        self.similarity
            .total_cmp(&other.similarity)
            .then_with(|| other.node.cmp(&self.node))
    }
}

#[derive(Debug)]
struct Node {
    key: String,
    vector: Vec<f32>,
    /// Neighbour lists, one per layer the node lives on
    links: Vec<Vec<usize>>,
    removed: bool,
}

/// Approximate nearest-neighbour index for one plan.
#[derive(Debug)]
pub struct HnswIndex {
    params: HnswParams,
    dimension: usize,
    nodes: Vec<Node>,
    /// Live node of each key
    slots: HashMap<String, usize>,
    entry_point: Option<usize>,
    max_level: usize,
    level_mult: f64,
    rng: StdRng,
    tombstones: usize,
}

impl HnswIndex {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        Self {
            params,
            dimension,
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry_point: None,
            max_level: 0,
            level_mult: 1.0 / (params.m as f64).ln(),
            rng: StdRng::seed_from_u64(params.seed),
            tombstones: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Insert `key`, replacing any previous vector stored under it.
    pub fn insert(&mut self, key: &str, vector: &[f32]) -> Result<(), StoreError> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.remove(key);
        self.add_node(key.to_string(), normalize(vector));
        Ok(())
    }

    /// Tombstone `key`. Returns false when it was not present.
    pub fn remove(&mut self, key: &str) -> bool {
        let Some(node) = self.slots.remove(key) else {
            return false;
        };
        self.nodes[node].removed = true;
        self.tombstones += 1;

        if self.nodes.len() >= MIN_COMPACTION_SIZE && self.tombstones * 2 > self.nodes.len() {
            self.rebuild();
        }
        true
    }

    /// The `k` live keys most similar to `query`, best first.
    ///
    /// `ef` is the layer-0 beam width; it is raised to `k` when smaller.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(String, f32)> {
        if k == 0 || self.slots.is_empty() || query.len() != self.dimension {
            return Vec::new();
        }
        let Some(mut entry) = self.entry_point else {
            return Vec::new();
        };

        let query = normalize(query);
        for layer in (1..=self.max_level).rev() {
            entry = self.greedy_closest(&query, entry, layer);
        }

        // Tombstones occupy beam slots without being returned.
        let ef = ef.max(k) + self.tombstones.min(ef.max(k));
        self.search_layer(&query, &[entry], ef, 0)
            .into_iter()
            .filter(|c| !self.nodes[c.node].removed)
            .take(k)
            .map(|c| (self.nodes[c.node].key.clone(), c.similarity))
            .collect()
    }

    /// Rebuild the graph from live nodes only.
    pub fn rebuild(&mut self) {
        let live: Vec<(String, Vec<f32>)> = std::mem::take(&mut self.nodes)
            .into_iter()
            .filter(|n| !n.removed)
            .map(|n| (n.key, n.vector))
            .collect();

        debug!(live = live.len(), dropped = self.tombstones, "Rebuilding HNSW graph");

        self.slots.clear();
        self.entry_point = None;
        self.max_level = 0;
        self.tombstones = 0;
        self.rng = StdRng::seed_from_u64(self.params.seed);

        for (key, vector) in live {
            self.add_node(key, vector);
        }
    }

    fn random_level(&mut self) -> usize {
        let r: f64 = self.rng.random();
        let level = (-(1.0 - r).ln() * self.level_mult).floor();
        (level as usize).min(MAX_LEVEL)
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn links(&self, node: usize, layer: usize) -> &[usize] {
        self.nodes[node]
            .links
            .get(layer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn similarity_to(&self, query: &[f32], node: usize) -> f32 {
        dot(query, &self.nodes[node].vector)
    }

    /// `vector` must already be unit length.
    fn add_node(&mut self, key: String, vector: Vec<f32>) {
        let level = self.random_level();
        let idx = self.nodes.len();
        self.nodes.push(Node {
            key: key.clone(),
            vector,
            links: vec![Vec::new(); level + 1],
            removed: false,
        });
        self.slots.insert(key, idx);

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(idx);
            self.max_level = level;
            return;
        };

        let query = self.nodes[idx].vector.clone();
        let top = self.max_level;

        for layer in (level + 1..=top).rev() {
            entry = self.greedy_closest(&query, entry, layer);
        }

        let mut entries = vec![entry];
        for layer in (0..=level.min(top)).rev() {
            let found = self.search_layer(&query, &entries, self.params.ef_construction, layer);
            let neighbours: Vec<usize> = found
                .iter()
                .take(self.max_links(layer))
                .map(|c| c.node)
                .collect();

            for &neighbour in &neighbours {
                self.connect(neighbour, idx, layer);
            }
            self.nodes[idx].links[layer] = neighbours;
            entries = found.iter().map(|c| c.node).collect();
        }

        if level > top {
            self.entry_point = Some(idx);
            self.max_level = level;
        }
    }

    /// Add `to` to the neighbour list of `from`, pruning to the most similar.
    fn connect(&mut self, from: usize, to: usize, layer: usize) {
        let max = self.max_links(layer);
        let Some(list) = self.nodes[from].links.get_mut(layer) else {
            return;
        };
        list.push(to);
        if list.len() <= max {
            return;
        }

        let base = &self.nodes[from].vector;
        let mut scored: Vec<Candidate> = self.nodes[from].links[layer]
            .iter()
            .map(|&n| Candidate {
                similarity: dot(base, &self.nodes[n].vector),
                node: n,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(max);
        self.nodes[from].links[layer] = scored.into_iter().map(|c| c.node).collect();
    }

    fn greedy_closest(&self, query: &[f32], entry: usize, layer: usize) -> usize {
        self.search_layer(query, &[entry], 1, layer)
            .first()
            .map(|c| c.node)
            .unwrap_or(entry)
    }

    /// Beam search on one layer. Returns up to `ef` candidates, best first.
    fn search_layer(&self, query: &[f32], entries: &[usize], ef: usize, layer: usize) -> Vec<Candidate> {
        let mut visited: HashSet<usize> = entries.iter().copied().collect();
        // Max-heap: next node to expand.
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::new();
        // Min-heap: worst kept result on top.
        let mut best: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();

        for &node in entries {
            let candidate = Candidate {
                similarity: self.similarity_to(query, node),
                node,
            };
            frontier.push(candidate);
            best.push(Reverse(candidate));
            if best.len() > ef {
                best.pop();
            }
        }

        while let Some(current) = frontier.pop() {
            let worst = best.peek().map(|r| r.0.similarity).unwrap_or(f32::NEG_INFINITY);
            if best.len() >= ef && current.similarity < worst {
                break;
            }

            for &neighbour in self.links(current.node, layer) {
                if !visited.insert(neighbour) {
                    continue;
                }
                let similarity = self.similarity_to(query, neighbour);
                let worst = best.peek().map(|r| r.0.similarity).unwrap_or(f32::NEG_INFINITY);
                if best.len() < ef || similarity > worst {
                    let candidate = Candidate { similarity, node: neighbour };
                    frontier.push(candidate);
                    best.push(Reverse(candidate));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut found: Vec<Candidate> = best.into_iter().map(|Reverse(c)| c).collect();
        found.sort_by(|a, b| b.cmp(a));
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    fn random_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| (0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
            .collect()
    }

    fn exact_top(vectors: &[Vec<f32>], query: &[f32], k: usize) -> Vec<String> {
        let mut scored: Vec<(usize, f32)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(v, query)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().take(k).map(|(i, _)| format!("v{i}")).collect()
    }

    fn build(vectors: &[Vec<f32>], dim: usize) -> HnswIndex {
        let mut index = HnswIndex::new(dim, HnswParams::default());
        for (i, v) in vectors.iter().enumerate() {
            index.insert(&format!("v{i}"), v).unwrap();
        }
        index
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = HnswIndex::new(4, HnswParams::default());
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 5, 64).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn finds_exact_match_first() {
        let mut index = HnswIndex::new(3, HnswParams::default());
        index.insert("x", &[1.0, 0.0, 0.0]).unwrap();
        index.insert("y", &[0.0, 1.0, 0.0]).unwrap();
        index.insert("z", &[0.0, 0.0, 1.0]).unwrap();

        let results = index.search(&[0.9, 0.1, 0.0], 2, 64);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "x");
    }

    #[test]
    fn rejects_wrong_dimension() {
        let mut index = HnswIndex::new(3, HnswParams::default());
        assert!(matches!(
            index.insert("x", &[1.0, 0.0]),
            Err(StoreError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(index.search(&[1.0, 0.0], 1, 8).is_empty());
    }

    #[test]
    fn reinsert_replaces_vector() {
        let mut index = HnswIndex::new(2, HnswParams::default());
        index.insert("a", &[1.0, 0.0]).unwrap();
        index.insert("a", &[0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);

        let results = index.search(&[0.0, 1.0], 1, 16);
        assert_eq!(results[0].0, "a");
        assert!((results[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn removed_keys_are_not_returned() {
        let mut index = HnswIndex::new(2, HnswParams::default());
        index.insert("a", &[1.0, 0.0]).unwrap();
        index.insert("b", &[0.8, 0.2]).unwrap();

        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        let results = index.search(&[1.0, 0.0], 5, 16);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "b");
    }

    #[test]
    fn recall_against_exact_search() {
        let dim = 24;
        let vectors = random_vectors(600, dim, 7);
        let index = build(&vectors, dim);
        let queries = random_vectors(20, dim, 99);

        let k = 10;
        let mut hits = 0;
        for query in &queries {
            let expected = exact_top(&vectors, query, k);
            let found: Vec<String> = index.search(query, k, 64).into_iter().map(|(key, _)| key).collect();
            hits += found.iter().filter(|key| expected.contains(key)).count();
        }
        let recall = hits as f64 / (queries.len() * k) as f64;
        assert!(recall >= 0.9, "recall {recall} below 0.9");
    }

    #[test]
    fn compaction_keeps_live_entries() {
        let dim = 8;
        let vectors = random_vectors(64, dim, 3);
        let mut index = build(&vectors, dim);

        for i in 0..40 {
            index.remove(&format!("v{i}"));
        }
        assert_eq!(index.len(), 24);
        assert!(index.tombstones() < 24, "graph should have been compacted");

        for i in 40..64 {
            let results = index.search(&vectors[i], 1, 32);
            assert_eq!(results[0].0, format!("v{i}"));
        }
    }

    #[test]
    fn same_seed_same_results() {
        let dim = 16;
        let vectors = random_vectors(200, dim, 11);
        let a = build(&vectors, dim);
        let b = build(&vectors, dim);
        let query = &random_vectors(1, dim, 12)[0];
        assert_eq!(a.search(query, 5, 32), b.search(query, 5, 32));
    }
}
